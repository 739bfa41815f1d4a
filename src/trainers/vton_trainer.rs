//! Try-on trainer
//!
//! Self-supervised reconstruction: the person image is both an input and the
//! target. Each step warps the garment, synthesizes the composite and
//! minimizes `L1(output, person) + w * perceptual(output, person)` with Adam.
//! Only the warping estimator and synthesizer parameters are optimized; the
//! VGG comparator is frozen.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use log::{info, warn};
use std::fs;
use std::path::Path;
use std::time::Instant;

use super::adam::Adam;
use super::candle_image_utils::save_image;
use super::checkpoint::{self, TrainingState};
use super::vton_data_loader::{Batch, PairBatchLoader};
use super::Config;
use crate::error::VtonError;
use crate::models::{PerceptualComparator, VtonNetwork};

/// Loss components of one optimization step
#[derive(Debug, Clone, Copy)]
pub struct StepLoss {
    pub total: f32,
    pub l1: f32,
    pub perceptual: f32,
}

/// Whether 1-indexed `epoch` is a checkpoint epoch
pub fn should_checkpoint(epoch: usize, save_every: usize) -> bool {
    save_every > 0 && epoch % save_every == 0
}

pub struct VtonTrainer {
    config: Config,
    device: Device,
    varmap: VarMap,
    network: VtonNetwork,
    // absent for pixel-only runs
    perceptual: Option<PerceptualComparator>,
    optimizer: Adam,
    params: Vec<(String, Var)>,
    global_step: usize,
    start_epoch: usize,
    start_time: Instant,
    // first composite and warped garment of the latest batch
    preview: Option<(Tensor, Tensor)>,
}

impl VtonTrainer {
    /// `perceptual` may be `None` only when `perceptual_weight` is zero.
    pub fn new(config: Config, perceptual: Option<PerceptualComparator>, device: Device) -> Result<Self> {
        if perceptual.is_none() && config.train.perceptual_weight > 0.0 {
            return Err(VtonError::InvalidConfig(
                "perceptual_weight > 0 requires VGG19 weights".into(),
            )
            .into());
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let network = VtonNetwork::new(config.model.network_config(), vb)?;

        let params = {
            let data = varmap.data().lock().map_err(|_| anyhow::anyhow!("VarMap lock poisoned"))?;
            let mut params: Vec<(String, Var)> =
                data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
            params.sort_by(|(a, _), (b, _)| a.cmp(b));
            params
        };
        let num_elements: usize = params.iter().map(|(_, v)| v.elem_count()).sum();
        info!("Try-on network: {} tensors, {} elements", params.len(), num_elements);

        let optimizer = Adam::with_params(
            config.train.learning_rate,
            config.train.beta1,
            config.train.beta2,
            config.train.eps,
        );

        let mut trainer = Self {
            config,
            device,
            varmap,
            network,
            perceptual,
            optimizer,
            params,
            global_step: 0,
            start_epoch: 0,
            start_time: Instant::now(),
            preview: None,
        };

        if let Some(path) = trainer.config.save.resume_from.clone() {
            trainer.resume(&path)?;
        }

        Ok(trainer)
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Load parameters and, when present next to it, optimizer moments and
    /// the epoch counter.
    pub fn resume(&mut self, path: &Path) -> Result<()> {
        checkpoint::load_parameters(&mut self.varmap, path)?;

        if let Some((optimizer_path, state_path)) = checkpoint::sibling_paths(path) {
            if state_path.exists() {
                let state = checkpoint::load_state(&state_path)?;
                self.start_epoch = state.epoch;
                self.global_step = state.global_step;
                if optimizer_path.exists() {
                    checkpoint::load_optimizer(&mut self.optimizer, &optimizer_path, state.global_step, &self.device)?;
                }
                info!("Resuming after epoch {} (step {})", state.epoch, state.global_step);
            } else {
                warn!("No training state next to {}, starting from epoch 1", path.display());
            }
        }
        Ok(())
    }

    /// One forward/backward/update pass on `batch`.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepLoss> {
        let person = batch.person.to_device(&self.device)?;
        let garment = batch.garment.to_device(&self.device)?;

        let (output, warped) = self.network.forward_t(&person, &garment, true)?;

        // The untouched person image is the reconstruction target
        let l1 = (&output - &person)?.abs()?.mean_all()?;
        let weight = self.config.train.perceptual_weight;
        let (total, perceptual) = match &self.perceptual {
            Some(comparator) if weight > 0.0 => {
                let p = comparator.compare(&output, &person)?;
                ((&l1 + (&p * weight)?)?, p.to_scalar::<f32>()?)
            }
            _ => (l1.clone(), 0.0),
        };

        // Gradients are recomputed from scratch on every backward pass
        let grads = total.backward()?;
        self.optimizer.step(&self.params, &grads)?;
        self.global_step += 1;

        self.preview = Some((output.get(0)?.detach(), warped.get(0)?.detach()));

        Ok(StepLoss {
            total: total.to_scalar::<f32>()?,
            l1: l1.to_scalar::<f32>()?,
            perceptual,
        })
    }

    /// Train over one shuffled epoch and return the average total loss.
    pub fn train_epoch(&mut self, loader: &mut PairBatchLoader, epoch: usize) -> Result<f32> {
        let num_batches = loader.num_batches();
        let progress = EpochProgress::new(num_batches, epoch, self.config.train.epochs);

        let mut epoch_loss = 0.0f32;
        let mut seen = 0usize;
        for batch in loader.epoch() {
            let batch = batch?;
            let loss = self.train_step(&batch)?;
            epoch_loss += loss.total;
            seen += 1;
            progress.tick(loss.total);
        }
        progress.finish();

        if seen == 0 {
            return Err(VtonError::EmptyDataset.into());
        }
        Ok(epoch_loss / seen as f32)
    }

    /// Run epochs `start_epoch..epochs`, checkpointing on schedule.
    /// Returns the per-epoch average losses.
    pub fn train(&mut self, loader: &mut PairBatchLoader) -> Result<Vec<f32>> {
        if loader.dataset().is_empty() {
            return Err(VtonError::EmptyDataset.into());
        }

        let epochs = self.config.train.epochs;
        info!(
            "Training for epochs {}..={} on {} pairs, batch size {}",
            self.start_epoch + 1,
            epochs,
            loader.dataset().len(),
            self.config.train.batch_size
        );

        let mut history = Vec::with_capacity(epochs.saturating_sub(self.start_epoch));
        for epoch in self.start_epoch..epochs {
            let avg_loss = self.train_epoch(loader, epoch)?;
            let elapsed = self.start_time.elapsed().as_secs_f32();
            info!(
                "Epoch {}/{} Average Loss: {:.4} | step {} | {:.1}s",
                epoch + 1,
                epochs,
                avg_loss,
                self.global_step,
                elapsed
            );
            history.push(avg_loss);

            if should_checkpoint(epoch + 1, self.config.save.save_every) {
                self.save_checkpoint(epoch + 1, avg_loss)?;
            }
        }

        info!("Training complete after {} steps", self.global_step);
        Ok(history)
    }

    /// Persist parameters, optimizer moments and training state for the
    /// 1-indexed `epoch`.
    pub fn save_checkpoint(&self, epoch: usize, average_loss: f32) -> Result<()> {
        let output_dir = &self.config.save.output_dir;
        fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create checkpoint directory: {}", output_dir.display()))?;

        checkpoint::save_parameters(&self.varmap, &checkpoint::checkpoint_path(output_dir, epoch), epoch)?;
        checkpoint::save_optimizer(&self.optimizer, &checkpoint::optimizer_path(output_dir, epoch))?;

        let (beta1, beta2) = self.optimizer.betas();
        let state = TrainingState {
            epoch,
            global_step: self.global_step,
            learning_rate: self.optimizer.learning_rate(),
            beta1,
            beta2,
            average_loss,
        };
        checkpoint::save_state(&state, &checkpoint::state_path(output_dir, epoch))?;

        if self.config.save.save_samples {
            if let Some((output, warped)) = &self.preview {
                let samples_dir = output_dir.join("samples");
                fs::create_dir_all(&samples_dir)?;
                save_image(output, samples_dir.join(format!("epoch_{}_tryon.png", epoch)))?;
                save_image(warped, samples_dir.join(format!("epoch_{}_warped.png", epoch)))?;
            }
        }

        Ok(())
    }
}

/// Per-epoch progress display, a no-op without the `progress-bar` feature
struct EpochProgress {
    #[cfg(feature = "progress-bar")]
    bar: indicatif::ProgressBar,
}

impl EpochProgress {
    #[allow(unused_variables)]
    fn new(num_batches: usize, epoch: usize, epochs: usize) -> Self {
        #[cfg(feature = "progress-bar")]
        {
            let bar = indicatif::ProgressBar::new(num_batches as u64);
            if let Ok(style) = indicatif::ProgressStyle::with_template(
                "{prefix} [{bar:30}] {pos}/{len} {msg}",
            ) {
                bar.set_style(style.progress_chars("=> "));
            }
            bar.set_prefix(format!("Epoch {}/{}", epoch + 1, epochs));
            Self { bar }
        }
        #[cfg(not(feature = "progress-bar"))]
        Self {}
    }

    #[allow(unused_variables)]
    fn tick(&self, loss: f32) {
        #[cfg(feature = "progress-bar")]
        {
            self.bar.set_message(format!("loss {:.4}", loss));
            self.bar.inc(1);
        }
    }

    fn finish(&self) {
        #[cfg(feature = "progress-bar")]
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainers::vton_data_loader::TryOnDataset;
    use std::sync::Arc;

    fn tiny_config(dir: &Path, height: usize, width: usize) -> Config {
        let mut config = Config::default();
        config.device = "cpu".into();
        config.data.root = dir.to_path_buf();
        config.data.height = height;
        config.data.width = width;
        config.model.warp_base_channels = 4;
        config.model.synth_base_channels = 4;
        config.train.batch_size = 1;
        config.train.perceptual_weight = 0.0;
        config.train.seed = Some(0);
        config.save.output_dir = dir.join("checkpoints");
        config
    }

    fn random_comparator() -> Result<PerceptualComparator> {
        let varmap = VarMap::new();
        Ok(PerceptualComparator::new(VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu))?)
    }

    fn loader_for(config: &Config) -> Result<PairBatchLoader> {
        let dataset = Arc::new(TryOnDataset::new(config.data.dataset_config())?);
        PairBatchLoader::new(dataset, config.train.batch_size, true, Some(1), config.train.seed, Device::Cpu)
    }

    /// Smooth synthetic images (ramps per channel), each garment identical to
    /// its person image
    fn synthetic_batch(height: usize, width: usize) -> Result<Batch> {
        let dev = Device::Cpu;
        let xs = Tensor::arange(0f32, width as f32, &dev)?
            .affine(2.0 / (width - 1) as f64, -1.0)?
            .reshape((1, 1, width))?
            .broadcast_as((1, height, width))?;
        let ys = Tensor::arange(0f32, height as f32, &dev)?
            .affine(2.0 / (height - 1) as f64, -1.0)?
            .reshape((1, height, 1))?
            .broadcast_as((1, height, width))?;
        let p0 = Tensor::cat(&[&xs, &ys, &(&xs * 0.5)?], 0)?;
        let p1 = Tensor::cat(&[&ys, &xs.neg()?, &(&ys * 0.5)?], 0)?;
        let person = Tensor::stack(&[&p0, &p1], 0)?;
        Ok(Batch {
            garment: person.clone(),
            person,
            person_ids: vec!["p0".into(), "p1".into()],
            garment_ids: vec!["g0".into(), "g1".into()],
        })
    }

    #[test]
    fn test_checkpoint_cadence() {
        let epochs: Vec<usize> = (1..=25).filter(|&e| should_checkpoint(e, 10)).collect();
        assert_eq!(epochs, vec![10, 20]);
        assert!(!(1..=25).any(|e| should_checkpoint(e, 0)));
    }

    #[test]
    fn test_reconstruction_loss_decreases() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = tiny_config(dir.path(), 64, 64);
        config.model.synth_base_channels = 8;
        config.train.learning_rate = 1e-3;
        let mut trainer = VtonTrainer::new(config, None, Device::Cpu)?;

        let batch = synthetic_batch(64, 64)?;
        let first = trainer.train_step(&batch)?.l1;
        let mut last = first;
        for _ in 1..50 {
            last = trainer.train_step(&batch)?.l1;
        }
        assert!(last < 0.6 * first, "l1 only went from {} to {}", first, last);
        assert_eq!(trainer.global_step(), 50);
        Ok(())
    }

    #[test]
    fn test_total_combines_pixel_and_perceptual_terms() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = tiny_config(dir.path(), 32, 32);
        config.train.perceptual_weight = 0.1;
        let mut trainer = VtonTrainer::new(config, Some(random_comparator()?), Device::Cpu)?;

        let loss = trainer.train_step(&synthetic_batch(32, 32)?)?;
        assert!(loss.perceptual > 0.0);
        assert!((loss.total - (loss.l1 + 0.1 * loss.perceptual)).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_training_writes_checkpoints_on_schedule() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("train_pairs.txt"), "p1.jpg g1.jpg\n")?;
        let mut config = tiny_config(dir.path(), 64, 64);
        config.train.epochs = 25;
        config.save.save_samples = true;

        let mut loader = loader_for(&config)?;
        let mut trainer = VtonTrainer::new(config.clone(), None, Device::Cpu)?;
        let history = trainer.train(&mut loader)?;
        assert_eq!(history.len(), 25);

        let out = &config.save.output_dir;
        for epoch in 1..=25 {
            let expected = epoch == 10 || epoch == 20;
            assert_eq!(checkpoint::checkpoint_path(out, epoch).exists(), expected, "epoch {}", epoch);
        }
        assert!(checkpoint::state_path(out, 20).exists());
        assert!(checkpoint::optimizer_path(out, 20).exists());
        assert!(out.join("samples/epoch_10_tryon.png").exists());
        Ok(())
    }

    #[test]
    fn test_resume_restores_epoch_and_parameters() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("train_pairs.txt"), "p1.jpg g1.jpg\n")?;
        let mut config = tiny_config(dir.path(), 64, 64);
        config.train.epochs = 2;
        config.save.save_every = 2;

        let mut loader = loader_for(&config)?;
        let mut trainer = VtonTrainer::new(config.clone(), None, Device::Cpu)?;
        trainer.train(&mut loader)?;

        let ckpt = checkpoint::checkpoint_path(&config.save.output_dir, 2);
        let mut resumed_config = config.clone();
        resumed_config.train.epochs = 3;
        resumed_config.save.resume_from = Some(ckpt);
        let resumed = VtonTrainer::new(resumed_config, None, Device::Cpu)?;
        assert_eq!(resumed.start_epoch(), 2);
        assert_eq!(resumed.global_step(), 2);

        let name = "generator.final.weight";
        let original = trainer.varmap().data().lock().unwrap()[name].as_tensor().clone();
        let restored = resumed.varmap().data().lock().unwrap()[name].as_tensor().clone();
        let diff = (original - restored)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_positive_weight_requires_comparator() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = tiny_config(dir.path(), 64, 64);
        config.train.perceptual_weight = 0.1;
        assert!(VtonTrainer::new(config, None, Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn test_empty_dataset_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = tiny_config(dir.path(), 64, 64);
        let mut loader = loader_for(&config)?;
        let mut trainer = VtonTrainer::new(config, None, Device::Cpu)?;
        assert!(trainer.train(&mut loader).is_err());
        Ok(())
    }
}
