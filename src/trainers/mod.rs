pub mod adam;
pub mod candle_image_utils;
pub mod checkpoint;
pub mod device;
pub mod vton_data_loader;
pub mod vton_trainer;

// Re-export key types
pub use adam::Adam;
pub use vton_data_loader::{Batch, DatasetConfig, ImageLayout, PairBatchLoader, Sample, TryOnDataset};
pub use vton_trainer::{StepLoss, VtonTrainer};

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::VtonError;
use crate::models::{PerceptualComparator, VtonNetworkConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// "cpu", "cuda", "cuda:<n>" or "metal"; unavailable accelerators fall back to CPU
    pub device: String,
    pub data: DataConfig,
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub save: SaveConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: "cuda".to_string(),
            data: DataConfig::default(),
            model: ModelConfig::default(),
            train: TrainConfig::default(),
            save: SaveConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub root: PathBuf,
    pub mode: String,
    pub pairs_file: Option<String>,
    pub layout: ImageLayout,
    pub height: usize,
    pub width: usize,
    pub num_workers: Option<usize>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            mode: "train".to_string(),
            pairs_file: None,
            layout: ImageLayout::Shared,
            height: 256,
            width: 192,
            num_workers: None,
        }
    }
}

impl DataConfig {
    pub fn dataset_config(&self) -> DatasetConfig {
        DatasetConfig {
            root: self.root.clone(),
            mode: self.mode.clone(),
            pairs_file: self.pairs_file.clone(),
            layout: self.layout.clone(),
            height: self.height,
            width: self.width,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub person_channels: usize,
    pub warp_base_channels: usize,
    pub synth_base_channels: usize,
    /// Pretrained VGG19 `features.*` weights in safetensors format
    pub vgg_weights: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            person_channels: 3,
            warp_base_channels: 64,
            synth_base_channels: 64,
            vgg_weights: PathBuf::from("weights/vgg19.safetensors"),
        }
    }
}

impl ModelConfig {
    pub fn network_config(&self) -> VtonNetworkConfig {
        VtonNetworkConfig::with_widths(
            self.person_channels,
            self.warp_base_channels,
            self.synth_base_channels,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub perceptual_weight: f64,
    pub shuffle: bool,
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            epochs: 100,
            learning_rate: 2e-4,
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-8,
            perceptual_weight: 0.1,
            shuffle: true,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    pub output_dir: PathBuf,
    /// Checkpoint every N epochs (1-indexed); 0 disables checkpoints
    pub save_every: usize,
    pub save_samples: bool,
    pub resume_from: Option<PathBuf>,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("checkpoints"),
            save_every: 10,
            save_samples: false,
            resume_from: None,
        }
    }
}

impl Config {
    /// Reject settings the networks cannot run with
    pub fn validate(&self) -> Result<(), VtonError> {
        if self.train.batch_size == 0 {
            return Err(VtonError::InvalidConfig("train.batch_size must be at least 1".into()));
        }
        let (h, w) = (self.data.height, self.data.width);
        if h == 0 || w == 0 || h % 32 != 0 || w % 32 != 0 {
            return Err(VtonError::InvalidConfig(format!(
                "image size {}x{} must be a non-zero multiple of 32",
                h, w
            )));
        }
        if self.model.warp_base_channels == 0 || self.model.synth_base_channels == 0 {
            return Err(VtonError::InvalidConfig("model channel widths must be non-zero".into()));
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&config_str)
        .with_context(|| "Failed to parse YAML config")?;

    Ok(config)
}

/// Build every component from `config` and run the full training loop.
pub fn run_training(config: Config) -> Result<Vec<f32>> {
    config.validate()?;

    let device = device::select_device(&config.device);
    info!("Using device: {:?}", device);

    let dataset = Arc::new(TryOnDataset::new(config.data.dataset_config())?);
    let mut loader = PairBatchLoader::new(
        dataset,
        config.train.batch_size,
        config.train.shuffle,
        config.data.num_workers,
        config.train.seed,
        device.clone(),
    )?;

    // Pixel-only runs never touch the comparator
    let perceptual = if config.train.perceptual_weight > 0.0 {
        Some(PerceptualComparator::load(&config.model.vgg_weights, &device)?)
    } else {
        info!("perceptual_weight is 0, skipping VGG19 weights");
        None
    };
    let mut trainer = VtonTrainer::new(config, perceptual, device)?;
    trainer.train(&mut loader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() -> Result<()> {
        let yaml = r#"
device: cpu
data:
  root: /datasets/vton
  layout:
    type: split
    person_dir: image
    garment_dir: cloth
train:
  epochs: 25
"#;
        let config: Config = serde_yaml::from_str(yaml)?;
        assert_eq!(config.device, "cpu");
        assert_eq!(config.data.root, PathBuf::from("/datasets/vton"));
        assert_eq!(
            config.data.layout,
            ImageLayout::Split {
                person_dir: "image".into(),
                garment_dir: "cloth".into()
            }
        );
        assert_eq!((config.data.height, config.data.width), (256, 192));
        assert_eq!(config.train.epochs, 25);
        assert_eq!(config.train.batch_size, 4);
        assert_eq!(config.train.learning_rate, 2e-4);
        assert_eq!((config.train.beta1, config.train.beta2), (0.5, 0.999));
        assert_eq!(config.save.save_every, 10);
        Ok(())
    }

    #[test]
    fn test_shared_layout_tag() -> Result<()> {
        let config: Config = serde_yaml::from_str("data:\n  layout:\n    type: shared\n")?;
        assert_eq!(config.data.layout, ImageLayout::Shared);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.data.height = 250;
        assert!(config.validate().is_err());
        config.data.height = 256;
        config.train.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vton.yaml");
        fs::write(&path, "save:\n  output_dir: out\n  save_every: 5\n")?;
        let config = load_config(&path)?;
        assert_eq!(config.save.output_dir, PathBuf::from("out"));
        assert_eq!(config.save.save_every, 5);
        Ok(())
    }

    #[test]
    fn test_missing_vgg_weights_abort_training() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("train_pairs.txt"), "p.jpg g.jpg\n")?;
        let mut config = Config::default();
        config.device = "cpu".into();
        config.data.root = dir.path().to_path_buf();
        config.model.vgg_weights = dir.path().join("missing.safetensors");
        assert!(run_training(config).is_err());
        Ok(())
    }

    #[test]
    fn test_pixel_only_run_needs_no_vgg_weights() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("train_pairs.txt"), "p.jpg g.jpg\n")?;
        let mut config = Config::default();
        config.device = "cpu".into();
        config.data.root = dir.path().to_path_buf();
        config.data.height = 64;
        config.data.width = 64;
        config.model.warp_base_channels = 4;
        config.model.synth_base_channels = 4;
        config.model.vgg_weights = dir.path().join("missing.safetensors");
        config.train.batch_size = 1;
        config.train.epochs = 1;
        config.train.perceptual_weight = 0.0;
        config.save.save_every = 0;
        let history = run_training(config)?;
        assert_eq!(history.len(), 1);
        Ok(())
    }
}
