//! Paired person/garment data loading for try-on training
//!
//! Handles:
//! - Manifest parsing (`<mode>_pairs.txt`, one `<person> <garment>` pair per line)
//! - Shared or split image directory layouts
//! - Placeholder substitution for unreadable images
//! - Shuffled batching with parallel sample loading

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::candle_image_utils::{load_image_tensor, white_placeholder};
use crate::error::VtonError;

/// Where person and garment files live relative to `<root>/<mode>/`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageLayout {
    /// Both filenames resolve against `<root>/<mode>/`
    #[default]
    Shared,
    /// Person files under `<root>/<mode>/<person_dir>/`, garments under
    /// `<root>/<mode>/<garment_dir>/`
    Split {
        person_dir: String,
        garment_dir: String,
    },
}

/// Dataset configuration
#[derive(Debug, Clone)]
pub struct DatasetConfig {
    pub root: PathBuf,
    pub mode: String,
    /// Manifest filename under `root`, defaults to `<mode>_pairs.txt`
    pub pairs_file: Option<String>,
    pub layout: ImageLayout,
    pub height: usize,
    pub width: usize,
}

impl DatasetConfig {
    pub fn new<P: Into<PathBuf>>(root: P, mode: &str) -> Self {
        Self {
            root: root.into(),
            mode: mode.to_string(),
            pairs_file: None,
            layout: ImageLayout::Shared,
            height: 256,
            width: 192,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        let name = self
            .pairs_file
            .clone()
            .unwrap_or_else(|| format!("{}_pairs.txt", self.mode));
        self.root.join(name)
    }

    pub fn person_path(&self, name: &str) -> PathBuf {
        let base = self.root.join(&self.mode);
        match &self.layout {
            ImageLayout::Shared => base.join(name),
            ImageLayout::Split { person_dir, .. } => base.join(person_dir).join(name),
        }
    }

    pub fn garment_path(&self, name: &str) -> PathBuf {
        let base = self.root.join(&self.mode);
        match &self.layout {
            ImageLayout::Shared => base.join(name),
            ImageLayout::Split { garment_dir, .. } => base.join(garment_dir).join(name),
        }
    }
}

/// A single training pair
#[derive(Debug, Clone)]
pub struct Sample {
    /// `[3, H, W]` in [-1, 1]
    pub person_image: Tensor,
    /// `[3, H, W]` in [-1, 1]
    pub garment_image: Tensor,
    pub person_id: String,
    pub garment_id: String,
}

/// Parse manifest text into ordered `(person, garment)` pairs.
/// Duplicates are kept; blank lines are skipped.
pub fn parse_manifest(text: &str, path: &Path) -> Result<Vec<(String, String)>, VtonError> {
    let mut pairs = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [] => continue,
            [person, garment] => pairs.push((person.to_string(), garment.to_string())),
            _ => {
                return Err(VtonError::MalformedManifest {
                    path: path.to_path_buf(),
                    line: i + 1,
                    content: line.to_string(),
                })
            }
        }
    }
    Ok(pairs)
}

/// Index -> (person, garment) sample provider
pub struct TryOnDataset {
    config: DatasetConfig,
    pairs: Vec<(String, String)>,
}

impl TryOnDataset {
    /// Read the manifest. A missing manifest yields an empty dataset; a
    /// malformed line is an error.
    pub fn new(config: DatasetConfig) -> Result<Self> {
        let manifest = config.manifest_path();
        let pairs = if manifest.exists() {
            let text = fs::read_to_string(&manifest)
                .with_context(|| format!("Failed to read manifest: {}", manifest.display()))?;
            parse_manifest(&text, &manifest)?
        } else {
            warn!("Manifest {} not found, dataset will be empty", manifest.display());
            Vec::new()
        };

        info!(
            "Dataset loaded: {} pairs from {} ({}x{})",
            pairs.len(),
            config.root.join(&config.mode).display(),
            config.height,
            config.width
        );

        Ok(Self { config, pairs })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Load pair `index`. Unreadable images never fail the call: both images
    /// are replaced by a white placeholder and a warning is logged.
    pub fn get(&self, index: usize) -> Result<Sample> {
        let (person_id, garment_id) = self.pairs.get(index).ok_or(VtonError::IndexOutOfRange {
            index,
            len: self.pairs.len(),
        })?;
        let (h, w) = (self.config.height, self.config.width);
        let person_path = self.config.person_path(person_id);
        let garment_path = self.config.garment_path(garment_id);

        let loaded = load_image_tensor(&person_path, h, w)
            .and_then(|p| Ok((p, load_image_tensor(&garment_path, h, w)?)));

        let (person_image, garment_image) = match loaded {
            Ok(images) => images,
            Err(e) => {
                warn!(
                    "Substituting placeholder images for pair {} (person={}, garment={}): {:#}",
                    index,
                    person_path.display(),
                    garment_path.display(),
                    e
                );
                (white_placeholder(h, w)?, white_placeholder(h, w)?)
            }
        };

        Ok(Sample {
            person_image,
            garment_image,
            person_id: person_id.clone(),
            garment_id: garment_id.clone(),
        })
    }
}

/// A stacked batch of samples, in loader order
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, 3, H, W]`
    pub person: Tensor,
    /// `[B, 3, H, W]`
    pub garment: Tensor,
    pub person_ids: Vec<String>,
    pub garment_ids: Vec<String>,
}

impl Batch {
    pub fn from_samples(samples: Vec<Sample>, device: &Device) -> Result<Self> {
        let persons: Vec<&Tensor> = samples.iter().map(|s| &s.person_image).collect();
        let garments: Vec<&Tensor> = samples.iter().map(|s| &s.garment_image).collect();
        let person = Tensor::stack(&persons, 0)?.to_device(device)?;
        let garment = Tensor::stack(&garments, 0)?.to_device(device)?;
        Ok(Self {
            person,
            garment,
            person_ids: samples.iter().map(|s| s.person_id.clone()).collect(),
            garment_ids: samples.iter().map(|s| s.garment_id.clone()).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.person_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.person_ids.is_empty()
    }
}

/// Shuffling batch loader. Samples within a batch are fetched in parallel
/// on a dedicated rayon pool; results keep index order.
pub struct PairBatchLoader {
    dataset: Arc<TryOnDataset>,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    pool: rayon::ThreadPool,
    device: Device,
}

impl PairBatchLoader {
    pub fn new(
        dataset: Arc<TryOnDataset>,
        batch_size: usize,
        shuffle: bool,
        num_workers: Option<usize>,
        seed: Option<u64>,
        device: Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(VtonError::InvalidConfig("batch_size must be at least 1".into()).into());
        }
        let workers = num_workers.unwrap_or_else(num_cpus::get).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("vton-loader-{}", i))
            .build()
            .context("Failed to build data loader thread pool")?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            rng,
            pool,
            device,
        })
    }

    pub fn dataset(&self) -> &TryOnDataset {
        &self.dataset
    }

    /// Number of batches per epoch; the last batch may be short
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Index groups for one epoch, reshuffled on every call when enabled
    pub fn epoch_indices(&mut self) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            indices.shuffle(&mut self.rng);
        }
        indices.chunks(self.batch_size).map(|c| c.to_vec()).collect()
    }

    pub fn load_batch(&self, indices: &[usize]) -> Result<Batch> {
        let dataset = &self.dataset;
        let samples = self.pool.install(|| {
            indices
                .par_iter()
                .map(|&i| dataset.get(i))
                .collect::<Result<Vec<_>>>()
        })?;
        Batch::from_samples(samples, &self.device)
    }

    /// Iterate over one shuffled epoch
    pub fn epoch(&mut self) -> EpochIter<'_> {
        let batches = self.epoch_indices();
        EpochIter {
            loader: self,
            batches: batches.into_iter(),
        }
    }
}

pub struct EpochIter<'a> {
    loader: &'a PairBatchLoader,
    batches: std::vec::IntoIter<Vec<usize>>,
}

impl Iterator for EpochIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.batches.next()?;
        Some(self.loader.load_batch(&indices))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.batches.size_hint()
    }
}

impl ExactSizeIterator for EpochIter<'_> {}
