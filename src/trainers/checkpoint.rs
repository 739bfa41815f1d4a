//! Checkpoint I/O
//!
//! Parameters are written as safetensors with string metadata, optimizer
//! moments as a second safetensors file and the scalar training state as
//! JSON. Files are named by 1-indexed epoch:
//! - `vton_epoch_<n>.safetensors`
//! - `vton_epoch_<n>_optimizer.safetensors`
//! - `vton_epoch_<n>_state.json`

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use log::info;
use safetensors::{serialize, tensor::TensorView, Dtype as SafeDtype};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::adam::Adam;

pub const CHECKPOINT_FORMAT: &str = "vton-flow-unet";

/// Scalar training state stored next to each checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub epoch: usize,
    pub global_step: usize,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub average_loss: f32,
}

pub fn checkpoint_path(output_dir: &Path, epoch: usize) -> PathBuf {
    output_dir.join(format!("vton_epoch_{}.safetensors", epoch))
}

pub fn optimizer_path(output_dir: &Path, epoch: usize) -> PathBuf {
    output_dir.join(format!("vton_epoch_{}_optimizer.safetensors", epoch))
}

pub fn state_path(output_dir: &Path, epoch: usize) -> PathBuf {
    output_dir.join(format!("vton_epoch_{}_state.json", epoch))
}

/// Sibling optimizer/state files of a parameter checkpoint, if it follows
/// the `vton_epoch_<n>.safetensors` naming
pub fn sibling_paths(checkpoint: &Path) -> Option<(PathBuf, PathBuf)> {
    let stem = checkpoint.file_stem()?.to_str()?;
    let dir = checkpoint.parent()?;
    Some((
        dir.join(format!("{}_optimizer.safetensors", stem)),
        dir.join(format!("{}_state.json", stem)),
    ))
}

/// Write every variable of `varmap` to `path`.
pub fn save_parameters(varmap: &VarMap, path: &Path, epoch: usize) -> Result<()> {
    let tensors: Vec<(String, Tensor)> = {
        let data = varmap.data().lock().map_err(|_| anyhow::anyhow!("VarMap lock poisoned"))?;
        let mut named: Vec<(String, Tensor)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        named.sort_by(|(a, _), (b, _)| a.cmp(b));
        named
    };

    // Collect raw bytes first so the views can borrow them
    let mut tensor_info = Vec::with_capacity(tensors.len());
    let mut all_data: Vec<Vec<u8>> = Vec::with_capacity(tensors.len());
    for (name, tensor) in &tensors {
        tensor_info.push((
            name.clone(),
            convert_dtype(tensor.dtype())?,
            tensor.dims().to_vec(),
            all_data.len(),
        ));
        all_data.push(tensor_to_vec(tensor)?);
    }

    let mut safe_tensors = HashMap::new();
    for (name, dtype, shape, idx) in tensor_info {
        safe_tensors.insert(name, TensorView::new(dtype, shape, &all_data[idx])?);
    }

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), CHECKPOINT_FORMAT.to_string());
    metadata.insert("epoch".to_string(), epoch.to_string());
    metadata.insert("num_tensors".to_string(), tensors.len().to_string());

    let data = serialize(&safe_tensors, &Some(metadata))?;
    fs::write(path, data).with_context(|| format!("Failed to write checkpoint: {}", path.display()))?;

    info!("Saved {} parameter tensors to {}", tensors.len(), path.display());
    Ok(())
}

/// Load parameters saved by `save_parameters` into an existing `varmap`.
pub fn load_parameters(varmap: &mut VarMap, path: &Path) -> Result<()> {
    varmap
        .load(path)
        .with_context(|| format!("Failed to load checkpoint: {}", path.display()))?;
    info!("Loaded parameters from {}", path.display());
    Ok(())
}

pub fn save_optimizer(adam: &Adam, path: &Path) -> Result<()> {
    candle_core::safetensors::save(&adam.state_tensors(), path)
        .with_context(|| format!("Failed to write optimizer state: {}", path.display()))?;
    Ok(())
}

pub fn load_optimizer(adam: &mut Adam, path: &Path, step: usize, device: &Device) -> Result<()> {
    let state = candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to read optimizer state: {}", path.display()))?;
    adam.load_state_tensors(state, step);
    Ok(())
}

pub fn save_state(state: &TrainingState, path: &Path) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(state)?)
        .with_context(|| format!("Failed to write training state: {}", path.display()))?;
    Ok(())
}

pub fn load_state(path: &Path) -> Result<TrainingState> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read training state: {}", path.display()))?;
    Ok(serde_json::from_str(&text)?)
}

fn convert_dtype(dtype: DType) -> Result<SafeDtype> {
    match dtype {
        DType::F32 => Ok(SafeDtype::F32),
        DType::F16 => Ok(SafeDtype::F16),
        DType::BF16 => Ok(SafeDtype::BF16),
        DType::F64 => Ok(SafeDtype::F64),
        _ => Err(anyhow::anyhow!("Unsupported dtype for safetensors: {:?}", dtype)),
    }
}

fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<u8>> {
    let flattened = tensor.flatten_all()?;

    let data = match tensor.dtype() {
        DType::F32 => {
            let data: Vec<f32> = flattened.to_vec1()?;
            bytemuck::cast_slice(&data).to_vec()
        }
        DType::F64 => {
            let data: Vec<f64> = flattened.to_vec1()?;
            bytemuck::cast_slice(&data).to_vec()
        }
        DType::F16 => {
            let data: Vec<half::f16> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        DType::BF16 => {
            let data: Vec<half::bf16> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        _ => return Err(anyhow::anyhow!("Unsupported tensor dtype for conversion")),
    };
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_parameter_roundtrip_with_metadata() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = checkpoint_path(dir.path(), 10);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints((2, 3), "layer.weight", Init::Randn { mean: 0.0, stdev: 1.0 })?;
        save_parameters(&varmap, &path, 10)?;

        let bytes = fs::read(&path)?;
        let (_, meta) = safetensors::SafeTensors::read_metadata(&bytes)?;
        let meta = meta.metadata().clone().expect("metadata present");
        assert_eq!(meta["epoch"], "10");
        assert_eq!(meta["format"], CHECKPOINT_FORMAT);

        let mut restored = VarMap::new();
        let vb = VarBuilder::from_varmap(&restored, DType::F32, &Device::Cpu);
        let r = vb.get_with_hints((2, 3), "layer.weight", Init::Const(0.0))?;
        load_parameters(&mut restored, &path)?;
        let diff = (w - r)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_state_json_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = state_path(dir.path(), 20);
        let state = TrainingState {
            epoch: 20,
            global_step: 400,
            learning_rate: 2e-4,
            beta1: 0.5,
            beta2: 0.999,
            average_loss: 0.25,
        };
        save_state(&state, &path)?;
        assert_eq!(load_state(&path)?, state);
        Ok(())
    }

    #[test]
    fn test_sibling_paths_follow_naming() {
        let ckpt = checkpoint_path(Path::new("/tmp/ckpt"), 30);
        let (opt, state) = sibling_paths(&ckpt).unwrap();
        assert_eq!(opt, optimizer_path(Path::new("/tmp/ckpt"), 30));
        assert_eq!(state, state_path(Path::new("/tmp/ckpt"), 30));
    }
}
