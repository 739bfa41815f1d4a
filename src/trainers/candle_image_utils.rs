//! Image <-> tensor conversion for try-on training
//! All tensors use CHW layout with values in [-1, 1]

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use std::path::Path;

/// Load an image from disk, convert to RGB, resize to `(height, width)` and
/// normalize to [-1, 1]. The tensor is created on the CPU.
pub fn load_image_tensor<P: AsRef<Path>>(path: P, height: usize, width: usize) -> Result<Tensor> {
    let path = path.as_ref();
    let img = image::open(path)
        .with_context(|| format!("Failed to open image: {}", path.display()))?;
    let img = img.resize_exact(width as u32, height as u32, FilterType::Triangle);
    image_to_tensor(&img, &Device::Cpu)
}

/// Convert an image to a `[3, H, W]` tensor in [-1, 1]
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = img.to_rgb8();
    let (width, height) = (img.width() as usize, img.height() as usize);
    let data: Vec<f32> = img
        .into_raw()
        .into_iter()
        .map(|v| v as f32 / 127.5 - 1.0)
        .collect();

    Ok(Tensor::from_vec(data, (height, width, 3), device)?.permute((2, 0, 1))?.contiguous()?)
}

/// Uniform white `[3, H, W]` image in normalized space
pub fn white_placeholder(height: usize, width: usize) -> Result<Tensor> {
    Ok(Tensor::ones((3, height, width), DType::F32, &Device::Cpu)?)
}

/// Save a `[3, H, W]` tensor in [-1, 1] as an image
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    // Convert from [-1, 1] to [0, 255]
    let tensor = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    let tensor = tensor.to_dtype(DType::U8)?;

    let (channel, height, width) = tensor.dims3()
        .context("Expected 3D tensor [C, H, W]")?;

    if channel != 3 {
        anyhow::bail!("Expected 3 channels (RGB), got {}", channel);
    }

    // Permute from CHW to HWC for image crate
    let tensor = tensor.permute((1, 2, 0))?;
    let data = tensor.flatten_all()?.to_vec1::<u8>()?;

    let img = image::ImageBuffer::<image::Rgb<u8>, Vec<u8>>::from_raw(
        width as u32,
        height as u32,
        data,
    ).context("Failed to create image buffer")?;

    let path = path.as_ref();
    match path.extension().and_then(|s| s.to_str()) {
        Some("jpg") | Some("jpeg") => {
            img.save_with_format(path, image::ImageFormat::Jpeg)?;
        }
        _ => {
            img.save_with_format(path, image::ImageFormat::Png)?;
        }
    }

    Ok(())
}
