//! Frozen VGG19 feature comparator for the perceptual loss
//!
//! The convolutional trunk of VGG19 up to relu4_4 is split into four
//! successive blocks (relu1_2, relu2_2, relu3_4, relu4_4). Weights use the
//! torchvision `features.{i}` naming so a converted ImageNet checkpoint can be
//! loaded directly. Every weight is detached on construction and the
//! comparator exposes no way to mutate it, so it never takes part in an
//! optimizer step.

use anyhow::Context;
use candle_core::{bail, DType, Device, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};
use log::info;
use std::path::Path;

/// (pool before the block, [(features index, in channels, out channels)])
const VGG19_BLOCKS: [(bool, &[(usize, usize, usize)]); 4] = [
    (false, &[(0, 3, 64), (2, 64, 64)]),
    (true, &[(5, 64, 128), (7, 128, 128)]),
    (true, &[(10, 128, 256), (12, 256, 256), (14, 256, 256), (16, 256, 256)]),
    (true, &[(19, 256, 512), (21, 512, 512), (23, 512, 512), (25, 512, 512)]),
];

struct FeatureBlock {
    pool_first: bool,
    convs: Vec<Conv2d>,
}

impl Module for FeatureBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = if self.pool_first {
            x.max_pool2d(2)?
        } else {
            x.clone()
        };
        for conv in &self.convs {
            x = conv.forward(&x)?.relu()?;
        }
        Ok(x)
    }
}

fn frozen_conv(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    let conv = candle_nn::conv2d(in_c, out_c, 3, cfg, vb)?;
    Ok(Conv2d::new(
        conv.weight().detach(),
        conv.bias().map(|b| b.detach()),
        *conv.config(),
    ))
}

pub struct PerceptualComparator {
    blocks: Vec<FeatureBlock>,
}

impl PerceptualComparator {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let features = vb.pp("features");
        let blocks = VGG19_BLOCKS
            .iter()
            .map(|(pool_first, layers)| {
                let convs = layers
                    .iter()
                    .map(|&(idx, in_c, out_c)| frozen_conv(in_c, out_c, features.pp(idx.to_string())))
                    .collect::<Result<Vec<_>>>()?;
                Ok(FeatureBlock {
                    pool_first: *pool_first,
                    convs,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks })
    }

    /// Load pretrained VGG19 weights from a safetensors file.
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> anyhow::Result<Self> {
        let path = path.as_ref();
        info!("Loading VGG19 perceptual weights from: {}", path.display());
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to read VGG19 weights: {}", path.display()))?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::new(vb).with_context(|| format!("Incompatible VGG19 weights in {}", path.display()))
    }

    /// Activations after each of the four blocks.
    pub fn features(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        let mut out = Vec::with_capacity(self.blocks.len());
        let mut h = x.clone();
        for block in &self.blocks {
            h = block.forward(&h)?;
            out.push(h.clone());
        }
        Ok(out)
    }

    /// Sum over blocks of the mean absolute feature difference. Gradients
    /// flow into `generated` only.
    pub fn compare(&self, generated: &Tensor, target: &Tensor) -> Result<Tensor> {
        if generated.dims() != target.dims() {
            bail!(
                "perceptual inputs differ in shape: {:?} vs {:?}",
                generated.dims(),
                target.dims()
            );
        }
        let target = target.detach();
        let mut loss = Tensor::zeros((), generated.dtype(), generated.device())?;
        let mut g = generated.clone();
        let mut t = target;
        for block in &self.blocks {
            g = block.forward(&g)?;
            t = block.forward(&t)?;
            loss = (loss + (&g - &t)?.abs()?.mean_all()?)?;
        }
        Ok(loss)
    }
}
