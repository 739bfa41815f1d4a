//! Try-on synthesizer
//!
//! U-Net style encoder-decoder that fuses the person image with the warped
//! garment. Five strided conv stages go down to 1/32 resolution, four
//! transposed conv stages come back up with skip connections, and a final
//! transposed conv + tanh produces the RGB composite in [-1, 1].

use candle_core::{Module, Result, Tensor};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, Conv2d, ConvTranspose2d, VarBuilder};

use super::layers::{down_conv, leaky_relu, up_conv};

const LEAKY_SLOPE: f64 = 0.2;

#[derive(Debug, Clone, Copy)]
pub struct SynthesizerConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Width of the first encoder stage (64 in the reference network)
    pub base_channels: usize,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            in_channels: 6,
            out_channels: 3,
            base_channels: 64,
        }
    }
}

/// Strided conv + BatchNorm + LeakyReLU
struct DownBlock {
    conv: Conv2d,
    norm: BatchNorm,
}

impl DownBlock {
    fn new(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv: down_conv(in_c, out_c, false, vb.pp("conv"))?,
            norm: batch_norm(out_c, BatchNormConfig::default(), vb.pp("norm"))?,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv.forward(x)?.apply_t(&self.norm, train)?;
        leaky_relu(&x, LEAKY_SLOPE)
    }
}

/// Transposed conv + BatchNorm + ReLU
struct UpBlock {
    conv: ConvTranspose2d,
    norm: BatchNorm,
}

impl UpBlock {
    fn new(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv: up_conv(in_c, out_c, false, vb.pp("conv"))?,
            norm: batch_norm(out_c, BatchNormConfig::default(), vb.pp("norm"))?,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.conv.forward(x)?.apply_t(&self.norm, train)?.relu()
    }
}

pub struct UNetSynthesizer {
    down1: Conv2d,
    down2: DownBlock,
    down3: DownBlock,
    down4: DownBlock,
    down5: DownBlock,
    up1: UpBlock,
    up2: UpBlock,
    up3: UpBlock,
    up4: UpBlock,
    final_conv: ConvTranspose2d,
}

impl UNetSynthesizer {
    pub fn new(config: SynthesizerConfig, vb: VarBuilder) -> Result<Self> {
        let c = config.base_channels;
        Ok(Self {
            down1: down_conv(config.in_channels, c, true, vb.pp("down1"))?,
            down2: DownBlock::new(c, c * 2, vb.pp("down2"))?,
            down3: DownBlock::new(c * 2, c * 4, vb.pp("down3"))?,
            down4: DownBlock::new(c * 4, c * 8, vb.pp("down4"))?,
            down5: DownBlock::new(c * 8, c * 8, vb.pp("down5"))?,
            up1: UpBlock::new(c * 8, c * 8, vb.pp("up1"))?,
            up2: UpBlock::new(c * 16, c * 4, vb.pp("up2"))?,
            up3: UpBlock::new(c * 8, c * 2, vb.pp("up3"))?,
            up4: UpBlock::new(c * 4, c, vb.pp("up4"))?,
            final_conv: up_conv(c * 2, config.out_channels, true, vb.pp("final"))?,
        })
    }

    /// Fuse `person` and `warped_garment` (both `[B, 3, H, W]`) into the
    /// composite. `train` selects batch statistics (true) or running
    /// statistics (false) in every normalization layer.
    pub fn forward_t(&self, person: &Tensor, warped_garment: &Tensor, train: bool) -> Result<Tensor> {
        let x = Tensor::cat(&[person, warped_garment], 1)?;

        let d1 = leaky_relu(&self.down1.forward(&x)?, LEAKY_SLOPE)?;
        let d2 = self.down2.forward_t(&d1, train)?;
        let d3 = self.down3.forward_t(&d2, train)?;
        let d4 = self.down4.forward_t(&d3, train)?;
        let d5 = self.down5.forward_t(&d4, train)?;

        let u1 = self.up1.forward_t(&d5, train)?;
        let u2 = self.up2.forward_t(&Tensor::cat(&[&u1, &d4], 1)?, train)?;
        let u3 = self.up3.forward_t(&Tensor::cat(&[&u2, &d3], 1)?, train)?;
        let u4 = self.up4.forward_t(&Tensor::cat(&[&u3, &d2], 1)?, train)?;

        self.final_conv
            .forward(&Tensor::cat(&[&u4, &d1], 1)?)?
            .tanh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(base_channels: usize) -> Result<(VarMap, UNetSynthesizer)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = SynthesizerConfig {
            base_channels,
            ..Default::default()
        };
        let net = UNetSynthesizer::new(config, vb)?;
        Ok((varmap, net))
    }

    #[test]
    fn test_output_shape_matches_full_resolution() -> Result<()> {
        let (_varmap, net) = build(64)?;
        let person = Tensor::rand(-1f32, 1f32, (1, 3, 256, 192), &Device::Cpu)?;
        let garment = Tensor::rand(-1f32, 1f32, (1, 3, 256, 192), &Device::Cpu)?;
        let out = net.forward_t(&person, &garment, false)?;
        assert_eq!(out.dims(), &[1, 3, 256, 192]);
        Ok(())
    }

    #[test]
    fn test_output_is_bounded() -> Result<()> {
        let (_varmap, net) = build(8)?;
        let person = (Tensor::rand(-1f32, 1f32, (2, 3, 64, 64), &Device::Cpu)? * 10.0)?;
        let garment = Tensor::rand(-1f32, 1f32, (2, 3, 64, 64), &Device::Cpu)?;
        let out = net.forward_t(&person, &garment, true)?;
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
        Ok(())
    }

    #[test]
    fn test_eval_mode_is_deterministic() -> Result<()> {
        let (_varmap, net) = build(8)?;
        let person = Tensor::rand(-1f32, 1f32, (1, 3, 64, 32), &Device::Cpu)?;
        let garment = Tensor::rand(-1f32, 1f32, (1, 3, 64, 32), &Device::Cpu)?;
        let a = net.forward_t(&person, &garment, false)?;
        let b = net.forward_t(&person, &garment, false)?;
        let diff = (a - b)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_mode_flag_switches_normalization_statistics() -> Result<()> {
        let (_varmap, net) = build(8)?;
        let person = Tensor::rand(-1f32, 1f32, (2, 3, 64, 64), &Device::Cpu)?;
        let garment = Tensor::rand(-1f32, 1f32, (2, 3, 64, 64), &Device::Cpu)?;
        let eval = net.forward_t(&person, &garment, false)?;
        let train = net.forward_t(&person, &garment, true)?;
        let diff = (eval - train)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff > 0.0);
        Ok(())
    }
}
