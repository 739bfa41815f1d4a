//! Cascaded warp-then-synthesize try-on network

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::flow_warp::{FlowWarpConfig, FlowWarpEstimator};
use super::unet_synthesizer::{SynthesizerConfig, UNetSynthesizer};

#[derive(Debug, Clone, Copy, Default)]
pub struct VtonNetworkConfig {
    pub warp: FlowWarpConfig,
    pub synthesizer: SynthesizerConfig,
}

impl VtonNetworkConfig {
    pub fn with_widths(person_channels: usize, warp_base: usize, synth_base: usize) -> Self {
        Self {
            warp: FlowWarpConfig {
                person_channels,
                garment_channels: 3,
                base_channels: warp_base,
            },
            synthesizer: SynthesizerConfig {
                in_channels: 6,
                out_channels: 3,
                base_channels: synth_base,
            },
        }
    }
}

pub struct VtonNetwork {
    pub warping: FlowWarpEstimator,
    pub generator: UNetSynthesizer,
}

impl VtonNetwork {
    /// Parameters live under `warping.*` and `generator.*` of `vb`.
    pub fn new(config: VtonNetworkConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            warping: FlowWarpEstimator::new(config.warp, vb.pp("warping"))?,
            generator: UNetSynthesizer::new(config.synthesizer, vb.pp("generator"))?,
        })
    }

    /// Returns `(output, warped_garment)`.
    pub fn forward_t(&self, person: &Tensor, garment: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let warped = self.warping.forward(person, garment)?;
        let output = self.generator.forward_t(person, &warped, train)?;
        Ok((output, warped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_forward_shapes_and_parameter_names() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = VtonNetwork::new(VtonNetworkConfig::with_widths(3, 4, 4), vb)?;

        let person = Tensor::rand(-1f32, 1f32, (2, 3, 64, 32), &Device::Cpu)?;
        let garment = Tensor::rand(-1f32, 1f32, (2, 3, 64, 32), &Device::Cpu)?;
        let (output, warped) = net.forward_t(&person, &garment, true)?;
        assert_eq!(output.dims(), &[2, 3, 64, 32]);
        assert_eq!(warped.dims(), &[2, 3, 64, 32]);

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("warping.flow_head.weight"));
        assert!(data.contains_key("generator.final.weight"));
        assert!(data.keys().all(|k| k.starts_with("warping.") || k.starts_with("generator.")));
        Ok(())
    }
}
