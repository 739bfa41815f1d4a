pub mod layers;
pub mod flow_warp;
pub mod unet_synthesizer;
pub mod vgg_perceptual;
pub mod vton_network;

pub use flow_warp::{FlowWarpConfig, FlowWarpEstimator};
pub use unet_synthesizer::{SynthesizerConfig, UNetSynthesizer};
pub use vgg_perceptual::PerceptualComparator;
pub use vton_network::{VtonNetwork, VtonNetworkConfig};
