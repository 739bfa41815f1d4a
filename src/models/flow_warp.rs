//! Flow-based garment warping
//!
//! A small strided CNN looks at the person and the garment side by side and
//! predicts a coarse 2-channel displacement field. The field is upsampled to
//! the garment resolution, added to an identity sampling grid and the garment
//! is resampled through it. Everything stays differentiable so the warp is
//! learned end to end from the try-on loss.

use candle_core::{bail, DType, Device, Module, Result, Tensor};
use candle_nn::{Conv2d, VarBuilder};

use super::layers::{conv3x3, conv_relu, resize_bilinear};

/// Flow estimator hyperparameters
#[derive(Debug, Clone, Copy)]
pub struct FlowWarpConfig {
    /// Channels of the person representation (3 for a plain RGB image)
    pub person_channels: usize,
    pub garment_channels: usize,
    /// Width of the first stage; later stages use 2x and 4x
    pub base_channels: usize,
}

impl Default for FlowWarpConfig {
    fn default() -> Self {
        Self {
            person_channels: 3,
            garment_channels: 3,
            base_channels: 64,
        }
    }
}

pub struct FlowWarpEstimator {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    flow_head: Conv2d,
}

impl FlowWarpEstimator {
    pub fn new(config: FlowWarpConfig, vb: VarBuilder) -> Result<Self> {
        let in_c = config.person_channels + config.garment_channels;
        let c = config.base_channels;
        Ok(Self {
            conv1: conv3x3(in_c, c, 2, vb.pp("conv1"))?,
            conv2: conv3x3(c, c * 2, 2, vb.pp("conv2"))?,
            conv3: conv3x3(c * 2, c * 4, 2, vb.pp("conv3"))?,
            flow_head: conv3x3(c * 4, 2, 1, vb.pp("flow_head"))?,
        })
    }

    /// Predict a `[B, 2, Hg, Wg]` displacement field at the garment's resolution.
    pub fn predict_flow(&self, person: &Tensor, garment: &Tensor) -> Result<Tensor> {
        let (_, _, hp, wp) = person.dims4()?;
        let (_, _, hg, wg) = garment.dims4()?;

        // Features are extracted at the person resolution
        let garment_feat = resize_bilinear(garment, hp, wp)?;
        let x = Tensor::cat(&[person, &garment_feat], 1)?;

        let x = conv_relu(&self.conv1, &x)?;
        let x = conv_relu(&self.conv2, &x)?;
        let x = conv_relu(&self.conv3, &x)?;
        let flow = self.flow_head.forward(&x)?;

        resize_bilinear(&flow, hg, wg)
    }

    /// Warp the garment onto the person. Output has the garment's shape.
    pub fn forward(&self, person: &Tensor, garment: &Tensor) -> Result<Tensor> {
        let flow = self.predict_flow(person, garment)?;
        warp_with_flow(garment, &flow)
    }
}

fn linspace(n: usize) -> Vec<f32> {
    if n < 2 {
        return vec![-1.0; n];
    }
    (0..n)
        .map(|i| -1.0 + 2.0 * i as f32 / (n - 1) as f32)
        .collect()
}

/// Identity sampling grid `[B, 2, H, W]` spanning [-1, 1].
/// Channel 0 holds x (along width), channel 1 holds y (along height).
pub fn identity_grid(batch_size: usize, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let xs = linspace(width);
    let ys = linspace(height);
    let mut data = Vec::with_capacity(2 * height * width);
    for _ in 0..height {
        data.extend_from_slice(&xs);
    }
    for y in &ys {
        data.extend(std::iter::repeat(*y).take(width));
    }
    Tensor::from_vec(data, (1, 2, height, width), device)?.repeat((batch_size, 1, 1, 1))
}

/// Resample `image` by adding `flow` to the identity grid at the flow's
/// resolution.
pub fn warp_with_flow(image: &Tensor, flow: &Tensor) -> Result<Tensor> {
    let (b, _, h, w) = flow.dims4()?;
    let grid = identity_grid(b, h, w, flow.device())?.to_dtype(flow.dtype())?;
    grid_sample_border(image, &(grid + flow)?)
}

/// Bilinear sampling of `image` (`[B, C, Hin, Win]`) at normalized
/// coordinates `grid` (`[B, 2, H, W]`), align-corners convention, with
/// out-of-range coordinates clamped to the border.
pub fn grid_sample_border(image: &Tensor, grid: &Tensor) -> Result<Tensor> {
    let (b, c, h_in, w_in) = image.dims4()?;
    let (gb, gc, h, w) = grid.dims4()?;
    if gb != b || gc != 2 {
        bail!(
            "grid of shape {:?} does not match image batch {} with 2 coordinate channels",
            grid.dims(),
            b
        );
    }
    let n = h * w;
    let gx = grid.narrow(1, 0, 1)?.reshape((b, 1, n))?;
    let gy = grid.narrow(1, 1, 1)?.reshape((b, 1, n))?;

    let max_x = (w_in - 1) as f64;
    let max_y = (h_in - 1) as f64;
    let px = ((gx + 1.0)? * (max_x / 2.0))?.clamp(0.0, max_x)?;
    let py = ((gy + 1.0)? * (max_y / 2.0))?.clamp(0.0, max_y)?;

    // Corner indices carry no gradient, the weights do
    let x0 = px.detach().floor()?;
    let y0 = py.detach().floor()?;
    let x1 = (&x0 + 1.0)?.minimum(max_x)?;
    let y1 = (&y0 + 1.0)?.minimum(max_y)?;

    let wx1 = (&px - &x0)?;
    let wx0 = wx1.affine(-1.0, 1.0)?;
    let wy1 = (&py - &y0)?;
    let wy0 = wy1.affine(-1.0, 1.0)?;

    let flat = image.reshape((b, c, h_in * w_in))?;
    let gather = |ys: &Tensor, xs: &Tensor| -> Result<Tensor> {
        let idx = ((ys * w_in as f64)? + xs)?
            .to_dtype(DType::U32)?
            .broadcast_as((b, c, n))?
            .contiguous()?;
        flat.gather(&idx, 2)
    };

    let v00 = gather(&y0, &x0)?.broadcast_mul(&(&wx0 * &wy0)?)?;
    let v01 = gather(&y0, &x1)?.broadcast_mul(&(&wx1 * &wy0)?)?;
    let v10 = gather(&y1, &x0)?.broadcast_mul(&(&wx0 * &wy1)?)?;
    let v11 = gather(&y1, &x1)?.broadcast_mul(&(&wx1 * &wy1)?)?;

    (((v00 + v01)? + v10)? + v11)?.reshape((b, c, h, w))
}
