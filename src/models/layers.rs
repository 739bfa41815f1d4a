//! Shared building blocks for the try-on networks
//!
//! Thin constructors over `candle_nn` convolutions plus align-corners
//! bilinear resizing expressed as two matrix products so that it stays
//! differentiable on every backend.

use candle_core::{Device, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, VarBuilder};

/// 4x4 stride-2 pad-1 convolution, halves the spatial size
pub fn down_conv(in_c: usize, out_c: usize, bias: bool, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride: 2,
        ..Default::default()
    };
    if bias {
        candle_nn::conv2d(in_c, out_c, 4, cfg, vb)
    } else {
        candle_nn::conv2d_no_bias(in_c, out_c, 4, cfg, vb)
    }
}

/// 4x4 stride-2 pad-1 transposed convolution, doubles the spatial size
pub fn up_conv(in_c: usize, out_c: usize, bias: bool, vb: VarBuilder) -> Result<ConvTranspose2d> {
    let cfg = ConvTranspose2dConfig {
        padding: 1,
        stride: 2,
        ..Default::default()
    };
    if bias {
        candle_nn::conv_transpose2d(in_c, out_c, 4, cfg, vb)
    } else {
        candle_nn::conv_transpose2d_no_bias(in_c, out_c, 4, cfg, vb)
    }
}

/// 3x3 same-padding convolution with configurable stride
pub fn conv3x3(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    candle_nn::conv2d(in_c, out_c, 3, cfg, vb)
}

pub fn leaky_relu(x: &Tensor, negative_slope: f64) -> Result<Tensor> {
    x.maximum(&(x * negative_slope)?)
}

/// Row-stochastic `(n_out, n_in)` matrix performing 1D linear
/// interpolation with the align-corners convention.
pub fn interpolation_matrix(n_in: usize, n_out: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; n_out * n_in];
    for i in 0..n_out {
        let src = if n_out > 1 {
            i as f32 * (n_in - 1) as f32 / (n_out - 1) as f32
        } else {
            0.0
        };
        let i0 = (src.floor() as usize).min(n_in - 1);
        let i1 = (i0 + 1).min(n_in - 1);
        let w1 = src - i0 as f32;
        data[i * n_in + i0] += 1.0 - w1;
        data[i * n_in + i1] += w1;
    }
    Tensor::from_vec(data, (n_out, n_in), device)
}

/// Bilinear resize of a `[B, C, H, W]` tensor to `(height, width)`,
/// matching `align_corners = true` semantics.
pub fn resize_bilinear(x: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    if h == height && w == width {
        return Ok(x.clone());
    }
    let ry = interpolation_matrix(h, height, x.device())?.to_dtype(x.dtype())?;
    let rx_t = interpolation_matrix(w, width, x.device())?
        .to_dtype(x.dtype())?
        .t()?
        .contiguous()?;
    ry.broadcast_matmul(&x.contiguous()?)?.broadcast_matmul(&rx_t)
}

/// Apply a module and a ReLU
pub fn conv_relu<M: Module>(m: &M, x: &Tensor) -> Result<Tensor> {
    m.forward(x)?.relu()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolation_matrix_rows_sum_to_one() -> Result<()> {
        let m = interpolation_matrix(4, 9, &Device::Cpu)?;
        let sums = m.sum(1)?.to_vec1::<f32>()?;
        for s in sums {
            assert!((s - 1.0).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_resize_bilinear_preserves_corners() -> Result<()> {
        let x = Tensor::arange(0f32, 6.0, &Device::Cpu)?.reshape((1, 1, 2, 3))?;
        let y = resize_bilinear(&x, 4, 5)?;
        assert_eq!(y.dims(), &[1, 1, 4, 5]);
        let y = y.flatten_all()?.to_vec1::<f32>()?;
        assert!((y[0] - 0.0).abs() < 1e-5);
        assert!((y[4] - 2.0).abs() < 1e-5);
        assert!((y[15] - 3.0).abs() < 1e-5);
        assert!((y[19] - 5.0).abs() < 1e-5);
        // centre of the first output row lands exactly on the middle input column
        assert!((y[2] - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_leaky_relu() -> Result<()> {
        let x = Tensor::new(&[-1f32, 0.0, 2.0], &Device::Cpu)?;
        let y = leaky_relu(&x, 0.2)?.to_vec1::<f32>()?;
        assert_eq!(y, vec![-0.2, 0.0, 2.0]);
        Ok(())
    }
}
