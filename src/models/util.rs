//! Small helpers shared by the attention and transformer layers

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, Init, Linear, VarBuilder};

/// Most negative finite value representable in `dtype`
pub fn max_neg_value(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => -half::f16::MAX.to_f64(),
        DType::BF16 => -half::bf16::MAX.to_f64(),
        DType::F64 => f64::MIN,
        DType::I64 => i64::MIN as f64,
        DType::U8 | DType::U32 => 0.0,
        _ => f32::MIN as f64,
    }
}

/// `U(-1/sqrt(dim), 1/sqrt(dim))`, `dim` being the last axis of the parameter
pub fn uniform_init(dim: usize) -> Init {
    let std = 1.0 / (dim as f64).sqrt();
    Init::Uniform { lo: -std, up: std }
}

/// Group normalization used in front of every spatial transformer
pub fn normalize(in_channels: usize, num_groups: usize, vb: VarBuilder) -> Result<GroupNorm> {
    candle_nn::group_norm(num_groups, in_channels, 1e-6, vb)
}

/// Affine layer norm over the last axis.
///
/// Built from plain tensor ops so `weight`, `bias` and the input all receive
/// gradients; the fused `candle_nn::ops::layer_norm` is forward-only.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f32,
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        candle_nn::ops::layer_norm_slow(xs, &self.weight, &self.bias, self.eps)
    }
}

pub fn layer_norm(dim: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
    let bias = vb.get_with_hints(dim, "bias", Init::Const(0.0))?;
    Ok(LayerNorm {
        weight,
        bias,
        eps: eps as f32,
    })
}

/// Linear layer whose weight and bias start at zero
pub fn zero_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", Init::Const(0.0))?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// 1x1 convolution whose weight and bias start at zero
pub fn zero_conv2d(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    let weight = vb.get_with_hints((out_channels, in_channels, 1, 1), "weight", Init::Const(0.0))?;
    let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;
    Ok(Conv2d::new(weight, Some(bias), Conv2dConfig::default()))
}
