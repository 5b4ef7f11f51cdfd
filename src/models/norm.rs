//! Normalization layers built from primitive tensor ops
//!
//! candle's fused norm kernels have no backward pass, so every layer here
//! is written with ops that autograd can differentiate.

use anyhow::Result;
use candle_core::{Tensor, Var, D};
use candle_nn::{Init, VarBuilder};

use crate::config::NormMode;

/// Per-frame normalization across channels of a (B, C, T) tensor
///
/// Uses the unbiased channel variance, as in the CPC reference encoder.
pub struct ChannelNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl ChannelNorm {
    /// Create with affine weight/bias of shape (1, C, 1)
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((1, channels, 1), "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints((1, channels, 1), "bias", Init::Const(0.0))?;
        Ok(Self {
            weight,
            bias,
            eps: 1e-5,
        })
    }

    /// Normalize over dim 1
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(1)?;
        let var = x.var_keepdim(1)?;
        let x = x.broadcast_sub(&mean)?.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(x.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

/// Per-channel normalization over time of a (B, C, T) tensor
pub struct InstanceNorm {
    affine: Option<(Tensor, Tensor)>,
    eps: f64,
}

impl InstanceNorm {
    /// Instance norm with learned per-channel scale and shift
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        Ok(Self {
            affine: Some((weight.reshape((1, channels, 1))?, bias.reshape((1, channels, 1))?)),
            eps: 1e-5,
        })
    }

    /// Instance norm without parameters
    pub fn plain() -> Self {
        Self {
            affine: None,
            eps: 1e-5,
        }
    }

    /// Normalize over dim 2 with the biased variance
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(2)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(2)?;
        let x = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        match &self.affine {
            Some((w, b)) => Ok(x.broadcast_mul(w)?.broadcast_add(b)?),
            None => Ok(x),
        }
    }
}

/// Batch normalization over (B, T) per channel with running statistics
pub struct BatchNorm {
    weight: Tensor,
    bias: Tensor,
    running_mean: Var,
    running_var: Var,
    momentum: f64,
    eps: f64,
}

impl BatchNorm {
    /// Running statistics live in the var map next to the affine parameters
    /// so they are checkpointed; the optimizer never sees a gradient for them.
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        let running_mean =
            Var::from_tensor(&vb.get_with_hints(channels, "running_mean", Init::Const(0.0))?)?;
        let running_var =
            Var::from_tensor(&vb.get_with_hints(channels, "running_var", Init::Const(1.0))?)?;
        Ok(Self {
            weight,
            bias,
            running_mean,
            running_var,
            momentum: 0.1,
            eps: 1e-5,
        })
    }

    /// Batch statistics when `train`, running statistics otherwise
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let c = x.dim(1)?;
        let (mean, var) = if train {
            let mean = x.mean_keepdim(2)?.mean_keepdim(0)?;
            let centered = x.broadcast_sub(&mean)?;
            let var = centered.sqr()?.mean_keepdim(2)?.mean_keepdim(0)?;

            let n = (x.dim(0)? * x.dim(2)?) as f64;
            let unbiased = (var.detach() * (n / (n - 1.0).max(1.0)))?.flatten_all()?;
            let m = self.momentum;
            let new_mean = ((self.running_mean.as_tensor() * (1.0 - m))?
                + (mean.detach().flatten_all()? * m)?)?;
            let new_var = ((self.running_var.as_tensor() * (1.0 - m))? + (unbiased * m)?)?;
            self.running_mean.set(&new_mean)?;
            self.running_var.set(&new_var)?;
            (mean, var)
        } else {
            (
                self.running_mean.as_tensor().reshape((1, c, 1))?,
                self.running_var.as_tensor().reshape((1, c, 1))?,
            )
        };
        let x = x.broadcast_sub(&mean)?.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        let w = self.weight.reshape((1, c, 1))?;
        let b = self.bias.reshape((1, c, 1))?;
        Ok(x.broadcast_mul(&w)?.broadcast_add(&b)?)
    }

    /// Forget the running statistics
    pub fn reset_running_stats(&self) -> Result<()> {
        self.running_mean.set(&self.running_mean.zeros_like()?)?;
        self.running_var.set(&self.running_var.ones_like()?)?;
        Ok(())
    }
}

/// Layer norm over the last dim
pub struct GradLayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl GradLayerNorm {
    /// Create with weight 1 and bias 0
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(dim, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight,
            bias,
            eps: 1e-5,
        })
    }

    /// Normalize the last dim
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let x = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(x.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

/// Norm layer placed after each encoder convolution
pub enum EncoderNorm {
    /// Channel norm
    Channel(ChannelNorm),
    /// Instance norm
    Instance(InstanceNorm),
    /// Batch norm
    Batch(BatchNorm),
    /// No normalization
    Identity,
}

impl EncoderNorm {
    /// Build the layer selected by `mode`
    pub fn new(mode: NormMode, channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match mode {
            NormMode::LayerNorm => Self::Channel(ChannelNorm::new(channels, vb)?),
            NormMode::InstanceNorm => Self::Instance(InstanceNorm::new(channels, vb)?),
            NormMode::BatchNorm => Self::Batch(BatchNorm::new(channels, vb)?),
            NormMode::Identity => Self::Identity,
        })
    }

    /// Apply the norm
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Channel(n) => n.forward(x),
            Self::Instance(n) => n.forward(x),
            Self::Batch(n) => n.forward(x, train),
            Self::Identity => Ok(x.clone()),
        }
    }

    /// Reset batch-norm running statistics; no-op for the other layers
    pub fn reset_running_stats(&self) -> Result<()> {
        if let Self::Batch(n) = self {
            n.reset_running_stats()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_channel_norm_zero_mean_over_channels() {
        let varmap = VarMap::new();
        let norm = ChannelNorm::new(4, vb(&varmap)).unwrap();
        let x = Tensor::randn(0f32, 3.0, (2, 4, 5), &Device::Cpu).unwrap();
        let y = norm.forward(&x).unwrap();
        let mean: Vec<Vec<Vec<f32>>> = y.mean_keepdim(1).unwrap().to_vec3().unwrap();
        for v in mean.iter().flatten().flatten() {
            assert!(v.abs() < 1e-4);
        }
    }

    #[test]
    fn test_instance_norm_unit_variance() {
        let norm = InstanceNorm::plain();
        let x = Tensor::randn(1f32, 2.0, (1, 3, 50), &Device::Cpu).unwrap();
        let y = norm.forward(&x).unwrap();
        let var: Vec<f32> = y.sqr().unwrap().mean(2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for v in var {
            assert!((v - 1.0).abs() < 1e-2);
        }
    }

    #[test]
    fn test_batch_norm_updates_running_stats() {
        let varmap = VarMap::new();
        let norm = BatchNorm::new(2, vb(&varmap)).unwrap();
        let x = (Tensor::ones((4, 2, 8), DType::F32, &Device::Cpu).unwrap() * 5.0).unwrap();
        norm.forward(&x, true).unwrap();
        let mean: Vec<f32> = norm.running_mean.as_tensor().to_vec1().unwrap();
        assert!((mean[0] - 0.5).abs() < 1e-5);

        norm.reset_running_stats().unwrap();
        let mean: Vec<f32> = norm.running_mean.as_tensor().to_vec1().unwrap();
        assert_eq!(mean, vec![0.0, 0.0]);
    }
}
