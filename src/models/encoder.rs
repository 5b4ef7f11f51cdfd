//! Frame encoders mapping raw audio (B, 1, L) to latent frames (B, C, L / 160)
//!
//! - `CpcEncoder`: five strided convolutions, total stride 160
//! - `MfccEncoder`: fixed MFCC features
//! - `LfbEncoder`: learned complex filterbank followed by a Hann low-pass

use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Module, VarBuilder};
use std::f32::consts::PI;

use super::norm::{EncoderNorm, InstanceNorm};
use crate::audio::Mfcc;
use crate::config::{CpcConfig, EncoderType, NormMode};

/// (kernel, stride, padding) of the five encoder convolutions
const CONV_LAYOUT: [(usize, usize, usize); 5] =
    [(10, 5, 3), (8, 4, 2), (4, 2, 1), (4, 2, 1), (4, 2, 1)];

/// Strided convolution encoder
pub struct CpcEncoder {
    convs: Vec<Conv1d>,
    norms: Vec<EncoderNorm>,
    hidden: usize,
    no_last_relu: bool,
}

impl CpcEncoder {
    /// Create the encoder with `hidden` channels in every layer
    pub fn new(hidden: usize, norm_mode: NormMode, no_last_relu: bool, vb: VarBuilder) -> Result<Self> {
        let mut convs = Vec::with_capacity(CONV_LAYOUT.len());
        let mut norms = Vec::with_capacity(CONV_LAYOUT.len());
        for (i, &(kernel, stride, padding)) in CONV_LAYOUT.iter().enumerate() {
            let in_channels = if i == 0 { 1 } else { hidden };
            let cfg = Conv1dConfig {
                padding,
                stride,
                ..Default::default()
            };
            convs.push(candle_nn::conv1d(
                in_channels,
                hidden,
                kernel,
                cfg,
                vb.pp(format!("conv{i}")),
            )?);
            norms.push(EncoderNorm::new(norm_mode, hidden, vb.pp(format!("norm{i}")))?);
        }
        Ok(Self {
            convs,
            norms,
            hidden,
            no_last_relu,
        })
    }

    /// Forward pass, output (B, hidden, L / 160)
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let last = self.convs.len() - 1;
        let mut x = x.clone();
        for (i, (conv, norm)) in self.convs.iter().zip(&self.norms).enumerate() {
            x = norm.forward(&conv.forward(&x)?, train)?;
            if i < last || !self.no_last_relu {
                x = x.relu()?;
            }
        }
        Ok(x)
    }
}

/// Fixed MFCC encoder
pub struct MfccEncoder {
    mfcc: Mfcc,
}

impl MfccEncoder {
    /// `dim` MFCC coefficients per frame
    pub fn new(dim: usize, sample_rate: u32) -> Self {
        Self {
            mfcc: Mfcc::new(dim, sample_rate),
        }
    }

    /// Output (B, dim, L / 160); the trailing centered frame is dropped so
    /// frame counts match the convolutional encoder
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let len = x.dim(x.rank() - 1)?;
        let frames = len / crate::DOWNSAMPLING;
        let features = self.mfcc.compute_tensor(x, x.device())?;
        Ok(features.narrow(2, 0, frames.min(features.dim(2)?))?)
    }
}

/// Learned log filterbank
pub struct LfbEncoder {
    conv: Conv1d,
    hann: Tensor,
    norm: Option<InstanceNorm>,
    dim: usize,
}

impl LfbEncoder {
    /// `dim` complex filters of width 400
    pub fn new(dim: usize, normalize: bool, vb: VarBuilder) -> Result<Self> {
        let conv = candle_nn::conv1d(1, 2 * dim, 400, Conv1dConfig::default(), vb.pp("conv"))?;
        let window: Vec<f32> = (0..400)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / 400.0).cos()))
            .collect();
        let hann = Tensor::from_vec(window, (1, 1, 400), vb.device())?;
        Ok(Self {
            conv,
            hann,
            norm: normalize.then(InstanceNorm::plain),
            dim,
        })
    }

    /// Output (B, dim, L / 160)
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let n = x.dim(0)?;
        let x = self.conv.forward(x)?;
        let t = x.dim(2)?;
        let x = x.reshape((n, self.dim, 2, t))?;
        let power = (x.narrow(2, 0, 1)?.sqr()? + x.narrow(2, 1, 1)?.sqr()?)?;
        let power = power.reshape((n * self.dim, 1, t))?;
        let smoothed = power.conv1d(&self.hann, 350, crate::DOWNSAMPLING, 1, 1)?;
        let frames = smoothed.dim(2)?;
        let x = (smoothed.reshape((n, self.dim, frames))?.abs()? + 1.0)?.log()?;
        match &self.norm {
            Some(norm) => norm.forward(&x),
            None => Ok(x),
        }
    }
}

/// Any of the frame encoders
pub enum Encoder {
    /// Convolutional encoder
    Cpc(CpcEncoder),
    /// MFCC encoder
    Mfcc(MfccEncoder),
    /// Learned filterbank encoder
    Lfb(LfbEncoder),
}

impl Encoder {
    /// Build the encoder selected by the config
    pub fn from_config(config: &CpcConfig, vb: VarBuilder) -> Result<Self> {
        Ok(match config.encoder_type {
            EncoderType::Cpc => Self::Cpc(CpcEncoder::new(
                config.hidden_encoder,
                config.norm_mode,
                config.encoder_no_last_relu,
                vb,
            )?),
            EncoderType::Mfcc => Self::Mfcc(MfccEncoder::new(config.hidden_encoder, config.sample_rate)),
            EncoderType::Lfb => Self::Lfb(LfbEncoder::new(config.hidden_encoder, true, vb)?),
        })
    }

    /// Encode (B, 1, L) audio into (B, C, T) frames
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = x.to_dtype(DType::F32)?;
        match self {
            Self::Cpc(e) => e.forward(&x, train),
            Self::Mfcc(e) => e.forward(&x),
            Self::Lfb(e) => e.forward(&x),
        }
    }

    /// Number of output channels
    pub fn dim_output(&self) -> usize {
        match self {
            Self::Cpc(e) => e.hidden,
            Self::Mfcc(e) => e.mfcc.n_mfcc(),
            Self::Lfb(e) => e.dim,
        }
    }

    /// Audio samples per output frame
    pub fn downsampling(&self) -> usize {
        crate::DOWNSAMPLING
    }

    /// Reset batch-norm running statistics
    pub fn reset_running_stats(&self) -> Result<()> {
        if let Self::Cpc(e) = self {
            for norm in &e.norms {
                norm.reset_running_stats()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn audio(len: usize) -> Tensor {
        Tensor::randn(0f32, 0.1, (2, 1, len), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_cpc_encoder_downsamples_by_160() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = CpcEncoder::new(16, NormMode::LayerNorm, false, vb).unwrap();
        let out = encoder.forward(&audio(3200), true).unwrap();
        assert_eq!(out.dims(), &[2, 16, 20]);
        let min: f32 = out.min_keepdim(0).unwrap().flatten_all().unwrap().min(0).unwrap().to_scalar().unwrap();
        assert!(min >= 0.0);
    }

    #[test]
    fn test_lfb_encoder_frames() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = LfbEncoder::new(8, true, vb).unwrap();
        let out = encoder.forward(&audio(20480)).unwrap();
        assert_eq!(out.dims(), &[2, 8, 128]);
    }

    #[test]
    fn test_mfcc_encoder_frames() {
        let encoder = MfccEncoder::new(13, 16000);
        let out = encoder.forward(&audio(3200)).unwrap();
        assert_eq!(out.dims(), &[2, 13, 20]);
    }

    #[test]
    fn test_encoder_enum_dims() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = CpcConfig {
            hidden_encoder: 12,
            norm_mode: NormMode::BatchNorm,
            ..Default::default()
        };
        let encoder = Encoder::from_config(&config, vb).unwrap();
        assert_eq!(encoder.dim_output(), 12);
        assert_eq!(encoder.downsampling(), 160);
        encoder.reset_running_stats().unwrap();
    }
}
