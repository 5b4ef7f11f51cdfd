//! Causal transformer used as an AR network and in front of the prediction heads
//!
//! Post-norm blocks: `x = ln(x + attn(x))`, `x = ln(x + ff(x))`. Without
//! absolute positions, attention carries a learned relative position term.

use anyhow::Result;
use candle_core::{Device, Tensor, D};
use candle_nn::{Init, Linear, Module, VarBuilder};

use super::norm::GradLayerNorm;
use crate::utils::tensor_utils::{create_causal_mask_u8, grad_softmax_last_dim, mask_to_attention_bias};

const N_HEADS: usize = 8;
const DIM_FEEDFORWARD: usize = 2048;

/// Sinusoidal position table (len, dim)
fn sinusoidal_positions(len: usize, dim: usize, device: &Device) -> Result<Tensor> {
    let mut table = vec![0f32; len * dim];
    for pos in 0..len {
        for i in 0..dim {
            let exponent = (2 * (i / 2)) as f32 / dim as f32;
            let angle = pos as f32 / 10000f32.powf(exponent);
            table[pos * dim + i] = if i % 2 == 0 { angle.sin() } else { angle.cos() };
        }
    }
    Ok(Tensor::from_vec(table, (len, dim), device)?)
}

struct CausalSelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    /// (head_dim, size_seq) relative position keys
    k_relpos: Option<Tensor>,
    num_heads: usize,
    head_dim: usize,
}

impl CausalSelfAttention {
    fn new(dim: usize, size_seq: usize, relpos: bool, vb: VarBuilder) -> Result<Self> {
        let num_heads = if dim % N_HEADS == 0 { N_HEADS } else { 1 };
        let head_dim = dim / num_heads;
        let k_relpos = if relpos {
            let stdev = 1.0 / (head_dim as f64).sqrt();
            Some(vb.get_with_hints((head_dim, size_seq), "k_relpos", Init::Randn { mean: 0.0, stdev })?)
        } else {
            None
        };
        Ok(Self {
            q_proj: candle_nn::linear(dim, dim, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(dim, dim, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(dim, dim, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(dim, dim, vb.pp("out_proj"))?,
            k_relpos,
            num_heads,
            head_dim,
        })
    }

    fn split_heads(&self, x: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        Ok(x.reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b * self.num_heads, t, self.head_dim))?)
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let q = self.split_heads(&self.q_proj.forward(x)?, b, t)?;
        let k = self.split_heads(&self.k_proj.forward(x)?, b, t)?;
        let v = self.split_heads(&self.v_proj.forward(x)?, b, t)?;

        let mut scores = q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;
        if let Some(k_relpos) = &self.k_relpos {
            let bh = b * self.num_heads;
            // Column c of the table scores offset size_seq - 1 - c; keep the
            // last t columns so offsets stay aligned for shorter inputs
            let size_seq = k_relpos.dim(1)?;
            let width = t.min(size_seq);
            let qp = q.broadcast_matmul(&k_relpos.narrow(1, size_seq - width, width)?)?;
            let qp = if width < t {
                let pad = Tensor::zeros((bh, t, t - width), qp.dtype(), qp.device())?;
                Tensor::cat(&[pad, qp], 2)?
            } else {
                qp
            };
            // Skew so that entry (i, j) holds the score for offset i - j
            let z = Tensor::zeros((bh, t, 1), qp.dtype(), qp.device())?;
            let skewed = Tensor::cat(&[z, qp], 2)?
                .reshape((bh, t + 1, t))?
                .narrow(1, 1, t)?;
            scores = (scores + skewed)?;
        }
        let scores = (scores / (self.head_dim as f64).sqrt())?;
        let bias = mask_to_attention_bias(&create_causal_mask_u8(t, t, x.device())?)?.squeeze(0)?;
        let weights = grad_softmax_last_dim(&scores.broadcast_add(&bias)?)?;
        let out = weights.matmul(&v)?;

        let out = out
            .reshape((b, self.num_heads, t, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.num_heads * self.head_dim))?;
        Ok(self.out_proj.forward(&out)?)
    }
}

struct TransformerLayer {
    attention: CausalSelfAttention,
    ln_att: GradLayerNorm,
    linear1: Linear,
    linear2: Linear,
    ln_ff: GradLayerNorm,
}

impl TransformerLayer {
    fn new(dim: usize, size_seq: usize, relpos: bool, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: CausalSelfAttention::new(dim, size_seq, relpos, vb.pp("attention"))?,
            ln_att: GradLayerNorm::new(dim, vb.pp("ln_att"))?,
            linear1: candle_nn::linear(dim, DIM_FEEDFORWARD, vb.pp("ff").pp("linear1"))?,
            linear2: candle_nn::linear(DIM_FEEDFORWARD, dim, vb.pp("ff").pp("linear2"))?,
            ln_ff: GradLayerNorm::new(dim, vb.pp("ln_ff"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.ln_att.forward(&(x + self.attention.forward(x)?)?)?;
        let ff = self.linear2.forward(&self.linear1.forward(&x)?.relu()?)?;
        self.ln_ff.forward(&(x + ff)?)
    }
}

/// Stack of causal transformer layers keeping the input width
pub struct TransformerAr {
    layers: Vec<TransformerLayer>,
    abspos: bool,
    dim: usize,
}

impl TransformerAr {
    /// `size_seq` is the longest sequence the relative position table covers
    pub fn new(dim: usize, n_layers: usize, size_seq: usize, abspos: bool, vb: VarBuilder) -> Result<Self> {
        let layers = (0..n_layers)
            .map(|i| TransformerLayer::new(dim, size_seq, !abspos, vb.pp("layers").pp(i)))
            .collect::<Result<_>>()?;
        Ok(Self { layers, abspos, dim })
    }

    /// Output width, equal to the input width
    pub fn dim_output(&self) -> usize {
        self.dim
    }

    /// (B, T, D) -> (B, T, D)
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = if self.abspos {
            let (_, t, d) = x.dims3()?;
            x.broadcast_add(&sinusoidal_positions(t, d, x.device())?.to_dtype(x.dtype())?)?
        } else {
            x.clone()
        };
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn test_output_shape_and_heads() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ar = TransformerAr::new(16, 2, 10, false, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 10, 16), &Device::Cpu).unwrap();
        assert_eq!(ar.forward(&x).unwrap().dims(), &[2, 10, 16]);
        assert_eq!(ar.layers[0].attention.num_heads, 8);
    }

    #[test]
    fn test_single_head_for_odd_dims() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ar = TransformerAr::new(6, 1, 4, true, vb).unwrap();
        assert_eq!(ar.layers[0].attention.num_heads, 1);
    }

    #[test]
    fn test_causality() {
        for abspos in [false, true] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let ar = TransformerAr::new(8, 1, 6, abspos, vb).unwrap();
            let x = Tensor::randn(0f32, 1.0, (1, 6, 8), &Device::Cpu).unwrap();
            let full = ar.forward(&x).unwrap();
            let prefix = ar.forward(&x.narrow(1, 0, 4).unwrap()).unwrap();
            assert!(max_abs_diff(&full.narrow(1, 0, 4).unwrap(), &prefix) < 1e-4);
        }
    }

    #[test]
    fn test_sinusoidal_first_row() {
        let table = sinusoidal_positions(3, 4, &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = table.to_vec2().unwrap();
        assert_eq!(rows[0], vec![0.0, 1.0, 0.0, 1.0]);
    }
}
