//! Autoregressive context networks over (B, T, D) frame sequences

use anyhow::{anyhow, Result};
use candle_core::{Tensor, D};
use candle_nn::rnn::{GRUState, LSTMState};
use candle_nn::{Init, Linear, Module, VarBuilder, GRU, LSTM, RNN};
use std::sync::Mutex;

use super::transformer::TransformerAr;
use crate::config::{ArMode, CpcConfig, CpcMode, SamplingType};
use crate::utils::tensor_utils::flip_time;

/// Single-layer Elman network with tanh activation, parameter names
/// matching the GRU/LSTM layers (`weight_ih_l{k}`, ...)
pub struct TanhRnn {
    ih: Linear,
    hh: Linear,
    hidden: usize,
}

impl TanhRnn {
    /// Layer `layer_idx` of a stacked network
    pub fn new(in_dim: usize, hidden: usize, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        let bound = 1.0 / (hidden as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let w_ih = vb.get_with_hints((hidden, in_dim), &format!("weight_ih_l{layer_idx}"), init)?;
        let w_hh = vb.get_with_hints((hidden, hidden), &format!("weight_hh_l{layer_idx}"), init)?;
        let b_ih = vb.get_with_hints(hidden, &format!("bias_ih_l{layer_idx}"), init)?;
        let b_hh = vb.get_with_hints(hidden, &format!("bias_hh_l{layer_idx}"), init)?;
        Ok(Self {
            ih: Linear::new(w_ih, Some(b_ih)),
            hh: Linear::new(w_hh, Some(b_hh)),
            hidden,
        })
    }

    /// Run over the sequence from `h0`, returning (outputs (B, T, H), last h)
    pub fn seq(&self, x: &Tensor, h0: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (b, t, _) = x.dims3()?;
        let projected = self.ih.forward(x)?;
        let mut h = match h0 {
            Some(h) => h.clone(),
            None => Tensor::zeros((b, self.hidden), x.dtype(), x.device())?,
        };
        let mut outputs = Vec::with_capacity(t);
        for step in 0..t {
            let xt = projected.narrow(1, step, 1)?.squeeze(1)?;
            h = (xt + self.hh.forward(&h)?)?.tanh()?;
            outputs.push(h.clone());
        }
        Ok((Tensor::stack(&outputs, 1)?, h))
    }
}

enum RecurrentLayers {
    Gru(Vec<GRU>),
    Lstm(Vec<LSTM>),
    Tanh(Vec<TanhRnn>),
}

/// Per-layer state carried across calls when `keep_hidden` is set
#[derive(Clone)]
enum CarriedState {
    Gru(Vec<Tensor>),
    Lstm(Vec<(Tensor, Tensor)>),
    Tanh(Vec<Tensor>),
}

/// Stacked GRU / LSTM / tanh-RNN, batch first
pub struct CpcAr {
    layers: RecurrentLayers,
    hidden: usize,
    keep_hidden: bool,
    reverse: bool,
    carried: Mutex<Option<CarriedState>>,
}

impl CpcAr {
    /// Create a recurrent network of `n_levels` layers
    pub fn new(
        in_dim: usize,
        hidden: usize,
        keep_hidden: bool,
        n_levels: usize,
        mode: ArMode,
        reverse: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let in_dim_of = |layer_idx: usize| if layer_idx == 0 { in_dim } else { hidden };
        let layers = match mode {
            ArMode::Gru => RecurrentLayers::Gru(
                (0..n_levels)
                    .map(|layer_idx| {
                        let cfg = candle_nn::GRUConfig {
                            layer_idx,
                            ..Default::default()
                        };
                        candle_nn::gru(in_dim_of(layer_idx), hidden, cfg, vb.clone())
                    })
                    .collect::<candle_core::Result<_>>()?,
            ),
            ArMode::Lstm => RecurrentLayers::Lstm(
                (0..n_levels)
                    .map(|layer_idx| {
                        let cfg = candle_nn::LSTMConfig {
                            layer_idx,
                            ..Default::default()
                        };
                        candle_nn::lstm(in_dim_of(layer_idx), hidden, cfg, vb.clone())
                    })
                    .collect::<candle_core::Result<_>>()?,
            ),
            ArMode::Rnn => RecurrentLayers::Tanh(
                (0..n_levels)
                    .map(|layer_idx| TanhRnn::new(in_dim_of(layer_idx), hidden, layer_idx, vb.clone()))
                    .collect::<Result<_>>()?,
            ),
            other => return Err(anyhow!("{other:?} is not a recurrent AR mode")),
        };
        Ok(Self {
            layers,
            hidden,
            keep_hidden,
            reverse,
            carried: Mutex::new(None),
        })
    }

    /// Hidden size
    pub fn dim_output(&self) -> usize {
        self.hidden
    }

    /// Forget the carried hidden state
    pub fn reset_hidden(&self) -> Result<()> {
        *self.carried.lock().map_err(|_| anyhow!("AR state lock poisoned"))? = None;
        Ok(())
    }

    /// (B, T, D_in) -> (B, T, hidden); time order of the output always
    /// matches the input
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = if self.reverse { flip_time(x)? } else { x.clone() };
        let batch = x.dim(0)?;

        let mut carried = self.carried.lock().map_err(|_| anyhow!("AR state lock poisoned"))?;
        let previous = if self.keep_hidden {
            carried.clone().filter(|state| state_batch(state) == Some(batch))
        } else {
            None
        };

        let (out, last) = match &self.layers {
            RecurrentLayers::Gru(layers) => {
                let init = match previous {
                    Some(CarriedState::Gru(h)) => Some(h),
                    _ => None,
                };
                let mut xs = x;
                let mut last = Vec::with_capacity(layers.len());
                for (i, layer) in layers.iter().enumerate() {
                    let states = match &init {
                        Some(h) => layer.seq_init(&xs, &GRUState { h: h[i].clone() })?,
                        None => layer.seq(&xs)?,
                    };
                    xs = layer.states_to_tensor(&states)?;
                    if let Some(s) = states.last() {
                        last.push(s.h().detach());
                    }
                }
                (xs, CarriedState::Gru(last))
            }
            RecurrentLayers::Lstm(layers) => {
                let init = match previous {
                    Some(CarriedState::Lstm(hc)) => Some(hc),
                    _ => None,
                };
                let mut xs = x;
                let mut last = Vec::with_capacity(layers.len());
                for (i, layer) in layers.iter().enumerate() {
                    let states = match &init {
                        Some(hc) => layer.seq_init(
                            &xs,
                            &LSTMState {
                                h: hc[i].0.clone(),
                                c: hc[i].1.clone(),
                            },
                        )?,
                        None => layer.seq(&xs)?,
                    };
                    xs = layer.states_to_tensor(&states)?;
                    if let Some(s) = states.last() {
                        last.push((s.h().detach(), s.c().detach()));
                    }
                }
                (xs, CarriedState::Lstm(last))
            }
            RecurrentLayers::Tanh(layers) => {
                let init = match previous {
                    Some(CarriedState::Tanh(h)) => Some(h),
                    _ => None,
                };
                let mut xs = x;
                let mut last = Vec::with_capacity(layers.len());
                for (i, layer) in layers.iter().enumerate() {
                    let (out, h) = layer.seq(&xs, init.as_ref().map(|h| &h[i]))?;
                    xs = out;
                    last.push(h.detach());
                }
                (xs, CarriedState::Tanh(last))
            }
        };

        if self.keep_hidden {
            *carried = Some(last);
        }

        if self.reverse {
            flip_time(&out).map_err(Into::into)
        } else {
            Ok(out)
        }
    }
}

fn state_batch(state: &CarriedState) -> Option<usize> {
    let first = match state {
        CarriedState::Gru(h) | CarriedState::Tanh(h) => h.first(),
        CarriedState::Lstm(hc) => hc.first().map(|(h, _)| h),
    };
    first.and_then(|h| h.dim(0).ok())
}

/// Independent forward and backward GRUs, outputs concatenated
pub struct BiDirAr {
    forward_net: CpcAr,
    backward_net: CpcAr,
}

impl BiDirAr {
    /// `dim_output` must be even; each direction gets half of it
    pub fn new(in_dim: usize, dim_output: usize, n_levels: usize, vb: VarBuilder) -> Result<Self> {
        if dim_output % 2 != 0 {
            return Err(anyhow!("bidirectional AR needs an even output dim, got {dim_output}"));
        }
        let half = dim_output / 2;
        Ok(Self {
            forward_net: CpcAr::new(in_dim, half, false, n_levels, ArMode::Gru, false, vb.pp("net_forward"))?,
            backward_net: CpcAr::new(in_dim, half, false, n_levels, ArMode::Gru, true, vb.pp("net_backward"))?,
        })
    }

    /// (B, T, D_in) -> (B, T, dim_output)
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let xf = self.forward_net.forward(x)?;
        let xb = self.backward_net.forward(x)?;
        Ok(Tensor::cat(&[xf, xb], D::Minus1)?)
    }
}

/// Bidirectional GRU whose layers read both directions of the layer below
pub struct BiDirArTangled {
    layers: Vec<(GRU, GRU)>,
    half: usize,
}

impl BiDirArTangled {
    /// `dim_output` must be even
    pub fn new(in_dim: usize, dim_output: usize, n_levels: usize, vb: VarBuilder) -> Result<Self> {
        if dim_output % 2 != 0 {
            return Err(anyhow!("bidirectional AR needs an even output dim, got {dim_output}"));
        }
        let half = dim_output / 2;
        let mut layers = Vec::with_capacity(n_levels);
        for layer_idx in 0..n_levels {
            let layer_in = if layer_idx == 0 { in_dim } else { dim_output };
            let cfg = || candle_nn::GRUConfig {
                layer_idx,
                ..Default::default()
            };
            layers.push((
                candle_nn::gru(layer_in, half, cfg(), vb.pp("forward"))?,
                candle_nn::gru(layer_in, half, cfg(), vb.pp("backward"))?,
            ));
        }
        Ok(Self { layers, half })
    }

    /// (B, T, D_in) -> (B, T, 2 * half)
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut xs = x.clone();
        for (fwd, bwd) in &self.layers {
            let f = fwd.states_to_tensor(&fwd.seq(&xs)?)?;
            let reversed = flip_time(&xs)?;
            let b = flip_time(&bwd.states_to_tensor(&bwd.seq(&reversed)?)?)?;
            xs = Tensor::cat(&[f, b], D::Minus1)?;
        }
        Ok(xs)
    }
}

/// Any context network
pub enum ArNet {
    /// Recurrent network
    Recurrent(CpcAr),
    /// Identity
    NoAr(usize),
    /// Causal transformer
    Transformer(TransformerAr),
    /// Two independent directions
    BiDir(BiDirAr, usize),
    /// Interleaved directions
    BiDirTangled(BiDirArTangled),
}

impl ArNet {
    /// Build the network selected by the config for inputs of width `input_dim`
    pub fn from_config(config: &CpcConfig, input_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match config.ar_mode {
            ArMode::Transformer => Self::Transformer(TransformerAr::new(
                input_dim,
                1,
                config.frames_per_window(),
                config.abspos,
                vb,
            )?),
            ArMode::NoAr => Self::NoAr(input_dim),
            mode => Self::Recurrent(CpcAr::new(
                input_dim,
                config.hidden_gar,
                config.sampling_type == SamplingType::Sequential,
                config.n_levels_gru,
                mode,
                config.cpc_mode == Some(CpcMode::Reverse),
                vb,
            )?),
        })
    }

    /// (B, T, D_in) -> (B, T, dim_output)
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Recurrent(ar) => ar.forward(x),
            Self::NoAr(_) => Ok(x.clone()),
            Self::Transformer(ar) => ar.forward(x),
            Self::BiDir(ar, _) => ar.forward(x),
            Self::BiDirTangled(ar) => ar.forward(x),
        }
    }

    /// Output feature width
    pub fn dim_output(&self) -> usize {
        match self {
            Self::Recurrent(ar) => ar.dim_output(),
            Self::NoAr(dim) => *dim,
            Self::Transformer(ar) => ar.dim_output(),
            Self::BiDir(_, dim) => *dim,
            Self::BiDirTangled(ar) => ar.half * 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn input() -> Tensor {
        Tensor::randn(0f32, 1.0, (2, 6, 4), &Device::Cpu).unwrap()
    }

    fn build(mode: ArMode, keep_hidden: bool, reverse: bool, varmap: &VarMap) -> CpcAr {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        CpcAr::new(4, 5, keep_hidden, 2, mode, reverse, vb).unwrap()
    }

    #[test]
    fn test_recurrent_modes_shapes() {
        for mode in [ArMode::Gru, ArMode::Lstm, ArMode::Rnn] {
            let varmap = VarMap::new();
            let ar = build(mode, false, false, &varmap);
            let out = ar.forward(&input()).unwrap();
            assert_eq!(out.dims(), &[2, 6, 5], "{mode:?}");
        }
    }

    #[test]
    fn test_torch_style_parameter_names() {
        let varmap = VarMap::new();
        build(ArMode::Lstm, false, false, &varmap);
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("weight_ih_l0"));
        assert!(data.contains_key("weight_hh_l1"));
    }

    #[test]
    fn test_causal_forward_is_prefix_stable() {
        let varmap = VarMap::new();
        let ar = build(ArMode::Gru, false, false, &varmap);
        let x = input();
        let full = ar.forward(&x).unwrap();
        let prefix = ar.forward(&x.narrow(1, 0, 3).unwrap()).unwrap();
        let diff: f32 = (full.narrow(1, 0, 3).unwrap() - prefix)
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(0)
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_reverse_depends_on_future() {
        let varmap = VarMap::new();
        let ar = build(ArMode::Gru, false, true, &varmap);
        let x = input();
        let full = ar.forward(&x).unwrap();
        let prefix = ar.forward(&x.narrow(1, 0, 3).unwrap()).unwrap();
        let diff: f32 = (full.narrow(1, 0, 3).unwrap() - prefix)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 1e-6);
    }

    #[test]
    fn test_keep_hidden_changes_second_call() {
        let varmap = VarMap::new();
        let ar = build(ArMode::Lstm, true, false, &varmap);
        let x = input();
        let first = ar.forward(&x).unwrap();
        let second = ar.forward(&x).unwrap();
        let diff: f32 = (first - second).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff > 1e-6);

        ar.reset_hidden().unwrap();
        let third = ar.forward(&x).unwrap();
        let again = build(ArMode::Lstm, false, false, &varmap).forward(&x).unwrap();
        let diff: f32 = (third - again).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_bidirectional_dims() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ar = BiDirAr::new(4, 6, 1, vb.pp("bidir")).unwrap();
        assert_eq!(ar.forward(&input()).unwrap().dims(), &[2, 6, 6]);
        let tangled = BiDirArTangled::new(4, 6, 2, vb.pp("tangled")).unwrap();
        assert_eq!(tangled.forward(&input()).unwrap().dims(), &[2, 6, 6]);
        assert!(BiDirAr::new(4, 5, 1, vb.pp("odd")).is_err());
    }
}
