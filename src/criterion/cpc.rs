//! InfoNCE criterion predicting future encoded frames from the context

use anyhow::{bail, Result};
use candle_core::{DType, Tensor, D};
use candle_nn::{linear_no_bias, Dropout, Linear, Module, VarBuilder};
use rand::Rng;
use std::sync::Mutex;

use crate::error::CpcError;
use crate::models::TransformerAr;
use crate::utils::tensor_utils::flip_time;

enum Predictor {
    Linear(Linear),
    Transformer(TransformerAr),
}

impl Predictor {
    fn forward(&self, c: &Tensor) -> Result<Tensor> {
        match self {
            Self::Linear(l) => Ok(l.forward(c)?),
            Self::Transformer(t) => t.forward(c),
        }
    }
}

/// One predictor per future step, scoring candidates by the mean of the
/// elementwise product
struct PredictionNetwork {
    predictors: Vec<Predictor>,
    dropout: Option<Dropout>,
}

impl PredictionNetwork {
    fn new(
        n_predicts: usize,
        dim_ar: usize,
        dim_enc: usize,
        transformer: bool,
        dropout: bool,
        size_seq: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if transformer && dim_ar != dim_enc {
            return Err(CpcError::DimensionMismatch {
                context: "transformer prediction heads".into(),
                expected: dim_enc,
                actual: dim_ar,
            }
            .into());
        }
        let vb = vb.pp("predictors");
        let predictors = (0..n_predicts)
            .map(|k| -> Result<Predictor> {
                Ok(if transformer {
                    Predictor::Transformer(TransformerAr::new(dim_enc, 1, size_seq, false, vb.pp(k))?)
                } else {
                    Predictor::Linear(linear_no_bias(dim_ar, dim_enc, vb.pp(k))?)
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            predictors,
            dropout: dropout.then(|| Dropout::new(0.5)),
        })
    }

    /// c (B, W, dim_ar), candidates[k] (B, 1 + N, W, dim_enc) -> (B, 1 + N, W) per step
    fn forward(&self, c: &Tensor, candidates: &[Tensor], train: bool) -> Result<Vec<Tensor>> {
        let mut out = Vec::with_capacity(self.predictors.len());
        for (predictor, candidates) in self.predictors.iter().zip(candidates) {
            let mut pred = predictor.forward(c)?;
            if let Some(dropout) = &self.dropout {
                pred = dropout.forward(&pred, train)?;
            }
            let pred = pred.unsqueeze(1)?;
            out.push(candidates.broadcast_mul(&pred)?.mean(D::Minus1)?);
        }
        Ok(out)
    }
}

/// Contrastive predictive coding loss with uniform in-batch negatives.
///
/// For each of the `n_predicts` steps the positive candidate sits at index 0
/// among `1 + negative_sampling_ext` candidates.
pub struct CpcUnsupervisedCriterion {
    prediction: PredictionNetwork,
    n_predicts: usize,
    negative_sampling_ext: usize,
    reverse: bool,
    rng: Mutex<rand::rngs::StdRng>,
}

impl CpcUnsupervisedCriterion {
    /// Prediction heads for `n_predicts` steps from `dim_ctx` to `dim_enc`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        n_predicts: usize,
        dim_ar: usize,
        dim_enc: usize,
        negative_sampling_ext: usize,
        reverse: bool,
        transformer_heads: bool,
        dropout: bool,
        size_input_seq: usize,
        seed: u64,
        vb: VarBuilder,
    ) -> Result<Self> {
        use rand::SeedableRng;
        if size_input_seq <= n_predicts {
            bail!("sequences of {size_input_seq} frames leave no window for {n_predicts} predictions");
        }
        let prediction = PredictionNetwork::new(
            n_predicts,
            dim_ar,
            dim_enc,
            transformer_heads,
            dropout,
            size_input_seq - n_predicts,
            vb.pp("prediction"),
        )?;
        Ok(Self {
            prediction,
            n_predicts,
            negative_sampling_ext,
            reverse,
            rng: Mutex::new(rand::rngs::StdRng::seed_from_u64(seed)),
        })
    }

    /// Future steps predicted
    pub fn n_predicts(&self) -> usize {
        self.n_predicts
    }

    /// Flat row indices into the (B * S, D) encoded frames for the negatives
    /// of every (line, negative, position), shape (B * N * W)
    fn negative_indices(&self, batch: usize, seq: usize, window: usize) -> Result<Vec<u32>> {
        let n = self.negative_sampling_ext;
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| anyhow::anyhow!("negative sampler lock poisoned"))?;
        let mut idx = Vec::with_capacity(batch * n * window);
        for _ in 0..batch * n {
            for w in 0..window {
                let line = rng.gen_range(0..batch);
                let offset = rng.gen_range(1..seq);
                idx.push(((w + offset) % seq + line * seq) as u32);
            }
        }
        Ok(idx)
    }

    /// Candidates per step: positive at index 0 followed by the negatives,
    /// each (B, 1 + N, W, D)
    fn sample_clean(&self, encoded: &Tensor, window: usize) -> Result<Vec<Tensor>> {
        let (b, s, d) = encoded.dims3()?;
        let flat = encoded.contiguous()?.reshape((b * s, d))?;
        let idx = self.negative_indices(b, s, window)?;
        let idx = Tensor::from_vec(idx, b * self.negative_sampling_ext * window, encoded.device())?;
        let negatives = flat
            .index_select(&idx, 0)?
            .reshape((b, self.negative_sampling_ext, window, d))?;

        (1..=self.n_predicts)
            .map(|k| {
                let positive = encoded.narrow(1, k, window)?.unsqueeze(1)?;
                Ok(Tensor::cat(&[positive, negatives.clone()], 1)?)
            })
            .collect()
    }

    /// (losses (1, n_predicts), accuracies (1, n_predicts))
    pub fn forward(&self, c_feature: &Tensor, encoded: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (c_feature, encoded) = if self.reverse {
            (flip_time(c_feature)?, flip_time(encoded)?)
        } else {
            (c_feature.clone(), encoded.clone())
        };
        let (b, s, _) = c_feature.dims3()?;
        if s <= self.n_predicts {
            bail!("sequence of {s} frames is too short for {} predictions", self.n_predicts);
        }
        let window = s - self.n_predicts;
        let c = c_feature.narrow(1, 0, window)?;
        let candidates = self.sample_clean(&encoded, window)?;
        let predictions = self.prediction.forward(&c, &candidates, train)?;

        let mut losses = Vec::with_capacity(self.n_predicts);
        let mut accuracies = Vec::with_capacity(self.n_predicts);
        for scores in predictions {
            let n_cand = scores.dim(1)?;
            let scores = scores.transpose(1, 2)?.contiguous()?.reshape((b * window, n_cand))?;
            let log_probs = candle_nn::ops::log_softmax(&scores, D::Minus1)?;
            losses.push(log_probs.narrow(1, 0, 1)?.mean_all()?.neg()?);
            let best = scores.argmax(D::Minus1)?;
            let correct = best.eq(0u32)?.to_dtype(DType::F32)?.mean_all()?;
            accuracies.push(correct);
        }
        let losses = Tensor::stack(&losses, 0)?.unsqueeze(0)?;
        let accuracies = Tensor::stack(&accuracies, 0)?.unsqueeze(0)?;
        Ok((losses, accuracies))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::{Optimizer, VarMap};

    fn criterion(transformer: bool, reverse: bool) -> (VarMap, CpcUnsupervisedCriterion) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let c = CpcUnsupervisedCriterion::new(3, 8, 8, 5, reverse, transformer, false, 12, 0, vb).unwrap();
        (varmap, c)
    }

    #[test]
    fn test_output_shapes() {
        for transformer in [false, true] {
            let (_vm, crit) = criterion(transformer, false);
            let c = Tensor::randn(0f32, 1.0, (2, 12, 8), &Device::Cpu).unwrap();
            let enc = Tensor::randn(0f32, 1.0, (2, 12, 8), &Device::Cpu).unwrap();
            let (loss, acc) = crit.forward(&c, &enc, true).unwrap();
            assert_eq!(loss.dims(), &[1, 3]);
            assert_eq!(acc.dims(), &[1, 3]);
            let acc: Vec<f32> = acc.flatten_all().unwrap().to_vec1().unwrap();
            assert!(acc.iter().all(|a| (0.0..=1.0).contains(a)));
        }
    }

    #[test]
    fn test_negatives_never_hit_own_position_in_line() {
        let (_vm, crit) = criterion(false, false);
        let idx = crit.negative_indices(1, 12, 9).unwrap();
        for (i, &flat) in idx.iter().enumerate() {
            let w = i % 9;
            assert_ne!(flat as usize, w);
        }
    }

    #[test]
    fn test_parameter_names() {
        let (varmap, _crit) = criterion(false, false);
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("prediction.predictors.0.weight"));
        assert!(data.contains_key("prediction.predictors.2.weight"));
    }

    #[test]
    fn test_loss_decreases_with_training() {
        let (varmap, crit) = criterion(false, false);
        let enc = Tensor::randn(0f32, 1.0, (2, 12, 8), &Device::Cpu).unwrap();
        // context already equal to the future frames it has to predict
        let c = Tensor::cat(&[enc.narrow(1, 1, 11).unwrap(), enc.narrow(1, 0, 1).unwrap()], 1).unwrap();
        let mut opt = candle_nn::AdamW::new(
            varmap.all_vars(),
            candle_nn::ParamsAdamW {
                lr: 0.05,
                weight_decay: 0.0,
                ..Default::default()
            },
        )
        .unwrap();
        let first: f32 = crit.forward(&c, &enc, true).unwrap().0.sum_all().unwrap().to_scalar().unwrap();
        for _ in 0..30 {
            let (loss, _) = crit.forward(&c, &enc, true).unwrap();
            candle_nn::Optimizer::backward_step(&mut opt, &loss.sum_all().unwrap()).unwrap();
        }
        let last: f32 = crit.forward(&c, &enc, true).unwrap().0.sum_all().unwrap().to_scalar().unwrap();
        assert!(last < first);
    }

    #[test]
    fn test_too_short_sequence() {
        let (_vm, crit) = criterion(false, true);
        let x = Tensor::zeros((1, 3, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(crit.forward(&x, &x, false).is_err());
    }
}
