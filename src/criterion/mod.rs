//! Training criteria
//!
//! Every criterion maps (context, encoded, labels) to per-head losses and
//! accuracies of shape (1, K): K = `n_predicts` for CPC, 1 otherwise.

mod cpc;
mod supervised;

pub use cpc::CpcUnsupervisedCriterion;
pub use supervised::{classification_loss, PhoneCriterion, SpeakerCriterion};

use anyhow::{Context, Result};
use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::{CpcConfig, CpcMode, RnnMode};

/// Labels of one batch
#[derive(Debug, Clone, Copy)]
pub struct CriterionLabels<'a> {
    /// Speaker index per window (B)
    pub speakers: &'a Tensor,
    /// Frame labels (B, S), phones or cluster pseudo labels
    pub phones: Option<&'a Tensor>,
}

/// Criterion selected by the run configuration
pub enum Criterion {
    /// Contrastive prediction of future encodings
    Cpc(CpcUnsupervisedCriterion),
    /// Speaker classification
    Speaker(SpeakerCriterion),
    /// Frame-level phone classification
    Phone(PhoneCriterion),
    /// No trainable criterion
    None,
}

impl Criterion {
    /// (losses (1, K), accuracies (1, K))
    pub fn forward(
        &self,
        c_feature: &Tensor,
        encoded: &Tensor,
        labels: CriterionLabels,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        match self {
            Self::Cpc(c) => c.forward(c_feature, encoded, train),
            Self::Speaker(s) => s.forward(c_feature, labels.speakers),
            Self::Phone(p) => {
                let phones = labels.phones.context("phone criterion needs frame labels")?;
                p.forward(c_feature, encoded, phones)
            }
            Self::None => supervised::none_outputs(c_feature),
        }
    }

    /// Number of loss heads
    pub fn n_heads(&self) -> usize {
        match self {
            Self::Cpc(c) => c.n_predicts(),
            _ => 1,
        }
    }
}

/// Build the criterion for a model producing `(dim_ctx, dim_enc)` features.
///
/// `n_phones` is set when frame labels were loaded.
pub fn build_criterion(
    config: &CpcConfig,
    (dim_ctx, dim_enc): (usize, usize),
    n_speakers: usize,
    n_phones: Option<usize>,
    vb: VarBuilder,
) -> Result<Criterion> {
    if !config.supervised {
        if config.cpc_mode == Some(CpcMode::None) {
            return Ok(Criterion::None);
        }
        let cpc = CpcUnsupervisedCriterion::new(
            config.n_predicts,
            dim_ctx,
            dim_enc,
            config.negative_sampling_ext,
            config.cpc_mode == Some(CpcMode::Reverse),
            config.rnn_mode == RnnMode::Transformer,
            config.dropout,
            config.frames_per_window(),
            config.random_seed.unwrap_or(0),
            vb,
        )?;
        return Ok(Criterion::Cpc(cpc));
    }
    match n_phones {
        Some(n_phones) => {
            let dim = if config.on_encoder { dim_enc } else { dim_ctx };
            Ok(Criterion::Phone(PhoneCriterion::new(dim, n_phones, config.on_encoder, vb)?))
        }
        None => Ok(Criterion::Speaker(SpeakerCriterion::new(dim_ctx, n_speakers, vb)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(config: &CpcConfig, n_phones: Option<usize>) -> Criterion {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        build_criterion(config, (8, 8), 3, n_phones, vb).unwrap()
    }

    #[test]
    fn test_selection() {
        let config = CpcConfig {
            size_window: 160 * 20,
            n_predicts: 4,
            rnn_mode: RnnMode::Linear,
            ..Default::default()
        };
        assert!(matches!(build(&config, None), Criterion::Cpc(_)));
        assert_eq!(build(&config, None).n_heads(), 4);

        let none = CpcConfig {
            cpc_mode: Some(CpcMode::None),
            ..config.clone()
        };
        assert!(matches!(build(&none, None), Criterion::None));

        let supervised = CpcConfig {
            supervised: true,
            ..config
        };
        assert!(matches!(build(&supervised, None), Criterion::Speaker(_)));
        assert!(matches!(build(&supervised, Some(5)), Criterion::Phone(_)));
    }

    #[test]
    fn test_phone_requires_labels() {
        let config = CpcConfig {
            supervised: true,
            ..Default::default()
        };
        let crit = build(&config, Some(4));
        let x = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu).unwrap();
        let speakers = Tensor::zeros(1, DType::U32, &Device::Cpu).unwrap();
        let labels = CriterionLabels {
            speakers: &speakers,
            phones: None,
        };
        assert!(crit.forward(&x, &x, labels, false).is_err());
    }
}
