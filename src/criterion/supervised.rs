//! Supervised speaker / phone classifiers and the no-op criterion

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

/// Mean cross-entropy and accuracy of (N, C) logits against (N) labels,
/// each returned as (1, 1)
pub fn classification_loss(logits: &Tensor, labels: &Tensor) -> Result<(Tensor, Tensor)> {
    let labels = labels.to_dtype(DType::U32)?;
    let loss = candle_nn::loss::cross_entropy(logits, &labels)?;
    let acc = logits
        .argmax(D::Minus1)?
        .eq(&labels)?
        .to_dtype(DType::F32)?
        .mean_all()?;
    Ok((loss.reshape((1, 1))?, acc.reshape((1, 1))?))
}

/// Speaker classification from the last context frame
pub struct SpeakerCriterion {
    classifier: Linear,
}

impl SpeakerCriterion {
    /// Linear speaker classifier on `dim` features
    pub fn new(dim: usize, n_speakers: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            classifier: linear(dim, n_speakers, vb.pp("classifier"))?,
        })
    }

    /// Per-sequence loss and accuracy from the last context frame
    pub fn forward(&self, c_feature: &Tensor, speakers: &Tensor) -> Result<(Tensor, Tensor)> {
        let s = c_feature.dim(1)?;
        let last = c_feature.narrow(1, s - 1, 1)?.squeeze(1)?;
        classification_loss(&self.classifier.forward(&last)?, speakers)
    }
}

/// Frame-level phone classification on context or encoder features
pub struct PhoneCriterion {
    classifier: Linear,
    on_encoder: bool,
}

impl PhoneCriterion {
    /// Linear phone classifier
    pub fn new(dim: usize, n_phones: usize, on_encoder: bool, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            classifier: linear(dim, n_phones, vb.pp("classifier"))?,
            on_encoder,
        })
    }

    /// `phones` (B, S) frame labels
    pub fn forward(&self, c_feature: &Tensor, encoded: &Tensor, phones: &Tensor) -> Result<(Tensor, Tensor)> {
        let features = if self.on_encoder { encoded } else { c_feature };
        let logits = self.classifier.forward(features)?;
        let n = logits.dim(D::Minus1)?;
        let logits = logits.reshape(((), n))?;
        classification_loss(&logits, &phones.flatten_all()?)
    }
}

/// Zero loss and accuracy, shape (1, 1)
pub fn none_outputs(like: &Tensor) -> Result<(Tensor, Tensor)> {
    let zeros = Tensor::zeros((1, 1), DType::F32, like.device())?;
    Ok((zeros.clone(), zeros))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_classification_loss_perfect_logits() {
        let logits = Tensor::new(&[[10f32, 0.0], [0.0, 10.0]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 1], &Device::Cpu).unwrap();
        let (loss, acc) = classification_loss(&logits, &labels).unwrap();
        let loss: f32 = loss.squeeze(0).unwrap().squeeze(0).unwrap().to_scalar().unwrap();
        let acc: f32 = acc.squeeze(0).unwrap().squeeze(0).unwrap().to_scalar().unwrap();
        assert!(loss < 1e-3);
        assert_eq!(acc, 1.0);
    }

    #[test]
    fn test_phone_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let crit = PhoneCriterion::new(4, 3, true, vb).unwrap();
        let c = Tensor::zeros((2, 5, 7), DType::F32, &Device::Cpu).unwrap();
        let enc = Tensor::randn(0f32, 1.0, (2, 5, 4), &Device::Cpu).unwrap();
        let phones = Tensor::zeros((2, 5), DType::U32, &Device::Cpu).unwrap();
        let (loss, acc) = crit.forward(&c, &enc, &phones).unwrap();
        assert_eq!(loss.dims(), &[1, 1]);
        assert_eq!(acc.dims(), &[1, 1]);
    }

    #[test]
    fn test_speaker_uses_last_frame() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let crit = SpeakerCriterion::new(4, 2, vb).unwrap();
        let c = Tensor::randn(0f32, 1.0, (3, 6, 4), &Device::Cpu).unwrap();
        let speakers = Tensor::new(&[0u32, 1, 1], &Device::Cpu).unwrap();
        let (loss, _) = crit.forward(&c, &speakers).unwrap();
        let loss: f32 = loss.sum_all().unwrap().to_scalar().unwrap();
        assert!(loss.is_finite());
    }
}
