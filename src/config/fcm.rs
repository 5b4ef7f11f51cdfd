//! Prototype pushing, FCM membership and AR shortening options

use serde::{Deserialize, Serialize};

use crate::error::CpcError;

/// Where the centers used for pushing and FCM membership come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CenterSource {
    /// Learnable `num_protos x repr_dim` prototypes trained with the criterion
    Prototypes,
    /// Centers of the periodically refreshed k-means clustering
    KMeans,
}

impl Default for CenterSource {
    fn default() -> Self {
        Self::Prototypes
    }
}

/// Boundary detector used when the AR input is shortened
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmenterKind {
    /// Greedy bottom-up merging of adjacent segments
    Hierarchical,
    /// Iterative variance-based boundary retention
    Jch {
        /// Fraction of boundaries kept at each reduction round
        step_reduction: f64,
    },
    /// Peaks of the frame dissimilarity curve
    Kreuk {
        /// Minimum peak prominence on the min-max normalized curve
        prominence: f64,
    },
    /// Local maxima of the frame dissimilarity curve over their neighbours
    Jhu {
        /// Margin a maximum must exceed its two-frame neighbourhood by
        threshold: f64,
    },
}

impl Default for SegmenterKind {
    fn default() -> Self {
        Self::Hierarchical
    }
}

/// FCM / push / shortening settings
///
/// Every `Option` is "off" when `None`. Weights that take a gradual start
/// ramp linearly from the start epoch to the last epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FcmSettings {
    /// Enable the FCM projections around the AR network
    pub fcm_project: bool,
    /// Append two length slots to the AR input
    pub model_length_in_ar: bool,
    /// Target shortening factor of the AR input
    pub hier_ar_shorten: Option<f64>,
    /// Epoch the shortening starts ramping from 1
    pub hier_ar_gradual_start: Option<f64>,
    /// Exponent of the merged length in the merge cost
    pub hier_ar_merge_prior: Option<f64>,
    /// Boundary detector for the shortening
    pub segmenter: SegmenterKind,
    /// Push weight on the encoder output for every consumer
    pub vq_push_enc_center_weight_on_top_conv: Option<f64>,
    /// Push weight on the AR input only
    pub vq_push_enc_center_weight_only_ar: Option<f64>,
    /// Push weight on the encoded criterion input only
    pub vq_push_enc_center_weight_only_criterion: Option<f64>,
    /// Push weight on the context criterion input
    pub vq_push_ctx_center_weight: Option<f64>,
    /// Gradual start of the push weights
    pub vq_gradual_start: Option<f64>,
    /// Push loss weight on the encoded features
    pub push_loss_weight_enc: Option<f64>,
    /// Push loss weight on the context features
    pub push_loss_weight_ctx: Option<f64>,
    /// Linear instead of squared push loss
    pub push_loss_linear: bool,
    /// Gradual start of the push loss
    pub push_loss_gradual_start: Option<f64>,
    /// Scale of the loss pulling used centers to their points
    pub push_loss_protos_mult: Option<f64>,
    /// Normalize centers in the push loss
    pub push_loss_center_norm: bool,
    /// Normalize points in the push loss
    pub push_loss_point_norm: bool,
    /// Reweight normalized distances by the point norm
    pub push_loss_norm_reweight: bool,
    /// Concatenate pushed features and memberships
    pub reprs_concat: bool,
    /// Blend the concatenation by sums instead of lengths
    pub reprs_concat_norm_sums_not_lengths: bool,
    /// Number of centers
    pub num_protos: usize,
    /// Where centers come from
    pub centers: CenterSource,
    /// FCM exponent of the memberships before the AR network
    pub m_before_ar: Option<f64>,
    /// Memberships kept after the AR network
    pub left_protos: Option<usize>,
    /// Push degree before the AR network
    pub push_deg_feature_before_ar: Option<f64>,
    /// FCM exponent of the memberships after the AR network
    pub m_after_ar: Option<f64>,
    /// Push degree of the context after the AR network
    pub push_deg_ctx_after_ar: Option<f64>,
    /// Push degree of context and encoding after the AR network
    pub push_deg_all_after_ar: Option<f64>,
}

impl FcmSettings {
    /// Check option combinations that cannot be honoured together
    pub fn validate(&self) -> Result<(), CpcError> {
        if self.push_loss_point_norm && !self.push_loss_center_norm {
            return Err(CpcError::config(
                "push_loss_point_norm requires push_loss_center_norm",
            ));
        }
        if self.m_before_ar.is_some() && self.m_after_ar.is_some() {
            return Err(CpcError::config(
                "m_before_ar and m_after_ar are mutually exclusive",
            ));
        }
        if self.push_deg_ctx_after_ar.is_some() && self.push_deg_all_after_ar.is_some() {
            return Err(CpcError::config(
                "push_deg_ctx_after_ar and push_deg_all_after_ar are mutually exclusive; \
                 push_deg_all_after_ar already pushes the context",
            ));
        }
        if let Some(m) = self.m_before_ar.or(self.m_after_ar) {
            if m <= 1.0 {
                return Err(CpcError::config(format!("FCM exponent m must be > 1, got {m}")));
            }
        }
        if let Some(s) = self.hier_ar_shorten {
            if s < 1.0 {
                return Err(CpcError::config(format!("hier_ar_shorten must be >= 1, got {s}")));
            }
        }
        let needs_centers = self.m_before_ar.is_some()
            || self.m_after_ar.is_some()
            || self.doing_push_loss_or_push_after()
            || self.vq_push_enc_center_weight_on_top_conv.is_some()
            || self.vq_push_enc_center_weight_only_ar.is_some()
            || self.push_deg_feature_before_ar.is_some()
            || self.push_deg_ctx_after_ar.is_some()
            || self.push_deg_all_after_ar.is_some();
        if needs_centers && self.num_protos == 0 {
            return Err(CpcError::config("num_protos must be > 0 when centers are used"));
        }
        Ok(())
    }

    /// True when the training loop has to run the push-loss pass
    pub fn doing_push_loss_or_push_after(&self) -> bool {
        self.push_loss_weight_enc.is_some()
            || self.push_loss_weight_ctx.is_some()
            || self.vq_push_enc_center_weight_only_criterion.is_some()
            || self.vq_push_ctx_center_weight.is_some()
    }

    /// Encoder dims left for features once the length slots are reserved
    pub fn base_dim(&self, encoder_dim: usize) -> usize {
        if self.model_length_in_ar {
            encoder_dim.saturating_sub(2)
        } else {
            encoder_dim
        }
    }

    /// Dimension of the AR input for a given encoder width
    pub fn ar_input_dim(&self, encoder_dim: usize) -> usize {
        let encoder_dim = self.base_dim(encoder_dim);
        let base = if self.fcm_project && self.m_before_ar.is_some() {
            if self.reprs_concat {
                encoder_dim + self.num_protos
            } else {
                self.num_protos
            }
        } else {
            encoder_dim
        };
        if self.model_length_in_ar {
            base + 2
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_norm_requires_center_norm() {
        let settings = FcmSettings {
            push_loss_point_norm: true,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_ar_input_dim_concat() {
        let settings = FcmSettings {
            fcm_project: true,
            reprs_concat: true,
            m_before_ar: Some(2.0),
            num_protos: 50,
            ..Default::default()
        };
        assert_eq!(settings.ar_input_dim(256), 306);

        let settings = FcmSettings {
            reprs_concat: false,
            ..settings
        };
        assert_eq!(settings.ar_input_dim(256), 50);
    }

    #[test]
    fn test_ar_input_dim_with_length_slots() {
        let settings = FcmSettings {
            model_length_in_ar: true,
            ..Default::default()
        };
        assert_eq!(settings.base_dim(256), 254);
        assert_eq!(settings.ar_input_dim(256), 256);
    }

    #[test]
    fn test_push_loss_flag() {
        let mut settings = FcmSettings::default();
        assert!(!settings.doing_push_loss_or_push_after());
        settings.vq_push_ctx_center_weight = Some(0.5);
        assert!(settings.doing_push_loss_or_push_after());
    }
}
