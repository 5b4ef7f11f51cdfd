//! Encoder + AR model with prototype pushing and AR-input shortening

use anyhow::{bail, Result};
use candle_core::{Tensor, D};
use candle_nn::VarBuilder;

use super::ar::ArNet;
use super::boundaries::{jch_boundaries, jhu_boundaries, kreuk_boundaries};
use super::encoder::Encoder;
use super::fcm::{gradual_active, gradual_coefficient, gradual_training_normalize, FcmProjector};
use super::segmentation::{k_for_shortening, HierarchicalSegmenter, Segmentation, SegmentationStats, MIN_SEGMENTS_PER_LINE};
use crate::config::{CpcConfig, FcmSettings, SegmenterKind};

/// Per-call inputs besides the audio
#[derive(Debug, Clone, Copy)]
pub struct ForwardContext<'a> {
    /// Prototype or k-means centers (k, D)
    pub centers: Option<&'a Tensor>,
    /// Current epoch, 0-based
    pub epoch: f64,
    /// Total number of epochs of the run
    pub total_epochs: f64,
    /// Stop segment merging above this cost
    pub max_segment_cost: Option<f64>,
    /// Batch statistics in the encoder norms
    pub train: bool,
}

impl<'a> ForwardContext<'a> {
    /// Evaluation context without centers
    pub fn eval() -> Self {
        Self {
            centers: None,
            epoch: 0.0,
            total_epochs: 1.0,
            max_segment_cost: None,
            train: false,
        }
    }
}

/// Output of `CpcModel::forward`
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Context features (B, L, dim_ctx)
    pub c_feature: Tensor,
    /// Encoded features as seen by the criterion (B, L, dim_enc)
    pub encoded: Tensor,
    /// Encoder output before any pushing (B, L, base_dim)
    pub pure_encoded: Tensor,
    /// Feature width the push-loss pass works on, when that pass is needed
    pub push_dim: Option<usize>,
    /// Statistics of the AR-input segmentation
    pub segmentation: Option<SegmentationStats>,
}

/// Output of `CpcModel::push_losses`
#[derive(Debug, Clone)]
pub struct PushOutput {
    /// Weighted push loss, scalar
    pub loss: Tensor,
    /// Closest-center counts (1, k)
    pub counts: Tensor,
    /// Context features for the criterion
    pub c_feature: Tensor,
    /// Encoded features for the criterion
    pub encoded: Tensor,
}

/// CPC feature model
pub struct CpcModel {
    encoder: Encoder,
    ar: ArNet,
    fcm: Option<FcmSettings>,
    projector: FcmProjector,
}

impl CpcModel {
    /// Assemble a model from its parts
    pub fn new(encoder: Encoder, ar: ArNet, fcm: Option<FcmSettings>) -> Self {
        let projector = fcm.as_ref().map(FcmProjector::from_settings).unwrap_or_default();
        Self {
            encoder,
            ar,
            fcm,
            projector,
        }
    }

    /// Build encoder (`encoder.*`) and AR (`ar.*`) from the config
    pub fn from_config(config: &CpcConfig, vb: VarBuilder) -> Result<Self> {
        let encoder = Encoder::from_config(config, vb.pp("encoder"))?;
        let ar = ArNet::from_config(config, config.ar_input_dim(), vb.pp("ar"))?;
        Ok(Self::new(encoder, ar, config.fcm.clone()))
    }

    /// Encoder stage
    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// Context network
    pub fn ar(&self) -> &ArNet {
        &self.ar
    }

    /// FCM settings, if any
    pub fn fcm(&self) -> Option<&FcmSettings> {
        self.fcm.as_ref()
    }

    /// Audio samples per frame
    pub fn downsampling(&self) -> usize {
        self.encoder.downsampling()
    }

    /// Encoder dims left once the length slots are reserved
    pub fn base_dim(&self) -> usize {
        match &self.fcm {
            Some(fcm) => fcm.base_dim(self.encoder.dim_output()),
            None => self.encoder.dim_output(),
        }
    }

    /// True when training has to run `push_losses` after `forward`
    pub fn doing_push_loss_or_push_after(&self) -> bool {
        self.fcm.as_ref().map_or(false, FcmSettings::doing_push_loss_or_push_after)
    }

    /// (dim_ctx, dim_enc) of the features returned by `forward`
    pub fn output_dims(&self) -> (usize, usize) {
        let base = self.base_dim();
        let ar_dim = self.ar.dim_output();
        let Some(fcm) = self.fcm.as_ref().filter(|f| f.fcm_project) else {
            return (ar_dim, base);
        };
        let protos = fcm.num_protos;
        let left = fcm.left_protos.filter(|&lp| lp > 0);
        match (fcm.reprs_concat, fcm.m_before_ar.is_some(), fcm.m_after_ar.is_some()) {
            (false, true, _) => match left {
                Some(lp) => (ar_dim.min(lp), protos.min(lp)),
                None => (ar_dim, protos),
            },
            (false, false, true) => (protos, protos),
            (true, true, _) => {
                let m_ctx = ar_dim.saturating_sub(base);
                match left {
                    Some(lp) => (base + m_ctx.min(lp), base + protos.min(lp)),
                    None => (ar_dim, base + protos),
                }
            }
            (true, false, true) => (ar_dim + protos, base + protos),
            _ => (ar_dim, base),
        }
    }

    /// Encoder output as (B, L, base_dim)
    pub fn encode(&self, audio: &Tensor, train: bool) -> Result<Tensor> {
        let encoded = self.encoder.forward(audio, train)?.transpose(1, 2)?.contiguous()?;
        if self.fcm.as_ref().map_or(false, |f| f.model_length_in_ar) {
            let d = encoded.dim(2)?;
            return Ok(encoded.narrow(2, 0, d.saturating_sub(2))?);
        }
        Ok(encoded)
    }

    fn require<'c>(centers: Option<&'c Tensor>, what: &str) -> Result<&'c Tensor> {
        match centers {
            Some(c) => Ok(c),
            None => bail!("{what} needs centers but none were given"),
        }
    }

    fn push_opt(&self, x: Tensor, centers: Option<&Tensor>, deg: Option<f64>) -> Result<Tensor> {
        match (centers, deg) {
            (Some(c), Some(deg)) => self.projector.push(&x, c, deg),
            _ => Ok(x),
        }
    }

    /// Push only the first `base` dims of `x`
    fn push_prefix(&self, x: &Tensor, base: usize, centers: Option<&Tensor>, deg: Option<f64>) -> Result<Tensor> {
        let (Some(_), Some(_)) = (centers, deg) else {
            return Ok(x.clone());
        };
        let width = x.dim(D::Minus1)?;
        if width <= base {
            return self.push_opt(x.clone(), centers, deg);
        }
        let head = self.push_opt(x.narrow(D::Minus1, 0, base)?, centers, deg)?;
        let tail = x.narrow(D::Minus1, base, width - base)?;
        Ok(Tensor::cat(&[head, tail], D::Minus1)?)
    }

    fn vq_coefficient(fcm: &FcmSettings, weight: Option<f64>, ctx: &ForwardContext) -> Option<f64> {
        let weight = weight.filter(|w| *w != 0.0)?;
        gradual_active(fcm.vq_gradual_start, ctx.epoch)
            .then(|| gradual_coefficient(weight, fcm.vq_gradual_start, ctx.epoch, ctx.total_epochs))
    }

    fn segment(&self, fcm: &FcmSettings, encoded: &Tensor, ctx: &ForwardContext) -> Result<Option<Segmentation>> {
        let Some(target_shortening) = fcm.hier_ar_shorten else {
            return Ok(None);
        };
        let shortening = match fcm.hier_ar_gradual_start {
            None => target_shortening,
            Some(start) => {
                let progress = (ctx.epoch - start).max(0.0) / (ctx.total_epochs - start).max(1.0);
                (1.0 + (target_shortening - 1.0) * progress).max(1.0)
            }
        };
        let (b, l, _) = encoded.dims3()?;
        let segmentation = match fcm.segmenter {
            SegmenterKind::Hierarchical => HierarchicalSegmenter::new(fcm.hier_ar_merge_prior).segment(
                encoded,
                ctx.max_segment_cost,
                k_for_shortening(b, l, shortening),
            )?,
            SegmenterKind::Jch { step_reduction } => {
                jch_boundaries(encoded, 1.0 / shortening, MIN_SEGMENTS_PER_LINE, step_reduction)?
            }
            SegmenterKind::Kreuk { prominence } => kreuk_boundaries(encoded, prominence)?,
            SegmenterKind::Jhu { threshold } => jhu_boundaries(encoded, threshold)?,
        };
        Ok(Some(segmentation))
    }

    /// Full forward pass on (B, 1, W) audio
    pub fn forward(&self, audio: &Tensor, ctx: &ForwardContext) -> Result<ModelOutput> {
        let mut encoded = self.encode(audio, ctx.train)?;
        let pure_encoded = encoded.clone();

        let Some(fcm) = &self.fcm else {
            let c_feature = self.ar.forward(&encoded)?;
            return Ok(ModelOutput {
                c_feature,
                encoded,
                pure_encoded,
                push_dim: None,
                segmentation: None,
            });
        };
        let centers = ctx.centers;
        let p = &self.projector;

        if let (Some(c), Some(coeff)) = (centers, Self::vq_coefficient(fcm, fcm.vq_push_enc_center_weight_on_top_conv, ctx)) {
            encoded = p.push_detached(&encoded, c, coeff)?;
        }
        let base = encoded.dim(D::Minus1)?;

        if fcm.fcm_project {
            if let Some(m) = fcm.m_before_ar {
                let c = Self::require(centers, "m_before_ar")?;
                if fcm.reprs_concat {
                    let memberships = p.membership(&encoded, c, m)?;
                    let pushed = self.push_opt(encoded.clone(), centers, fcm.push_deg_feature_before_ar)?;
                    let (pushed, memberships) = gradual_training_normalize(
                        &pushed,
                        &memberships,
                        ctx.epoch,
                        ctx.total_epochs,
                        fcm.reprs_concat_norm_sums_not_lengths,
                    )?;
                    encoded = Tensor::cat(&[pushed, memberships], D::Minus1)?;
                } else {
                    let pushed = self.push_opt(encoded, centers, fcm.push_deg_feature_before_ar)?;
                    encoded = p.membership(&pushed, c, m)?;
                }
            } else {
                encoded = self.push_opt(encoded, centers, fcm.push_deg_feature_before_ar)?;
            }
        }

        let segmentation = self.segment(fcm, &encoded, ctx)?;
        let mut ar_input = match &segmentation {
            Some(seg) => seg.compress(&encoded)?,
            None => encoded.clone(),
        };
        if let (Some(c), Some(coeff)) = (centers, Self::vq_coefficient(fcm, fcm.vq_push_enc_center_weight_only_ar, ctx)) {
            ar_input = p.push_detached(&ar_input, c, coeff)?;
        }
        if fcm.model_length_in_ar {
            let (b, s, _) = ar_input.dims3()?;
            let slots = Tensor::zeros((b, s, 2), ar_input.dtype(), ar_input.device())?;
            ar_input = Tensor::cat(&[ar_input, slots], D::Minus1)?;
        }

        let mut c_feature = self.ar.forward(&ar_input)?;
        if let Some(seg) = &segmentation {
            c_feature = seg.restore(&c_feature)?;
        }

        if fcm.fcm_project {
            (c_feature, encoded) = self.after_ar(fcm, c_feature, encoded, base, ctx)?;
        }

        Ok(ModelOutput {
            c_feature,
            encoded,
            pure_encoded,
            push_dim: fcm.doing_push_loss_or_push_after().then_some(base),
            segmentation: segmentation.map(|s| s.stats()),
        })
    }

    fn after_ar(
        &self,
        fcm: &FcmSettings,
        c_feature: Tensor,
        encoded: Tensor,
        base: usize,
        ctx: &ForwardContext,
    ) -> Result<(Tensor, Tensor)> {
        let centers = ctx.centers;
        let p = &self.projector;
        let left_protos = fcm.left_protos.filter(|&lp| lp > 0);
        let normalize = |a: &Tensor, b: &Tensor| {
            gradual_training_normalize(a, b, ctx.epoch, ctx.total_epochs, fcm.reprs_concat_norm_sums_not_lengths)
        };
        let truncate = |x: Tensor, width: usize| -> Result<Tensor> {
            let d = x.dim(D::Minus1)?;
            Ok(x.narrow(D::Minus1, 0, d.min(width))?)
        };

        if !fcm.reprs_concat {
            if fcm.m_before_ar.is_some() {
                let sums = c_feature.sum_keepdim(D::Minus1)?.maximum(1.0)?;
                let c = c_feature.broadcast_div(&sums)?;
                return match left_protos {
                    Some(lp) => Ok((truncate(c, lp)?, truncate(encoded, lp)?)),
                    None => Ok((c, encoded)),
                };
            }
            let mut c = self.push_opt(c_feature, centers, fcm.push_deg_ctx_after_ar)?;
            let mut enc = encoded;
            if fcm.push_deg_all_after_ar.is_some() {
                enc = self.push_opt(enc, centers, fcm.push_deg_all_after_ar)?;
                c = self.push_opt(c, centers, fcm.push_deg_all_after_ar)?;
            }
            if let Some(m) = fcm.m_after_ar {
                let centers = Self::require(centers, "m_after_ar")?;
                enc = p.membership(&enc, centers, m)?;
                c = p.membership(&c, centers, m)?;
            }
            return Ok((c, enc));
        }

        if fcm.m_before_ar.is_some() {
            let width = c_feature.dim(D::Minus1)?;
            if width < base {
                bail!("context width {width} is below the encoder width {base} it is split at");
            }
            let mut c_push = c_feature.narrow(D::Minus1, 0, base)?;
            let c_m = c_feature.narrow(D::Minus1, base, width - base)?;
            c_push = self.push_opt(c_push, centers, fcm.push_deg_ctx_after_ar)?;
            let mut enc = encoded;
            if fcm.push_deg_all_after_ar.is_some() {
                c_push = self.push_opt(c_push, centers, fcm.push_deg_all_after_ar)?;
                enc = self.push_prefix(&enc, base, centers, fcm.push_deg_all_after_ar)?;
            }
            let (c_push, mut c_m) = normalize(&c_push, &c_m)?;
            // the membership part of `encoded` is truncated like the context one
            if let Some(lp) = left_protos {
                let enc_width = enc.dim(D::Minus1)?;
                let e_push = enc.narrow(D::Minus1, 0, base)?;
                let e_m = truncate(enc.narrow(D::Minus1, base, enc_width - base)?, lp)?;
                enc = Tensor::cat(&[e_push, e_m], D::Minus1)?;
                c_m = truncate(c_m, lp)?;
            }
            return Ok((Tensor::cat(&[c_push, c_m], D::Minus1)?, enc));
        }

        if let Some(m) = fcm.m_after_ar {
            let centers_t = Self::require(centers, "m_after_ar")?;
            let c_m = p.membership(&c_feature, centers_t, m)?;
            let mut c_push = self.push_opt(c_feature, centers, fcm.push_deg_ctx_after_ar)?;
            c_push = self.push_opt(c_push, centers, fcm.push_deg_all_after_ar)?;
            let (c_push, c_m) = normalize(&c_push, &c_m)?;
            let c = Tensor::cat(&[c_push, c_m], D::Minus1)?;

            let e_m = p.membership(&encoded, centers_t, m)?;
            let e_push = self.push_opt(encoded, centers, fcm.push_deg_all_after_ar)?;
            let (e_push, e_m) = normalize(&e_push, &e_m)?;
            return Ok((c, Tensor::cat(&[e_push, e_m], D::Minus1)?));
        }

        let mut c = self.push_prefix(&c_feature, base, centers, fcm.push_deg_ctx_after_ar)?;
        let mut enc = encoded;
        if fcm.push_deg_all_after_ar.is_some() {
            c = self.push_prefix(&c, base, centers, fcm.push_deg_all_after_ar)?;
            enc = self.push_prefix(&enc, base, centers, fcm.push_deg_all_after_ar)?;
        }
        Ok((c, enc))
    }

    /// Second pass: push losses on the first `base_dim` features and the
    /// straight-through pushes applied only to the criterion inputs.
    ///
    /// Without centers the loss is zero and features pass through unchanged.
    pub fn push_losses(
        &self,
        c_feature: &Tensor,
        encoded: &Tensor,
        centers: Option<&Tensor>,
        ctx: &ForwardContext,
    ) -> Result<PushOutput> {
        let device = c_feature.device();
        let zero = Tensor::zeros((), c_feature.dtype(), device)?;
        let (Some(fcm), Some(centers)) = (&self.fcm, centers) else {
            let k = self.fcm.as_ref().map_or(0, |f| f.num_protos);
            return Ok(PushOutput {
                loss: zero,
                counts: Tensor::zeros((1, k), c_feature.dtype(), device)?,
                c_feature: c_feature.clone(),
                encoded: encoded.clone(),
            });
        };
        let base = self.base_dim();
        let p = &self.projector;
        let prefix = |x: &Tensor| -> Result<Tensor> {
            let d = x.dim(D::Minus1)?;
            Ok(x.narrow(D::Minus1, 0, d.min(base))?)
        };

        let mut loss = zero;
        let mut counts = Tensor::zeros((1, centers.dim(0)?), c_feature.dtype(), device)?;
        // the encoder loss runs before the gradual start too (zero weight, live counts)
        let ctx_active = fcm.push_loss_weight_ctx.is_some() && gradual_active(fcm.push_loss_gradual_start, ctx.epoch);
        if fcm.push_loss_weight_enc.is_some() || ctx_active {
            let mult = gradual_coefficient(1.0, fcm.push_loss_gradual_start, ctx.epoch, ctx.total_epochs);
            for (weight, features) in [(fcm.push_loss_weight_enc, encoded), (fcm.push_loss_weight_ctx, c_feature)] {
                if let Some(weight) = weight {
                    let (part, used) = p.push_loss(&prefix(features)?, centers, mult * weight)?;
                    loss = (loss + part)?;
                    counts = (counts + used.to_dtype(c_feature.dtype())?)?;
                }
            }
        }

        let mut encoded_out = encoded.clone();
        if let Some(coeff) = Self::vq_coefficient(fcm, fcm.vq_push_enc_center_weight_only_criterion, ctx) {
            encoded_out = p.push_detached(&prefix(encoded)?, centers, coeff)?;
        }
        let mut c_out = c_feature.clone();
        if let Some(coeff) = Self::vq_coefficient(fcm, fcm.vq_push_ctx_center_weight, ctx) {
            c_out = p.push_detached(&prefix(c_feature)?, centers, coeff)?;
        }

        Ok(PushOutput {
            loss,
            counts,
            c_feature: c_out,
            encoded: encoded_out,
        })
    }

    /// Reset batch-norm running statistics of the encoder
    pub fn reset_running_stats(&self) -> Result<()> {
        self.encoder.reset_running_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArMode, NormMode};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    const WINDOW: usize = 160 * 24;

    fn config(fcm: Option<FcmSettings>, hidden_gar: usize) -> CpcConfig {
        let mut config = CpcConfig {
            hidden_encoder: 16,
            hidden_gar,
            ar_mode: ArMode::Gru,
            norm_mode: NormMode::LayerNorm,
            size_window: WINDOW,
            n_predicts: 4,
            fcm,
            ..Default::default()
        };
        config.finalize().unwrap();
        config
    }

    fn audio() -> Tensor {
        Tensor::randn(0f32, 0.1, (2, 1, WINDOW), &Device::Cpu).unwrap()
    }

    fn centers(k: usize, d: usize) -> Tensor {
        Tensor::randn(0f32, 1.0, (k, d), &Device::Cpu).unwrap()
    }

    fn ctx(centers: Option<&Tensor>) -> ForwardContext<'_> {
        ForwardContext {
            centers,
            epoch: 2.0,
            total_epochs: 10.0,
            max_segment_cost: None,
            train: true,
        }
    }

    fn run(fcm: Option<FcmSettings>, k: usize, hidden_gar: usize) -> (CpcModel, ModelOutput) {
        let config = config(fcm, hidden_gar);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CpcModel::from_config(&config, vb).unwrap();
        let centers = centers(k, model.base_dim());
        let out = model.forward(&audio(), &ctx(Some(&centers))).unwrap();
        (model, out)
    }

    fn assert_dims(model: &CpcModel, out: &ModelOutput) {
        let (dim_c, dim_enc) = model.output_dims();
        assert_eq!(out.c_feature.dims(), &[2, 24, dim_c]);
        assert_eq!(out.encoded.dims(), &[2, 24, dim_enc]);
    }

    #[test]
    fn test_plain_forward() {
        let (model, out) = run(None, 3, 12);
        assert_eq!(model.output_dims(), (12, 16));
        assert_dims(&model, &out);
        assert!(out.push_dim.is_none());
        assert!(out.segmentation.is_none());
    }

    #[test]
    fn test_length_slots() {
        let fcm = FcmSettings {
            model_length_in_ar: true,
            ..Default::default()
        };
        let (model, out) = run(Some(fcm), 3, 12);
        assert_eq!(model.base_dim(), 14);
        assert_eq!(out.pure_encoded.dims(), &[2, 24, 14]);
        assert_dims(&model, &out);
    }

    #[test]
    fn test_concat_m_before_with_left_protos() {
        let fcm = FcmSettings {
            fcm_project: true,
            reprs_concat: true,
            m_before_ar: Some(2.0),
            num_protos: 6,
            left_protos: Some(4),
            ..Default::default()
        };
        let (model, out) = run(Some(fcm), 6, 22);
        assert_eq!(model.output_dims(), (20, 20));
        assert_dims(&model, &out);
        // encoder part plus the first four memberships
        assert_eq!(out.encoded.dim(2).unwrap(), 16 + 4);
    }

    #[test]
    fn test_m_after_memberships() {
        let fcm = FcmSettings {
            fcm_project: true,
            m_after_ar: Some(2.0),
            num_protos: 5,
            push_deg_all_after_ar: Some(0.3),
            ..Default::default()
        };
        let config = config(Some(fcm), 16);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CpcModel::from_config(&config, vb).unwrap();
        let centers = centers(5, 16);
        let out = model.forward(&audio(), &ctx(Some(&centers))).unwrap();
        assert_eq!(model.output_dims(), (5, 5));
        assert_dims(&model, &out);
        let sums: Vec<Vec<f32>> = out.encoded.sum(D::Minus1).unwrap().to_vec2().unwrap();
        assert!(sums.iter().flatten().all(|s| (s - 1.0).abs() < 1e-3));
    }

    #[test]
    fn test_m_before_requires_centers() {
        let fcm = FcmSettings {
            fcm_project: true,
            m_before_ar: Some(2.0),
            num_protos: 4,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CpcModel::from_config(&config(Some(fcm), 12), vb).unwrap();
        assert!(model.forward(&audio(), &ctx(None)).is_err());
    }

    #[test]
    fn test_shortening_restores_length() {
        let fcm = FcmSettings {
            hier_ar_shorten: Some(2.0),
            ..Default::default()
        };
        let (model, out) = run(Some(fcm), 3, 12);
        assert_dims(&model, &out);
        let stats = out.segmentation.unwrap();
        assert_eq!(stats.total_segments, 24);
        assert!((stats.mean_length - 2.0).abs() < 1e-9);
        assert!(stats.cost_at_target.is_some());
    }

    fn boundary_segments(segmenter: SegmenterKind) -> (CpcModel, ModelOutput, Segmentation) {
        let fcm = FcmSettings {
            hier_ar_shorten: Some(2.0),
            segmenter,
            ..Default::default()
        };
        let (model, out) = run(Some(fcm.clone()), 3, 12);
        let encoded = model.encode(&audio(), false).unwrap();
        let seg = model.segment(&fcm, &encoded, &ctx(None)).unwrap().unwrap();
        (model, out, seg)
    }

    #[test]
    fn test_jch_segmenter_forward() {
        let (model, out, seg) = boundary_segments(SegmenterKind::Jch { step_reduction: 0.5 });
        assert_dims(&model, &out);
        assert!(out.segmentation.unwrap().total_segments >= 2 * MIN_SEGMENTS_PER_LINE);
        for cuts in &seg.cuts {
            assert!(cuts.len() - 1 >= MIN_SEGMENTS_PER_LINE);
            assert_eq!((cuts[0], *cuts.last().unwrap()), (0, 24));
        }
    }

    #[test]
    fn test_kreuk_segmenter_forward() {
        let (model, out, seg) = boundary_segments(SegmenterKind::Kreuk { prominence: 0.0 });
        assert_dims(&model, &out);
        let stats = out.segmentation.unwrap();
        assert!(stats.total_segments >= 2);
        assert!(stats.cost_at_target.is_none());
        for cuts in &seg.cuts {
            assert!(cuts.len() >= 2);
            assert!(cuts.windows(2).all(|w| w[0] < w[1]));
            assert_eq!((cuts[0], *cuts.last().unwrap()), (0, 24));
        }
    }

    #[test]
    fn test_jhu_segmenter_forward() {
        let (model, out, seg) = boundary_segments(SegmenterKind::Jhu { threshold: 0.04 });
        assert_dims(&model, &out);
        for cuts in &seg.cuts {
            assert!(cuts.windows(2).all(|w| w[0] < w[1]));
            assert_eq!((cuts[0], *cuts.last().unwrap()), (0, 24));
        }
    }

    #[test]
    fn test_push_losses_count_before_gradual_start() {
        let fcm = FcmSettings {
            push_loss_weight_enc: Some(1.0),
            push_loss_gradual_start: Some(5.0),
            num_protos: 3,
            ..Default::default()
        };
        let (model, out) = run(Some(fcm), 3, 16);
        let centers = centers(3, 16);
        let early = ForwardContext {
            epoch: 0.0,
            ..ctx(Some(&centers))
        };
        let push = model.push_losses(&out.c_feature, &out.encoded, Some(&centers), &early).unwrap();
        let loss: f32 = push.loss.to_scalar().unwrap();
        assert_eq!(loss, 0.0);
        let used: f32 = push.counts.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(used, 2.0 * 24.0);
    }

    #[test]
    fn test_push_losses() {
        let fcm = FcmSettings {
            push_loss_weight_enc: Some(1.0),
            push_loss_weight_ctx: Some(0.5),
            vq_push_ctx_center_weight: Some(0.5),
            num_protos: 3,
            ..Default::default()
        };
        let (model, out) = run(Some(fcm), 3, 16);
        assert_eq!(out.push_dim, Some(16));
        assert!(model.doing_push_loss_or_push_after());

        let centers = centers(3, 16);
        let push = model
            .push_losses(&out.c_feature, &out.encoded, Some(&centers), &ctx(Some(&centers)))
            .unwrap();
        let loss: f32 = push.loss.to_scalar().unwrap();
        assert!(loss > 0.0);
        let used: f32 = push.counts.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(used, 2.0 * 2.0 * 24.0);
        assert_eq!(push.c_feature.dims(), &[2, 24, 16]);

        let none = model.push_losses(&out.c_feature, &out.encoded, None, &ctx(None)).unwrap();
        let loss: f32 = none.loss.to_scalar().unwrap();
        assert_eq!(loss, 0.0);
        assert_eq!(none.counts.dims(), &[1, 3]);
    }
}
