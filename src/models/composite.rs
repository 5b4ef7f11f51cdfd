//! Feature models composed from loaded checkpoints

use anyhow::{bail, Result};
use candle_core::{Tensor, D};
use candle_nn::{Init, Linear, Module, VarBuilder};

use super::cpc_model::{CpcModel, ForwardContext};

/// Model whose features are projected by a bias-free linear map.
///
/// The weight (dim_out, dim_in) is the transposed nullspace basis and is
/// filled from the checkpoint.
pub struct NullspaceModel {
    inner: Box<FeatureModel>,
    projection: Linear,
    dim_out: usize,
}

impl NullspaceModel {
    /// `inner` under `cpc`, projection weight under `nullspace.weight`
    pub fn new(inner: FeatureModel, dim_in: usize, dim_out: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.pp("nullspace").get_with_hints((dim_out, dim_in), "weight", Init::Const(0.0))?;
        Ok(Self {
            inner: Box::new(inner),
            projection: Linear::new(weight, None),
            dim_out,
        })
    }

    /// Projected feature width
    pub fn dim_output(&self) -> usize {
        self.dim_out
    }

    /// Project both context and encoded features
    pub fn features(&self, audio: &Tensor, ctx: &ForwardContext) -> Result<(Tensor, Tensor)> {
        let (c, enc) = self.inner.features(audio, ctx)?;
        Ok((self.projection.forward(&c)?, self.projection.forward(&enc)?))
    }
}

/// Models run side by side with their features concatenated
pub struct ConcatenatedModel {
    models: Vec<FeatureModel>,
}

impl ConcatenatedModel {
    /// Fails without sub-models
    pub fn new(models: Vec<FeatureModel>) -> Result<Self> {
        if models.is_empty() {
            bail!("a concatenated model needs at least one sub-model");
        }
        Ok(Self { models })
    }

    /// Sub-models in concatenation order
    pub fn models(&self) -> &[FeatureModel] {
        &self.models
    }

    /// Concatenate every sub-model's context and encoded features along the
    /// feature dim
    pub fn features(&self, audio: &Tensor, ctx: &ForwardContext) -> Result<(Tensor, Tensor)> {
        let mut contexts = Vec::with_capacity(self.models.len());
        let mut encoded = Vec::with_capacity(self.models.len());
        for model in &self.models {
            let (c, enc) = model.features(audio, ctx)?;
            contexts.push(c);
            encoded.push(enc);
        }
        Ok((Tensor::cat(&contexts, D::Minus1)?, Tensor::cat(&encoded, D::Minus1)?))
    }
}

/// Any model that turns audio into (context, encoded) features
pub enum FeatureModel {
    /// Plain CPC model
    Cpc(CpcModel),
    /// CPC model followed by a nullspace projection
    Nullspace(NullspaceModel),
    /// Side-by-side models
    Concatenated(ConcatenatedModel),
}

impl FeatureModel {
    /// (B, 1, W) audio -> ((B, L, dim_ctx), (B, L, dim_enc))
    pub fn features(&self, audio: &Tensor, ctx: &ForwardContext) -> Result<(Tensor, Tensor)> {
        match self {
            Self::Cpc(model) => {
                let out = model.forward(audio, ctx)?;
                Ok((out.c_feature, out.encoded))
            }
            Self::Nullspace(model) => model.features(audio, ctx),
            Self::Concatenated(model) => model.features(audio, ctx),
        }
    }

    /// Every CPC model in the tree, depth first
    pub fn cpc_models(&self) -> Vec<&CpcModel> {
        match self {
            Self::Cpc(model) => vec![model],
            Self::Nullspace(model) => model.inner.cpc_models(),
            Self::Concatenated(model) => model.models.iter().flat_map(|m| m.cpc_models()).collect(),
        }
    }

    /// Audio samples per frame
    pub fn downsampling(&self) -> usize {
        self.cpc_models()
            .first()
            .map_or(crate::DOWNSAMPLING, |m| m.downsampling())
    }

    /// Unwrap a plain CPC model
    pub fn into_cpc(self) -> Result<CpcModel> {
        match self {
            Self::Cpc(model) => Ok(model),
            Self::Nullspace(_) => bail!("expected a plain CPC model, got a nullspace model"),
            Self::Concatenated(_) => bail!("expected a plain CPC model, got a concatenated model"),
        }
    }

    /// Reset batch-norm statistics of every CPC model
    pub fn reset_running_stats(&self) -> Result<()> {
        for model in self.cpc_models() {
            model.reset_running_stats()?;
        }
        Ok(())
    }
}

/// Feature extractor returning context or encoded features
pub struct FeatureModule<'a> {
    model: &'a FeatureModel,
    get_encoded: bool,
    collapse: bool,
    centers: Option<&'a Tensor>,
}

impl<'a> FeatureModule<'a> {
    /// Context features unless `get_encoded`; `collapse` flattens batch and time
    pub fn new(model: &'a FeatureModel, get_encoded: bool, collapse: bool) -> Self {
        Self {
            model,
            get_encoded,
            collapse,
            centers: None,
        }
    }

    /// Centers handed to models that push or project onto them
    pub fn with_centers(mut self, centers: Option<&'a Tensor>) -> Self {
        self.centers = centers;
        self
    }

    /// Wrapped model
    pub fn model(&self) -> &'a FeatureModel {
        self.model
    }

    /// Samples per feature frame
    pub fn downsampling(&self) -> usize {
        self.model.downsampling()
    }

    /// (B, 1, W) audio -> (B, L, D), or (B * L, D) when collapsing
    pub fn forward(&self, audio: &Tensor) -> Result<Tensor> {
        let ctx = ForwardContext {
            centers: self.centers,
            ..ForwardContext::eval()
        };
        let (c, enc) = self.model.features(audio, &ctx)?;
        let features = if self.get_encoded { enc } else { c };
        if self.collapse {
            let d = features.dim(D::Minus1)?;
            return Ok(features.reshape(((), d))?);
        }
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArMode, CpcConfig};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn cpc(varmap: &VarMap, prefix: &str, hidden: usize) -> CpcModel {
        let config = CpcConfig {
            hidden_encoder: hidden,
            hidden_gar: hidden,
            ar_mode: ArMode::Gru,
            ..Default::default()
        };
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        CpcModel::from_config(&config, vb.pp(prefix)).unwrap()
    }

    fn audio() -> Tensor {
        Tensor::randn(0f32, 0.1, (2, 1, 1600), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_concatenated_features() {
        let varmap = VarMap::new();
        let model = ConcatenatedModel::new(vec![
            FeatureModel::Cpc(cpc(&varmap, "a", 8)),
            FeatureModel::Cpc(cpc(&varmap, "b", 4)),
        ])
        .unwrap();
        let model = FeatureModel::Concatenated(model);
        let (c, enc) = model.features(&audio(), &ForwardContext::eval()).unwrap();
        assert_eq!(c.dims(), &[2, 10, 12]);
        assert_eq!(enc.dims(), &[2, 10, 12]);
        assert_eq!(model.cpc_models().len(), 2);
        assert!(model.into_cpc().is_err());
    }

    #[test]
    fn test_nullspace_projection() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let inner = FeatureModel::Cpc(cpc(&varmap, "m.cpc", 8));
        let model = NullspaceModel::new(inner, 8, 3, vb.pp("m")).unwrap();
        assert!(varmap.data().lock().unwrap().contains_key("m.nullspace.weight"));
        let (c, enc) = model.features(&audio(), &ForwardContext::eval()).unwrap();
        assert_eq!(c.dims(), &[2, 10, 3]);
        assert_eq!(enc.dims(), &[2, 10, 3]);
        // zero-initialized projection until a checkpoint fills it
        let sum: f32 = c.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }

    #[test]
    fn test_feature_module_collapse() {
        let varmap = VarMap::new();
        let model = FeatureModel::Cpc(cpc(&varmap, "x", 8));
        let module = FeatureModule::new(&model, true, true);
        let out = module.forward(&audio()).unwrap();
        assert_eq!(out.dims(), &[20, 8]);
        assert_eq!(module.downsampling(), 160);
    }
}
