//! Recursive model reconstruction from checkpoints
//!
//! A checkpoint whose stored args have `load` pointing at other run
//! directories was trained on top of those models: its structure is rebuilt
//! from them first, then its own tensors are loaded over the result.
//! Several checkpoint paths give a `ConcatenatedModel` whose sub-models live
//! under `models.<i>`.

use anyhow::{Context, Result};
use candle_core::{safetensors, DType, Device};
use candle_nn::{VarBuilder, VarMap};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::report::{load_into_varmap, LoadReport};
use super::{read_args, read_segment_cost, BEST_PREFIX, CRITERION_PREFIX, MODEL_PREFIX};
use crate::config::{CpcConfig, FcmSettings};
use crate::error::CpcError;
use crate::models::{ArNet, ConcatenatedModel, CpcModel, Encoder, FeatureModel, NullspaceModel};

/// How `load_model` rebuilds and fills models
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Fill the rebuilt models with checkpoint tensors
    pub load_state: bool,
    /// Prototype / push settings of the rebuilt CPC models
    pub fcm: Option<FcmSettings>,
    /// Wrap each checkpoint in a nullspace projection (`cpc.` + `nullspace.weight`)
    pub load_nullspace: bool,
    /// Partial JSON object overlaid on the args of directly built checkpoints
    pub update_config: Option<serde_json::Value>,
    /// Take the `best.` tensors instead of the last `model.` tensors
    pub load_best: bool,
    /// Read the stored segment cost
    pub load_segment_cost: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            load_state: true,
            fcm: None,
            load_nullspace: false,
            update_config: None,
            load_best: false,
            load_segment_cost: false,
        }
    }
}

/// A rebuilt model with its variables and output dims
pub struct LoadedModel {
    /// Loaded feature model
    pub model: FeatureModel,
    /// Width of the context features
    pub hidden_gar: usize,
    /// Width of the encoded features
    pub hidden_encoder: usize,
    /// Segment cost of the last loaded checkpoint that stored one
    pub segment_cost: Option<f64>,
    /// Every variable of `model`
    pub varmap: VarMap,
    /// Coverage of every loaded state dict
    pub reports: Vec<LoadReport>,
}

struct Built {
    model: FeatureModel,
    hidden_gar: usize,
    hidden_encoder: usize,
    segment_cost: Option<f64>,
}

fn join_prefix(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn scoped<'a>(vb: &VarBuilder<'a>, prefix: &str) -> VarBuilder<'a> {
    if prefix.is_empty() {
        vb.clone()
    } else {
        vb.pp(prefix)
    }
}

/// True when the run of `path` was trained on models loaded from other
/// directories
fn loads_other_runs(args: &CpcConfig, path: &Path) -> bool {
    match args.load.as_deref() {
        None | Some([]) => false,
        Some([single]) => single.parent() != path.parent(),
        Some(_) => true,
    }
}

/// Rebuild a CPC model from stored args.
///
/// Layer shapes follow the stored args (including their FCM options);
/// `fcm` only selects the forward-time behavior.
pub fn build_cpc_model(args: &CpcConfig, fcm: Option<FcmSettings>, vb: VarBuilder) -> Result<CpcModel> {
    let encoder = Encoder::from_config(args, vb.pp("encoder"))?;
    let ar = ArNet::from_config(args, args.ar_input_dim(), vb.pp("ar"))?;
    Ok(CpcModel::new(encoder, ar, fcm))
}

fn load_into(
    paths: &[PathBuf],
    options: &LoadOptions,
    varmap: &VarMap,
    prefix: &str,
    device: &Device,
    reports: &mut Vec<LoadReport>,
) -> Result<Built> {
    if paths.is_empty() {
        return Err(CpcError::config("no checkpoint to load").into());
    }
    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
    let mut models = Vec::with_capacity(paths.len());
    let (mut hidden_gar, mut hidden_encoder) = (0, 0);
    let mut segment_cost = None;

    for (i, path) in paths.iter().enumerate() {
        info!("Loading checkpoint {:?}", path);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut args = read_args(dir, true)?;
        let sub_prefix = if paths.len() > 1 {
            join_prefix(prefix, &format!("models.{i}"))
        } else {
            prefix.to_string()
        };
        let nullspace = options.load_nullspace && options.load_state;
        let model_prefix = if nullspace {
            join_prefix(&sub_prefix, "cpc")
        } else {
            sub_prefix.clone()
        };

        let do_load = loads_other_runs(&args, path);
        if let (Some(update), false) = (&options.update_config, do_load) {
            info!("Updating the configuration with {}", serde_json::to_string_pretty(update)?);
            args = args.merge_json(update)?;
        }

        let (mut model, mut gar, mut enc) = if do_load {
            let inner_options = LoadOptions {
                load_state: false,
                load_nullspace: false,
                ..options.clone()
            };
            let sources = args.load.clone().unwrap_or_default();
            let built = load_into(&sources, &inner_options, varmap, &model_prefix, device, reports)?;
            (built.model, built.hidden_gar, built.hidden_encoder)
        } else {
            let cpc = build_cpc_model(&args, options.fcm.clone(), scoped(&vb, &model_prefix))?;
            let (gar, enc) = cpc.output_dims();
            (FeatureModel::Cpc(cpc), gar, enc)
        };

        if options.load_state {
            info!("Loading the state at {:?}", path);
            let tensors = safetensors::load(path, device)
                .with_context(|| format!("Failed to read checkpoint {:?}", path))?;
            if options.load_segment_cost {
                match read_segment_cost(&tensors)? {
                    Some(cost) => {
                        info!("Loaded segment cost {cost:.4}");
                        segment_cost = Some(cost);
                    }
                    None => warn!("Segment cost requested but absent from {:?}", path),
                }
            }
            if nullspace {
                let dim_inter = args
                    .dim_inter
                    .ok_or_else(|| CpcError::config("nullspace loading needs dim_inter in the stored args"))?;
                let dim_out = gar.checked_sub(dim_inter).ok_or(CpcError::DimensionMismatch {
                    context: "nullspace projection".into(),
                    expected: dim_inter,
                    actual: gar,
                })?;
                model = FeatureModel::Nullspace(NullspaceModel::new(model, gar, dim_out, scoped(&vb, &sub_prefix))?);
                gar = dim_out;
                enc = enc.saturating_sub(dim_inter);
            }
            let source = if options.load_best { BEST_PREFIX } else { MODEL_PREFIX };
            let report = load_into_varmap(
                varmap,
                &tensors,
                &sub_prefix,
                source,
                source.trim_end_matches('.'),
                &path.display().to_string(),
            )?;
            report.log_summary();
            reports.push(report);
        }

        hidden_gar += gar;
        hidden_encoder += enc;
        models.push(model);
    }

    let model = if models.len() == 1 {
        info!("Loaded a single model");
        models.remove(0)
    } else {
        info!("Loaded {} concatenated models", models.len());
        FeatureModel::Concatenated(ConcatenatedModel::new(models)?)
    };
    Ok(Built {
        model,
        hidden_gar,
        hidden_encoder,
        segment_cost,
    })
}

/// Rebuild the model stored at `paths`.
///
/// Dims accumulate over the paths, so a concatenation of models of context
/// width 256 and 64 reports `hidden_gar = 320`.
pub fn load_model(paths: &[PathBuf], options: &LoadOptions, device: &Device) -> Result<LoadedModel> {
    let varmap = VarMap::new();
    let mut reports = Vec::new();
    let built = load_into(paths, options, &varmap, "", device, &mut reports)?;
    Ok(LoadedModel {
        model: built.model,
        hidden_gar: built.hidden_gar,
        hidden_encoder: built.hidden_encoder,
        segment_cost: built.segment_cost,
        varmap,
        reports,
    })
}

/// Fill the criterion variables from the `criterion.` tensors of `path`
pub fn load_criterion<P: AsRef<Path>>(path: P, varmap: &VarMap, device: &Device) -> Result<LoadReport> {
    let path = path.as_ref();
    let tensors =
        safetensors::load(path, device).with_context(|| format!("Failed to read checkpoint {:?}", path))?;
    let report = load_into_varmap(varmap, &tensors, "", CRITERION_PREFIX, "criterion", &path.display().to_string())?;
    report.log_summary();
    Ok(report)
}
