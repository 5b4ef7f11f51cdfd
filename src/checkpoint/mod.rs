//! Run directories: checkpoint files, stored args and logs
//!
//! A run directory holds
//! - `checkpoint_<epoch>.safetensors` with the model (`model.`), criterion
//!   (`criterion.`) and best-validation model (`best.`) tensors, plus a
//!   `segment_cost` scalar when the run tracks one
//! - `checkpoint_args.json`, the full `CpcConfig` of the run
//! - `checkpoint_logs.json`, the `TrainingLogs`

mod loader;
mod report;

pub use loader::{build_cpc_model, load_criterion, load_model, LoadOptions, LoadedModel};
pub use report::{load_into_varmap, LoadReport};

use anyhow::{anyhow, Context, Result};
use candle_core::{safetensors, Device, Tensor};
use candle_nn::VarMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::CpcConfig;
use crate::training::TrainingLogs;

/// File name prefix of checkpoints
pub const CHECKPOINT_PREFIX: &str = "checkpoint_";
/// Extension of checkpoint files
pub const CHECKPOINT_EXTENSION: &str = "safetensors";
/// Stored run config
pub const ARGS_FILE: &str = "checkpoint_args.json";
/// Stored run logs
pub const LOGS_FILE: &str = "checkpoint_logs.json";

/// Key prefix of model variables in a checkpoint file
pub const MODEL_PREFIX: &str = "model.";
/// Key prefix of criterion variables
pub const CRITERION_PREFIX: &str = "criterion.";
/// Key prefix of the best validation model state
pub const BEST_PREFIX: &str = "best.";
/// Scalar holding the mean segment cost
pub const SEGMENT_COST_KEY: &str = "segment_cost";

/// `<dir>/checkpoint_<epoch>.safetensors`
pub fn checkpoint_path<P: AsRef<Path>>(dir: P, epoch: usize) -> PathBuf {
    dir.as_ref()
        .join(format!("{CHECKPOINT_PREFIX}{epoch}.{CHECKPOINT_EXTENSION}"))
}

/// Epoch of a checkpoint file name, `None` for any other file
pub fn checkpoint_epoch<P: AsRef<Path>>(path: P) -> Option<usize> {
    let path = path.as_ref();
    if path.extension()? != CHECKPOINT_EXTENSION {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(CHECKPOINT_PREFIX)?
        .parse()
        .ok()
}

/// Latest checkpoint of a run directory with its args and logs
#[derive(Debug, Clone)]
pub struct CheckpointData {
    /// Absolute path of the latest checkpoint file
    pub path: PathBuf,
    /// Logs of the run up to this checkpoint
    pub logs: TrainingLogs,
    /// Stored args over the defaults
    pub args: CpcConfig,
    /// Epoch of the latest checkpoint
    pub epoch: usize,
}

/// Read `checkpoint_args.json` of `dir`.
///
/// Keys absent from the file keep their defaults. With `no_load_possible` a
/// missing or unreadable file yields the default config.
pub fn read_args<P: AsRef<Path>>(dir: P, no_load_possible: bool) -> Result<CpcConfig> {
    let path = dir.as_ref().join(ARGS_FILE);
    match CpcConfig::load(&path) {
        Ok(args) => Ok(args),
        Err(e) if no_load_possible => {
            warn!("No usable args at {:?}: {:#}", path, e);
            Ok(CpcConfig::default())
        }
        Err(e) => Err(e),
    }
}

/// Find the latest checkpoint of `dir`.
///
/// Returns `None` when `dir` does not exist or holds no checkpoint. Missing
/// logs or args are errors unless `no_load_possible`.
pub fn get_checkpoint_data<P: AsRef<Path>>(dir: P, no_load_possible: bool) -> Result<Option<CheckpointData>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Ok(None);
    }
    let latest = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {:?}", dir))?
        .filter_map(|e| e.ok())
        .filter_map(|e| checkpoint_epoch(e.path()).map(|epoch| (epoch, e.path())))
        .max_by_key(|(epoch, _)| *epoch);
    let Some((epoch, path)) = latest else {
        info!("No checkpoints found at {:?}", dir);
        return Ok(None);
    };

    let logs_path = dir.join(LOGS_FILE);
    let logs = match TrainingLogs::load(&logs_path) {
        Ok(logs) => logs,
        Err(e) if no_load_possible => {
            warn!("Failed to load logs: {:#}", e);
            TrainingLogs::default()
        }
        Err(e) => return Err(e),
    };
    let args = read_args(dir, no_load_possible)?;
    let path = std::fs::canonicalize(&path).unwrap_or(path);
    Ok(Some(CheckpointData { path, logs, args, epoch }))
}

/// Deep copy of every variable, used to keep the best model state
pub fn snapshot(varmap: &VarMap) -> Result<HashMap<String, Tensor>> {
    let data = varmap.data().lock().map_err(|_| anyhow!("VarMap lock poisoned"))?;
    data.iter()
        .map(|(name, var)| -> Result<(String, Tensor)> { Ok((name.clone(), var.as_tensor().copy()?)) })
        .collect()
}

/// Everything written to one checkpoint file
pub struct CheckpointState<'a> {
    /// Feature model variables
    pub model: &'a VarMap,
    /// Criterion, prototype and clustering variables
    pub criterion: &'a VarMap,
    /// Best validation model state, when tracked
    pub best: Option<&'a HashMap<String, Tensor>>,
    /// Mean segment cost of the run
    pub segment_cost: Option<f64>,
}

/// Write one safetensors file with prefixed model / criterion / best tensors
pub fn save_checkpoint<P: AsRef<Path>>(state: &CheckpointState, path: P) -> Result<()> {
    let path = path.as_ref();
    let mut named: HashMap<String, Tensor> = HashMap::new();
    for (prefix, varmap) in [(MODEL_PREFIX, state.model), (CRITERION_PREFIX, state.criterion)] {
        let data = varmap.data().lock().map_err(|_| anyhow!("VarMap lock poisoned"))?;
        for (name, var) in data.iter() {
            named.insert(format!("{prefix}{name}"), var.as_tensor().clone());
        }
    }
    if let Some(best) = state.best {
        for (name, tensor) in best {
            named.insert(format!("{BEST_PREFIX}{name}"), tensor.clone());
        }
    }
    if let Some(cost) = state.segment_cost {
        named.insert(SEGMENT_COST_KEY.to_string(), Tensor::new(&[cost as f32], &Device::Cpu)?);
    }
    safetensors::save(&named, path).with_context(|| format!("Failed to save checkpoint {:?}", path))?;
    info!("Saved {} tensors to {:?}", named.len(), path);
    Ok(())
}

/// Segment cost stored in a checkpoint, if any
pub fn read_segment_cost(tensors: &HashMap<String, Tensor>) -> Result<Option<f64>> {
    match tensors.get(SEGMENT_COST_KEY) {
        Some(t) => {
            let values = t.to_dtype(candle_core::DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
            Ok(values.first().copied())
        }
        None => Ok(None),
    }
}
