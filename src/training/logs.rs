//! Per-head loss / accuracy bookkeeping and the JSON run log

use anyhow::{Context, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Flatten a tensor of any shape into plain numbers
pub fn untensor(t: &Tensor) -> Result<Vec<f64>> {
    Ok(t.detach()
        .to_dtype(candle_core::DType::F64)?
        .flatten_all()?
        .to_vec1::<f64>()?)
}

/// Running sums of per-head values over the steps of one epoch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepLogs {
    /// Summed values per key
    pub values: BTreeMap<String, Vec<f64>>,
    /// Steps accumulated
    pub iter: usize,
}

impl StepLogs {
    /// Empty logs
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `values` element-wise to the sums stored under `key`
    pub fn accumulate(&mut self, key: &str, values: &[f64]) {
        let entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| vec![0.0; values.len()]);
        if entry.len() < values.len() {
            entry.resize(values.len(), 0.0);
        }
        for (sum, v) in entry.iter_mut().zip(values) {
            *sum += v;
        }
    }

    /// Mean over the heads of `key`
    pub fn mean(&self, key: &str) -> Option<f64> {
        let values = self.values.get(key)?;
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// `(logs - prev) / step` for every key of `logs`
pub fn update_logs(logs: &StepLogs, step: usize, prev: Option<&StepLogs>) -> StepLogs {
    let step = step.max(1) as f64;
    let values = logs
        .values
        .iter()
        .map(|(key, values)| {
            let previous = prev.and_then(|p| p.values.get(key));
            let averaged = values
                .iter()
                .enumerate()
                .map(|(i, v)| (v - previous.and_then(|p| p.get(i)).copied().unwrap_or(0.0)) / step)
                .collect();
            (key.clone(), averaged)
        })
        .collect();
    StepLogs {
        values,
        iter: logs.iter,
    }
}

/// Log one table row per key, one column per prediction step
pub fn show_logs(text: &str, logs: &StepLogs) {
    info!("{}", "-".repeat(50));
    info!("{}", text);
    for (key, values) in &logs.values {
        let header: String = std::iter::once(format!("{:>16}", "Step"))
            .chain((1..=values.len()).map(|s| format!("{:>16}", s)))
            .collect::<Vec<_>>()
            .join(" ");
        let row: String = std::iter::once(format!("{:>16}", key))
            .chain(values.iter().map(|v| format!("{:>16}", format!("{:10.6}", v))))
            .collect::<Vec<_>>()
            .join(" ");
        info!("{}", header);
        info!("{}", row);
    }
    info!("{}", "-".repeat(50));
}

/// Whole-run log, stored as `checkpoint_logs.json`.
///
/// Every value key holds one entry per completed epoch; keys that first
/// appear at a later epoch are padded with `null` for the earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingLogs {
    /// Finished epochs
    #[serde(default)]
    pub epoch: Vec<usize>,
    /// Training steps per finished epoch
    #[serde(default)]
    pub iter: Vec<usize>,
    /// Epochs between checkpoints
    #[serde(default = "default_save_step")]
    pub save_step: usize,
    /// Batches between log lines
    #[serde(default = "default_logging_step")]
    pub logging_step: usize,
    /// Per-epoch values of every key
    #[serde(flatten)]
    pub values: BTreeMap<String, Vec<Option<Vec<f64>>>>,
}

fn default_save_step() -> usize {
    5
}

fn default_logging_step() -> usize {
    1000
}

impl Default for TrainingLogs {
    fn default() -> Self {
        Self::new(default_save_step(), default_logging_step())
    }
}

impl TrainingLogs {
    /// Empty logs
    pub fn new(save_step: usize, logging_step: usize) -> Self {
        Self {
            epoch: Vec::new(),
            iter: Vec::new(),
            save_step,
            logging_step,
            values: BTreeMap::new(),
        }
    }

    /// Number of completed epochs, the epoch a resumed run starts at
    pub fn start_epoch(&self) -> usize {
        self.epoch.len()
    }

    /// Append the averaged logs of `epoch`
    pub fn push_epoch(&mut self, epoch: usize, step_logs: &[&StepLogs]) {
        for logs in step_logs {
            for (key, values) in &logs.values {
                let column = self
                    .values
                    .entry(key.clone())
                    .or_insert_with(|| vec![None; epoch]);
                column.resize(epoch, None);
                column.push(Some(values.clone()));
            }
        }
        if let Some(last) = step_logs.last() {
            self.iter.push(last.iter);
        }
        self.epoch.push(epoch);
    }

    /// Values of `key` at its most recent epoch
    pub fn last(&self, key: &str) -> Option<&[f64]> {
        self.values.get(key)?.last()?.as_deref()
    }

    /// Read logs written by `save`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read logs {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse logs {:?}", path))
    }

    /// Write as indented JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write logs {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_update_logs_delta() {
        let mut logs = StepLogs::new();
        logs.accumulate("locLoss_train", &[2.0, 4.0]);
        let prev = logs.clone();
        logs.accumulate("locLoss_train", &[4.0, 8.0]);
        logs.accumulate("locLoss_train", &[2.0, 2.0]);

        let avg = update_logs(&logs, 2, Some(&prev));
        assert_eq!(avg.values["locLoss_train"], vec![3.0, 5.0]);
        let full = update_logs(&logs, 3, None);
        assert_eq!(full.values["locLoss_train"], vec![8.0 / 3.0, 14.0 / 3.0]);
        assert!((full.mean("locLoss_train").unwrap() - 11.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_push_epoch_pads_late_keys() {
        let mut logs = TrainingLogs::new(1, 10);
        let mut first = StepLogs::new();
        first.accumulate("locAcc_val", &[0.5]);
        first.iter = 4;
        logs.push_epoch(0, &[&first]);

        let mut second = first.clone();
        second.accumulate("lossCluster_train", &[1.5]);
        logs.push_epoch(1, &[&second]);

        assert_eq!(logs.epoch, vec![0, 1]);
        assert_eq!(logs.iter, vec![4, 4]);
        assert_eq!(logs.values["lossCluster_train"], vec![None, Some(vec![1.5])]);
        assert_eq!(logs.last("locAcc_val"), Some(&[0.5][..]));
        assert_eq!(logs.start_epoch(), 2);
    }

    #[test]
    fn test_logs_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint_logs.json");
        let mut logs = TrainingLogs::new(3, 7);
        let mut step = StepLogs::new();
        step.accumulate("locLoss_val", &[1.0, 2.0]);
        logs.push_epoch(0, &[&step]);
        logs.save(&path).unwrap();

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["locLoss_val"][0][1], 2.0);
        assert_eq!(TrainingLogs::load(&path).unwrap(), logs);
    }

    #[test]
    fn test_untensor() {
        let t = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        assert_eq!(untensor(&t).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
