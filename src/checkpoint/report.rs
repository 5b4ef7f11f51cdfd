//! Non-strict state loading with missing / unexpected key reporting
//!
//! Checkpoints are loaded by name into an existing `VarMap`. Variables with
//! no tensor in the file keep their current values and tensors with no
//! variable are ignored; both show up in the `LoadReport`.

use anyhow::{anyhow, Context, Result};
use candle_core::Tensor;
use candle_nn::VarMap;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Outcome of loading one tensor group into a `VarMap`
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Which part was loaded, e.g. "model" or "criterion"
    pub component: String,
    /// File the tensors came from
    pub file: String,
    /// Variable names that received a tensor
    pub found: BTreeSet<String>,
    /// Variable names with no tensor in the file
    pub missing: BTreeSet<String>,
    /// File keys of the group that matched no variable
    pub unexpected: BTreeSet<String>,
}

impl LoadReport {
    /// Fraction of variables that were filled
    pub fn success_rate(&self) -> f32 {
        let expected = self.found.len() + self.missing.len();
        if expected == 0 {
            return 1.0;
        }
        self.found.len() as f32 / expected as f32
    }

    /// No missing and no unexpected tensors
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// One info line, plus the first missing / unexpected keys as warnings
    pub fn log_summary(&self) {
        info!(
            "[{}] {}: loaded {}/{} tensors ({} unexpected)",
            self.component,
            self.file,
            self.found.len(),
            self.found.len() + self.missing.len(),
            self.unexpected.len()
        );
        for (label, keys) in [("missing", &self.missing), ("unexpected", &self.unexpected)] {
            for key in keys.iter().take(10) {
                warn!("[{}] {} key: {}", self.component, label, key);
            }
            if keys.len() > 10 {
                warn!("[{}] ... and {} more {} keys", self.component, keys.len() - 10, label);
            }
        }
    }
}

fn scoped_name(var_prefix: &str, name: &str) -> Option<String> {
    if var_prefix.is_empty() {
        return Some(name.to_string());
    }
    name.strip_prefix(var_prefix)?.strip_prefix('.').map(str::to_string)
}

/// Copy the tensors `tensor_prefix + <name>` of `tensors` into the variables
/// `var_prefix.<name>` of `varmap`.
pub fn load_into_varmap(
    varmap: &VarMap,
    tensors: &HashMap<String, Tensor>,
    var_prefix: &str,
    tensor_prefix: &str,
    component: &str,
    file: &str,
) -> Result<LoadReport> {
    let data = varmap.data().lock().map_err(|_| anyhow!("VarMap lock poisoned"))?;
    let mut report = LoadReport {
        component: component.to_string(),
        file: file.to_string(),
        ..Default::default()
    };
    let mut used = BTreeSet::new();

    for (name, var) in data.iter() {
        let Some(local) = scoped_name(var_prefix, name) else {
            continue;
        };
        let key = format!("{tensor_prefix}{local}");
        match tensors.get(&key) {
            Some(tensor) => {
                let value = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
                var.set(&value).with_context(|| format!("Shape mismatch loading {key} into {name}"))?;
                report.found.insert(name.clone());
                used.insert(key);
            }
            None => {
                report.missing.insert(name.clone());
            }
        }
    }
    report.unexpected = tensors
        .keys()
        .filter(|k| k.starts_with(tensor_prefix) && !used.contains(*k))
        .cloned()
        .collect();
    debug!("{} tensors under '{}' matched in {}", report.found.len(), tensor_prefix, file);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_load_reports_missing_and_unexpected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.pp("models.0").get_with_hints(3, "a", Init::Const(0.0)).unwrap();
        vb.pp("models.0").get_with_hints(2, "b", Init::Const(0.0)).unwrap();
        vb.pp("models.1").get_with_hints(2, "a", Init::Const(0.0)).unwrap();

        let mut tensors = HashMap::new();
        tensors.insert("model.a".to_string(), Tensor::new(&[1f32, 2.0, 3.0], &Device::Cpu).unwrap());
        tensors.insert("model.zzz".to_string(), Tensor::new(&[1f32], &Device::Cpu).unwrap());
        tensors.insert("criterion.w".to_string(), Tensor::new(&[1f32], &Device::Cpu).unwrap());

        let report = load_into_varmap(&varmap, &tensors, "models.0", "model.", "model", "x").unwrap();
        assert_eq!(report.found.len(), 1);
        assert!(report.missing.contains("models.0.b"));
        assert_eq!(report.unexpected.iter().collect::<Vec<_>>(), vec!["model.zzz"]);
        assert!(!report.is_complete());
        assert!((report.success_rate() - 0.5).abs() < 1e-6);

        let data = varmap.data().lock().unwrap();
        let a: Vec<f32> = data["models.0.a"].as_tensor().to_vec1().unwrap();
        assert_eq!(a, vec![1.0, 2.0, 3.0]);
        let other: Vec<f32> = data["models.1.a"].as_tensor().to_vec1().unwrap();
        assert_eq!(other, vec![0.0, 0.0]);
    }

    #[test]
    fn test_shape_mismatch_is_an_error() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(3, "w", Init::Const(0.0)).unwrap();
        let mut tensors = HashMap::new();
        tensors.insert("model.w".to_string(), Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap());
        assert!(load_into_varmap(&varmap, &tensors, "", "model.", "model", "x").is_err());
    }
}
