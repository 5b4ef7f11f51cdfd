//! Training and model configuration

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::fcm::FcmSettings;
use crate::error::CpcError;

/// Batch sampling strategy over audio windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingType {
    /// All windows of a batch come from one speaker
    SameSpeaker,
    /// Windows shuffled uniformly
    Uniform,
    /// All windows of a batch come from one sequence
    SameSequence,
    /// Windows in storage order
    Sequential,
}

/// Frame encoder architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderType {
    /// Strided convolution stack
    Cpc,
    /// Fixed MFCC features
    Mfcc,
    /// Learned log filterbank
    Lfb,
}

/// Autoregressive network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArMode {
    /// Gated recurrent unit
    #[serde(rename = "GRU")]
    Gru,
    /// Long short-term memory
    #[serde(rename = "LSTM")]
    Lstm,
    /// Elman RNN with tanh
    #[serde(rename = "RNN")]
    Rnn,
    /// Context is the encoding itself
    #[serde(rename = "no_ar")]
    NoAr,
    /// Causal transformer
    #[serde(rename = "transformer")]
    Transformer,
}

/// Encoder normalization layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormMode {
    /// Per-channel normalization over time
    #[serde(rename = "instanceNorm")]
    InstanceNorm,
    /// No normalization
    #[serde(rename = "ID")]
    Identity,
    /// Normalization over channels per frame
    #[serde(rename = "layerNorm")]
    LayerNorm,
    /// Batch normalization with running statistics
    #[serde(rename = "batchNorm")]
    BatchNorm,
}

/// Variant of the CPC objective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpcMode {
    /// Predict the past from the future
    Reverse,
    /// Masked bidirectional training
    Bert,
    /// No unsupervised criterion
    None,
}

/// Network on top of the context before the prediction heads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RnnMode {
    /// Plain linear heads
    Linear,
    /// One causal transformer block, then linear heads
    Transformer,
}

/// Clustering criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusteringMode {
    /// Classifier trained on k-means pseudo labels
    #[serde(rename = "deepClustering")]
    DeepClustering,
    /// Deep embedded clustering
    #[serde(rename = "deepEmbedded")]
    DeepEmbedded,
    /// CTC on cluster sequences
    #[serde(rename = "CTCClustering")]
    CtcClustering,
}

/// Cluster center update rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusteringUpdate {
    /// Lloyd iterations with a fixed k
    Kmean,
    /// DP-means, opening clusters beyond lambda
    Dpmean,
}

/// Keys never taken from a stored config when resuming a run
pub const RESUME_FORBIDDEN_KEYS: &[&str] = &[
    "n_gpu",
    "path_checkpoint",
    "debug",
    "restart",
    "distributed",
];

/// Complete run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpcConfig {
    // Data
    /// Root directory of the audio dataset
    pub path_db: PathBuf,
    /// Optional list of training sequence names
    pub path_train: Option<PathBuf>,
    /// Optional list of validation sequence names
    pub path_val: Option<PathBuf>,
    /// Optional frame-level phone labels
    pub path_phone: Option<PathBuf>,
    /// Audio file extension
    pub file_extension: String,
    /// Number of directory levels below `path_db` naming the speaker
    pub speaker_level: usize,
    /// Ignore the sequence listing cache
    pub ignore_cache: bool,
    /// Window size in samples
    pub size_window: usize,
    /// Upper bound on loaded samples per dataset
    pub max_size_loaded: usize,
    /// Sample rate the audio is resampled to
    pub sample_rate: u32,

    // Model
    /// Encoder output width
    pub hidden_encoder: usize,
    /// Context network width
    pub hidden_gar: usize,
    /// Encoder front end
    pub encoder_type: EncoderType,
    /// Drop the ReLU after the last encoder layer
    pub encoder_no_last_relu: bool,
    /// Encoder normalization
    pub norm_mode: NormMode,
    /// Context network
    pub ar_mode: ArMode,
    /// Stacked recurrent layers
    pub n_levels_gru: usize,
    /// Absolute positions in the transformer context network
    pub abspos: bool,
    /// Objective variant
    pub cpc_mode: Option<CpcMode>,
    /// Push, membership and shortening settings
    pub fcm: Option<FcmSettings>,
    /// Dimension removed by the nullspace projection
    pub dim_inter: Option<usize>,

    // Criterion
    /// Future steps predicted
    pub n_predicts: usize,
    /// Negatives per positive
    pub negative_sampling_ext: usize,
    /// Prediction head network
    pub rnn_mode: RnnMode,
    /// Dropout in the prediction heads
    pub dropout: bool,
    /// Train a supervised classifier instead of CPC
    pub supervised: bool,
    /// Phone classifier on the encoded features
    pub on_encoder: bool,
    /// CTC phone criterion
    pub ctc: bool,
    /// Adversarial speaker training
    pub adversarial: bool,

    // Clustering
    /// Clustering criterion
    pub clustering: Option<ClusteringMode>,
    /// Clusters
    pub n_clusters: usize,
    /// Cluster updates before the cluster loss starts
    pub cluster_delay: usize,
    /// Batches per cluster update
    pub cluster_iter: usize,
    /// Center update rule
    pub clustering_update: ClusteringUpdate,
    /// Lambda of the dp-means update
    pub dp_means_lambda: f64,

    // Optimization
    /// Base learning rate
    pub learning_rate: f64,
    /// Halve the learning rate every N epochs
    pub scheduler_step: Option<usize>,
    /// Linear warm-up over N epochs
    pub scheduler_ramp: Option<usize>,
    /// Adam beta1
    pub beta1: f64,
    /// Adam beta2
    pub beta2: f64,
    /// Adam epsilon
    pub epsilon: f64,
    /// Epochs of the run
    pub n_epoch: usize,
    /// Batch size per device
    pub batch_size_gpu: usize,
    /// Devices of the run
    pub n_gpu: usize,
    /// Window sampler
    pub sampling_type: SamplingType,
    /// Seed, drawn when missing
    pub random_seed: Option<u64>,
    /// Freeze the feature model
    pub eval_only: bool,
    /// Reset batch-norm statistics after loading
    pub reset_bn: bool,

    // Checkpointing
    /// Run directory
    pub path_checkpoint: Option<PathBuf>,
    /// Checkpoints to start from; several are concatenated
    pub load: Option<Vec<PathBuf>>,
    /// Also load the criterion of the first checkpoint
    pub load_criterion: bool,
    /// Ignore existing checkpoints in the run directory
    pub restart: bool,
    /// Epochs between checkpoints
    pub save_step: usize,
    /// Batches between training log lines
    pub logging_step: usize,
    /// Keep a small subset of the data
    pub debug: bool,
    /// Read the rank layout from the environment
    pub distributed: bool,
}

impl Default for CpcConfig {
    fn default() -> Self {
        Self {
            path_db: PathBuf::from("data"),
            path_train: None,
            path_val: None,
            path_phone: None,
            file_extension: ".wav".to_string(),
            speaker_level: 1,
            ignore_cache: false,
            size_window: 20480,
            max_size_loaded: 4_000_000_000,
            sample_rate: crate::SAMPLE_RATE,

            hidden_encoder: 256,
            hidden_gar: 256,
            encoder_type: EncoderType::Cpc,
            encoder_no_last_relu: false,
            norm_mode: NormMode::LayerNorm,
            ar_mode: ArMode::Lstm,
            n_levels_gru: 1,
            abspos: false,
            cpc_mode: None,
            fcm: None,
            dim_inter: None,

            n_predicts: 12,
            negative_sampling_ext: 128,
            rnn_mode: RnnMode::Transformer,
            dropout: false,
            supervised: false,
            on_encoder: false,
            ctc: false,
            adversarial: false,

            clustering: None,
            n_clusters: 200,
            cluster_delay: 0,
            cluster_iter: 100,
            clustering_update: ClusteringUpdate::Kmean,
            dp_means_lambda: 1.0,

            learning_rate: 2e-4,
            scheduler_step: None,
            scheduler_ramp: None,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            n_epoch: 200,
            batch_size_gpu: 8,
            n_gpu: 1,
            sampling_type: SamplingType::SameSpeaker,
            random_seed: None,
            eval_only: false,
            reset_bn: false,

            path_checkpoint: None,
            load: None,
            load_criterion: false,
            restart: false,
            save_step: 5,
            logging_step: 1000,
            debug: false,
            distributed: false,
        }
    }
}

impl CpcConfig {
    /// Load configuration from a YAML (or JSON, by extension) file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        if path.extension().map_or(false, |e| e == "json") {
            serde_json::from_str(&content).with_context(|| "Failed to parse config JSON")
        } else {
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config YAML")
        }
    }

    /// Write the configuration as pretty JSON
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)
            .with_context(|| format!("Failed to write {:?}", path.as_ref()))
    }

    /// Resolve derived values and reject inconsistent combinations.
    ///
    /// Draws a random seed when none is set, so the stored args of a run
    /// always record the seed that was used.
    pub fn finalize(&mut self) -> Result<(), CpcError> {
        if self.random_seed.is_none() {
            self.random_seed = Some(rand::random::<u32>() as u64);
        }
        if self.ctc {
            return Err(CpcError::Unsupported("CTC phone criterion".into()));
        }
        if self.adversarial {
            return Err(CpcError::Unsupported("adversarial speaker training".into()));
        }
        if self.cpc_mode == Some(CpcMode::Bert) {
            return Err(CpcError::Unsupported("bert cpc mode".into()));
        }
        if matches!(
            self.clustering,
            Some(ClusteringMode::DeepEmbedded) | Some(ClusteringMode::CtcClustering)
        ) {
            return Err(CpcError::Unsupported(format!(
                "clustering mode {:?}",
                self.clustering
            )));
        }
        if self.size_window % crate::DOWNSAMPLING != 0 {
            return Err(CpcError::config(format!(
                "size_window ({}) must be a multiple of {}",
                self.size_window,
                crate::DOWNSAMPLING
            )));
        }
        if self.size_window / crate::DOWNSAMPLING <= self.n_predicts {
            return Err(CpcError::config(format!(
                "size_window gives {} frames, need more than n_predicts = {}",
                self.size_window / crate::DOWNSAMPLING,
                self.n_predicts
            )));
        }
        if let Some(fcm) = &self.fcm {
            fcm.validate()?;
        }
        match self.ar_mode {
            ArMode::NoAr | ArMode::Transformer => self.hidden_gar = self.ar_input_dim(),
            _ => {}
        }
        Ok(())
    }

    /// Dimension of the AR network input
    pub fn ar_input_dim(&self) -> usize {
        match &self.fcm {
            Some(fcm) => fcm.ar_input_dim(self.hidden_encoder),
            None => self.hidden_encoder,
        }
    }

    /// Number of encoded frames per window
    pub fn frames_per_window(&self) -> usize {
        self.size_window / crate::DOWNSAMPLING
    }

    /// Total batch size across devices
    pub fn batch_size(&self) -> usize {
        self.n_gpu.max(1) * self.batch_size_gpu
    }
}

/// Overlay every field of `overrides` onto `base`, except `forbidden` keys.
pub fn load_args(
    base: &CpcConfig,
    overrides: &CpcConfig,
    forbidden: Option<&HashSet<&str>>,
) -> Result<CpcConfig> {
    merge_value(base, &serde_json::to_value(overrides)?, forbidden)
}

impl CpcConfig {
    /// Overlay the keys of a partial JSON object, e.g. `{"hidden_gar": 64}`
    pub fn merge_json(&self, overrides: &serde_json::Value) -> Result<Self> {
        if !overrides.is_object() {
            bail!("config overrides must be a JSON object, got {overrides}");
        }
        merge_value(self, overrides, None)
    }
}

fn merge_value(
    base: &CpcConfig,
    overrides: &serde_json::Value,
    forbidden: Option<&HashSet<&str>>,
) -> Result<CpcConfig> {
    let mut base_value = serde_json::to_value(base)?;

    if let (Some(base_map), Some(override_map)) = (base_value.as_object_mut(), overrides.as_object()) {
        for (key, value) in override_map {
            if forbidden.map_or(false, |f| f.contains(key.as_str())) {
                continue;
            }
            base_map.insert(key.clone(), value.clone());
        }
    }

    serde_json::from_value(base_value).context("Failed to rebuild merged config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roundtrip_yaml() {
        let config = CpcConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: CpcConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_bundled_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/small.yaml");
        let mut config = CpcConfig::load(path).unwrap();
        assert_eq!(config.sampling_type, SamplingType::SameSpeaker);
        assert_eq!(config.scheduler_ramp, Some(10));
        config.finalize().unwrap();
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "hidden_encoder: 64\nar_mode: GRU\nnorm_mode: ID\n";
        let config: CpcConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.hidden_encoder, 64);
        assert_eq!(config.ar_mode, ArMode::Gru);
        assert_eq!(config.norm_mode, NormMode::Identity);
        assert_eq!(config.n_predicts, 12);
    }

    #[test]
    fn test_finalize_no_ar_matches_dims() {
        let mut config = CpcConfig {
            ar_mode: ArMode::NoAr,
            hidden_encoder: 32,
            hidden_gar: 100,
            ..Default::default()
        };
        config.finalize().unwrap();
        assert_eq!(config.hidden_gar, 32);
        assert!(config.random_seed.is_some());
    }

    #[test]
    fn test_finalize_rejects_unsupported() {
        let mut config = CpcConfig {
            ctc: true,
            ..Default::default()
        };
        assert!(matches!(config.finalize(), Err(CpcError::Unsupported(_))));
    }

    #[test]
    fn test_merge_json_partial() {
        let config = CpcConfig::default();
        let merged = config
            .merge_json(&serde_json::json!({"hidden_gar": 64, "ar_mode": "GRU"}))
            .unwrap();
        assert_eq!(merged.hidden_gar, 64);
        assert_eq!(merged.ar_mode, ArMode::Gru);
        assert_eq!(merged.hidden_encoder, config.hidden_encoder);
        assert!(config.merge_json(&serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn test_load_args_respects_forbidden() {
        let base = CpcConfig {
            n_gpu: 4,
            ..Default::default()
        };
        let stored = CpcConfig {
            n_gpu: 1,
            hidden_gar: 512,
            ..Default::default()
        };
        let forbidden: HashSet<&str> = RESUME_FORBIDDEN_KEYS.iter().copied().collect();
        let merged = load_args(&base, &stored, Some(&forbidden)).unwrap();
        assert_eq!(merged.n_gpu, 4);
        assert_eq!(merged.hidden_gar, 512);
    }
}
