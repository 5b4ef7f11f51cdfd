//! Run configuration
//!
//! `CpcConfig` carries every training / model option. It is stored next to
//! checkpoints as `checkpoint_args.json` and can be loaded from YAML files.

mod cpc_config;
mod fcm;

pub use cpc_config::{
    load_args, ArMode, ClusteringMode, ClusteringUpdate, CpcConfig, CpcMode, EncoderType,
    NormMode, RnnMode, SamplingType, RESUME_FORBIDDEN_KEYS,
};
pub use fcm::{CenterSource, FcmSettings, SegmenterKind};
