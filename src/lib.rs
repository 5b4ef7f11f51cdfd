//! # cpc-audio
//!
//! Contrastive Predictive Coding for self-supervised speech representation
//! learning, built on Candle.
//!
//! ## Features
//!
//! - Convolutional, MFCC and learned filterbank frame encoders
//! - GRU / LSTM / RNN / transformer autoregressive context networks
//! - InfoNCE criterion with uniform in-batch negatives
//! - Prototype pushing and fuzzy-c-means membership regularizers
//! - Hierarchical segmentation shortening the AR input sequence
//! - k-means pseudo labels for deep clustering
//! - Recursive checkpoint loading into concatenated / nullspace models
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cpc_audio::{CpcConfig, distributed::DistributedContext, training::TrainingSession};
//!
//! let config = CpcConfig::load("configs/small.yaml")?;
//! let mut session = TrainingSession::new(config, &candle_core::Device::Cpu, DistributedContext::single())?;
//! session.run()?;
//! ```

// Require docs for public items, but not struct fields (too verbose)
#![warn(missing_docs)]
#![allow(rustdoc::missing_crate_level_docs)]

pub mod audio;
pub mod checkpoint;
pub mod clustering;
pub mod config;
pub mod criterion;
pub mod data;
pub mod distributed;
pub mod error;
pub mod models;
pub mod training;
pub mod utils;

// Re-exports for convenience
pub use config::{CpcConfig, FcmSettings};
pub use error::CpcError;
pub use models::{CpcModel, FeatureModel};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sample rate all audio is resampled to (16 kHz)
pub const SAMPLE_RATE: u32 = 16000;

/// Audio samples per encoded frame of the convolutional encoder
pub const DOWNSAMPLING: usize = 160;
