//! Domain error types
//!
//! Most fallible code returns `anyhow::Result` and attaches context; the
//! variants here are the failures callers may want to match on.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by CPC model construction, loading and training
#[derive(Error, Debug)]
pub enum CpcError {
    /// Mutually exclusive or inconsistent configuration values
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration requests a feature this crate does not provide
    #[error("Unsupported option: {0}")]
    Unsupported(String),

    /// No checkpoint file was found in a run directory
    #[error("No checkpoint found in {0:?}")]
    CheckpointNotFound(PathBuf),

    /// Tensor or feature dimensions do not line up
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// Dataset has no usable sequences or windows
    #[error("Empty dataset: {0}")]
    EmptyDataset(String),
}

impl CpcError {
    /// Shorthand for an invalid configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}
