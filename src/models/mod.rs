//! Neural network models for CPC
//!
//! This module contains all the neural network components:
//! - Frame encoders (strided convolutions, MFCC, learned filterbank)
//! - Autoregressive context networks (GRU, LSTM, RNN, transformer)
//! - Fuzzy-c-means projections and prototype pushing
//! - AR-input segmentation (hierarchical merging, fixed boundaries)
//! - Composite models assembled from checkpoints

pub mod ar;
pub mod boundaries;
pub mod composite;
pub mod cpc_model;
pub mod encoder;
pub mod fcm;
pub mod norm;
pub mod segmentation;
pub mod transformer;

// Re-exports
pub use ar::ArNet;
pub use composite::{ConcatenatedModel, FeatureModel, FeatureModule, NullspaceModel};
pub use cpc_model::{CpcModel, ForwardContext, ModelOutput, PushOutput};
pub use encoder::Encoder;
pub use segmentation::{HierarchicalSegmenter, Segmentation, SegmentationStats};
pub use transformer::TransformerAr;
