//! Dataset listing, windowed batches and sequence feature extraction

mod dataset;
mod features;
mod seqs;

pub use dataset::{AudioBatchData, Batch, DataLoader};
pub use features::{
    build_feature, build_feature_batch, build_feature_batch_from_samples, build_feature_from_samples,
    DEFAULT_BATCH_CHUNK, DEFAULT_MAX_SIZE_SEQ,
};
pub use seqs::{filter_seqs, find_all_seqs, parse_seq_labels, SeqEntry, SeqLabels, LABEL_STEP, SEQ_CACHE_FILE};
