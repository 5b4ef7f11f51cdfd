//! Audio front end
//!
//! - WAV loading with mono mix-down
//! - Sample rate conversion to 16 kHz
//! - Mel spectrogram and MFCC features for the fixed encoders

mod loader;
mod resampler;
mod mel;

pub use loader::AudioLoader;
pub use resampler::Resampler;
pub use mel::{MelSpectrogram, Mfcc};
