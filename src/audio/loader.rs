//! Audio file loading

use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

/// Loads speech files as mono f32 samples at a fixed sample rate
pub struct AudioLoader;

impl AudioLoader {
    /// Load audio from a file and return samples at the specified sample rate
    pub fn load<P: AsRef<Path>>(path: P, target_sr: u32) -> Result<(Vec<f32>, u32)> {
        let path = path.as_ref();

        if path.extension().map_or(false, |e| e.eq_ignore_ascii_case("wav")) {
            return Self::load_wav(path, target_sr);
        }

        Err(anyhow::anyhow!("Unsupported audio format: {:?}", path))
    }

    /// Number of samples the file holds once resampled to `target_sr`,
    /// read from the header only.
    pub fn duration_samples<P: AsRef<Path>>(path: P, target_sr: u32) -> Result<usize> {
        let reader = hound::WavReader::open(path.as_ref())
            .with_context(|| format!("Failed to open WAV file {:?}", path.as_ref()))?;
        let spec = reader.spec();
        let frames = reader.duration() as u64;
        Ok((frames * target_sr as u64 / spec.sample_rate as u64) as usize)
    }

    fn load_wav(path: &Path, target_sr: u32) -> Result<(Vec<f32>, u32)> {
        let reader = hound::WavReader::open(path)
            .with_context(|| format!("Failed to open WAV file {:?}", path))?;

        let spec = reader.spec();
        let sample_rate = spec.sample_rate;

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .with_context(|| format!("Corrupt float samples in {:?}", path))?,
            hound::SampleFormat::Int => {
                let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max_value))
                    .collect::<std::result::Result<_, _>>()
                    .with_context(|| format!("Corrupt integer samples in {:?}", path))?
            }
        };

        let mono_samples = if spec.channels > 1 {
            samples
                .chunks(spec.channels as usize)
                .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
                .collect()
        } else {
            samples
        };

        debug!(
            "Loaded {:?}: {} samples @ {} Hz, {} channel(s)",
            path,
            mono_samples.len(),
            sample_rate,
            spec.channels
        );

        if sample_rate != target_sr {
            let resampled = super::Resampler::resample(&mono_samples, sample_rate, target_sr)?;
            Ok((resampled, target_sr))
        } else {
            Ok((mono_samples, sample_rate))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, samples: &[i16], sample_rate: u32, channels: u16) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_load_stereo_mixes_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        // left = 0.5, right = -0.5 -> mono 0
        let samples: Vec<i16> = (0..200).map(|i| if i % 2 == 0 { 16384 } else { -16384 }).collect();
        write_wav(&path, &samples, 16000, 2);

        let (audio, sr) = AudioLoader::load(&path, 16000).unwrap();
        assert_eq!(sr, 16000);
        assert_eq!(audio.len(), 100);
        assert!(audio.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_duration_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_wav(&path, &vec![0i16; 8000], 8000, 1);
        assert_eq!(AudioLoader::duration_samples(&path, 16000).unwrap(), 16000);
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(AudioLoader::load("speech.flac", 16000).is_err());
    }
}
