//! Audio resampling using rubato

use anyhow::Result;
use rubato::{
    Resampler as RubatoResampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

/// Audio resampler
pub struct Resampler;

impl Resampler {
    /// Resample audio from one sample rate to another
    pub fn resample(samples: &[f32], from_sr: u32, to_sr: u32) -> Result<Vec<f32>> {
        if from_sr == to_sr || samples.is_empty() {
            return Ok(samples.to_vec());
        }

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let ratio = to_sr as f64 / from_sr as f64;
        let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, samples.len(), 1)?;

        let input = vec![samples.to_vec()];
        let output = resampler.process(&input, None)?;
        let mut output = output.into_iter().next().unwrap_or_default();

        // rubato reports a fixed output frame count; trim to the exact ratio
        let expected = (samples.len() as f64 * ratio).round() as usize;
        output.truncate(expected);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_rate_is_identity() {
        let samples = vec![0.1f32, -0.2, 0.3];
        assert_eq!(Resampler::resample(&samples, 16000, 16000).unwrap(), samples);
    }

    #[test]
    fn test_downsample_length() {
        let samples = vec![0.0f32; 32000];
        let out = Resampler::resample(&samples, 32000, 16000).unwrap();
        assert!(out.len() <= 16000);
        assert!(out.len() > 15000);
    }
}
