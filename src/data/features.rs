//! Whole-sequence feature extraction in fixed-size chunks

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use std::path::Path;

use crate::audio::AudioLoader;
use crate::models::FeatureModule;
use crate::utils::tensor_utils::seq_normalization;

/// Chunk size of `build_feature`
pub const DEFAULT_MAX_SIZE_SEQ: usize = 64000;
/// Chunk size of `build_feature_batch`
pub const DEFAULT_BATCH_CHUNK: usize = 8000;

fn run_chunk(module: &FeatureModule, chunk: &[f32], batch: usize, seq_norm: bool, device: &Device) -> Result<Tensor> {
    let len = chunk.len() / batch;
    let audio = Tensor::from_slice(chunk, (batch, 1, len), device)?;
    let mut features = module.forward(&audio)?;
    if features.rank() == 2 {
        features = features.unsqueeze(0)?;
    }
    if seq_norm {
        features = seq_normalization(&features)?;
    }
    Ok(features.detach().to_device(&Device::Cpu)?)
}

fn last_frames(features: &Tensor, n: usize) -> Result<Tensor> {
    let l = features.dim(1)?;
    Ok(features.narrow(1, l - n.min(l), n.min(l))?)
}

/// Features (1, L, D) of a whole sequence, computed in chunks of
/// `max_size_seq` samples.
///
/// With `strict` every chunk has the full size: the tail is covered by the
/// last `max_size_seq` samples, keeping only the frames past the last full
/// chunk. Tails shorter than one frame are dropped.
pub fn build_feature_from_samples(
    module: &FeatureModule,
    samples: &[f32],
    strict: bool,
    max_size_seq: usize,
    seq_norm: bool,
    device: &Device,
) -> Result<Tensor> {
    let size = samples.len();
    let mut out = Vec::new();
    let mut start = 0;
    while start < size {
        if strict && start + max_size_seq > size {
            break;
        }
        let end = size.min(start + max_size_seq);
        if end - start < module.downsampling() {
            break;
        }
        out.push(run_chunk(module, &samples[start..end], 1, seq_norm, device)?);
        start += max_size_seq;
    }
    let delta = size.saturating_sub(start) / module.downsampling();
    if strict && delta > 0 {
        let tail = &samples[size.saturating_sub(max_size_seq)..];
        let features = run_chunk(module, tail, 1, seq_norm, device)?;
        out.push(last_frames(&features, delta)?);
    }
    if out.is_empty() {
        bail!("sequence of {size} samples yields no frames");
    }
    Ok(Tensor::cat(&out, 1)?)
}

/// `build_feature_from_samples` on a file resampled to 16 kHz
pub fn build_feature<P: AsRef<Path>>(
    module: &FeatureModule,
    path: P,
    strict: bool,
    max_size_seq: usize,
    seq_norm: bool,
    device: &Device,
) -> Result<Tensor> {
    let (samples, _) = AudioLoader::load(path, crate::SAMPLE_RATE)?;
    build_feature_from_samples(module, &samples, strict, max_size_seq, seq_norm, device)
}

/// Batched variant: full chunks of `max_size_seq` samples go through the
/// model `batch_size` at a time, then the remainder (when at least one frame
/// long) is run on its own, or as the last `max_size_seq` samples when
/// `strict`.
pub fn build_feature_batch_from_samples(
    module: &FeatureModule,
    samples: &[f32],
    strict: bool,
    max_size_seq: usize,
    seq_norm: bool,
    batch_size: usize,
    device: &Device,
) -> Result<Tensor> {
    let size = samples.len();
    let n_chunks = size / max_size_seq;
    let mut out = Vec::new();
    for batch_start in (0..n_chunks).step_by(batch_size.max(1)) {
        let batch_end = n_chunks.min(batch_start + batch_size.max(1));
        let chunk = &samples[batch_start * max_size_seq..batch_end * max_size_seq];
        let features = run_chunk(module, chunk, batch_end - batch_start, false, device)?;
        for i in 0..features.dim(0)? {
            let mut line = features.narrow(0, i, 1)?;
            if seq_norm {
                line = seq_normalization(&line)?;
            }
            out.push(line);
        }
    }

    let remainder = size % max_size_seq;
    if remainder >= module.downsampling() {
        if strict {
            let tail = &samples[size.saturating_sub(max_size_seq)..];
            let features = run_chunk(module, tail, 1, seq_norm, device)?;
            out.push(last_frames(&features, remainder / module.downsampling())?);
        } else {
            out.push(run_chunk(module, &samples[size - remainder..], 1, seq_norm, device)?);
        }
    }
    if out.is_empty() {
        bail!("sequence of {size} samples yields no frames");
    }
    Ok(Tensor::cat(&out, 1)?)
}

/// `build_feature_batch_from_samples` on a file resampled to 16 kHz
pub fn build_feature_batch<P: AsRef<Path>>(
    module: &FeatureModule,
    path: P,
    strict: bool,
    max_size_seq: usize,
    seq_norm: bool,
    batch_size: usize,
    device: &Device,
) -> Result<Tensor> {
    let (samples, _) = AudioLoader::load(path, crate::SAMPLE_RATE)?;
    build_feature_batch_from_samples(module, &samples, strict, max_size_seq, seq_norm, batch_size, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArMode, CpcConfig};
    use crate::models::{CpcModel, FeatureModel};
    use candle_core::DType;
    use candle_nn::{VarBuilder, VarMap};

    fn model() -> FeatureModel {
        let config = CpcConfig {
            hidden_encoder: 8,
            hidden_gar: 8,
            ar_mode: ArMode::NoAr,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CpcModel::from_config(&config, vb).unwrap();
        FeatureModel::Cpc(model)
    }

    fn samples(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 * 0.01).sin()).collect()
    }

    #[test]
    fn test_chunked_frame_counts() {
        let model = model();
        let m = FeatureModule::new(&model, false, false);
        let audio = samples(1600 * 2 + 480);
        let loose = build_feature_from_samples(&m, &audio, false, 1600, false, &Device::Cpu).unwrap();
        assert_eq!(loose.dims(), &[1, 23, 8]);
        let strict = build_feature_from_samples(&m, &audio, true, 1600, false, &Device::Cpu).unwrap();
        assert_eq!(strict.dims(), &[1, 23, 8]);
    }

    #[test]
    fn test_strict_tail_matches_full_chunk_end() {
        let model = model();
        let m = FeatureModule::new(&model, false, false);
        let audio = samples(1600 + 800);
        let strict = build_feature_from_samples(&m, &audio, true, 1600, false, &Device::Cpu).unwrap();
        let tail = run_chunk(&m, &audio[800..], 1, false, &Device::Cpu).unwrap();
        let a: Vec<f32> = strict.narrow(1, 10, 5).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = tail.narrow(1, 5, 5).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_batched_matches_sequential() {
        let model = model();
        let m = FeatureModule::new(&model, false, false);
        let audio = samples(800 * 5 + 320);
        let batched =
            build_feature_batch_from_samples(&m, &audio, false, 800, false, 2, &Device::Cpu).unwrap();
        assert_eq!(batched.dims(), &[1, 27, 8]);
        let plain = build_feature_from_samples(&m, &audio, false, 800, false, &Device::Cpu).unwrap();
        let diff: f32 = (batched - plain)
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(1)
            .unwrap()
            .max_keepdim(2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0];
        assert!(diff < 1e-4);
    }

    #[test]
    fn test_too_short() {
        let model = model();
        let m = FeatureModule::new(&model, false, false);
        assert!(build_feature_from_samples(&m, &samples(100), true, 1600, false, &Device::Cpu).is_err());
    }
}
