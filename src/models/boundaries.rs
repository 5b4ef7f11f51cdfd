//! Fixed boundary detectors producing a `Segmentation`
//!
//! All of them work on detached CPU copies of a (B, L, D) encoding and index frames
//! of the flattened batch, keeping every line end as a boundary.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};

use super::segmentation::Segmentation;
use crate::utils::tensor_utils::{adjacent_cosine_similarity, max_min_norm};

fn to_host(encoded: &Tensor) -> Result<Vec<Vec<Vec<f32>>>> {
    Ok(encoded.detach().to_device(&Device::Cpu)?.to_dtype(DType::F32)?.to_vec3()?)
}

/// Iterative variance-based boundary retention.
///
/// Starting from a boundary before every frame, each round scores boundaries
/// by the standard deviation of the span between their neighbours and keeps
/// the top `max(final_length, step_reduction * count)`, until at most
/// `final_length_factor * (B * L + 1)` remain. Lines left with fewer than
/// `min_length_seq` segments get their largest segments split in half.
pub fn jch_boundaries(
    encoded: &Tensor,
    final_length_factor: f64,
    min_length_seq: usize,
    step_reduction: f64,
) -> Result<Segmentation> {
    if !(0.0..1.0).contains(&step_reduction) || step_reduction == 0.0 {
        bail!("step_reduction must be in (0, 1), got {step_reduction}");
    }
    let (b, l, d) = encoded.dims3()?;
    let frames = to_host(encoded)?;
    let n = b * l;

    let mut csum = vec![vec![0f64; d]; n + 1];
    let mut csum2 = vec![vec![0f64; d]; n + 1];
    for (i, frame) in frames.iter().flatten().enumerate() {
        for (j, &v) in frame.iter().enumerate() {
            let v = v as f64;
            csum[i + 1][j] = csum[i][j] + v;
            csum2[i + 1][j] = csum2[i][j] + v * v;
        }
    }

    let final_length = (final_length_factor * (n + 1) as f64) as usize;
    let mut idx: Vec<usize> = (0..=n).collect();
    while idx.len() > final_length.max(2) {
        let mut scores = vec![1e10f64; idx.len()];
        for k in 1..idx.len() - 1 {
            let (beg, end) = (idx[k - 1], idx[k + 1]);
            let count = (end - beg) as f64;
            let var: f64 = (0..d)
                .map(|j| {
                    let mean = (csum[end][j] - csum[beg][j]) / count;
                    (csum2[end][j] - csum2[beg][j]) / count - mean * mean
                })
                .sum::<f64>()
                / d.max(1) as f64;
            scores[k] = var.max(0.0).sqrt();
        }
        let retain = final_length.max((idx.len() as f64 * step_reduction) as usize);
        let mut order: Vec<usize> = (0..idx.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
        order.truncate(retain.max(2));
        order.sort_unstable();
        idx = order.into_iter().map(|k| idx[k]).collect();
    }

    let mut segmentation = Segmentation::from_flat_boundaries(&idx, b, l);
    for cuts in segmentation.cuts.iter_mut() {
        while cuts.len() - 1 < min_length_seq.min(l) {
            let Some((largest, _)) = cuts
                .windows(2)
                .enumerate()
                .max_by(|(ia, a), (ib, b)| (a[1] - a[0]).cmp(&(b[1] - b[0])).then(ib.cmp(ia)))
            else {
                break;
            };
            let mid = ((cuts[largest] + cuts[largest + 1]) as f64 / 2.0).round() as usize;
            if mid == cuts[largest] || mid == cuts[largest + 1] {
                break;
            }
            cuts.insert(largest + 1, mid);
        }
    }
    Ok(segmentation)
}

/// Peaks of `x` with at least the given topographic prominence.
///
/// Flat peaks report their middle sample.
pub fn find_peaks(x: &[f32], prominence: f64) -> Vec<usize> {
    let mut peaks = Vec::new();
    let mut i = 1;
    while i + 1 < x.len() {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead + 1 < x.len() && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                let peak = (i + ahead - 1) / 2;
                let height = x[peak];
                let mut left_min = height;
                for &v in x[..i].iter().rev() {
                    if v > height {
                        break;
                    }
                    left_min = left_min.min(v);
                }
                let mut right_min = height;
                for &v in &x[ahead..] {
                    if v > height {
                        break;
                    }
                    right_min = right_min.min(v);
                }
                if (height - left_min.max(right_min)) as f64 >= prominence {
                    peaks.push(peak);
                }
                i = ahead;
                continue;
            }
        }
        i += 1;
    }
    peaks
}

/// Boundaries at prominent peaks of the min-max normalized negative cosine
/// similarity between consecutive frames
pub fn kreuk_boundaries(encoded: &Tensor, prominence: f64) -> Result<Segmentation> {
    let (b, l, _) = encoded.dims3()?;
    if l < 2 {
        return Ok(Segmentation::identity(b, l));
    }
    let encoded = encoded.detach().to_dtype(DType::F32)?;
    let scores = adjacent_cosine_similarity(&encoded)?.neg()?;
    let scores = Tensor::cat(&[scores.narrow(1, 0, 1)?, scores], 1)?;
    let scores = max_min_norm(&scores)?;
    let flat: Vec<f32> = scores.flatten_all()?.to_device(&Device::Cpu)?.to_vec1()?;

    let mut peaks = find_peaks(&flat, prominence);
    if peaks.is_empty() {
        peaks.push(0);
    }
    Ok(Segmentation::from_flat_boundaries(&peaks, b, l))
}

/// Boundaries at local maxima of the min-max normalized dissimilarity of
/// consecutive frames.
///
/// A frame starts a segment when its dissimilarity exceeds both direct
/// neighbours and, by more than `threshold`, a neighbour one or two frames away.
pub fn jhu_boundaries(encoded: &Tensor, threshold: f64) -> Result<Segmentation> {
    let (b, l, _) = encoded.dims3()?;
    if l < 2 {
        return Ok(Segmentation::identity(b, l));
    }
    let similarity = adjacent_cosine_similarity(&encoded.detach().to_dtype(DType::F32)?)?;
    let dissimilarity: Vec<Vec<f32>> = max_min_norm(&similarity)?
        .affine(-1.0, 1.0)?
        .to_device(&Device::Cpu)?
        .to_vec2()?;

    let threshold = threshold as f32;
    let mut flat = Vec::new();
    for (line, d) in dissimilarity.iter().enumerate() {
        let n = d.len();
        let above = |i: usize, gap: usize| -> f32 {
            let before = if i >= gap { (d[i] - d[i - gap]).max(0.0) } else { 0.0 };
            let after = if i + gap < n { (d[i] - d[i + gap]).max(0.0) } else { 0.0 };
            before.min(after)
        };
        for i in 0..n {
            let near = above(i, 1);
            let score = (near.max(above(i, 2)) - threshold).max(0.0).min(near);
            if score > 0.0 {
                flat.push(line * l + i + 1);
            }
        }
    }
    Ok(Segmentation::from_flat_boundaries(&flat, b, l))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_states() -> Tensor {
        // frames alternate direction after position 4 in each line
        let mut data = Vec::new();
        for _line in 0..2 {
            for t in 0..8 {
                if t < 4 {
                    data.extend_from_slice(&[1f32, 0.1 * t as f32]);
                } else {
                    data.extend_from_slice(&[0.1 * t as f32, 1.0]);
                }
            }
        }
        Tensor::from_vec(data, (2, 8, 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_find_peaks_prominence() {
        let x = [0.0f32, 1.0, 0.0, 0.3, 0.2, 0.5, 0.5, 0.5, 0.0];
        assert_eq!(find_peaks(&x, 0.0), vec![1, 3, 6]);
        assert_eq!(find_peaks(&x, 0.4), vec![1, 6]);
    }

    #[test]
    fn test_kreuk_finds_change_point() {
        let seg = kreuk_boundaries(&two_states(), 0.5).unwrap();
        assert_eq!(seg.cuts[0], vec![0, 4, 8]);
        assert_eq!(seg.cuts[1], vec![0, 4, 8]);
    }

    #[test]
    fn test_jhu_finds_change_point() {
        let seg = jhu_boundaries(&two_states(), 0.04).unwrap();
        assert_eq!(seg.cuts[0], vec![0, 4, 8]);
        assert_eq!(seg.cuts[1], vec![0, 4, 8]);

        let flat = jhu_boundaries(&Tensor::ones((1, 6, 2), DType::F32, &Device::Cpu).unwrap(), 0.04).unwrap();
        assert_eq!(flat.cuts, vec![vec![0, 6]]);
    }

    #[test]
    fn test_jch_respects_min_length() {
        let seg = jch_boundaries(&two_states(), 0.1, 3, 0.5).unwrap();
        for cuts in &seg.cuts {
            assert!(cuts.len() - 1 >= 3);
            assert_eq!(cuts[0], 0);
            assert_eq!(*cuts.last().unwrap(), 8);
        }
    }

    #[test]
    fn test_jch_rejects_bad_step() {
        assert!(jch_boundaries(&two_states(), 0.5, 1, 1.5).is_err());
    }
}
