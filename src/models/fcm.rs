//! Prototype pushing and fuzzy-c-means-like membership
//!
//! All functions take points as (B, N, D) and centers as (k, D). Distances
//! are squared euclidean; square roots go through a small floor so the
//! backward pass stays finite at zero distance.

use anyhow::{bail, Result};
use candle_core::{DType, Tensor, D};

use crate::config::FcmSettings;

const SQRT_FLOOR: f64 = 1e-12;

/// Squared euclidean distances (B, N, k) from every vector to every centroid.
///
/// 2-D input (N, D) is treated as a batch of one. With `do_norm`, vectors and
/// centroids are scaled to unit length first.
pub fn se_distances_to_centroids(vecs: &Tensor, centroids: &Tensor, do_norm: bool) -> Result<Tensor> {
    let vecs = if vecs.rank() == 2 { vecs.unsqueeze(0)? } else { vecs.clone() };
    let (vecs, centroids) = if do_norm {
        (
            vecs.broadcast_div(&vecs.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?)?,
            centroids.broadcast_div(&centroids.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?)?,
        )
    } else {
        (vecs, centroids.clone())
    };
    let k = centroids.dim(0)?;
    let vec_sq = vecs.sqr()?.sum_keepdim(D::Minus1)?;
    let centr_sq = centroids.sqr()?.sum(D::Minus1)?.reshape((1, 1, k))?;
    let dot = vecs.broadcast_matmul(&centroids.t()?)?;
    Ok(vec_sq.broadcast_add(&centr_sq)?.sub(&(dot * 2.0)?)?)
}

/// Rows of `centers` closest to each point, shape (B, N, D)
fn closest_centers(dists: &Tensor, centers: &Tensor) -> Result<Tensor> {
    let (b, n, _) = dists.dims3()?;
    let closest = dists.argmin(D::Minus1)?.flatten_all()?;
    Ok(centers.index_select(&closest, 0)?.reshape((b, n, centers.dim(1)?))?)
}

fn sqrt_floored(dists_sq: &Tensor) -> Result<Tensor> {
    Ok(dists_sq.maximum(SQRT_FLOOR)?.sqrt()?)
}

/// Move every point a fraction `deg` of the way to its closest center.
///
/// `do_norm` measures distances on unit vectors; `do_norm_for_push` also
/// pushes the unit vectors.
pub fn push_to_closest(
    points: &Tensor,
    centers: &Tensor,
    deg: f64,
    do_norm: bool,
    do_norm_for_push: bool,
) -> Result<Tensor> {
    let (points, centers) = if do_norm_for_push {
        (
            points.broadcast_div(&points.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?)?,
            centers.broadcast_div(&centers.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?)?,
        )
    } else {
        (points.clone(), centers.clone())
    };
    let dists = sqrt_floored(&se_distances_to_centroids(&points, &centers, do_norm)?)?;
    let diffs = (closest_centers(&dists, &centers)? - &points)?;
    Ok(((diffs * deg)? + points)?)
}

/// What `FcmProjector::belong` computes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BelongMode {
    /// Fuzzy membership with exponent `m`
    Membership { m: f64 },
    /// Differentiable push toward the closest center
    Push { deg: f64 },
    /// Distance-to-closest loss
    PushLoss { weight: f64 },
    /// Push in the forward pass only, gradient passes straight through
    PushDetached { deg: f64 },
}

/// Result of `FcmProjector::belong`
#[derive(Debug)]
pub enum BelongOutput {
    /// Transformed features (B, N, D) or memberships (B, N, k)
    Features(Tensor),
    /// Scalar loss and per-center closest counts (1, k)
    Loss { loss: Tensor, counts: Tensor },
}

/// FCM / push operator configured from the FCM settings
#[derive(Debug, Clone, Default)]
pub struct FcmProjector {
    /// Normalize centers
    pub center_norm: bool,
    /// Normalize points
    pub point_norm: bool,
    /// Reweight normalized distances by the point norm
    pub norm_reweight: bool,
    /// Scale of the center-side loss
    pub protos_mult: Option<f64>,
    /// Linear instead of squared loss
    pub linear: bool,
}

impl FcmProjector {
    /// Push loss options of `settings`
    pub fn from_settings(settings: &FcmSettings) -> Self {
        Self {
            center_norm: settings.push_loss_center_norm,
            point_norm: settings.push_loss_point_norm,
            norm_reweight: settings.push_loss_norm_reweight,
            protos_mult: settings.push_loss_protos_mult,
            linear: settings.push_loss_linear,
        }
    }

    /// Apply `mode` to `points` (B, N, D) against `centers` (k, D)
    pub fn belong(&self, points: &Tensor, centers: &Tensor, mode: BelongMode) -> Result<BelongOutput> {
        let normed = matches!(mode, BelongMode::PushLoss { .. } | BelongMode::PushDetached { .. })
            && self.center_norm;

        let mut points = points.clone();
        let mut centers = centers.clone();
        let mut point_lens = None;
        let mut loss_scale = None;
        if normed {
            let lens = points.sqr()?.sum(D::Minus1)?.maximum(SQRT_FLOOR)?.sqrt()?;
            let centers_lens = centers.sqr()?.sum_keepdim(D::Minus1)?.maximum(SQRT_FLOOR)?.sqrt()?;
            let unit_centers = centers.broadcast_div(&centers_lens.maximum(1.0)?)?;
            if self.point_norm {
                centers = unit_centers;
                points = points.broadcast_div(&lens.maximum(1.0)?.unsqueeze(D::Minus1)?)?;
                if self.norm_reweight && matches!(mode, BelongMode::PushLoss { .. }) {
                    loss_scale = Some(lens.mean_all()?);
                }
            } else {
                centers = unit_centers.broadcast_mul(&lens.mean_all()?)?;
            }
            point_lens = Some(lens);
        }

        let (dists_sq, dists) = match self.protos_mult {
            Some(mult) => {
                if !matches!(mode, BelongMode::PushLoss { .. }) {
                    bail!("push_loss_protos_mult only applies to the push loss");
                }
                let sq1 = se_distances_to_centroids(&points, &centers.detach(), false)?.maximum(0.0)?;
                let sq2 = se_distances_to_centroids(&points.detach(), &centers, false)?.maximum(0.0)?;
                let d1 = sqrt_floored(&sq1)?;
                let d2 = sqrt_floored(&sq2)?;
                ((sq1 + (sq2 * mult)?)?, (d1 + (d2 * mult)?)?)
            }
            None => {
                let sq = se_distances_to_centroids(&points, &centers, false)?.maximum(0.0)?;
                let d = sqrt_floored(&sq)?;
                (sq, d)
            }
        };

        match mode {
            BelongMode::Membership { m } => {
                let rev = dists.maximum(1e-8)?.recip()?;
                let ratio = dists.unsqueeze(3)?.broadcast_mul(&rev.unsqueeze(2)?)?;
                let denom = ratio.powf(2.0 / (m - 1.0))?.sum(D::Minus1)?;
                Ok(BelongOutput::Features(denom.maximum(1e-8)?.recip()?))
            }
            BelongMode::Push { deg } => {
                let diffs = (closest_centers(&dists, &centers)? - &points)?;
                Ok(BelongOutput::Features(((diffs * deg)? + &points)?))
            }
            BelongMode::PushLoss { weight } => {
                let dst = if self.linear { &dists } else { &dists_sq };
                let min = dst.min(D::Minus1)?;
                let counts = closest_counts(&dst.argmin(D::Minus1)?, centers.dim(0)?)?;
                let mut loss = (min.mean_all()? * weight)?;
                if let Some(scale) = loss_scale {
                    loss = (loss * scale)?;
                }
                Ok(BelongOutput::Loss { loss, counts })
            }
            BelongMode::PushDetached { deg } => {
                let closest = closest_centers(&dists, &centers)?;
                let shift = ((closest * deg)? - (&points * deg)?)?.detach();
                let mut pushed = (&points + shift)?;
                if let (true, true, Some(lens)) = (self.center_norm, self.point_norm, &point_lens) {
                    pushed = pushed.broadcast_mul(&lens.unsqueeze(D::Minus1)?)?;
                }
                Ok(BelongOutput::Features(pushed))
            }
        }
    }

    /// Fuzzy memberships (B, N, k)
    pub fn membership(&self, points: &Tensor, centers: &Tensor, m: f64) -> Result<Tensor> {
        self.features(points, centers, BelongMode::Membership { m })
    }

    /// Differentiable push toward the closest center
    pub fn push(&self, points: &Tensor, centers: &Tensor, deg: f64) -> Result<Tensor> {
        self.features(points, centers, BelongMode::Push { deg })
    }

    /// Straight-through push toward the closest center
    pub fn push_detached(&self, points: &Tensor, centers: &Tensor, deg: f64) -> Result<Tensor> {
        self.features(points, centers, BelongMode::PushDetached { deg })
    }

    /// Push loss and closest counts
    pub fn push_loss(&self, points: &Tensor, centers: &Tensor, weight: f64) -> Result<(Tensor, Tensor)> {
        match self.belong(points, centers, BelongMode::PushLoss { weight })? {
            BelongOutput::Loss { loss, counts } => Ok((loss, counts)),
            BelongOutput::Features(_) => bail!("push loss produced features"),
        }
    }

    fn features(&self, points: &Tensor, centers: &Tensor, mode: BelongMode) -> Result<Tensor> {
        match self.belong(points, centers, mode)? {
            BelongOutput::Features(t) => Ok(t),
            BelongOutput::Loss { .. } => bail!("{mode:?} produced a loss"),
        }
    }
}

/// Histogram of closest-center indices as (1, k) f32
fn closest_counts(indices: &Tensor, k: usize) -> Result<Tensor> {
    let mut counts = vec![0f32; k];
    for idx in indices.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()? {
        if let Some(c) = counts.get_mut(idx as usize) {
            *c += 1.0;
        }
    }
    Ok(Tensor::from_vec(counts, (1, k), indices.device())?)
}

/// Blend two representations over training time.
///
/// `part1` lengths are clamped to at least 1 and scaled by `1 - p`, `part2`
/// is rescaled so its length relative to the final `part1` length is
/// `p / (1 - p)`, with `p = (epoch + 1) / (total + 1)`.
pub fn gradual_training_normalize(
    part1: &Tensor,
    part2: &Tensor,
    epoch: f64,
    total: f64,
    sums_not_lengths: bool,
) -> Result<(Tensor, Tensor)> {
    let p = (epoch + 1.0) / (total + 1.0);
    let length = |t: &Tensor| -> Result<Tensor> {
        Ok(if sums_not_lengths {
            t.abs()?.sum_keepdim(D::Minus1)?
        } else {
            t.sqr()?.sum_keepdim(D::Minus1)?.maximum(SQRT_FLOOR)?.sqrt()?
        })
    };

    let l1 = length(part1)?;
    let l1_clamped = l1.maximum(1.0)?;
    let part1 = (part1.broadcast_div(&l1_clamped)? * (1.0 - p))?;
    let l1_final = ((l1 / &l1_clamped)? * (1.0 - p))?;

    let l2_clamped = length(part2)?.maximum(1.0)?;
    let target = ((l1_final * p)? / (1.0 - p))?;
    let part2 = part2.broadcast_mul(&target)?.broadcast_div(&l2_clamped)?;
    Ok((part1, part2))
}

/// `weight` ramped linearly from epoch `start` to the last epoch
pub fn gradual_coefficient(weight: f64, start: Option<f64>, epoch: f64, total: f64) -> f64 {
    match start {
        None => weight,
        Some(start) => weight * (epoch - start).max(0.0) / (total - start).max(1.0),
    }
}

/// Whether a weight with gradual `start` is active at `epoch`
pub fn gradual_active(start: Option<f64>, epoch: f64) -> bool {
    start.map_or(true, |s| epoch >= s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn to_vec3(t: &Tensor) -> Vec<Vec<Vec<f32>>> {
        t.to_vec3().unwrap()
    }

    fn centers() -> Tensor {
        Tensor::new(&[[0f32, 0.], [10., 0.]], &Device::Cpu).unwrap()
    }

    fn points() -> Tensor {
        Tensor::new(&[[[1f32, 0.], [9., 0.], [4., 3.]]], &Device::Cpu).unwrap()
    }

    #[test]
    fn test_distances() {
        let d = se_distances_to_centroids(&points(), &centers(), false).unwrap();
        let d = to_vec3(&d);
        assert_eq!(d[0][0], vec![1.0, 81.0]);
        assert_eq!(d[0][2], vec![25.0, 45.0]);

        let flat = se_distances_to_centroids(&points().squeeze(0).unwrap(), &centers(), false).unwrap();
        assert_eq!(flat.dims(), &[1, 3, 2]);
    }

    #[test]
    fn test_push_moves_toward_closest() {
        let pushed = push_to_closest(&points(), &centers(), 0.5, false, false).unwrap();
        let pushed = to_vec3(&pushed);
        assert_eq!(pushed[0][0], vec![0.5, 0.0]);
        assert_eq!(pushed[0][1], vec![9.5, 0.0]);

        let projector = FcmProjector::default();
        let same = projector.push(&points(), &centers(), 1.0).unwrap();
        assert_eq!(to_vec3(&same)[0][2], vec![0.0, 0.0]);
    }

    #[test]
    fn test_membership_sums_to_one() {
        let projector = FcmProjector::default();
        let m = projector.membership(&points(), &centers(), 2.0).unwrap();
        assert_eq!(m.dims(), &[1, 3, 2]);
        for row in to_vec3(&m)[0].iter() {
            let s: f32 = row.iter().sum();
            assert!((s - 1.0).abs() < 1e-5);
        }
        // point 0 is 1 from center 0 and 9 from center 1
        let first = &to_vec3(&m)[0][0];
        assert!((first[0] - 81.0 / 82.0).abs() < 1e-4);
    }

    #[test]
    fn test_push_loss_and_counts() {
        let projector = FcmProjector::default();
        let (loss, counts) = projector.push_loss(&points(), &centers(), 2.0).unwrap();
        let loss: f32 = loss.to_scalar().unwrap();
        assert!((loss - 2.0 * (1.0 + 1.0 + 25.0) / 3.0).abs() < 1e-4);
        let counts: Vec<Vec<f32>> = counts.to_vec2().unwrap();
        assert_eq!(counts, vec![vec![2.0, 1.0]]);

        let linear = FcmProjector {
            linear: true,
            ..Default::default()
        };
        let (loss, _) = linear.push_loss(&points(), &centers(), 1.0).unwrap();
        let loss: f32 = loss.to_scalar().unwrap();
        assert!((loss - 7.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_push_detached_is_straight_through() {
        let var = Var::from_tensor(&points()).unwrap();
        let projector = FcmProjector::default();
        let pushed = projector.push_detached(var.as_tensor(), &centers(), 0.5).unwrap();
        assert_eq!(to_vec3(&pushed)[0][0], vec![0.5, 0.0]);

        let grads = pushed.sum_all().unwrap().backward().unwrap();
        let g: Vec<Vec<Vec<f32>>> = grads.get(var.as_tensor()).unwrap().to_vec3().unwrap();
        assert!(g.iter().flatten().flatten().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_protos_mult_requires_push_loss() {
        let projector = FcmProjector {
            protos_mult: Some(0.5),
            ..Default::default()
        };
        assert!(projector.push(&points(), &centers(), 0.5).is_err());
        assert!(projector.push_loss(&points(), &centers(), 1.0).is_ok());
    }

    #[test]
    fn test_gradual_normalize_lengths() {
        let part1 = Tensor::new(&[[[3f32, 4.]]], &Device::Cpu).unwrap();
        let part2 = Tensor::new(&[[[0f32, 2.]]], &Device::Cpu).unwrap();
        // p = 0.5
        let (a, b) = gradual_training_normalize(&part1, &part2, 0.0, 1.0, false).unwrap();
        let a = to_vec3(&a);
        let b = to_vec3(&b);
        assert!((a[0][0][0] - 0.3).abs() < 1e-5);
        assert!((a[0][0][1] - 0.4).abs() < 1e-5);
        // final part1 length 0.5, part2 length scaled to 0.5
        assert!((b[0][0][1] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_gradual_coefficient() {
        assert_eq!(gradual_coefficient(2.0, None, 3.0, 10.0), 2.0);
        assert_eq!(gradual_coefficient(2.0, Some(5.0), 3.0, 10.0), 0.0);
        assert!((gradual_coefficient(2.0, Some(5.0), 7.5, 10.0) - 1.0).abs() < 1e-12);
        assert!(!gradual_active(Some(5.0), 3.0));
        assert!(gradual_active(None, 0.0));
    }
}
