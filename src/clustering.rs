//! k-means pseudo labels, deep clustering and learnable prototypes

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{linear, Init, Linear, Module, VarBuilder};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::config::{ClusteringUpdate, SamplingType};
use crate::criterion::classification_loss;
use crate::data::{build_feature, AudioBatchData, Batch, SeqLabels, DEFAULT_MAX_SIZE_SEQ, LABEL_STEP};
use crate::models::fcm::se_distances_to_centroids;
use crate::models::FeatureModule;
use crate::utils::tensor_utils::one_hot;

/// Lloyd iterations of a `KMeans::fit`
pub const KMEANS_MAX_ITER: usize = 20;
/// Stop when the mean squared center shift falls below this
pub const KMEANS_EPSILON: f64 = 1e-4;

/// Cluster centers (k, D) on the CPU
#[derive(Debug, Clone)]
pub struct KMeans {
    centers: Tensor,
}

fn sq_dist(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

impl KMeans {
    /// Wrap fixed (k, D) centers
    pub fn from_centers(centers: Tensor) -> Result<Self> {
        if centers.rank() != 2 {
            bail!("centers must be (k, D), got {:?}", centers.dims());
        }
        Ok(Self {
            centers: centers.to_device(&Device::Cpu)?.to_dtype(DType::F32)?,
        })
    }

    /// (k, D) centers
    pub fn centers(&self) -> &Tensor {
        &self.centers
    }

    /// Number of clusters
    pub fn k(&self) -> usize {
        self.centers.dim(0).unwrap_or(0)
    }

    /// k-means++ seeding on host rows
    fn plus_plus_init(rows: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
        let mut centers = vec![rows[rng.gen_range(0..rows.len())].clone()];
        let mut nearest: Vec<f32> = rows.iter().map(|r| sq_dist(r, &centers[0])).collect();
        while centers.len() < k {
            let total: f32 = nearest.iter().sum();
            let pick = if total > 0.0 {
                let mut target = rng.gen::<f32>() * total;
                let mut idx = rows.len() - 1;
                for (i, &d) in nearest.iter().enumerate() {
                    if target < d {
                        idx = i;
                        break;
                    }
                    target -= d;
                }
                idx
            } else {
                rng.gen_range(0..rows.len())
            };
            centers.push(rows[pick].clone());
            let last = &centers[centers.len() - 1];
            for (n, r) in nearest.iter_mut().zip(rows) {
                *n = n.min(sq_dist(r, last));
            }
        }
        centers
    }

    /// Lloyd iterations over (N, D) features.
    ///
    /// Starts from `init` when given, otherwise from k-means++ seeds. Empty
    /// clusters keep their previous center.
    pub fn fit(features: &Tensor, k: usize, init: Option<&Tensor>, rng: &mut StdRng) -> Result<Self> {
        let features = features.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
        let (n, d) = features.dims2()?;
        if n == 0 || k == 0 {
            bail!("k-means needs points and clusters, got {n} points for k = {k}");
        }
        let mut centers = match init {
            Some(c) if c.dims() == [k, d] => c.to_device(&Device::Cpu)?.to_dtype(DType::F32)?,
            _ => {
                let rows: Vec<Vec<f32>> = features.to_vec2()?;
                let seeds = Self::plus_plus_init(&rows, k.min(n), rng);
                let mut flat: Vec<f32> = seeds.into_iter().flatten().collect();
                // fewer points than clusters: repeat the seeds
                while flat.len() < k * d {
                    let extra = flat[..d].to_vec();
                    flat.extend(extra);
                }
                Tensor::from_vec(flat, (k, d), &Device::Cpu)?
            }
        };

        for iter in 0..KMEANS_MAX_ITER {
            let assign = se_distances_to_centroids(&features, &centers, false)?
                .squeeze(0)?
                .argmin(D::Minus1)?;
            let onehot = one_hot(&assign, k)?;
            let counts = onehot.sum(0)?.unsqueeze(1)?;
            let sums = onehot.t()?.contiguous()?.matmul(&features)?;
            let means = sums.broadcast_div(&counts.maximum(1.0)?)?;
            let has_points = counts.gt(0f32)?.broadcast_as((k, d))?;
            let updated = has_points.where_cond(&means, &centers)?;
            let shift: f32 = (&updated - &centers)?.sqr()?.mean_all()?.to_scalar()?;
            centers = updated;
            if (shift as f64) < KMEANS_EPSILON {
                debug!("k-means converged after {} iterations", iter + 1);
                break;
            }
        }
        Ok(Self { centers })
    }

    /// DP-means over (N, D) features: a point farther than `lambda`
    /// (squared distance) from every center opens a new cluster, up to
    /// `max_clusters`.
    pub fn dp_means(features: &Tensor, lambda: f64, max_clusters: usize, rng: &mut StdRng) -> Result<Self> {
        let rows: Vec<Vec<f32>> = features.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.to_vec2()?;
        if rows.is_empty() || max_clusters == 0 {
            bail!("dp-means needs points and at least one cluster");
        }
        let d = rows[0].len();
        let mean: Vec<f32> = (0..d)
            .map(|j| rows.iter().map(|r| r[j]).sum::<f32>() / rows.len() as f32)
            .collect();
        let mut centers = vec![mean];
        let mut order: Vec<usize> = (0..rows.len()).collect();
        rand::seq::SliceRandom::shuffle(order.as_mut_slice(), rng);

        for _ in 0..KMEANS_MAX_ITER {
            let mut assign = vec![0usize; rows.len()];
            for &i in &order {
                let (best, dist) = centers
                    .iter()
                    .enumerate()
                    .map(|(c, center)| (c, sq_dist(&rows[i], center)))
                    .fold((0, f32::INFINITY), |acc, x| if x.1 < acc.1 { x } else { acc });
                if dist as f64 > lambda && centers.len() < max_clusters {
                    centers.push(rows[i].clone());
                    assign[i] = centers.len() - 1;
                } else {
                    assign[i] = best;
                }
            }
            let mut sums = vec![vec![0f32; d]; centers.len()];
            let mut counts = vec![0usize; centers.len()];
            for (row, &a) in rows.iter().zip(&assign) {
                counts[a] += 1;
                for (s, v) in sums[a].iter_mut().zip(row) {
                    *s += v;
                }
            }
            let mut shift = 0f32;
            for ((center, sum), &count) in centers.iter_mut().zip(&sums).zip(&counts) {
                if count == 0 {
                    continue;
                }
                let updated: Vec<f32> = sum.iter().map(|s| s / count as f32).collect();
                shift += sq_dist(center, &updated);
                *center = updated;
            }
            if (shift as f64) < KMEANS_EPSILON {
                break;
            }
        }
        let k = centers.len();
        let flat: Vec<f32> = centers.into_iter().flatten().collect();
        Ok(Self {
            centers: Tensor::from_vec(flat, (k, d), &Device::Cpu)?,
        })
    }

    /// Index of the closest center for every row of (..., D) features
    pub fn assign(&self, features: &Tensor) -> Result<Tensor> {
        let dims = features.dims().to_vec();
        let d = dims[dims.len() - 1];
        let flat = features
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .reshape(((), d))?;
        let idx = se_distances_to_centroids(&flat, &self.centers, false)?
            .squeeze(0)?
            .argmin(D::Minus1)?;
        Ok(idx.reshape(&dims[..dims.len() - 1])?)
    }
}

/// Deep clustering: periodic k-means on context features, and a classifier
/// trained on the resulting frame pseudo labels.
pub struct DeepClustering {
    k: usize,
    delay: usize,
    cluster_iter: usize,
    update: ClusteringUpdate,
    dp_lambda: f64,
    step: usize,
    clusters: Option<KMeans>,
    hidden: Linear,
    output: Linear,
}

impl DeepClustering {
    /// Classifier layers under `classifier.0` and `classifier.2`
    pub fn new(
        k: usize,
        dim: usize,
        delay: usize,
        cluster_iter: usize,
        update: ClusteringUpdate,
        dp_lambda: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb = vb.pp("classifier");
        Ok(Self {
            k,
            delay,
            cluster_iter,
            update,
            dp_lambda,
            step: 0,
            clusters: None,
            hidden: linear(dim, dim, vb.pp(0))?,
            output: linear(dim, k, vb.pp(2))?,
        })
    }

    /// Number of clusters
    pub fn k(&self) -> usize {
        self.k
    }

    /// Active once more than `delay` cluster updates were requested
    pub fn can_run(&self) -> bool {
        self.step > self.delay
    }

    /// Current clusters, `None` before the first update
    pub fn clusters(&self) -> Option<&KMeans> {
        self.clusters.as_ref()
    }

    /// Refresh the clusters from up to `cluster_iter` uniform batches.
    ///
    /// `extract` maps a batch to (B, S, D) context features.
    pub fn update_clusters<F>(
        &mut self,
        dataset: &mut AudioBatchData,
        batch_size: usize,
        device: &Device,
        rng: &mut StdRng,
        mut extract: F,
    ) -> Result<()>
    where
        F: FnMut(&Batch) -> Result<Tensor>,
    {
        self.step += 1;
        if !self.can_run() {
            return Ok(());
        }
        let mut features = Vec::new();
        for batch in dataset
            .loader(batch_size, SamplingType::Uniform, true, device, rng)
            .take(self.cluster_iter.max(1))
        {
            let c = extract(&batch?)?;
            let d = c.dim(D::Minus1)?;
            features.push(c.detach().reshape(((), d))?.to_device(&Device::Cpu)?);
        }
        if features.is_empty() {
            bail!("no batches available to update the clusters");
        }
        let features = Tensor::cat(&features, 0)?;
        let clusters = match self.update {
            ClusteringUpdate::Kmean => {
                KMeans::fit(&features, self.k, self.clusters.as_ref().map(KMeans::centers), rng)?
            }
            ClusteringUpdate::Dpmean => KMeans::dp_means(&features, self.dp_lambda, self.k, rng)?,
        };
        info!("Clusters updated: {} centers from {} frames", clusters.k(), features.dim(0)?);
        self.clusters = Some(clusters);
        Ok(())
    }

    /// Classification loss (1, 1) of (B, S, D) features against (B, S)
    /// pseudo labels; zero before activation
    pub fn forward(&self, x: &Tensor, labels: &Tensor) -> Result<Tensor> {
        if !self.can_run() {
            return Ok(Tensor::zeros((1, 1), DType::F32, x.device())?);
        }
        let logits = self.output.forward(&self.hidden.forward(x)?.relu()?)?;
        let logits = logits.reshape(((), self.k))?;
        let (loss, _) = classification_loss(&logits, &labels.flatten_all()?)?;
        Ok(loss)
    }
}

/// Pseudo labels of every sequence from the closest cluster of each frame,
/// and how many frames fell into each cluster
pub fn build_new_phone_dict<P: AsRef<Path>>(
    root: P,
    seqs: &[crate::data::SeqEntry],
    module: &FeatureModule,
    clusters: &KMeans,
    device: &Device,
) -> Result<(SeqLabels, Vec<usize>)> {
    let root = root.as_ref();
    let mut labels = BTreeMap::new();
    let mut filling = vec![0usize; clusters.k()];
    info!("Building the new frame labels from {} clusters", clusters.k());
    for seq in seqs {
        let features = build_feature(module, root.join(&seq.path), true, DEFAULT_MAX_SIZE_SEQ, false, device)?;
        let assigned: Vec<u32> = clusters.assign(&features)?.flatten_all()?.to_vec1()?;
        for &a in &assigned {
            filling[a as usize] += 1;
        }
        labels.insert(seq.name(), assigned);
    }
    Ok((SeqLabels::new(LABEL_STEP, labels), filling))
}

/// Learnable centers (num_protos, dim) initialized from N(0, 1) / (5 sqrt(dim))
pub struct Prototypes {
    protos: Tensor,
}

impl Prototypes {
    /// `num_protos x dim` prototypes under `protos`
    pub fn new(num_protos: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let protos = vb.get_with_hints(
            (num_protos, dim),
            "protos",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0 / (5.0 * (dim as f64).sqrt()),
            },
        )?;
        Ok(Self { protos })
    }

    /// (num_protos, dim) prototypes
    pub fn centers(&self) -> &Tensor {
        &self.protos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use rand::SeedableRng;

    fn blobs() -> Tensor {
        let mut data = Vec::new();
        for i in 0..30 {
            let jitter = (i % 5) as f32 * 0.01;
            match i % 3 {
                0 => data.extend_from_slice(&[0.0 + jitter, 0.0]),
                1 => data.extend_from_slice(&[5.0 + jitter, 5.0]),
                _ => data.extend_from_slice(&[-5.0, 5.0 + jitter]),
            }
        }
        Tensor::from_vec(data, (30, 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_kmeans_separates_blobs() {
        let mut rng = StdRng::seed_from_u64(7);
        let features = blobs();
        let km = KMeans::fit(&features, 3, None, &mut rng).unwrap();
        let assign: Vec<u32> = km.assign(&features).unwrap().to_vec1().unwrap();
        for i in 3..30 {
            assert_eq!(assign[i], assign[i % 3]);
        }
        assert_ne!(assign[0], assign[1]);
        assert_ne!(assign[1], assign[2]);
        assert_ne!(assign[0], assign[2]);
    }

    #[test]
    fn test_assign_keeps_leading_dims() {
        let km = KMeans::from_centers(Tensor::new(&[[0f32, 0.0], [1.0, 1.0]], &Device::Cpu).unwrap()).unwrap();
        let x = Tensor::new(&[[[0.9f32, 1.1], [0.1, 0.0]]], &Device::Cpu).unwrap();
        let assign: Vec<Vec<u32>> = km.assign(&x).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(assign, vec![vec![1, 0]]);
    }

    #[test]
    fn test_dp_means_is_capped() {
        let mut rng = StdRng::seed_from_u64(1);
        let features = blobs();
        let capped = KMeans::dp_means(&features, 1.0, 2, &mut rng).unwrap();
        assert_eq!(capped.k(), 2);
        let free = KMeans::dp_means(&features, 1.0, 10, &mut rng).unwrap();
        assert!(free.k() >= 3);
    }

    #[test]
    fn test_deep_clustering_inactive_before_delay() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let dc = DeepClustering::new(4, 6, 1, 2, ClusteringUpdate::Kmean, 1.0, vb).unwrap();
        assert!(!dc.can_run());
        let x = Tensor::ones((2, 3, 6), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros((2, 3), DType::U32, &Device::Cpu).unwrap();
        let loss: f32 = dc.forward(&x, &labels).unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(loss, 0.0);
        assert!(varmap.data().lock().unwrap().contains_key("classifier.2.weight"));
    }

    #[test]
    fn test_prototype_scale() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let protos = Prototypes::new(200, 100, vb).unwrap();
        assert_eq!(protos.centers().dims(), &[200, 100]);
        let std: f32 = protos.centers().sqr().unwrap().mean_all().unwrap().sqrt().unwrap().to_scalar().unwrap();
        assert!((std - 0.02).abs() < 0.002);
    }
}
