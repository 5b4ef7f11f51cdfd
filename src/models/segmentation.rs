//! Variable-length segmentation of encoded frame sequences
//!
//! A `Segmentation` splits every batch line of a (B, L, D) tensor into
//! contiguous segments. `compress` replaces each segment by its mean frame
//! and `restore` broadcasts per-segment values back to frame resolution;
//! both are matmuls, so gradients flow through them.

use anyhow::{bail, Result};
use candle_core::Tensor;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Lines are never merged below this many segments
pub const MIN_SEGMENTS_PER_LINE: usize = 5;

/// Total number of segments wanted for a (B, L) batch shortened `shortening` times
pub fn k_for_shortening(batch: usize, len: usize, shortening: f64) -> usize {
    let wanted = ((batch * len) as f64 / shortening.max(1.0)).round() as usize;
    wanted.max(batch)
}

/// Summary of a segmentation, logged during training
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentationStats {
    /// Merge cost at which the wanted segment count was reached
    pub cost_at_target: Option<f64>,
    /// Number of segments over all lines
    pub total_segments: usize,
    /// Mean segment length in frames
    pub mean_length: f64,
}

/// Per-line segment cut points
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    /// Cut points of every line, starting with 0 and ending with `seq_len`
    pub cuts: Vec<Vec<usize>>,
    /// Frames per line
    pub seq_len: usize,
    /// Merge cost at which the wanted segment count was reached
    pub cost_at_target: Option<f64>,
}

impl Segmentation {
    /// One segment per frame
    pub fn identity(batch: usize, seq_len: usize) -> Self {
        Self {
            cuts: vec![(0..=seq_len).collect(); batch],
            seq_len,
            cost_at_target: None,
        }
    }

    /// Split flat boundary indices over `batch * seq_len` frames into lines.
    ///
    /// Line ends are added when missing.
    pub fn from_flat_boundaries(flat: &[usize], batch: usize, seq_len: usize) -> Self {
        let mut cuts = vec![vec![0usize]; batch];
        for &idx in flat {
            let line = idx / seq_len.max(1);
            let pos = idx % seq_len.max(1);
            if line < batch && pos > 0 {
                cuts[line].push(pos);
            }
        }
        for line in cuts.iter_mut() {
            line.push(seq_len);
            line.sort_unstable();
            line.dedup();
        }
        Self {
            cuts,
            seq_len,
            cost_at_target: None,
        }
    }

    /// Segment lengths of every line
    pub fn lengths(&self) -> Vec<Vec<usize>> {
        self.cuts
            .iter()
            .map(|c| c.windows(2).map(|w| w[1] - w[0]).collect())
            .collect()
    }

    /// Number of segments over all lines
    pub fn total_segments(&self) -> usize {
        self.cuts.iter().map(|c| c.len().saturating_sub(1)).sum()
    }

    /// Longest line in segments
    pub fn max_segments(&self) -> usize {
        self.cuts.iter().map(|c| c.len().saturating_sub(1)).max().unwrap_or(0)
    }

    /// Counts and merge cost for logging
    pub fn stats(&self) -> SegmentationStats {
        let total = self.total_segments();
        SegmentationStats {
            cost_at_target: self.cost_at_target,
            total_segments: total,
            mean_length: (self.cuts.len() * self.seq_len) as f64 / total.max(1) as f64,
        }
    }

    /// (B, S_max, L) averaging matrix, padding rows zero
    fn averaging_matrix(&self, like: &Tensor) -> Result<Tensor> {
        let (b, s, l) = (self.cuts.len(), self.max_segments(), self.seq_len);
        let mut data = vec![0f32; b * s * l];
        for (line, cuts) in self.cuts.iter().enumerate() {
            for (seg, w) in cuts.windows(2).enumerate() {
                let weight = 1.0 / (w[1] - w[0]) as f32;
                let row = (line * s + seg) * l;
                data[row + w[0]..row + w[1]].iter_mut().for_each(|v| *v = weight);
            }
        }
        Ok(Tensor::from_vec(data, (b, s, l), like.device())?.to_dtype(like.dtype())?)
    }

    /// (B, L, S_max) frame-to-segment assignment
    fn assignment_matrix(&self, like: &Tensor) -> Result<Tensor> {
        let (b, s, l) = (self.cuts.len(), self.max_segments(), self.seq_len);
        let mut data = vec![0f32; b * l * s];
        for (line, cuts) in self.cuts.iter().enumerate() {
            for (seg, w) in cuts.windows(2).enumerate() {
                for frame in w[0]..w[1] {
                    data[(line * l + frame) * s + seg] = 1.0;
                }
            }
        }
        Ok(Tensor::from_vec(data, (b, l, s), like.device())?.to_dtype(like.dtype())?)
    }

    /// (B, L, D) -> (B, S_max, D) segment means
    pub fn compress(&self, encoded: &Tensor) -> Result<Tensor> {
        let (b, l, _) = encoded.dims3()?;
        if b != self.cuts.len() || l != self.seq_len {
            bail!(
                "segmentation is for ({}, {}), got encoded of shape ({b}, {l}, _)",
                self.cuts.len(),
                self.seq_len
            );
        }
        Ok(self.averaging_matrix(encoded)?.matmul(&encoded.contiguous()?)?)
    }

    /// (B, S_max, H) -> (B, L, H), every frame gets its segment's value
    pub fn restore(&self, ctx: &Tensor) -> Result<Tensor> {
        let (b, s, _) = ctx.dims3()?;
        if b != self.cuts.len() || s != self.max_segments() {
            bail!(
                "segmentation has ({}, {}) segments, got context of shape ({b}, {s}, _)",
                self.cuts.len(),
                self.max_segments()
            );
        }
        Ok(self.assignment_matrix(ctx)?.matmul(&ctx.contiguous()?)?)
    }
}

#[derive(Debug)]
struct Candidate {
    cost: f64,
    left: usize,
    right: usize,
    left_version: u32,
    right_version: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Reversed so the max-heap pops the cheapest merge, leftmost first on ties
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.left.cmp(&self.left))
    }
}

struct Node {
    line: usize,
    len: usize,
    sum: Vec<f64>,
    next: Option<usize>,
    prev: Option<usize>,
    version: u32,
    alive: bool,
}

/// Greedy bottom-up merging of adjacent segments
///
/// The cost of merging segments a and b is the increase of the within-segment
/// sum of squared errors, `n_a n_b / (n_a + n_b) * |mu_a - mu_b|^2`,
/// optionally multiplied by `(n_a + n_b)^merge_prior`.
#[derive(Debug, Clone)]
pub struct HierarchicalSegmenter {
    /// Exponent of the merged length in the cost
    pub merge_prior: Option<f64>,
    /// Lines never go below this many segments
    pub min_segments_per_line: usize,
}

impl Default for HierarchicalSegmenter {
    fn default() -> Self {
        Self {
            merge_prior: None,
            min_segments_per_line: MIN_SEGMENTS_PER_LINE,
        }
    }
}

impl HierarchicalSegmenter {
    /// Segmenter with the default minimum per line
    pub fn new(merge_prior: Option<f64>) -> Self {
        Self {
            merge_prior,
            ..Default::default()
        }
    }

    fn merge_cost(&self, a: &Node, b: &Node) -> f64 {
        let (na, nb) = (a.len as f64, b.len as f64);
        let dist: f64 = a
            .sum
            .iter()
            .zip(&b.sum)
            .map(|(sa, sb)| {
                let d = sa / na - sb / nb;
                d * d
            })
            .sum();
        let cost = na * nb / (na + nb) * dist;
        match self.merge_prior {
            Some(prior) => cost * (na + nb).powf(prior),
            None => cost,
        }
    }

    fn candidate(&self, nodes: &[Node], left: usize, right: usize) -> Candidate {
        Candidate {
            cost: self.merge_cost(&nodes[left], &nodes[right]),
            left,
            right,
            left_version: nodes[left].version,
            right_version: nodes[right].version,
        }
    }

    /// Merge segments of `encoded` (B, L, D) until `target_total` segments
    /// remain or the cheapest merge costs more than `max_cost`.
    ///
    /// Segmentation is computed on detached CPU data.
    pub fn segment(&self, encoded: &Tensor, max_cost: Option<f64>, target_total: usize) -> Result<Segmentation> {
        let (b, l, _) = encoded.dims3()?;
        if l == 0 {
            return Ok(Segmentation::identity(b, 0));
        }
        let frames: Vec<Vec<Vec<f32>>> = encoded
            .detach()
            .to_device(&candle_core::Device::Cpu)?
            .to_dtype(candle_core::DType::F32)?
            .to_vec3()?;

        let mut nodes: Vec<Node> = Vec::with_capacity(b * l);
        for (line, line_frames) in frames.iter().enumerate() {
            for (t, frame) in line_frames.iter().enumerate() {
                let idx = line * l + t;
                nodes.push(Node {
                    line,
                    len: 1,
                    sum: frame.iter().map(|&v| v as f64).collect(),
                    next: (t + 1 < l).then_some(idx + 1),
                    prev: (t > 0).then_some(idx - 1),
                    version: 0,
                    alive: true,
                });
            }
        }

        let mut heap = BinaryHeap::with_capacity(b * l);
        for idx in 0..nodes.len() {
            if let Some(next) = nodes[idx].next {
                heap.push(self.candidate(&nodes, idx, next));
            }
        }

        let min_per_line = self.min_segments_per_line.max(1);
        let mut line_counts = vec![l; b];
        let mut total = b * l;
        let mut cost_at_target = None;

        while total > target_total {
            let Some(best) = heap.pop() else { break };
            let (left, right) = (&nodes[best.left], &nodes[best.right]);
            if !left.alive
                || !right.alive
                || left.version != best.left_version
                || right.version != best.right_version
            {
                continue;
            }
            let line = left.line;
            if line_counts[line] <= min_per_line {
                continue;
            }
            if max_cost.map_or(false, |max| best.cost > max) {
                cost_at_target = Some(best.cost);
                break;
            }

            let right_node = std::mem::replace(
                &mut nodes[best.right],
                Node {
                    line,
                    len: 0,
                    sum: Vec::new(),
                    next: None,
                    prev: None,
                    version: 0,
                    alive: false,
                },
            );
            let merged = &mut nodes[best.left];
            merged.len += right_node.len;
            merged.sum.iter_mut().zip(&right_node.sum).for_each(|(a, b)| *a += b);
            merged.next = right_node.next;
            merged.version += 1;
            if let Some(next) = right_node.next {
                nodes[next].prev = Some(best.left);
            }

            line_counts[line] -= 1;
            total -= 1;
            if total <= target_total {
                cost_at_target = Some(best.cost);
            }

            if let Some(prev) = nodes[best.left].prev {
                heap.push(self.candidate(&nodes, prev, best.left));
            }
            if let Some(next) = nodes[best.left].next {
                heap.push(self.candidate(&nodes, best.left, next));
            }
        }

        let mut cuts = Vec::with_capacity(b);
        for line in 0..b {
            let mut line_cuts = vec![0];
            let mut cursor = Some(line * l);
            let mut pos = 0;
            while let Some(idx) = cursor {
                pos += nodes[idx].len;
                line_cuts.push(pos);
                cursor = nodes[idx].next;
            }
            cuts.push(line_cuts);
        }

        Ok(Segmentation {
            cuts,
            seq_len: l,
            cost_at_target,
        })
    }
}
