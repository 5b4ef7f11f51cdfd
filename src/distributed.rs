//! Process rank detection and data sharding for multi-process runs
//!
//! Each process trains on its own shard of the sequence list. Gradients are
//! not exchanged between processes; only the global master writes
//! checkpoints and logs.

use anyhow::Result;
use candle_core::Device;
use tracing::info;

/// Rank layout of the current process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedContext {
    /// Rank over all processes
    pub global_rank: usize,
    /// Number of processes
    pub world_size: usize,
    /// Rank on this node
    pub local_rank: usize,
}

impl Default for DistributedContext {
    fn default() -> Self {
        Self::single()
    }
}

fn env_usize(keys: &[&str]) -> Option<usize> {
    keys.iter()
        .find_map(|key| std::env::var(key).ok())
        .and_then(|v| v.trim().parse().ok())
}

impl DistributedContext {
    /// One process, rank 0
    pub fn single() -> Self {
        Self {
            global_rank: 0,
            world_size: 1,
            local_rank: 0,
        }
    }

    /// Read `RANK`, `WORLD_SIZE` and `LOCAL_RANK`, falling back to
    /// `SLURM_PROCID`, `SLURM_NTASKS` and `SLURM_LOCALID`.
    ///
    /// Missing variables give a single-process context.
    pub fn from_env() -> Self {
        let global_rank = env_usize(&["RANK", "SLURM_PROCID"]).unwrap_or(0);
        let world_size = env_usize(&["WORLD_SIZE", "SLURM_NTASKS"]).unwrap_or(1).max(1);
        let local_rank = env_usize(&["LOCAL_RANK", "SLURM_LOCALID"]).unwrap_or(0);
        let ctx = Self {
            global_rank: global_rank.min(world_size - 1),
            world_size,
            local_rank,
        };
        info!(
            "Distributed context: rank {}/{} (local rank {})",
            ctx.global_rank, ctx.world_size, ctx.local_rank
        );
        ctx
    }

    /// Only the global master writes checkpoints and logs
    pub fn is_master(&self) -> bool {
        self.global_rank == 0
    }

    /// Master of the processes sharing this node
    pub fn is_local_master(&self) -> bool {
        self.local_rank == 0
    }

    /// Contiguous slice `[len * rank / world, len * (rank + 1) / world)`
    pub fn shard<T: Clone>(&self, items: &[T]) -> Vec<T> {
        let len = items.len();
        let start = len * self.global_rank / self.world_size;
        let end = len * (self.global_rank + 1) / self.world_size;
        items[start..end].to_vec()
    }

    /// GPU of the local rank when available, CPU otherwise
    pub fn device(&self, cpu: bool) -> Result<Device> {
        if cpu {
            Ok(Device::Cpu)
        } else {
            Ok(Device::cuda_if_available(self.local_rank)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shards_cover_everything_once() {
        let items: Vec<usize> = (0..10).collect();
        let mut seen = Vec::new();
        for rank in 0..3 {
            let ctx = DistributedContext {
                global_rank: rank,
                world_size: 3,
                local_rank: rank,
            };
            seen.extend(ctx.shard(&items));
        }
        assert_eq!(seen, items);
        let first = DistributedContext {
            global_rank: 0,
            world_size: 3,
            local_rank: 0,
        };
        assert_eq!(first.shard(&items), vec![0, 1, 2]);
    }

    #[test]
    fn test_single_is_master() {
        let ctx = DistributedContext::single();
        assert!(ctx.is_master());
        assert!(ctx.is_local_master());
        assert_eq!(ctx.shard(&[1, 2, 3]), vec![1, 2, 3]);
        assert!(matches!(ctx.device(true).unwrap(), Device::Cpu));
    }
}
