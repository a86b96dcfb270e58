//! Reuse and memory-savings reporting.

use std::collections::HashSet;
use std::fmt;

use stowage_core::{BlockWeights, TensorIdentity};

/// Counters describing how often loads were served by existing placements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReuseStats {
    /// `load_block` calls.
    pub block_loads: u64,
    /// Loads served directly from the block store.
    pub holder_hits: u64,
    /// Parameters handed out across all successful loads.
    pub params_resolved: u64,
    /// Of those, parameters that did not need a new placement.
    pub params_reused: u64,
}

impl ReuseStats {
    pub fn reuse_percentage(&self) -> f64 {
        if self.params_resolved == 0 {
            0.0
        } else {
            self.params_reused as f64 / self.params_resolved as f64 * 100.0
        }
    }
}

impl fmt::Display for ReuseStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Weight sharing: {}/{} tensors reused ({:.1}%), {} of {} block loads from block store",
            self.params_reused,
            self.params_resolved,
            self.reuse_percentage(),
            self.holder_hits,
            self.block_loads,
        )
    }
}

/// Theoretical single-tier footprint of a model with and without sharing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavingsEstimate {
    /// One buffer per parameter reference.
    pub naive_bytes: usize,
    /// One buffer per distinct source identity.
    pub shared_bytes: usize,
}

impl SavingsEstimate {
    pub fn for_blocks<'a>(blocks: impl IntoIterator<Item = &'a BlockWeights>) -> Self {
        let mut seen: HashSet<TensorIdentity> = HashSet::new();
        let mut estimate = Self::default();
        for block in blocks {
            for (_, tensor) in block.iter() {
                estimate.naive_bytes += tensor.byte_len();
                if seen.insert(tensor.identity()) {
                    estimate.shared_bytes += tensor.byte_len();
                }
            }
        }
        estimate
    }

    pub fn saved_bytes(&self) -> usize {
        self.naive_bytes - self.shared_bytes
    }

    pub fn saved_fraction(&self) -> f64 {
        if self.naive_bytes == 0 {
            0.0
        } else {
            self.saved_bytes() as f64 / self.naive_bytes as f64
        }
    }
}

impl fmt::Display for SavingsEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GB: f64 = 1024.0 * 1024.0 * 1024.0;
        write!(
            f,
            "naive {:.2} GB, shared {:.2} GB, savings {:.2} GB ({:.1}%)",
            self.naive_bytes as f64 / GB,
            self.shared_bytes as f64 / GB,
            self.saved_bytes() as f64 / GB,
            self.saved_fraction() * 100.0,
        )
    }
}
