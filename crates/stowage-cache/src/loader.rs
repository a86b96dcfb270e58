//! Block loading orchestration.
//!
//! [`WeightLoader`] is the long-lived context owning the tier pools, the
//! placement cache and the block store. A load request for a block walks:
//!
//! ```text
//! CheckHolder ──hit──────────────────────────────────────────▶ Done
//!     │ miss / structural mismatch
//!     ▼
//! ComputePlacement ─▶ PerParamResolve ─▶ Commit ──stored──▶ Done
//!                                          │ lost race
//!                                          └──────▶ CheckHolder
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use stowage_core::{BlockWeights, DeviceTier, Result, StowageError};

use crate::config::LoaderConfig;
use crate::holder::{BlockParams, WeightHome};
use crate::placement::{PlacementPolicy, TierSplit};
use crate::stats::ReuseStats;
use crate::tier::TierSet;
use crate::weight_cache::{CacheEntry, CacheStats, WeightCache};

/// Commit attempts before a load gives up on a contended block.
pub const MAX_COMMIT_ATTEMPTS: usize = 4;

/// Cooperative cancellation flag for in-flight block loads.
#[derive(Debug, Clone, Default)]
pub struct LoadCancel(Arc<AtomicBool>);

impl LoadCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StowageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// How a block handle was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Served from the block store without touching the placement cache.
    HolderHit,
    /// Resolved parameter by parameter and committed by this request.
    Loaded {
        /// Parameters that required a new physical placement.
        placed: usize,
        /// Parameters served by an existing placement.
        reused: usize,
        /// Commit attempts, including lost races.
        attempts: usize,
    },
}

/// A loaded block bound to its placed buffers.
#[derive(Debug, Clone)]
pub struct BlockHandle {
    block_index: usize,
    params: BlockParams,
    outcome: LoadOutcome,
}

impl BlockHandle {
    pub fn block_index(&self) -> usize {
        self.block_index
    }

    pub fn outcome(&self) -> LoadOutcome {
        self.outcome
    }

    pub fn is_holder_hit(&self) -> bool {
        matches!(self.outcome, LoadOutcome::HolderHit)
    }

    pub fn params(&self) -> &BlockParams {
        &self.params
    }

    pub fn get(&self, name: &str) -> Option<&CacheEntry> {
        self.params.get(name)
    }

    pub fn tier_of(&self, name: &str) -> Option<DeviceTier> {
        self.get(name).map(CacheEntry::tier)
    }

    /// Read a parameter's placed bytes.
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.get(name)
            .ok_or_else(|| StowageError::Config(format!("block {} has no parameter '{name}'", self.block_index)))?
            .read()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

#[derive(Debug, Default)]
struct ReuseCounters {
    block_loads: AtomicU64,
    holder_hits: AtomicU64,
    params_resolved: AtomicU64,
    params_reused: AtomicU64,
}

/// Deduplicating, tier-aware block loader.
#[derive(Debug)]
pub struct WeightLoader {
    tiers: Arc<TierSet>,
    cache: WeightCache,
    home: WeightHome,
    default_split: TierSplit,
    counters: ReuseCounters,
}

impl WeightLoader {
    /// Build the tier pools, cache and block store described by `config`.
    pub fn new(config: &LoaderConfig) -> Result<Self> {
        config.validate()?;
        let tiers = Arc::new(TierSet::from_config(config)?);

        tracing::info!(
            "WeightLoader: {} block slots, tiers [{}], default split {}",
            config.num_blocks,
            tiers.tiers().map(|t| t.to_string()).collect::<Vec<_>>().join(", "),
            config.default_split,
        );

        Ok(Self::with_tiers(tiers, config.num_blocks, config.default_split))
    }

    /// Build a loader over existing tier pools.
    pub fn with_tiers(tiers: Arc<TierSet>, num_blocks: usize, default_split: TierSplit) -> Self {
        Self {
            cache: WeightCache::new(tiers.clone()),
            home: WeightHome::new(num_blocks),
            tiers,
            default_split,
            counters: ReuseCounters::default(),
        }
    }

    pub fn tiers(&self) -> &Arc<TierSet> {
        &self.tiers
    }

    pub fn cache(&self) -> &WeightCache {
        &self.cache
    }

    pub fn home(&self) -> &WeightHome {
        &self.home
    }

    pub fn default_split(&self) -> TierSplit {
        self.default_split
    }

    pub fn num_blocks(&self) -> usize {
        self.home.len()
    }

    /// Load `source` as block `block_index`, placing its parameters by
    /// `split`. Repeated loads of a block are served from the block store.
    pub fn load_block(&self, block_index: usize, source: &BlockWeights, split: &TierSplit) -> Result<BlockHandle> {
        self.load_block_cancellable(block_index, source, split, &LoadCancel::new())
    }

    /// [`load_block`](Self::load_block) using the configured default split.
    pub fn load_block_default(&self, block_index: usize, source: &BlockWeights) -> Result<BlockHandle> {
        let split = self.default_split;
        self.load_block(block_index, source, &split)
    }

    /// Like [`load_block`](Self::load_block), aborting without committing
    /// once `cancel` is set. References gathered so far are released.
    pub fn load_block_cancellable(
        &self,
        block_index: usize,
        source: &BlockWeights,
        split: &TierSplit,
        cancel: &LoadCancel,
    ) -> Result<BlockHandle> {
        let policy = PlacementPolicy::new(split)?;
        self.counters.block_loads.fetch_add(1, Ordering::Relaxed);

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            cancel.check()?;

            // CheckHolder
            if let Some(params) = self.home.load(block_index)? {
                match check_structure(block_index, &params, source) {
                    Ok(()) => {
                        self.counters.holder_hits.fetch_add(1, Ordering::Relaxed);
                        let n = params.len() as u64;
                        self.counters.params_resolved.fetch_add(n, Ordering::Relaxed);
                        self.counters.params_reused.fetch_add(n, Ordering::Relaxed);
                        tracing::trace!(block = block_index, "block store hit");
                        return Ok(BlockHandle {
                            block_index,
                            params,
                            outcome: LoadOutcome::HolderHit,
                        });
                    }
                    Err(e) => {
                        tracing::warn!("{e}; treating as a miss and reloading block {block_index}");
                        self.home.clear_if(block_index, &params)?;
                    }
                }
            }

            // ComputePlacement
            let plan = policy.assign(&source.param_sizes());

            // PerParamResolve
            let mut collected_params = BTreeMap::new();
            let (mut placed, mut reused) = (0usize, 0usize);
            for (name, tensor) in source.iter() {
                cancel.check()?;
                let tier = plan
                    .tier_of(name)
                    .ok_or_else(|| StowageError::Config(format!("no placement for parameter '{name}'")))?;
                let resolved = self.cache.resolve_source(tensor, tier)?;
                if resolved.placed {
                    placed += 1;
                } else {
                    reused += 1;
                    tracing::debug!(block = block_index, param = name, %tier, "reusing placement");
                }
                collected_params.insert(name.to_string(), resolved.entry);
            }
            cancel.check()?;

            // Commit
            match self.home.store(block_index, collected_params) {
                Ok(params) => {
                    self.counters
                        .params_resolved
                        .fetch_add((placed + reused) as u64, Ordering::Relaxed);
                    self.counters.params_reused.fetch_add(reused as u64, Ordering::Relaxed);
                    tracing::debug!(block = block_index, placed, reused, "committed block: {plan}");
                    return Ok(BlockHandle {
                        block_index,
                        params,
                        outcome: LoadOutcome::Loaded { placed, reused, attempts: attempt },
                    });
                }
                Err(StowageError::AlreadyPopulated { .. }) => {
                    tracing::debug!(block = block_index, attempt, "lost commit race, rechecking block store");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(block = block_index, "giving up after {MAX_COMMIT_ATTEMPTS} contended commits");
        Err(StowageError::CommitContention {
            block: block_index,
            attempts: MAX_COMMIT_ATTEMPTS,
        })
    }

    /// Drop the block store's references for a block. Returns whether the
    /// block was loaded.
    pub fn clear_block(&self, block_index: usize) -> Result<bool> {
        let cleared = self.home.clear(block_index)?;
        if cleared {
            tracing::debug!(block = block_index, "cleared block");
        }
        Ok(cleared)
    }

    /// Clear every block and forget every cached placement. Buffers still
    /// referenced by outstanding handles are freed when those are dropped.
    pub fn clear_all(&self) {
        let blocks = self.home.clear_all();
        self.cache.clear();
        tracing::info!(blocks, "cleared all blocks and placements");
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn reuse_stats(&self) -> ReuseStats {
        ReuseStats {
            block_loads: self.counters.block_loads.load(Ordering::Relaxed),
            holder_hits: self.counters.holder_hits.load(Ordering::Relaxed),
            params_resolved: self.counters.params_resolved.load(Ordering::Relaxed),
            params_reused: self.counters.params_reused.load(Ordering::Relaxed),
        }
    }
}

/// A populated holder must carry exactly the block's declared names.
fn check_structure(block_index: usize, params: &BlockParams, source: &BlockWeights) -> Result<()> {
    let expected = source.names();
    let matches = params.len() == expected.len() && expected.iter().all(|n| params.contains_key(*n));
    if matches {
        Ok(())
    } else {
        Err(StowageError::StructuralMismatch {
            block: block_index,
            expected: expected.iter().map(|n| n.to_string()).collect(),
            found: params.keys().cloned().collect(),
        })
    }
}
