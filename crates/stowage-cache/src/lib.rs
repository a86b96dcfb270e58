//! # stowage-cache
//!
//! Deduplicating, tier-aware weight loading for large models.
//!
//! Many parameter tensors of a model share storage (tied embeddings, repeated
//! blocks, duplicated shards). This crate places each distinct source tensor
//! at most once per storage tier and hands out shared references to the
//! placed buffer, so repeated references cost neither tier memory nor
//! another transfer.
//!
//! # Architecture
//!
//! ```text
//! WeightLoader::load_block
//!   ├─▶ WeightHome        block store: one ValueHolder per block
//!   ├─▶ PlacementPolicy   size-weighted tier split for the block
//!   └─▶ WeightCache       (TensorIdentity, DeviceTier) → CacheEntry
//!         └─▶ TierPool    allocate / copy_in / release on one tier
//! ```
//!
//! # Key components
//!
//! - [`LoaderConfig`]: tier capacities, block count, default split
//! - [`TierPool`] / [`TierSet`]: capacity-accounted buffer pools
//! - [`WeightCache`]: deduplicating placement cache
//! - [`PlacementPolicy`]: size-proportional tier assignment
//! - [`WeightHome`]: block-level store of resolved parameter sets
//! - [`WeightLoader`]: orchestrates block loads
//! - [`BlockPrefetcher`]: pipelined background block loading

pub mod config;
pub mod tier;
pub mod weight_cache;
pub mod placement;
pub mod holder;
pub mod loader;
pub mod prefetcher;
pub mod stats;

pub use config::LoaderConfig;
pub use tier::{BufferHandle, TierPool, TierSet};
pub use weight_cache::{CacheEntry, CacheKey, CacheStats, WeightCache};
pub use placement::{PlacementPlan, PlacementPolicy, TierSplit};
pub use holder::{BlockParams, ValueHolder, WeightHome};
pub use loader::{BlockHandle, LoadCancel, LoadOutcome, WeightLoader};
pub use prefetcher::BlockPrefetcher;
pub use stats::{ReuseStats, SavingsEstimate};
