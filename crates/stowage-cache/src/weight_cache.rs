//! Deduplicating placement cache keyed by `(TensorIdentity, DeviceTier)`.
//!
//! The first successful placement for a key is the only physical allocation
//! ever made for it; every later resolution of the key shares that buffer.
//! Concurrent resolutions of one key are serialized on a per-key load lock,
//! while different keys load in parallel.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use stowage_core::{DeviceTier, Result, SourceTensor, StowageError, TensorIdentity};

use crate::tier::{BufferHandle, TierPool, TierSet};

/// Unique per distinct (source, destination) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub identity: TensorIdentity,
    pub tier: DeviceTier,
}

/// A physical placement. Returns its buffer to the pool when the last
/// reference goes away.
struct Placement {
    key: CacheKey,
    handle: BufferHandle,
    pool: Arc<TierPool>,
}

impl Drop for Placement {
    fn drop(&mut self) {
        match self.pool.release(&self.handle) {
            Ok(()) => tracing::debug!(tier = %self.key.tier, identity = %self.key.identity, "freed placement"),
            Err(e) => tracing::warn!("failed to release placement for {}: {e}", self.key.identity),
        }
    }
}

/// Shared, reference-counted handle to a placed buffer.
///
/// Cloning adds a reference; dropping releases one. The buffer itself lives
/// in its tier's pool and is freed when the cache registration and every
/// clone are gone.
#[derive(Clone)]
pub struct CacheEntry {
    inner: Arc<Placement>,
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("identity", &self.inner.key.identity)
            .field("tier", &self.inner.key.tier)
            .field("refs", &Arc::strong_count(&self.inner))
            .finish()
    }
}

impl CacheEntry {
    pub fn key(&self) -> CacheKey {
        self.inner.key
    }

    pub fn identity(&self) -> TensorIdentity {
        self.inner.key.identity
    }

    pub fn tier(&self) -> DeviceTier {
        self.inner.key.tier
    }

    pub fn handle(&self) -> BufferHandle {
        self.inner.handle
    }

    pub fn byte_len(&self) -> usize {
        self.inner.handle.len()
    }

    /// Whether both handles refer to the same physical buffer.
    pub fn same_buffer(&self, other: &CacheEntry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Copy the placed bytes back out of the tier.
    pub fn read(&self) -> Result<Vec<u8>> {
        self.inner.pool.read(&self.inner.handle)
    }

    /// Current reference count, including the cache's own registration.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

/// Outcome of a resolution through [`WeightCache::resolve_source`].
#[derive(Debug, Clone)]
pub struct Resolved {
    pub entry: CacheEntry,
    /// `true` if this call performed the physical placement.
    pub placed: bool,
}

#[derive(Default)]
struct KeySlot {
    /// Held while a placement for this key is in flight.
    loading: Mutex<()>,
    entry: RwLock<Option<CacheEntry>>,
}

/// Maps `(TensorIdentity, DeviceTier)` to a shared placed buffer.
pub struct WeightCache {
    tiers: Arc<TierSet>,
    slots: Mutex<HashMap<CacheKey, Arc<KeySlot>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl fmt::Debug for WeightCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("WeightCache")
            .field("placements", &stats.unique_placements_per_tier)
            .field("refs", &stats.total_reference_count)
            .field("hits", &stats.hits)
            .field("misses", &stats.misses)
            .finish()
    }
}

impl WeightCache {
    pub fn new(tiers: Arc<TierSet>) -> Self {
        Self {
            tiers,
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn tiers(&self) -> &Arc<TierSet> {
        &self.tiers
    }

    /// Return the entry for `(identity, tier)`, placing it with `loader_fn`
    /// on first use.
    ///
    /// `loader_fn` receives the tier's pool and must allocate and fill the
    /// buffer. It runs at most once per key while the key stays cached; if
    /// it fails, nothing is inserted and a later call may retry.
    pub fn resolve<F>(&self, identity: TensorIdentity, tier: DeviceTier, loader_fn: F) -> Result<CacheEntry>
    where
        F: FnOnce(&TierPool) -> Result<BufferHandle>,
    {
        self.resolve_inner(identity, tier, loader_fn).map(|r| r.entry)
    }

    /// Resolve a source tensor onto `tier`, allocating and copying on miss.
    pub fn resolve_source(&self, source: &SourceTensor, tier: DeviceTier) -> Result<Resolved> {
        self.resolve_inner(source.identity(), tier, |pool| {
            let handle = pool.allocate(source.byte_len(), source.dtype())?;
            if let Err(e) = pool.copy_in(&handle, source.as_bytes()) {
                pool.release(&handle)?;
                return Err(e);
            }
            Ok(handle)
        })
    }

    fn resolve_inner<F>(&self, identity: TensorIdentity, tier: DeviceTier, loader_fn: F) -> Result<Resolved>
    where
        F: FnOnce(&TierPool) -> Result<BufferHandle>,
    {
        let key = CacheKey { identity, tier };
        let slot = self.slots.lock().entry(key).or_default().clone();

        if let Some(entry) = slot.entry.read().as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Resolved { entry: entry.clone(), placed: false });
        }

        let _loading = slot.loading.lock();
        // Another resolver may have finished while we waited for the lock.
        if let Some(entry) = slot.entry.read().as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Resolved { entry: entry.clone(), placed: false });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let pool = self.tiers.pool(tier)?;
        let handle = loader_fn(pool)?;
        if !pool.owns(&handle) {
            return Err(StowageError::InvalidHandle(handle.tier()));
        }
        if handle.len() != identity.byte_length {
            pool.release(&handle)?;
            return Err(StowageError::SizeMismatch {
                expected: identity.byte_length,
                actual: handle.len(),
            });
        }
        let entry = CacheEntry {
            inner: Arc::new(Placement { key, handle, pool: pool.clone() }),
        };
        *slot.entry.write() = Some(entry.clone());

        tracing::debug!(%tier, %identity, "placed new buffer");
        Ok(Resolved { entry, placed: true })
    }

    /// Look up an existing entry without placing.
    pub fn get(&self, identity: TensorIdentity, tier: DeviceTier) -> Option<CacheEntry> {
        let slot = self.slots.lock().get(&CacheKey { identity, tier }).cloned()?;
        let entry = slot.entry.read().clone();
        entry
    }

    pub fn contains(&self, identity: TensorIdentity, tier: DeviceTier) -> bool {
        self.get(identity, tier).is_some()
    }

    /// Release a reference obtained from [`resolve`](Self::resolve).
    /// Equivalent to dropping the entry.
    pub fn release(&self, entry: CacheEntry) {
        drop(entry);
    }

    /// Forget every placement on `tier`. Buffers still referenced elsewhere
    /// are freed when their last holder releases them.
    pub fn invalidate_tier(&self, tier: DeviceTier) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|key, _| key.tier != tier);
        let removed = before - slots.len();
        tracing::info!(%tier, removed, "invalidated tier placements");
        removed
    }

    /// Drop the cache's registration of entries no caller references and
    /// free their buffers. Returns the number of entries evicted.
    pub fn purge_unreferenced(&self) -> usize {
        let mut slots = self.slots.lock();
        let mut evicted = 0;
        slots.retain(|_, slot| {
            // A resolver that cloned the slot may still place into it.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let mut entry = slot.entry.write();
            match entry.as_ref().map(CacheEntry::ref_count) {
                Some(1) => {
                    *entry = None;
                    evicted += 1;
                    false
                }
                Some(_) => true,
                None => false,
            }
        });
        if evicted > 0 {
            tracing::info!(evicted, "purged unreferenced placements");
        }
        evicted
    }

    /// Forget every placement (model reload or teardown).
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let slots: Vec<Arc<KeySlot>> = self.slots.lock().values().cloned().collect();

        let mut unique_placements_per_tier = BTreeMap::new();
        let mut bytes_per_tier = BTreeMap::new();
        let mut total_reference_count = 0;
        for slot in &slots {
            let entry = slot.entry.read();
            if let Some(entry) = entry.as_ref() {
                *unique_placements_per_tier.entry(entry.tier()).or_insert(0) += 1;
                *bytes_per_tier.entry(entry.tier()).or_insert(0) += entry.byte_len();
                // Exclude the cache's own registration.
                total_reference_count += entry.ref_count() - 1;
            }
        }

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            unique_placements_per_tier,
            bytes_per_tier,
            total_reference_count,
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}

/// Cache statistics for memory-usage reporting.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub unique_placements_per_tier: BTreeMap<DeviceTier, usize>,
    pub bytes_per_tier: BTreeMap<DeviceTier, usize>,
    /// References held outside the cache (holders, in-flight requests).
    pub total_reference_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn placements_on(&self, tier: DeviceTier) -> usize {
        self.unique_placements_per_tier.get(&tier).copied().unwrap_or(0)
    }

    pub fn total_placements(&self) -> usize {
        self.unique_placements_per_tier.values().sum()
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tiers: Vec<String> = self
            .unique_placements_per_tier
            .iter()
            .map(|(tier, n)| {
                let bytes = self.bytes_per_tier.get(tier).copied().unwrap_or(0);
                format!("{tier}={n} ({:.1} MB)", bytes as f64 / (1024.0 * 1024.0))
            })
            .collect();
        write!(
            f,
            "WeightCache: [{}], {} refs, hit rate {:.1}% ({} hits, {} misses)",
            tiers.join(", "),
            self.total_reference_count,
            self.hit_rate * 100.0,
            self.hits,
            self.misses,
        )
    }
}
