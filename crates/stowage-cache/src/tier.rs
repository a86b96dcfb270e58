//! Per-tier buffer pools: the only code that touches real storage.
//!
//! Each [`TierPool`] is an arena of slots with a free list. A slot holds one
//! placed buffer, either as an in-memory byte buffer or, for a disk pool with
//! a spill directory, as a file. Handles carry a generation counter so a
//! handle that outlives its release is rejected instead of aliasing a reused
//! slot.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use stowage_core::{DType, DeviceTier, Result, StowageError};

use crate::config::LoaderConfig;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a buffer allocated from a [`TierPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    tier: DeviceTier,
    pool: u64,
    slot: usize,
    generation: u64,
    len: usize,
    dtype: DType,
}

impl BufferHandle {
    pub fn tier(&self) -> DeviceTier {
        self.tier
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Id of the pool that issued the handle.
    pub fn pool_id(&self) -> u64 {
        self.pool
    }
}

enum Backing {
    Memory(Vec<u8>),
    File(PathBuf),
}

struct Slot {
    generation: u64,
    backing: Option<Backing>,
}

struct PoolInner {
    /// Maximum bytes this pool may hand out (`usize::MAX` = unbounded).
    capacity: usize,
    used: usize,
    slots: Vec<Slot>,
    free: Vec<usize>,
    total_allocations: u64,
    total_releases: u64,
}

/// Capacity-accounted buffer pool for one [`DeviceTier`].
pub struct TierPool {
    tier: DeviceTier,
    /// Process-unique; scopes handles and spill file names to this pool.
    id: u64,
    spill_dir: Option<PathBuf>,
    inner: Mutex<PoolInner>,
}

impl std::fmt::Debug for TierPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TierPool")
            .field("tier", &self.tier)
            .field("id", &self.id)
            .field("capacity", &inner.capacity)
            .field("used", &inner.used)
            .field("live_buffers", &(inner.slots.len() - inner.free.len()))
            .field("spill_dir", &self.spill_dir)
            .finish()
    }
}

impl TierPool {
    /// Create an in-memory pool. `None` capacity means unbounded.
    pub fn new(tier: DeviceTier, capacity: Option<usize>) -> Self {
        Self {
            tier,
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            spill_dir: None,
            inner: Mutex::new(PoolInner {
                capacity: capacity.unwrap_or(usize::MAX),
                used: 0,
                slots: Vec::new(),
                free: Vec::new(),
                total_allocations: 0,
                total_releases: 0,
            }),
        }
    }

    /// Create a pool whose buffers are files under `dir`.
    pub fn file_backed(tier: DeviceTier, capacity: Option<usize>, dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut pool = Self::new(tier, capacity);
        pool.spill_dir = Some(dir.to_path_buf());
        Ok(pool)
    }

    pub fn tier(&self) -> DeviceTier {
        self.tier
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether `handle` was issued by this pool.
    pub fn owns(&self, handle: &BufferHandle) -> bool {
        handle.tier == self.tier && handle.pool == self.id
    }

    /// Allocate a zeroed buffer of `byte_length` bytes.
    pub fn allocate(&self, byte_length: usize, dtype: DType) -> Result<BufferHandle> {
        let mut inner = self.inner.lock();

        let available = inner.capacity - inner.used;
        if byte_length > available {
            return Err(StowageError::OutOfCapacity {
                tier: self.tier,
                requested: byte_length,
                available,
            });
        }

        let slot = match inner.free.pop() {
            Some(idx) => idx,
            None => {
                inner.slots.push(Slot { generation: 0, backing: None });
                inner.slots.len() - 1
            }
        };
        let generation = inner.slots[slot].generation + 1;

        let backing = match &self.spill_dir {
            Some(dir) => {
                let path = dir.join(format!(
                    "{}-{}-{}-{slot}-{generation}.bin",
                    sanitize_tier(self.tier),
                    std::process::id(),
                    self.id,
                ));
                match create_spill_file(&path, byte_length) {
                    Ok(()) => Backing::File(path),
                    Err(e) => {
                        inner.free.push(slot);
                        return Err(e);
                    }
                }
            }
            None => Backing::Memory(vec![0u8; byte_length]),
        };

        inner.slots[slot] = Slot { generation, backing: Some(backing) };
        inner.used += byte_length;
        inner.total_allocations += 1;

        tracing::trace!(tier = %self.tier, slot, byte_length, "allocated buffer");

        Ok(BufferHandle {
            tier: self.tier,
            pool: self.id,
            slot,
            generation,
            len: byte_length,
            dtype,
        })
    }

    /// Copy `source` into the buffer. Lengths must match exactly.
    pub fn copy_in(&self, handle: &BufferHandle, source: &[u8]) -> Result<()> {
        if source.len() != handle.len {
            return Err(StowageError::SizeMismatch {
                expected: handle.len,
                actual: source.len(),
            });
        }
        let mut inner = self.inner.lock();
        match self.backing_mut(&mut inner, handle)? {
            Backing::Memory(buf) => buf.copy_from_slice(source),
            Backing::File(path) => {
                let mut file = OpenOptions::new().write(true).open(&*path)?;
                file.seek(SeekFrom::Start(0))?;
                file.write_all(source)?;
            }
        }
        Ok(())
    }

    /// Read the buffer contents back.
    pub fn read(&self, handle: &BufferHandle) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        match self.backing_mut(&mut inner, handle)? {
            Backing::Memory(buf) => Ok(buf.clone()),
            Backing::File(path) => {
                let mut data = Vec::with_capacity(handle.len);
                File::open(&*path)?.read_to_end(&mut data)?;
                Ok(data)
            }
        }
    }

    /// Return the buffer's capacity to the pool.
    pub fn release(&self, handle: &BufferHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let backing = self.backing_mut(&mut inner, handle)?;
        if let Backing::File(path) = backing {
            if let Err(e) = fs::remove_file(&*path) {
                tracing::warn!("failed to remove spill file {}: {e}", path.display());
            }
        }
        inner.slots[handle.slot].backing = None;
        inner.free.push(handle.slot);
        inner.used -= handle.len;
        inner.total_releases += 1;
        tracing::trace!(tier = %self.tier, slot = handle.slot, "released buffer");
        Ok(())
    }

    fn backing_mut<'a>(&self, inner: &'a mut PoolInner, handle: &BufferHandle) -> Result<&'a mut Backing> {
        if !self.owns(handle) {
            return Err(StowageError::InvalidHandle(handle.tier));
        }
        match inner.slots.get_mut(handle.slot) {
            Some(slot) if slot.generation == handle.generation => slot
                .backing
                .as_mut()
                .ok_or(StowageError::InvalidHandle(self.tier)),
            _ => Err(StowageError::InvalidHandle(self.tier)),
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used
    }

    /// Configured capacity, or `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        let cap = self.inner.lock().capacity;
        (cap != usize::MAX).then_some(cap)
    }

    /// Buffers currently allocated and not yet released.
    pub fn live_buffers(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - inner.free.len()
    }

    /// Physical allocations performed over the pool's lifetime.
    pub fn total_allocations(&self) -> u64 {
        self.inner.lock().total_allocations
    }

    pub fn total_releases(&self) -> u64 {
        self.inner.lock().total_releases
    }
}

/// Never truncates: an existing file at `path` is an error.
fn create_spill_file(path: &Path, len: usize) -> Result<()> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.set_len(len as u64)?;
    Ok(())
}

fn sanitize_tier(tier: DeviceTier) -> String {
    tier.to_string().replace(':', "_")
}

/// The set of configured tier pools, keyed by tier.
#[derive(Debug, Default)]
pub struct TierSet {
    pools: BTreeMap<DeviceTier, Arc<TierPool>>,
}

impl TierSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the pools described by a loader configuration.
    pub fn from_config(config: &LoaderConfig) -> Result<Self> {
        let mut tiers = Self::new();
        let disk = match &config.spill_dir {
            Some(dir) => TierPool::file_backed(DeviceTier::Disk, config.disk_capacity, dir)?,
            None => TierPool::new(DeviceTier::Disk, config.disk_capacity),
        };
        tiers.insert(disk);
        tiers.insert(TierPool::new(DeviceTier::Host, config.host_capacity));
        for (idx, cap) in config.accelerator_capacities.iter().enumerate() {
            tiers.insert(TierPool::new(DeviceTier::Accelerator(idx), *cap));
        }
        Ok(tiers)
    }

    /// Add or replace the pool for its tier.
    pub fn insert(&mut self, pool: TierPool) {
        self.pools.insert(pool.tier(), Arc::new(pool));
    }

    pub fn pool(&self, tier: DeviceTier) -> Result<&Arc<TierPool>> {
        self.pools.get(&tier).ok_or(StowageError::UnknownTier(tier))
    }

    pub fn contains(&self, tier: DeviceTier) -> bool {
        self.pools.contains_key(&tier)
    }

    /// Configured tiers in canonical order.
    pub fn tiers(&self) -> impl Iterator<Item = DeviceTier> + '_ {
        self.pools.keys().copied()
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<TierPool>> {
        self.pools.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_copy_read() {
        let pool = TierPool::new(DeviceTier::Host, Some(64));
        let h = pool.allocate(4, DType::U8).unwrap();
        pool.copy_in(&h, &[1, 2, 3, 4]).unwrap();
        assert_eq!(pool.read(&h).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(pool.used_bytes(), 4);
        assert_eq!(pool.live_buffers(), 1);
    }

    #[test]
    fn test_out_of_capacity() {
        let pool = TierPool::new(DeviceTier::Accelerator(0), Some(10));
        pool.allocate(8, DType::U8).unwrap();
        let err = pool.allocate(4, DType::U8).unwrap_err();
        match err {
            StowageError::OutOfCapacity { tier, requested, available } => {
                assert_eq!(tier, DeviceTier::Accelerator(0));
                assert_eq!(requested, 4);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_release_returns_capacity_and_invalidates_handle() {
        let pool = TierPool::new(DeviceTier::Host, Some(8));
        let h1 = pool.allocate(8, DType::U8).unwrap();
        pool.release(&h1).unwrap();
        assert_eq!(pool.used_bytes(), 0);

        // Slot is reused with a new generation; the stale handle is rejected.
        let h2 = pool.allocate(8, DType::U8).unwrap();
        assert!(matches!(pool.read(&h1), Err(StowageError::InvalidHandle(_))));
        assert!(pool.release(&h1).is_err());
        assert!(pool.read(&h2).is_ok());
        assert_eq!(pool.total_allocations(), 2);
        assert_eq!(pool.total_releases(), 1);
    }

    #[test]
    fn test_copy_in_size_mismatch() {
        let pool = TierPool::new(DeviceTier::Host, None);
        let h = pool.allocate(4, DType::U8).unwrap();
        assert!(matches!(
            pool.copy_in(&h, &[0; 3]),
            Err(StowageError::SizeMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let host = TierPool::new(DeviceTier::Host, None);
        let disk = TierPool::new(DeviceTier::Disk, None);
        let h = host.allocate(2, DType::U8).unwrap();
        assert!(disk.read(&h).is_err());
    }

    #[test]
    fn test_same_tier_handle_from_other_pool_rejected() {
        let a = TierPool::new(DeviceTier::Host, None);
        let b = TierPool::new(DeviceTier::Host, None);
        let ha = a.allocate(4, DType::U8).unwrap();
        let _hb = b.allocate(4, DType::U8).unwrap();

        assert!(!b.owns(&ha));
        assert!(matches!(b.read(&ha), Err(StowageError::InvalidHandle(DeviceTier::Host))));
        assert!(b.release(&ha).is_err());
        assert_eq!(b.live_buffers(), 1);
    }

    #[test]
    fn test_pools_sharing_spill_dir_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = TierPool::file_backed(DeviceTier::Disk, None, dir.path()).unwrap();
        let b = TierPool::file_backed(DeviceTier::Disk, None, dir.path()).unwrap();

        let ha = a.allocate(4, DType::U8).unwrap();
        a.copy_in(&ha, &[1; 4]).unwrap();
        let hb = b.allocate(4, DType::U8).unwrap();
        b.copy_in(&hb, &[2; 4]).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);

        b.release(&hb).unwrap();
        assert_eq!(a.read(&ha).unwrap(), vec![1; 4]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_spill_file_never_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.bin");
        fs::write(&path, [9u8; 3]).unwrap();

        assert!(create_spill_file(&path, 8).is_err());
        assert_eq!(fs::read(&path).unwrap(), vec![9u8; 3]);
    }

    #[test]
    fn test_file_backed_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = TierPool::file_backed(DeviceTier::Disk, None, dir.path()).unwrap();
        let h = pool.allocate(3, DType::U8).unwrap();
        pool.copy_in(&h, &[7, 8, 9]).unwrap();
        assert_eq!(pool.read(&h).unwrap(), vec![7, 8, 9]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        pool.release(&h).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_tier_set_from_config() {
        let config = LoaderConfig::new(4).with_accelerators(vec![Some(100), None]);
        let tiers = TierSet::from_config(&config).unwrap();
        let listed: Vec<DeviceTier> = tiers.tiers().collect();
        assert_eq!(
            listed,
            vec![
                DeviceTier::Disk,
                DeviceTier::Host,
                DeviceTier::Accelerator(0),
                DeviceTier::Accelerator(1),
            ]
        );
        assert_eq!(tiers.pool(DeviceTier::Accelerator(0)).unwrap().capacity(), Some(100));
        assert!(matches!(
            tiers.pool(DeviceTier::Accelerator(5)),
            Err(StowageError::UnknownTier(_))
        ));
    }
}
