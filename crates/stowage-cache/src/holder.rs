//! Block-level store of fully resolved parameter sets.
//!
//! [`WeightHome`] is a fixed-size array of [`ValueHolder`] slots, one per
//! structural block. A holder is either empty or holds the complete,
//! tier-resolved parameter map of its block; it is never partially filled.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use stowage_core::{Result, StowageError};

use crate::weight_cache::CacheEntry;

/// Resolved parameters of one block, keyed by parameter name.
///
/// Shared via `Arc`: readers keep the entries alive even if the holder is
/// cleared while they still use them.
pub type BlockParams = Arc<BTreeMap<String, CacheEntry>>;

/// One block slot.
#[derive(Debug)]
pub struct ValueHolder {
    block_index: usize,
    params: Option<BlockParams>,
}

impl ValueHolder {
    fn empty(block_index: usize) -> Self {
        Self { block_index, params: None }
    }

    pub fn block_index(&self) -> usize {
        self.block_index
    }

    pub fn is_populated(&self) -> bool {
        self.params.is_some()
    }
}

/// Fixed-size array of block holders.
#[derive(Debug)]
pub struct WeightHome {
    slots: Vec<RwLock<ValueHolder>>,
}

impl WeightHome {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            slots: (0..num_blocks).map(|i| RwLock::new(ValueHolder::empty(i))).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, block_index: usize) -> Result<&RwLock<ValueHolder>> {
        self.slots.get(block_index).ok_or(StowageError::BlockOutOfRange {
            index: block_index,
            len: self.slots.len(),
        })
    }

    /// Populate an empty holder. Single writer wins: if the holder is
    /// already populated, `params` is dropped (releasing its references)
    /// and `AlreadyPopulated` is returned.
    pub fn store(&self, block_index: usize, params: BTreeMap<String, CacheEntry>) -> Result<BlockParams> {
        let mut holder = self.slot(block_index)?.write();
        if holder.is_populated() {
            return Err(StowageError::AlreadyPopulated { block: block_index });
        }
        let params = Arc::new(params);
        holder.params = Some(params.clone());
        Ok(params)
    }

    /// The populated parameter map, or `None` if the holder is empty.
    pub fn load(&self, block_index: usize) -> Result<Option<BlockParams>> {
        Ok(self.slot(block_index)?.read().params.clone())
    }

    /// Reset the holder, releasing its references. Returns whether it was
    /// populated.
    pub fn clear(&self, block_index: usize) -> Result<bool> {
        let taken = self.slot(block_index)?.write().params.take();
        Ok(taken.is_some())
    }

    /// Clear the holder only if it still holds `expected`; a holder that was
    /// repopulated in the meantime is left alone.
    pub fn clear_if(&self, block_index: usize, expected: &BlockParams) -> Result<bool> {
        let mut holder = self.slot(block_index)?.write();
        match &holder.params {
            Some(current) if Arc::ptr_eq(current, expected) => {
                holder.params = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Clear every holder. Returns how many were populated.
    pub fn clear_all(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.write().params.take().is_some())
            .count()
    }

    pub fn populated_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.read().is_populated()).count()
    }

    pub fn is_populated(&self, block_index: usize) -> Result<bool> {
        Ok(self.slot(block_index)?.read().is_populated())
    }
}
