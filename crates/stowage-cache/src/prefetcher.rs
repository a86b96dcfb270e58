//! Pipelined block loading.
//!
//! Loads upcoming blocks on blocking worker threads while the caller works on
//! the current one, so placement and transfer time for block N+1 overlaps
//! compute on block N.
//!
//! ```text
//! Time →
//! Block N:   [====COMPUTE====]
//! Block N+1:      [PLACE][XFER]
//! Block N+2:             [PLACE][XFER]
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use stowage_core::{BlockWeights, Result, StowageError};
use tokio::sync::oneshot;

use crate::loader::{BlockHandle, WeightLoader};
use crate::placement::TierSplit;

/// Background loader for a model's blocks in forward order.
///
/// Uses `tokio::task::spawn_blocking` for loads; the store and cache make
/// concurrent loads of one block safe, so a prefetch racing a direct load
/// only costs redundant compute.
pub struct BlockPrefetcher {
    loader: Arc<WeightLoader>,
    /// Source weights for every block, indexed by block position.
    blocks: Arc<Vec<BlockWeights>>,
    split: TierSplit,
    /// Number of blocks to load ahead of the current one.
    lookahead: usize,
    pending: Mutex<HashMap<usize, oneshot::Receiver<Result<BlockHandle>>>>,
}

impl std::fmt::Debug for BlockPrefetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPrefetcher")
            .field("blocks", &self.blocks.len())
            .field("lookahead", &self.lookahead)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl BlockPrefetcher {
    pub fn new(
        loader: Arc<WeightLoader>,
        blocks: Arc<Vec<BlockWeights>>,
        split: TierSplit,
        lookahead: usize,
    ) -> Self {
        Self {
            loader,
            blocks,
            split,
            lookahead,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Start loading the first `lookahead` blocks.
    pub fn start(&self) {
        for idx in 0..self.lookahead.min(self.blocks.len()) {
            self.submit_load(idx);
        }
    }

    /// Get block `idx`, waiting for an in-flight prefetch if there is one.
    ///
    /// Triggers prefetch of the following blocks.
    pub async fn get_block(&self, idx: usize) -> Result<BlockHandle> {
        let source = self.blocks.get(idx).ok_or(StowageError::BlockOutOfRange {
            index: idx,
            len: self.blocks.len(),
        })?;

        let pending = self.pending.lock().remove(&idx);
        let handle = match pending {
            Some(rx) => rx.await.map_err(|_| StowageError::Prefetch {
                block: idx,
                msg: "prefetch channel closed".into(),
            })??,
            // Not prefetched: load inline.
            None => self.loader.load_block(idx, source, &self.split)?,
        };

        self.prefetch_ahead(idx);
        Ok(handle)
    }

    /// Number of prefetches submitted and not yet collected.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn prefetch_ahead(&self, current_idx: usize) {
        for ahead in 1..=self.lookahead {
            self.submit_load(current_idx + ahead);
        }
    }

    fn submit_load(&self, idx: usize) {
        if idx >= self.blocks.len() {
            return;
        }

        let mut pending = self.pending.lock();
        if pending.contains_key(&idx) {
            return;
        }
        if matches!(self.loader.home().is_populated(idx), Ok(true)) {
            return;
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(idx, rx);

        // Without a runtime, fail the request so the caller never hangs.
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                let _ = tx.send(Err(StowageError::Prefetch {
                    block: idx,
                    msg: "no async runtime available".into(),
                }));
                return;
            }
        };

        let loader = self.loader.clone();
        let blocks = self.blocks.clone();
        let split = self.split;

        runtime.spawn(async move {
            let result = tokio::task::spawn_blocking(move || loader.load_block(idx, &blocks[idx], &split))
                .await
                .unwrap_or_else(|e| {
                    Err(StowageError::Prefetch {
                        block: idx,
                        msg: format!("load task panicked or was cancelled: {e}"),
                    })
                });
            // Receiver may be gone if the prefetcher was dropped.
            let _ = tx.send(result);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoaderConfig;
    use stowage_core::{DType, SourceTensor};

    fn model(num_blocks: usize) -> Arc<Vec<BlockWeights>> {
        let shared = SourceTensor::zeros(DType::F32, &[16]).unwrap();
        Arc::new(
            (0..num_blocks)
                .map(|_| {
                    BlockWeights::from_params([
                        ("w", shared.clone()),
                        ("b", SourceTensor::zeros(DType::F32, &[4]).unwrap()),
                    ])
                    .unwrap()
                })
                .collect(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prefetch_in_order() {
        let blocks = model(6);
        let loader = Arc::new(WeightLoader::new(&LoaderConfig::new(6)).unwrap());
        let prefetcher = BlockPrefetcher::new(loader.clone(), blocks, TierSplit::default(), 2);
        prefetcher.start();

        for idx in 0..6 {
            let handle = prefetcher.get_block(idx).await.unwrap();
            assert_eq!(handle.block_index(), idx);
            assert_eq!(handle.len(), 2);
        }

        assert_eq!(loader.home().populated_count(), 6);
        // One shared "w" plus six distinct biases.
        assert_eq!(loader.cache_stats().total_placements(), 7);
    }

    #[tokio::test]
    async fn test_out_of_range() {
        let loader = Arc::new(WeightLoader::new(&LoaderConfig::new(1)).unwrap());
        let prefetcher = BlockPrefetcher::new(loader, model(1), TierSplit::default(), 1);
        assert!(matches!(
            prefetcher.get_block(4).await,
            Err(StowageError::BlockOutOfRange { index: 4, len: 1 })
        ));
    }

    #[test]
    fn test_without_runtime_fails_fast() {
        let loader = Arc::new(WeightLoader::new(&LoaderConfig::new(2)).unwrap());
        let prefetcher = BlockPrefetcher::new(loader, model(2), TierSplit::default(), 1);
        prefetcher.start();
        assert_eq!(prefetcher.pending_count(), 1);

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let err = rt.block_on(prefetcher.get_block(0)).unwrap_err();
        assert!(matches!(err, StowageError::Prefetch { block: 0, .. }));
    }
}
