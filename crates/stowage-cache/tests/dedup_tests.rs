//! End-to-end tests for block loading with shared source tensors.

use std::sync::{Arc, Barrier};
use std::thread;

use stowage_cache::{LoadOutcome, LoaderConfig, TierSplit, WeightLoader};
use stowage_core::{BlockWeights, DType, DeviceTier, SourceRegistry, SourceTensor};

/// `num_blocks` blocks cycling through `unique` distinct weight/bias pairs.
fn redundant_model(num_blocks: usize, unique: usize, dim: usize) -> Vec<BlockWeights> {
    let sources: Vec<(SourceTensor, SourceTensor)> = (0..unique)
        .map(|u| {
            let w: Vec<f32> = (0..dim * dim).map(|i| (i + u) as f32).collect();
            let b: Vec<f32> = (0..dim).map(|i| (i * u) as f32).collect();
            (
                SourceTensor::from_f32(&w, &[dim, dim]).unwrap(),
                SourceTensor::from_f32(&b, &[dim]).unwrap(),
            )
        })
        .collect();

    (0..num_blocks)
        .map(|i| {
            let (w, b) = &sources[i % unique];
            BlockWeights::from_params([("weight", w.clone()), ("bias", b.clone())]).unwrap()
        })
        .collect()
}

// ============================================================================
// Redundancy
// ============================================================================

#[test]
fn test_redundancy_five_ten_blocks_two_unique_tensors() {
    let shared = [
        SourceTensor::zeros(DType::F32, &[64]).unwrap(),
        SourceTensor::zeros(DType::F32, &[64]).unwrap(),
    ];
    let blocks: Vec<BlockWeights> = (0..10)
        .map(|i| BlockWeights::from_params([("weight", shared[i % 2].clone())]).unwrap())
        .collect();

    let loader = WeightLoader::new(&LoaderConfig::new(10)).unwrap();
    let accel = TierSplit::new(0.0, 0.0, 100.0);
    for (idx, block) in blocks.iter().enumerate() {
        loader.load_block(idx, block, &accel).unwrap();
    }

    let pool = loader.tiers().pool(DeviceTier::Accelerator(0)).unwrap();
    assert_eq!(pool.total_allocations(), 2);
    assert_eq!(loader.cache_stats().placements_on(DeviceTier::Accelerator(0)), 2);
    assert_eq!(loader.home().populated_count(), 10);
    assert_eq!(loader.reuse_stats().params_reused, 8);
}

#[test]
fn test_allocations_independent_of_block_count() {
    for num_blocks in [4, 8, 16, 32] {
        let blocks = redundant_model(num_blocks, 4, 8);
        let loader = WeightLoader::new(&LoaderConfig::new(num_blocks)).unwrap();
        let split = TierSplit::new(0.0, 50.0, 50.0);
        for (idx, block) in blocks.iter().enumerate() {
            loader.load_block(idx, block, &split).unwrap();
        }

        // Each unique weight lands on host, each unique bias on the accelerator.
        let stats = loader.cache_stats();
        assert_eq!(stats.placements_on(DeviceTier::Host), 4, "blocks={num_blocks}");
        assert_eq!(stats.placements_on(DeviceTier::Accelerator(0)), 4, "blocks={num_blocks}");
        assert_eq!(stats.total_reference_count, num_blocks * 2);
    }
}

#[test]
fn test_tied_parameters_share_one_buffer() {
    let mut registry = SourceRegistry::new();
    registry
        .register("embed.weight", DType::F16, &[32, 8], vec![1u8; 512])
        .unwrap();
    registry.tie("head.weight", "embed.weight").unwrap();

    let block = BlockWeights::from_params([
        ("embed", registry.get("embed.weight").unwrap().clone()),
        ("head", registry.get("head.weight").unwrap().clone()),
    ])
    .unwrap();

    let loader = WeightLoader::new(&LoaderConfig::new(1)).unwrap();
    let handle = loader.load_block(0, &block, &TierSplit::default()).unwrap();

    assert!(handle.get("embed").unwrap().same_buffer(handle.get("head").unwrap()));
    assert_eq!(handle.outcome(), LoadOutcome::Loaded { placed: 1, reused: 1, attempts: 1 });
}

// ============================================================================
// Tiers
// ============================================================================

#[test]
fn test_same_source_on_two_tiers_is_copied_twice() {
    let blocks = redundant_model(2, 1, 4);
    let config = LoaderConfig::new(2).with_accelerators(vec![None, None]);
    let loader = WeightLoader::new(&config).unwrap();

    let a = loader.load_block(0, &blocks[0], &TierSplit::default()).unwrap();
    let b = loader
        .load_block(1, &blocks[1], &TierSplit::default().with_accelerator(1))
        .unwrap();

    let wa = a.get("weight").unwrap();
    let wb = b.get("weight").unwrap();
    assert_eq!(wa.tier(), DeviceTier::Accelerator(0));
    assert_eq!(wb.tier(), DeviceTier::Accelerator(1));
    assert!(!wa.same_buffer(wb));
    assert_eq!(wa.read().unwrap(), wb.read().unwrap());
    assert_eq!(wa.read().unwrap(), blocks[0].get("weight").unwrap().as_bytes());
}

#[test]
fn test_disk_tier_spills_to_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = LoaderConfig::new(1).with_spill_dir(dir.path());
    let loader = WeightLoader::new(&config).unwrap();
    let blocks = redundant_model(1, 1, 4);

    let handle = loader.load_block(0, &blocks[0], &TierSplit::new(100.0, 0.0, 0.0)).unwrap();
    assert_eq!(handle.tier_of("weight"), Some(DeviceTier::Disk));
    assert_eq!(handle.read("bias").unwrap(), blocks[0].get("bias").unwrap().as_bytes());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);

    drop(handle);
    loader.clear_all();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_capacity_returns_after_last_reference() {
    let config = LoaderConfig::new(1).with_accelerators(vec![Some(1024)]);
    let loader = WeightLoader::new(&config).unwrap();
    let blocks = redundant_model(1, 1, 8);

    let handle = loader.load_block(0, &blocks[0], &TierSplit::default()).unwrap();
    let pool = loader.tiers().pool(DeviceTier::Accelerator(0)).unwrap().clone();
    assert_eq!(pool.used_bytes(), blocks[0].total_bytes());

    loader.clear_all();
    // The outstanding handle keeps the buffers alive.
    assert_eq!(pool.used_bytes(), blocks[0].total_bytes());
    assert_eq!(handle.read("weight").unwrap().len(), 256);

    drop(handle);
    assert_eq!(pool.used_bytes(), 0);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_loads_single_commit() {
    let loader = Arc::new(WeightLoader::new(&LoaderConfig::new(1)).unwrap());
    let blocks = Arc::new(redundant_model(1, 1, 16));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let loader = loader.clone();
            let blocks = blocks.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                loader.load_block(0, &blocks[0], &TierSplit::default()).unwrap()
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let committed = results
        .iter()
        .filter(|h| matches!(h.outcome(), LoadOutcome::Loaded { .. }))
        .count();
    assert_eq!(committed, 1);
    for handle in &results {
        assert!(Arc::ptr_eq(handle.params(), results[0].params()));
    }

    let pool = loader.tiers().pool(DeviceTier::Accelerator(0)).unwrap();
    assert_eq!(pool.total_allocations(), 2);

    // Losers dropped their collected references: only the holder's remain.
    assert_eq!(loader.cache_stats().total_reference_count, 2);
    assert_eq!(loader.reuse_stats().holder_hits, 7);
}

#[test]
fn test_loaders_sharing_spill_dir_keep_their_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let config = LoaderConfig::new(1).with_spill_dir(dir.path());
    let a = WeightLoader::new(&config).unwrap();
    let b = WeightLoader::new(&config).unwrap();
    let disk = TierSplit::new(100.0, 0.0, 0.0);

    let ones = BlockWeights::from_params([("w", SourceTensor::from_bytes(DType::U8, &[4], vec![1; 4]).unwrap())]).unwrap();
    let twos = BlockWeights::from_params([("w", SourceTensor::from_bytes(DType::U8, &[4], vec![2; 4]).unwrap())]).unwrap();

    let ha = a.load_block(0, &ones, &disk).unwrap();
    let hb = b.load_block(0, &twos, &disk).unwrap();
    assert_eq!(ha.read("w").unwrap(), vec![1; 4]);
    assert_eq!(hb.read("w").unwrap(), vec![2; 4]);

    drop(hb);
    b.clear_all();
    assert_eq!(ha.read("w").unwrap(), vec![1; 4]);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn test_concurrent_blocks_share_placements() {
    let num_blocks = 12;
    let loader = Arc::new(WeightLoader::new(&LoaderConfig::new(num_blocks)).unwrap());
    let blocks = Arc::new(redundant_model(num_blocks, 3, 8));

    let handles: Vec<_> = (0..num_blocks)
        .map(|idx| {
            let loader = loader.clone();
            let blocks = blocks.clone();
            thread::spawn(move || loader.load_block(idx, &blocks[idx], &TierSplit::new(0.0, 30.0, 70.0)))
        })
        .collect();
    for h in handles {
        h.join().unwrap().unwrap();
    }

    let stats = loader.cache_stats();
    assert_eq!(stats.total_placements(), 6);
    assert_eq!(stats.total_reference_count, num_blocks * 2);
}
