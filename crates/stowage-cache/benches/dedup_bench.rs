//! Benchmark: deduplicated block loading vs one placement per reference.

use std::time::Instant;

use stowage_cache::{LoaderConfig, TierPool, TierSplit, WeightLoader};
use stowage_core::{BlockWeights, DType, DeviceTier, SourceTensor};

fn build_blocks(num_blocks: usize, unique: usize, dim: usize) -> Vec<BlockWeights> {
    let sources: Vec<(SourceTensor, SourceTensor)> = (0..unique)
        .map(|_| (SourceTensor::zeros(DType::F32, &[dim, dim]).unwrap(), SourceTensor::zeros(DType::F32, &[dim]).unwrap()))
        .collect();
    (0..num_blocks)
        .map(|i| {
            let (w, b) = &sources[i % unique];
            BlockWeights::from_params([("weight", w.clone()), ("bias", b.clone())]).unwrap()
        })
        .collect()
}

fn bench_naive(blocks: &[BlockWeights]) -> (f64, u64) {
    let pool = TierPool::new(DeviceTier::Accelerator(0), None);
    let start = Instant::now();
    let mut handles = Vec::new();
    for block in blocks {
        for (_, tensor) in block.iter() {
            let h = pool.allocate(tensor.byte_len(), tensor.dtype()).unwrap();
            pool.copy_in(&h, tensor.as_bytes()).unwrap();
            handles.push(h);
        }
    }
    let elapsed = start.elapsed().as_secs_f64();
    (elapsed, pool.total_allocations())
}

fn bench_shared(blocks: &[BlockWeights]) -> (f64, u64) {
    let loader = WeightLoader::new(&LoaderConfig::new(blocks.len())).unwrap();
    let split = TierSplit::default();
    let start = Instant::now();
    for (idx, block) in blocks.iter().enumerate() {
        loader.load_block(idx, block, &split).unwrap();
    }
    let elapsed = start.elapsed().as_secs_f64();
    let allocs = loader.tiers().pool(DeviceTier::Accelerator(0)).unwrap().total_allocations();
    (elapsed, allocs)
}

fn main() {
    println!("=== Stowage Dedup Benchmark ===\n");
    println!("{:<12} {:>8} {:>12} {:>12} {:>12} {:>12}",
        "Dim", "Redund.", "Naive (ms)", "Allocs", "Shared (ms)", "Allocs");
    println!("{}", "-".repeat(74));

    let num_blocks = 32;
    for &dim in &[64usize, 256, 512] {
        for &redundancy in &[1usize, 4, 8] {
            let blocks = build_blocks(num_blocks, num_blocks / redundancy, dim);
            let (naive_s, naive_allocs) = bench_naive(&blocks);
            let (shared_s, shared_allocs) = bench_shared(&blocks);
            println!("{:<12} {:>8} {:>10.3}ms {:>12} {:>10.3}ms {:>12}",
                format!("{}x{}", dim, dim),
                redundancy,
                naive_s * 1000.0,
                naive_allocs,
                shared_s * 1000.0,
                shared_allocs,
            );
        }
    }
}
