use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use rand::Rng;

use stowage_cache::{
    BufferHandle, LoaderConfig, PlacementPolicy, SavingsEstimate, TierSet, TierSplit, WeightLoader,
};
use stowage_core::{BlockWeights, DType, DeviceTier, SourceTensor, StowageError};

#[derive(Parser)]
#[command(
    name = "stowage",
    about = "Deduplicating, tier-aware weight loading",
    long_about = "Place model weights across disk, host and accelerator tiers,\nsharing one buffer per distinct source tensor and tier.",
    version,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show supported tiers and dtypes
    Info,
    /// Compare loading strategies on a synthetic model
    Bench {
        /// Side length of each square weight matrix
        #[arg(long, default_value = "1024")]
        layer_size: usize,
        /// Number of blocks to load
        #[arg(long, default_value = "8")]
        num_layers: usize,
        /// How many blocks share each unique weight set
        #[arg(long, default_value = "1")]
        redundancy: usize,
        /// Element type of the synthetic weights
        #[arg(long, default_value = "f32")]
        dtype: DType,
        /// Tier split as disk,host,accel percentages, optionally `@accel:N`
        #[arg(long, default_value = "0,0,100")]
        split: TierSplit,
        /// Accelerator percentages to sweep (rest on host), e.g. 25,50,100.
        /// Overrides --split.
        #[arg(long, value_delimiter = ',')]
        accel_sweep: Vec<f64>,
        /// Strategies to run
        #[arg(long, value_enum, value_delimiter = ',', default_values = ["naive", "shared", "lazy"])]
        strategy: Vec<Strategy>,
        /// Optional JSON loader configuration (tier capacities, spill dir)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Bound the host tier to this fraction of available RAM
        #[arg(long)]
        host_fraction: Option<f32>,
    },
    /// Show the tier assignment for a list of parameter sizes
    Plan {
        /// Parameter sizes in bytes (comma-separated)
        #[arg(long)]
        sizes: String,
        /// Tier split as disk,host,accel percentages, optionally `@accel:N`
        #[arg(long, default_value = "30,30,40")]
        split: TierSplit,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Strategy {
    /// One placement per parameter reference
    Naive,
    /// Deduplicated through the weight cache, every block kept loaded
    Shared,
    /// Deduplicated, releasing the previous block after loading the next
    Lazy,
}

impl Strategy {
    fn name(&self) -> &'static str {
        match self {
            Strategy::Naive => "naive",
            Strategy::Shared => "shared",
            Strategy::Lazy => "lazy",
        }
    }
}

struct BenchArgs {
    layer_size: usize,
    num_layers: usize,
    redundancy: usize,
    dtype: DType,
    splits: Vec<TierSplit>,
    strategies: Vec<Strategy>,
}

/// What one strategy achieved for one split.
enum RunResult {
    Done {
        millis: f64,
        allocations: u64,
        peak_bytes: usize,
    },
    OutOfCapacity(String),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info => cmd_info(),
        Commands::Bench {
            layer_size,
            num_layers,
            redundancy,
            dtype,
            split,
            accel_sweep,
            strategy,
            config,
            host_fraction,
        } => {
            let splits = if accel_sweep.is_empty() {
                vec![split]
            } else {
                accel_sweep
                    .iter()
                    .map(|pct| {
                        let s = TierSplit::new(0.0, 100.0 - pct, *pct).with_accelerator(split.accelerator);
                        s.validate().map(|_| s)
                    })
                    .collect::<Result<_, _>>()?
            };
            let args = BenchArgs {
                layer_size,
                num_layers,
                redundancy,
                dtype,
                splits,
                strategies: strategy,
            };
            cmd_bench(&args, config, host_fraction)
        }
        Commands::Plan { sizes, split } => cmd_plan(&sizes, split),
    }
}

fn cmd_info() -> anyhow::Result<()> {
    println!("stowage v{}\n", env!("CARGO_PKG_VERSION"));

    println!("Tiers (canonical placement order)");
    for tier in [DeviceTier::Disk, DeviceTier::Host, DeviceTier::Accelerator(0)] {
        println!("  {tier}");
    }

    println!("\nDTypes");
    let dtypes = [
        DType::F16, DType::BF16, DType::F32, DType::F64,
        DType::I8, DType::U8, DType::I32, DType::I64,
    ];
    for dtype in dtypes {
        let kind = if dtype.is_float() { "float" } else { "integer" };
        println!("  {:<5} {} byte(s), {kind}", dtype.to_string(), dtype.element_size());
    }
    Ok(())
}

/// Blocks of one weight matrix plus bias, cycling through
/// `num_layers / redundancy` unique sets of random bytes.
fn build_model(args: &BenchArgs) -> anyhow::Result<Vec<BlockWeights>> {
    let unique = (args.num_layers / args.redundancy.max(1)).max(1);
    let mut rng = rand::thread_rng();
    let mut random = |shape: &[usize]| -> anyhow::Result<SourceTensor> {
        let len = shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .and_then(|numel| args.dtype.storage_bytes(numel))
            .context("weight size overflows usize")?;
        let mut bytes = vec![0u8; len];
        rng.fill(&mut bytes[..]);
        Ok(SourceTensor::from_bytes(args.dtype, shape, bytes)?)
    };

    let mut sources = Vec::with_capacity(unique);
    for _ in 0..unique {
        sources.push((random(&[args.layer_size, args.layer_size])?, random(&[args.layer_size])?));
    }

    (0..args.num_layers)
        .map(|i| {
            let (w, b) = &sources[i % unique];
            Ok(BlockWeights::from_params([("weight", w.clone()), ("bias", b.clone())])?)
        })
        .collect()
}

fn cmd_bench(args: &BenchArgs, config_path: Option<PathBuf>, host_fraction: Option<f32>) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => LoaderConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => LoaderConfig::new(args.num_layers),
    };
    config.num_blocks = config.num_blocks.max(args.num_layers);
    if let Some(fraction) = host_fraction {
        config = config.adaptive_host(fraction);
    }
    tracing::info!(
        "bench: {} block slot(s), {} accelerator(s), spill dir {:?}",
        config.num_blocks,
        config.accelerator_capacities.len(),
        config.spill_dir,
    );

    println!("=== Stowage Weight Loading Benchmark ===");
    println!(
        "{} blocks of {}x{} {}, redundancy {}\n",
        args.num_layers, args.layer_size, args.layer_size, args.dtype, args.redundancy
    );

    let blocks = build_model(args)?;
    println!("Theoretical: {}\n", SavingsEstimate::for_blocks(&blocks));

    const MB: f64 = 1024.0 * 1024.0;
    println!(
        "{:<28} {:<8} {:>12} {:>10} {:>12}",
        "Split", "Method", "Load (ms)", "Allocs", "Peak (MB)"
    );
    println!("{}", "-".repeat(74));

    for split in &args.splits {
        for strategy in &args.strategies {
            let result = match strategy {
                Strategy::Naive => run_naive(&config, &blocks, split)?,
                Strategy::Shared => run_shared(&config, &blocks, split, false)?,
                Strategy::Lazy => run_shared(&config, &blocks, split, true)?,
            };
            match result {
                RunResult::Done { millis, allocations, peak_bytes } => println!(
                    "{:<28} {:<8} {:>10.3}ms {:>10} {:>12.1}",
                    split.to_string(),
                    strategy.name(),
                    millis,
                    allocations,
                    peak_bytes as f64 / MB,
                ),
                RunResult::OutOfCapacity(msg) => {
                    println!("{:<28} {:<8} {:>12} ({msg})", split.to_string(), strategy.name(), "OOM")
                }
            }
        }
    }
    Ok(())
}

/// Map a capacity failure to a result row; any other error aborts the bench.
fn capacity_row(err: StowageError) -> anyhow::Result<RunResult> {
    if err.is_capacity() {
        Ok(RunResult::OutOfCapacity(err.to_string()))
    } else {
        Err(err.into())
    }
}

fn run_naive(config: &LoaderConfig, blocks: &[BlockWeights], split: &TierSplit) -> anyhow::Result<RunResult> {
    let tiers = TierSet::from_config(config)?;
    let policy = PlacementPolicy::new(split)?;
    let mut handles: Vec<BufferHandle> = Vec::new();

    let start = Instant::now();
    let placed = place_every_reference(&tiers, &policy, blocks, &mut handles);
    let millis = start.elapsed().as_secs_f64() * 1000.0;
    let allocations = tiers.pools().map(|p| p.total_allocations()).sum();
    let peak_bytes = tiers.pools().map(|p| p.used_bytes()).sum();

    // Release on every path so spill files never outlive the run.
    for handle in &handles {
        tiers.pool(handle.tier())?.release(handle)?;
    }

    match placed {
        Ok(()) => Ok(RunResult::Done { millis, allocations, peak_bytes }),
        Err(e) => capacity_row(e),
    }
}

fn place_every_reference(
    tiers: &TierSet,
    policy: &PlacementPolicy,
    blocks: &[BlockWeights],
    handles: &mut Vec<BufferHandle>,
) -> stowage_core::Result<()> {
    for block in blocks {
        let plan = policy.assign(&block.param_sizes());
        for (name, tensor) in block.iter() {
            let tier = plan
                .tier_of(name)
                .ok_or_else(|| StowageError::Config(format!("no placement for parameter '{name}'")))?;
            let pool = tiers.pool(tier)?;
            let handle = pool.allocate(tensor.byte_len(), tensor.dtype())?;
            handles.push(handle);
            pool.copy_in(&handle, tensor.as_bytes())?;
        }
    }
    Ok(())
}

/// Deduplicated loading. With `lazy`, each block is cleared once the next
/// one is loaded and placements nobody references are purged.
fn run_shared(config: &LoaderConfig, blocks: &[BlockWeights], split: &TierSplit, lazy: bool) -> anyhow::Result<RunResult> {
    let loader = WeightLoader::new(config)?;
    let used = |loader: &WeightLoader| -> usize { loader.tiers().pools().map(|p| p.used_bytes()).sum() };

    let start = Instant::now();
    let mut peak_bytes = 0;
    for (idx, block) in blocks.iter().enumerate() {
        if let Err(e) = loader.load_block(idx, block, split) {
            return capacity_row(e);
        }
        peak_bytes = peak_bytes.max(used(&loader));
        if lazy && idx > 0 {
            loader.clear_block(idx - 1)?;
            loader.cache().purge_unreferenced();
        }
    }
    let millis = start.elapsed().as_secs_f64() * 1000.0;

    tracing::info!("{}", loader.reuse_stats());
    tracing::info!("{}", loader.cache_stats());
    let allocations = loader.tiers().pools().map(|p| p.total_allocations()).sum();
    Ok(RunResult::Done { millis, allocations, peak_bytes })
}

fn cmd_plan(sizes: &str, split: TierSplit) -> anyhow::Result<()> {
    let params: Vec<(String, usize)> = sizes
        .split(',')
        .enumerate()
        .map(|(i, s)| {
            let size = s.trim().parse::<usize>().with_context(|| format!("invalid size '{s}'"))?;
            Ok((format!("param{i}"), size))
        })
        .collect::<anyhow::Result<_>>()?;

    let plan = PlacementPolicy::new(&split)?.assign(&params);
    println!("{:<10} {:>12} {:>10}", "Param", "Bytes", "Tier");
    println!("{}", "-".repeat(34));
    for p in plan.iter() {
        println!("{:<10} {:>12} {:>10}", p.name, p.size, p.tier.to_string());
    }
    println!("\n{plan}");
    Ok(())
}
