//! Configuration for the weight loading context.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stowage_core::{Result, StowageError};

use crate::placement::TierSplit;

/// Configuration for a [`WeightLoader`](crate::WeightLoader).
///
/// Capacities are in bytes; `None` means the tier is unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Number of structural block slots in the block store.
    pub num_blocks: usize,

    /// Capacity of the disk tier.
    #[serde(default)]
    pub disk_capacity: Option<usize>,

    /// Capacity of the host memory tier.
    #[serde(default)]
    pub host_capacity: Option<usize>,

    /// One entry per accelerator, indexed by device index.
    #[serde(default = "default_accelerators")]
    pub accelerator_capacities: Vec<Option<usize>>,

    /// Directory for disk-tier buffers. Without it the disk tier is an
    /// in-memory pool with disk-tier accounting.
    #[serde(default)]
    pub spill_dir: Option<PathBuf>,

    /// Tier split used when a caller does not supply one.
    #[serde(default)]
    pub default_split: TierSplit,
}

fn default_accelerators() -> Vec<Option<usize>> {
    vec![None]
}

impl LoaderConfig {
    /// Unbounded disk and host tiers plus one unbounded accelerator.
    pub fn new(num_blocks: usize) -> Self {
        Self {
            num_blocks,
            disk_capacity: None,
            host_capacity: None,
            accelerator_capacities: default_accelerators(),
            spill_dir: None,
            default_split: TierSplit::default(),
        }
    }

    pub fn with_disk_capacity(mut self, bytes: usize) -> Self {
        self.disk_capacity = Some(bytes);
        self
    }

    pub fn with_host_capacity(mut self, bytes: usize) -> Self {
        self.host_capacity = Some(bytes);
        self
    }

    pub fn with_accelerators(mut self, capacities: Vec<Option<usize>>) -> Self {
        self.accelerator_capacities = capacities;
        self
    }

    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    pub fn with_split(mut self, split: TierSplit) -> Self {
        self.default_split = split;
        self
    }

    /// Bound the host tier to a fraction of currently available RAM.
    ///
    /// `memory_fraction` is clamped to `0.0..=1.0`.
    pub fn adaptive_host(mut self, memory_fraction: f32) -> Self {
        let available = available_ram_bytes();
        let fraction = memory_fraction.clamp(0.0, 1.0) as f64;
        let budget = (available as f64 * fraction) as usize;

        tracing::info!(
            "LoaderConfig: {:.1} GB available, budgeting {:.1} GB ({:.0}%) for host tier",
            available as f64 / 1e9,
            budget as f64 / 1e9,
            fraction * 100.0,
        );

        self.host_capacity = Some(budget);
        self
    }

    /// Load configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| StowageError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration describes a usable context.
    pub fn validate(&self) -> Result<()> {
        if self.default_split.accel_pct > 0.0
            && self.default_split.accelerator >= self.accelerator_capacities.len()
        {
            return Err(StowageError::Config(format!(
                "default split targets accel:{} but only {} accelerator(s) are configured",
                self.default_split.accelerator,
                self.accelerator_capacities.len()
            )));
        }
        self.default_split.validate()
    }
}

fn available_ram_bytes() -> usize {
    let sys = sysinfo::System::new_with_specifics(
        sysinfo::RefreshKind::new().with_memory(sysinfo::MemoryRefreshKind::everything()),
    );
    sys.available_memory() as usize
}
