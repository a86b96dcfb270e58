use std::fmt;
use std::str::FromStr;

use crate::StowageError;

/// Storage destination for placed weights.
///
/// Variants are declared in canonical placement order: slow and large first,
/// fast and scarce last. The derived `Ord` follows that order, with
/// accelerators ordered by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceTier {
    /// Spill storage (files or a disk-backed pool)
    Disk,
    /// Host (CPU) memory
    Host,
    /// Accelerator memory with device index
    Accelerator(usize),
}

impl DeviceTier {
    /// Whether this is the disk tier.
    pub fn is_disk(&self) -> bool {
        matches!(self, DeviceTier::Disk)
    }

    /// Whether this is the host tier.
    pub fn is_host(&self) -> bool {
        matches!(self, DeviceTier::Host)
    }

    /// Whether this is an accelerator tier.
    pub fn is_accelerator(&self) -> bool {
        matches!(self, DeviceTier::Accelerator(_))
    }

    /// Get the accelerator index, if applicable.
    pub fn accelerator_index(&self) -> Option<usize> {
        match self {
            DeviceTier::Accelerator(idx) => Some(*idx),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceTier::Disk => write!(f, "disk"),
            DeviceTier::Host => write!(f, "host"),
            DeviceTier::Accelerator(idx) => write!(f, "accel:{idx}"),
        }
    }
}

impl FromStr for DeviceTier {
    type Err = StowageError;

    /// Accepts `disk`, `host`/`cpu`, and `accel:N`/`cuda:N`/`gpu:N`
    /// (a bare `accel`, `cuda` or `gpu` means index 0).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let (kind, index) = match lower.split_once(':') {
            Some((kind, idx)) => {
                let idx = idx.parse::<usize>().map_err(|_| {
                    StowageError::Config(format!("invalid device index in '{s}'"))
                })?;
                (kind.to_string(), Some(idx))
            }
            None => (lower.clone(), None),
        };

        match (kind.as_str(), index) {
            ("disk", None) => Ok(DeviceTier::Disk),
            ("host" | "cpu", None) => Ok(DeviceTier::Host),
            ("accel" | "cuda" | "gpu", idx) => Ok(DeviceTier::Accelerator(idx.unwrap_or(0))),
            _ => Err(StowageError::Config(format!("unknown device tier '{s}'"))),
        }
    }
}
