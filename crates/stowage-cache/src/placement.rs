//! Size-proportional tier assignment for the parameters of a block.
//!
//! Each parameter is placed by the position of its size-weighted midpoint in
//! the block: `mid = (prefix_sum - size / 2) / total * 100`. Tiers own
//! consecutive percentage brackets in canonical order (disk, host,
//! accelerator), so the resulting split reflects memory share rather than
//! parameter count.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stowage_core::{DeviceTier, Result, StowageError};

/// Tolerance for bracket-boundary comparisons.
const BOUNDARY_EPS: f64 = 1e-9;

/// Percentage split of a block's bytes across tiers.
///
/// Shares need not sum to 100; they are normalized proportionally.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierSplit {
    pub disk_pct: f64,
    pub host_pct: f64,
    pub accel_pct: f64,
    /// Accelerator receiving the accelerator share.
    #[serde(default)]
    pub accelerator: usize,
}

impl Default for TierSplit {
    /// Everything on accelerator 0.
    fn default() -> Self {
        Self::new(0.0, 0.0, 100.0)
    }
}

impl TierSplit {
    pub fn new(disk_pct: f64, host_pct: f64, accel_pct: f64) -> Self {
        Self { disk_pct, host_pct, accel_pct, accelerator: 0 }
    }

    pub fn with_accelerator(mut self, index: usize) -> Self {
        self.accelerator = index;
        self
    }

    /// Reject negative, non-finite, or all-zero shares.
    pub fn validate(&self) -> Result<()> {
        let shares = [self.disk_pct, self.host_pct, self.accel_pct];
        if shares.iter().any(|s| !s.is_finite() || *s < 0.0) {
            return Err(StowageError::InvalidSplit(format!(
                "shares must be finite and non-negative, got {self}"
            )));
        }
        if shares.iter().sum::<f64>() <= 0.0 {
            return Err(StowageError::InvalidSplit("all shares are zero".into()));
        }
        Ok(())
    }

    /// Shares normalized to sum to 100, in canonical tier order.
    pub fn normalized(&self) -> Result<[(DeviceTier, f64); 3]> {
        self.validate()?;
        let total = self.disk_pct + self.host_pct + self.accel_pct;
        let scale = 100.0 / total;
        Ok([
            (DeviceTier::Disk, self.disk_pct * scale),
            (DeviceTier::Host, self.host_pct * scale),
            (DeviceTier::Accelerator(self.accelerator), self.accel_pct * scale),
        ])
    }
}

impl fmt::Display for TierSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "disk {}% / host {}% / accel:{} {}%",
            self.disk_pct, self.host_pct, self.accelerator, self.accel_pct
        )
    }
}

impl FromStr for TierSplit {
    type Err = StowageError;

    /// Parses `disk,host,accel` percentages, e.g. `30,30,40`, optionally
    /// followed by the accelerator receiving the last share: `30,30,40@accel:1`.
    fn from_str(s: &str) -> Result<Self> {
        let (shares_str, accelerator) = match s.split_once('@') {
            Some((shares, device)) => {
                let tier: DeviceTier = device.parse()?;
                let idx = tier.accelerator_index().ok_or_else(|| {
                    StowageError::InvalidSplit(format!("'{device}' is not an accelerator"))
                })?;
                (shares, idx)
            }
            None => (s, 0),
        };
        let parts: Vec<&str> = shares_str.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(StowageError::InvalidSplit(format!(
                "expected three comma-separated shares (disk,host,accel), got '{s}'"
            )));
        }
        let mut shares = [0.0f64; 3];
        for (share, part) in shares.iter_mut().zip(&parts) {
            *share = part
                .parse()
                .map_err(|_| StowageError::InvalidSplit(format!("'{part}' is not a number")))?;
        }
        let split = Self::new(shares[0], shares[1], shares[2]).with_accelerator(accelerator);
        split.validate()?;
        Ok(split)
    }
}

/// Validated placement brackets for one tier split.
#[derive(Debug, Clone)]
pub struct PlacementPolicy {
    /// `(tier, cumulative upper bound)` for every tier with a non-zero share.
    brackets: Vec<(DeviceTier, f64)>,
}

impl PlacementPolicy {
    pub fn new(split: &TierSplit) -> Result<Self> {
        let mut brackets = Vec::with_capacity(3);
        let mut upper = 0.0;
        for (tier, share) in split.normalized()? {
            if share > 0.0 {
                upper += share;
                brackets.push((tier, upper));
            }
        }
        Ok(Self { brackets })
    }

    /// Assign every parameter to a tier.
    ///
    /// Deterministic in the ordered `(name, size)` list; a boundary midpoint
    /// goes to the earlier tier. Parameters larger than their tier's share
    /// are still assigned there.
    pub fn assign(&self, params: &[(String, usize)]) -> PlacementPlan {
        let total: usize = params.iter().map(|(_, size)| *size).sum();
        let mut prefix = 0usize;
        let mut entries = Vec::with_capacity(params.len());

        for (name, size) in params {
            prefix += size;
            let mid = if total == 0 {
                0.0
            } else {
                (prefix as f64 - *size as f64 / 2.0) / total as f64 * 100.0
            };
            entries.push(PlacedParam {
                name: name.clone(),
                size: *size,
                tier: self.tier_for(mid),
            });
        }

        PlacementPlan { entries }
    }

    fn tier_for(&self, mid: f64) -> DeviceTier {
        self.brackets
            .iter()
            .find(|(_, upper)| mid <= *upper + BOUNDARY_EPS)
            .or_else(|| self.brackets.last())
            .map(|(tier, _)| *tier)
            .unwrap_or(DeviceTier::Host)
    }
}

/// One parameter's assigned tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedParam {
    pub name: String,
    pub size: usize,
    pub tier: DeviceTier,
}

/// Result of [`PlacementPolicy::assign`], in block order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlacementPlan {
    entries: Vec<PlacedParam>,
}

impl PlacementPlan {
    pub fn tier_of(&self, name: &str) -> Option<DeviceTier> {
        self.entries.iter().find(|p| p.name == name).map(|p| p.tier)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlacedParam> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes assigned to each tier.
    pub fn bytes_per_tier(&self) -> BTreeMap<DeviceTier, usize> {
        let mut out = BTreeMap::new();
        for p in &self.entries {
            *out.entry(p.tier).or_insert(0) += p.size;
        }
        out
    }
}

impl fmt::Display for PlacementPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total: usize = self.entries.iter().map(|p| p.size).sum();
        let parts: Vec<String> = self
            .bytes_per_tier()
            .into_iter()
            .map(|(tier, bytes)| {
                let pct = if total == 0 { 0.0 } else { bytes as f64 / total as f64 * 100.0 };
                format!("{tier} {bytes} B ({pct:.1}%)")
            })
            .collect();
        write!(f, "{} params: {}", self.entries.len(), parts.join(", "))
    }
}
