//! Worker sizing from job options.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const TIB: u64 = 1024 * GIB;

const SMALL_BELOW: u64 = 10 * GIB;
const MEDIUM_BELOW: u64 = 100 * GIB;
const LARGE_BELOW: u64 = TIB;

/// Option key carrying the estimated data volume in bytes.
pub const ESTIMATED_SIZE_KEY: &str = "estimated_size_bytes";
/// Option key carrying an explicit tier request.
pub const TIER_HINT_KEY: &str = "worker_tier";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerTier {
    Small,
    Medium,
    Large,
    XLarge,
}

impl WorkerTier {
    pub const ALL: [WorkerTier; 4] = [
        WorkerTier::Small,
        WorkerTier::Medium,
        WorkerTier::Large,
        WorkerTier::XLarge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerTier::Small => "small",
            WorkerTier::Medium => "medium",
            WorkerTier::Large => "large",
            WorkerTier::XLarge => "xlarge",
        }
    }
}

impl fmt::Display for WorkerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown worker tier `{0}` (expected small, medium, large or xlarge)")]
pub struct UnknownTier(pub String);

impl FromStr for WorkerTier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(WorkerTier::Small),
            "medium" => Ok(WorkerTier::Medium),
            "large" => Ok(WorkerTier::Large),
            "xlarge" | "extra-large" | "extra_large" => Ok(WorkerTier::XLarge),
            _ => Err(UnknownTier(s.to_string())),
        }
    }
}

/// Tier for a known data volume.
pub fn tier_for_size(bytes: u64) -> WorkerTier {
    if bytes < SMALL_BELOW {
        WorkerTier::Small
    } else if bytes < MEDIUM_BELOW {
        WorkerTier::Medium
    } else if bytes < LARGE_BELOW {
        WorkerTier::Large
    } else {
        WorkerTier::XLarge
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierSource {
    Estimate,
    Hint,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierSelection {
    pub tier: WorkerTier,
    pub source: TierSource,
}

/// Picks the worker tier for a job: a positive size estimate wins, then an
/// explicit tier hint, then `default`. Anything unusable is ignored.
pub fn select_tier(options: Option<&Value>, default: WorkerTier) -> TierSelection {
    let options = options.and_then(Value::as_object);

    if let Some(bytes) = options
        .and_then(|o| o.get(ESTIMATED_SIZE_KEY))
        .and_then(positive_bytes)
    {
        return TierSelection {
            tier: tier_for_size(bytes),
            source: TierSource::Estimate,
        };
    }

    if let Some(tier) = options
        .and_then(|o| o.get(TIER_HINT_KEY))
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
    {
        return TierSelection {
            tier,
            source: TierSource::Hint,
        };
    }

    TierSelection {
        tier: default,
        source: TierSource::Default,
    }
}

fn positive_bytes(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return (n > 0).then_some(n);
    }
    match value.as_f64() {
        Some(f) if f.is_finite() && f > 0.0 => Some(f.ceil().min(u64::MAX as f64) as u64),
        _ => None,
    }
}

/// Instance type launched for each tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceTypes {
    pub small: String,
    pub medium: String,
    pub large: String,
    pub xlarge: String,
}

impl Default for InstanceTypes {
    fn default() -> Self {
        Self {
            small: "t3.medium".into(),
            medium: "c5.large".into(),
            large: "c5.2xlarge".into(),
            xlarge: "c5.4xlarge".into(),
        }
    }
}

impl InstanceTypes {
    pub fn for_tier(&self, tier: WorkerTier) -> &str {
        match tier {
            WorkerTier::Small => &self.small,
            WorkerTier::Medium => &self.medium,
            WorkerTier::Large => &self.large,
            WorkerTier::XLarge => &self.xlarge,
        }
    }
}
