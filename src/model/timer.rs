use std::fmt;

use serde::{Deserialize, Serialize};

/// What a scheduled fire is for. Equality is structural (kind + name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum TimerInfo {
    TrustPoint(String),
    ClockDrift,
}

impl TimerInfo {
    pub fn trust_point(name: impl Into<String>) -> Self {
        TimerInfo::TrustPoint(name.into())
    }

    /// Name used for prefix based cancellation.
    pub fn name(&self) -> &str {
        match self {
            TimerInfo::TrustPoint(name) => name,
            TimerInfo::ClockDrift => "clock-drift",
        }
    }
}

impl fmt::Display for TimerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerInfo::TrustPoint(name) => write!(f, "trust-point:{name}"),
            TimerInfo::ClockDrift => f.write_str("clock-drift"),
        }
    }
}
