use async_trait::async_trait;
use chrono::TimeDelta;
use thiserror::Error;
use tracing::debug;

use crate::model::ClockDriftConfig;

#[derive(Debug, Clone, Error)]
#[error("Clock drift probe failed: {0}")]
pub struct ProbeError(pub String);

/// Measures the offset of the local clock against a time source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClockDriftProbe: Send + Sync + 'static {
    /// Local time minus reference time.
    async fn offset(&self, config: &ClockDriftConfig) -> Result<TimeDelta, ProbeError>;
}

/// Probe used when no time source client is wired in. Always reports zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredProbe;

#[async_trait]
impl ClockDriftProbe for UnconfiguredProbe {
    async fn offset(&self, config: &ClockDriftConfig) -> Result<TimeDelta, ProbeError> {
        debug!(server = %config.server, "No clock drift probe configured");
        Ok(TimeDelta::zero())
    }
}

/// Whether `offset` exceeds the configured tolerance, in either direction.
pub(crate) fn exceeds_tolerance(config: &ClockDriftConfig, offset: TimeDelta) -> bool {
    let tolerance = TimeDelta::from_std(config.max_clock_offset).unwrap_or(TimeDelta::MAX);
    offset.abs() > tolerance
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tolerance_is_symmetric() {
        let config = ClockDriftConfig {
            max_clock_offset: Duration::from_secs(5),
            ..ClockDriftConfig::default()
        };
        assert!(!exceeds_tolerance(&config, TimeDelta::seconds(5)));
        assert!(exceeds_tolerance(&config, TimeDelta::seconds(6)));
        assert!(exceeds_tolerance(&config, TimeDelta::seconds(-6)));
    }
}
