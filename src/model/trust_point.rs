use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A configured root of trust whose revocation state is cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPoint {
    pub name: String,
    /// Cron expression driving CRL refreshes; `None` disables the timer.
    pub crl_refresh_cron: Option<String>,
    pub caching_enabled: bool,
    /// Names of the certificate authorities of this chain, root first.
    pub authorities: Vec<String>,
}

impl TrustPoint {
    pub fn new(name: impl Into<String>, crl_refresh_cron: Option<String>) -> Self {
        let name = name.into();
        Self {
            authorities: vec![name.clone()],
            name,
            crl_refresh_cron,
            caching_enabled: true,
        }
    }

    /// The configured cron, treating an empty string as unset.
    pub fn cron(&self) -> Option<&str> {
        self.crl_refresh_cron
            .as_deref()
            .map(str::trim)
            .filter(|cron| !cron.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeProtocol {
    Ntp,
    Tsp,
}

/// Settings of the singleton clock drift detection job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockDriftConfig {
    pub protocol: TimeProtocol,
    pub server: String,
    #[serde(with = "millis")]
    pub timeout: Duration,
    #[serde(with = "millis")]
    pub max_clock_offset: Duration,
    pub cron: Option<String>,
}

impl Default for ClockDriftConfig {
    fn default() -> Self {
        Self {
            protocol: TimeProtocol::Ntp,
            server: "pool.ntp.org".to_string(),
            timeout: Duration::from_secs(10),
            max_clock_offset: Duration::from_secs(5),
            cron: None,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_trust_point_owns_its_root() {
        let tp = TrustPoint::new("CN=Root", Some("0 0 0 * * *".into()));
        assert_eq!(tp.authorities, vec!["CN=Root".to_string()]);
        assert!(tp.caching_enabled);
        assert_eq!(tp.cron(), Some("0 0 0 * * *"));
    }

    #[test]
    fn test_blank_cron_is_unset() {
        let tp = TrustPoint::new("CN=Root", Some("   ".into()));
        assert_eq!(tp.cron(), None);
    }

    #[test]
    fn test_clock_drift_serde_uses_millis() {
        let config = ClockDriftConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["timeout"], 10_000);
        assert_eq!(json["protocol"], "ntp");
    }
}
