use std::{collections::HashMap, path::PathBuf, time::Duration};

use config::{Config as ConfigLib, ConfigError, Environment, File};
use redis::{
    Client as RedisClient, RedisResult,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::dispatch::{ProxySettings, RetryPolicy};
use crate::model::{ClockDriftConfig, TimeProtocol};

/// Daily at midnight UTC.
pub const DEFAULT_CRON: &str = "0 0 0 * * *";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub dispatch: DispatchConfig,
    pub network: NetworkConfig,
    pub clock_drift: ClockDriftSettings,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Channel,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cron for trust points added without one
    #[serde(default)]
    pub default_cron: Option<String>,
    /// Persisted fire time table; unset keeps fire times in memory only
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub transport: TransportKind,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl DispatchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..RetryPolicy::default()
        }
    }
}

/// Outbound proxy settings, handed to workers as is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub enabled: bool,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl NetworkConfig {
    /// The proxy to hand out, if enabled.
    pub fn proxy(&self) -> Option<ProxySettings> {
        if !self.enabled {
            return None;
        }
        Some(ProxySettings {
            host: self.host.clone()?,
            port: self.port?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockDriftSettings {
    pub protocol: TimeProtocol,
    pub server: String,
    pub timeout_ms: u64,
    pub max_clock_offset_ms: u64,
    #[serde(default)]
    pub cron: Option<String>,
}

impl ClockDriftSettings {
    pub fn to_config(&self) -> ClockDriftConfig {
        ClockDriftConfig {
            protocol: self.protocol,
            server: self.server.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            max_clock_offset: Duration::from_millis(self.max_clock_offset_ms),
            cron: self.cron.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Trust point and trust domain snapshot; unset keeps it in memory only
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub uri: SecretString,
}

impl RedisConfig {
    /// Establishes a new Redis connection based on the provided URI.
    ///
    /// - To enable TLS, the URI must use the `rediss://` scheme.
    /// - To enable insecure TLS, the URI must use the `rediss://` scheme and end with `/#insecure`.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn start(&self) -> RedisResult<ConnectionManager> {
        let client = RedisClient::open(self.uri.expose_secret())?;
        let config = ConnectionManagerConfig::new().set_connection_timeout(Duration::from_secs(60));
        client.get_connection_manager_with_config(config).await
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ConfigLib::builder()
            .set_default("store.backend", "memory")?
            .set_default("dispatch.transport", "channel")?
            .set_default("dispatch.queue_capacity", 1024)?
            .set_default("dispatch.max_attempts", 5)?
            .set_default("dispatch.initial_delay_ms", 100)?
            .set_default("dispatch.max_delay_ms", 5000)?
            .set_default("network.enabled", false)?
            .set_default("clock_drift.protocol", "ntp")?
            .set_default("clock_drift.server", "pool.ntp.org")?
            .set_default("clock_drift.timeout_ms", 10_000)?
            .set_default("clock_drift.max_clock_offset_ms", 5_000)?
            .set_default("scheduler.default_cron", DEFAULT_CRON)?
            .set_default("scheduler.state_path", "data/fire_times.json")?
            .set_default("registry.path", "data/registry.json")?
            .add_source(File::with_name("config/settings").required(false));

        // If env_vars is provided, we use it instead of system environment
        // This is to avoid systems variables pollution across tests
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // Use system environment variables
            // Should be in the format APP_STORE__BACKEND or APP_REDIS__URI
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let needs_redis = self.store.backend == StoreBackend::Redis
            || self.dispatch.transport == TransportKind::Redis;
        if needs_redis && self.redis.is_none() {
            return Err(ConfigError::Message(
                "redis.uri is required by the redis store backend or transport".to_string(),
            ));
        }
        if self.network.enabled && (self.network.host.is_none() || self.network.port.is_none()) {
            return Err(ConfigError::Message(
                "network.host and network.port are required when the proxy is enabled"
                    .to_string(),
            ));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::Message(
                "dispatch.queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
