use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_inline_default::serde_inline_default;

use crate::{Error, ErrorKind, Result, SerializerType, meta::{DEFAULT_WEIGHT, MAX_WEIGHT}};

fn all_defaults<T: DeserializeOwned>() -> T {
    serde_json::from_value(serde_json::Value::Object(serde_json::Map::default()))
        .expect("every config field has a default")
}

macro_rules! default_from_empty {
    ($($ty:ty),*) => {
        $(impl Default for $ty {
            fn default() -> Self {
                all_defaults()
            }
        })*
    };
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct TransportConfig {
    #[serde_inline_default(Duration::from_secs(3))]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// A connection that wrote nothing for this long sends a heartbeat.
    #[serde_inline_default(Duration::from_secs(30))]
    #[serde(with = "humantime_serde")]
    pub writer_idle: Duration,
    /// Accepted connections that read nothing for this long are closed.
    #[serde_inline_default(Duration::from_secs(60))]
    #[serde(with = "humantime_serde")]
    pub reader_idle: Duration,
    #[serde_inline_default(64 << 20)]
    pub max_frame_size: usize,
    #[serde_inline_default(1024)]
    pub write_queue: usize,
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct PoolConfig {
    /// How long an empty channel group may linger in directory listings.
    #[serde_inline_default(Duration::from_secs(5 * 60))]
    #[serde(with = "humantime_serde")]
    pub loss_interval: Duration,
    #[serde_inline_default(Duration::from_secs(10 * 60))]
    #[serde(with = "humantime_serde")]
    pub warm_up: Duration,
    #[serde_inline_default(DEFAULT_WEIGHT)]
    pub default_weight: u32,
    #[serde_inline_default(MAX_WEIGHT)]
    pub max_weight: u32,
    /// How long `ChannelGroup::next` waits for a connection before giving up.
    #[serde_inline_default(Duration::from_secs(1))]
    #[serde(with = "humantime_serde")]
    pub wait_available: Duration,
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct RegistryConfig {
    #[serde_inline_default(Duration::from_millis(300))]
    #[serde(with = "humantime_serde")]
    pub ack_scan_interval: Duration,
    /// Unacknowledged messages older than this are sent again.
    #[serde_inline_default(Duration::from_secs(10))]
    #[serde(with = "humantime_serde")]
    pub ack_grace: Duration,
    #[serde_inline_default(Duration::from_secs(1))]
    #[serde(with = "humantime_serde")]
    pub register_retry: Duration,
    #[serde_inline_default(SerializerType::default())]
    pub serializer: SerializerType,
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct InvokeConfig {
    #[serde_inline_default(Duration::from_secs(3))]
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    #[serde_inline_default(Duration::from_millis(30))]
    #[serde(with = "humantime_serde")]
    pub timeout_scan_interval: Duration,
    #[serde_inline_default(Duration::from_secs(3))]
    #[serde(with = "humantime_serde")]
    pub await_connections: Duration,
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ProviderConfig {
    /// Requests beyond this many in flight are answered with `SERVER_BUSY`.
    #[serde_inline_default(1024)]
    pub max_in_flight: usize,
    /// Host published to the registry; empty lets the registry use the peer address.
    #[serde_inline_default(String::new())]
    pub advertise_host: String,
}

default_from_empty!(
    TransportConfig,
    PoolConfig,
    RegistryConfig,
    InvokeConfig,
    ProviderConfig,
    Config
);

/// Runtime configuration shared by clients, providers and the registry node.
#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct Config {
    #[serde_inline_default("flarepc".to_string())]
    pub app_name: String,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub invoke: InvokeConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl Config {
    /// Loads a JSON config file; absent fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the file cannot be read, or a serde error if it is not
    /// valid JSON.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::new(
                ErrorKind::InvalidArgument,
                format!("read {}: {e}", path.display()),
            )
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.invoke.default_timeout, Duration::from_secs(3));
        assert_eq!(config.invoke.timeout_scan_interval, Duration::from_millis(30));
        assert_eq!(config.registry.ack_grace, Duration::from_secs(10));
        assert_eq!(config.pool.loss_interval, Duration::from_secs(300));
        assert_eq!(config.pool.default_weight, 50);
        assert_eq!(config.transport.writer_idle, Duration::from_secs(30));
    }

    #[test]
    fn test_partial_override() {
        let config: Config = serde_json::from_str(
            r#"{"app_name": "orders", "invoke": {"default_timeout": "250ms"}, "pool": {"warm_up": "1m"}}"#,
        )
        .unwrap();
        assert_eq!(config.app_name, "orders");
        assert_eq!(config.invoke.default_timeout, Duration::from_millis(250));
        assert_eq!(config.invoke.await_connections, Duration::from_secs(3));
        assert_eq!(config.pool.warm_up, Duration::from_secs(60));
        assert_eq!(config.registry, RegistryConfig::default());
    }
}
