use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::{Error, ErrorKind, Result};

pub const DEFAULT_GROUP: &str = "default";
pub const DEFAULT_VERSION: &str = "1.0.0";
pub const DEFAULT_WEIGHT: u32 = 50;
pub const MAX_WEIGHT: u32 = 100;

/// Directory key of a logical service.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct ServiceMeta {
    pub group: String,
    pub name: String,
    pub version: String,
}

impl ServiceMeta {
    pub fn new(group: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// `group-name-version`, the provider-side lookup key.
    #[must_use]
    pub fn directory(&self) -> String {
        format!("{}-{}-{}", self.group, self.name, self.version)
    }
}

impl std::fmt::Display for ServiceMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.group, self.name, self.version)
    }
}

/// Node identity of a provider or registry.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(value: SocketAddr) -> Self {
        Self::new(value.ip().to_string(), value.port())
    }
}

impl std::str::FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument, format!("expect host:port, got {s:?}"))
        })?;
        let port = port
            .parse()
            .map_err(|e| Error::new(ErrorKind::InvalidArgument, format!("port of {s:?}: {e}")))?;
        Ok(Self::new(host, port))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One provider address serving one service.
///
/// Identity is the address plus the service; weight and connection count are attributes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegisterMeta {
    pub address: Address,
    pub service: ServiceMeta,
    pub weight: u32,
    /// How many connections a consumer should keep to this address.
    pub conn_count: u32,
}

impl RegisterMeta {
    #[must_use]
    pub fn new(address: Address, service: ServiceMeta) -> Self {
        Self {
            address,
            service,
            weight: DEFAULT_WEIGHT,
            conn_count: 1,
        }
    }

    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.min(MAX_WEIGHT);
        self
    }

    #[must_use]
    pub fn with_conn_count(mut self, conn_count: u32) -> Self {
        self.conn_count = conn_count;
        self
    }
}

impl PartialEq for RegisterMeta {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.service == other.service
    }
}

impl Eq for RegisterMeta {}

impl std::hash::Hash for RegisterMeta {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.service.hash(state);
    }
}

/// Membership change delivered to subscription listeners.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum NotifyEvent {
    ChildAdded,
    ChildRemoved,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        let address: Address = "10.0.0.1:9000".parse().unwrap();
        assert_eq!(address, Address::new("10.0.0.1", 9000));
        assert_eq!(address.to_string(), "10.0.0.1:9000");
        "10.0.0.1".parse::<Address>().unwrap_err();
        "host:port".parse::<Address>().unwrap_err();
    }

    #[test]
    fn test_weight_is_capped() {
        let meta = RegisterMeta::new(Address::new("h", 1), ServiceMeta::new("g", "svc", "1.0"))
            .with_weight(500);
        assert_eq!(meta.weight, MAX_WEIGHT);
        assert_eq!(meta.service.directory(), "g-svc-1.0");
    }

    #[test]
    fn test_identity_ignores_weight() {
        let service = ServiceMeta::new("g", "svc", "1.0");
        let heavy = RegisterMeta::new(Address::new("h", 1), service.clone()).with_weight(90);
        let light = RegisterMeta::new(Address::new("h", 1), service.clone()).with_conn_count(4);
        assert_eq!(heavy, light);

        let mut metas = std::collections::HashSet::new();
        metas.insert(heavy);
        assert!(!metas.insert(light.clone()));
        assert!(metas.remove(&light));
        assert_ne!(light, RegisterMeta::new(Address::new("h", 2), service));
    }
}
