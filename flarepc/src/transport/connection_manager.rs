use std::sync::Arc;

use dashmap::DashMap;
use foldhash::fast::RandomState;

use super::ConnectionWatchdog;
use crate::meta::Address;

/// A watchdog-managed connection handed out by a connector.
#[derive(Debug, Clone)]
pub struct Connection {
    watchdog: Arc<ConnectionWatchdog>,
}

impl Connection {
    #[must_use]
    pub fn new(watchdog: Arc<ConnectionWatchdog>) -> Self {
        Self { watchdog }
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        self.watchdog.address()
    }

    /// Resolves `true` on the first successful connect, `false` if reconnecting was
    /// cancelled before that.
    pub async fn wait_connected(&self) -> bool {
        self.watchdog.wait_connected().await
    }

    pub fn set_reconnect(&self, reconnect: bool) {
        if reconnect {
            self.watchdog.start();
        } else {
            self.watchdog.stop();
        }
    }
}

/// Tracks the connections per address so reconnecting can be cancelled by address.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<Address, Vec<Connection>, RandomState>,
}

impl ConnectionManager {
    pub fn manage(&self, connection: Connection) {
        self.connections
            .entry(connection.address().clone())
            .or_default()
            .push(connection);
    }

    #[must_use]
    pub fn is_managed(&self, address: &Address) -> bool {
        self.connections.contains_key(address)
    }

    /// Stops auto-reconnect for every connection to `address` and forgets them.
    pub fn cancel_reconnect(&self, address: &Address) {
        if let Some((_, connections)) = self.connections.remove(address) {
            tracing::info!("cancel reconnect to {address}");
            for connection in connections {
                connection.set_reconnect(false);
            }
        }
    }

    pub fn cancel_all_reconnect(&self) {
        let addresses: Vec<_> = self.connections.iter().map(|e| e.key().clone()).collect();
        for address in addresses {
            self.cancel_reconnect(&address);
        }
    }
}
