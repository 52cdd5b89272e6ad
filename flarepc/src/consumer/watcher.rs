use std::{sync::Arc, time::Duration};

use futures_util::{StreamExt, stream::FuturesUnordered};

use super::Connector;
use crate::{
    meta::{NotifyEvent, RegisterMeta, ServiceMeta},
    registry::{NotifyListener, RegistryService},
    transport::{ChannelGroup, Connection},
};

/// Keeps the group list of one directory in step with its registry membership.
///
/// An added provider gets `conn_count` watchdog-managed connections; its group is listed under
/// the directory once the first one is up. A removed provider is unlisted, and stops
/// reconnecting once no directory lists it anymore.
pub struct ConnectionWatcher {
    directory: ServiceMeta,
    connector: Arc<Connector>,
    registry: Arc<RegistryService>,
}

impl ConnectionWatcher {
    #[must_use]
    pub fn new(
        directory: ServiceMeta,
        connector: Arc<Connector>,
        registry: Arc<RegistryService>,
    ) -> Self {
        Self {
            directory,
            connector,
            registry,
        }
    }

    #[must_use]
    pub fn directory(&self) -> &ServiceMeta {
        &self.directory
    }

    /// Waits until some provider of the directory has a live connection.
    pub async fn wait_for_available(&self, timeout: Duration) -> bool {
        self.connector
            .wait_for_available(&self.directory, timeout)
            .await
    }

    fn list_when_available(&self, group: Arc<ChannelGroup>) {
        let connector = self.connector.clone();
        let directory = self.directory.clone();
        let wait = connector.config().invoke.await_connections;
        self.connector.spawn("list when available", async move {
            if group.wait_for_available(wait).await {
                connector.add_channel_group(&directory, group);
            } else {
                tracing::warn!("{} for {directory} is still not connected", group.address());
            }
        });
    }

    /// Lists `group` as soon as any of `connections` is up.
    fn list_on_first_connect(&self, group: Arc<ChannelGroup>, connections: Vec<Connection>) {
        let connector = self.connector.clone();
        let directory = self.directory.clone();
        self.connector.spawn("list on connect", async move {
            let mut connected: FuturesUnordered<_> = connections
                .into_iter()
                .map(|connection| async move { connection.wait_connected().await })
                .collect();
            while let Some(up) = connected.next().await {
                if up {
                    connector.add_channel_group(&directory, group);
                    return;
                }
            }
            tracing::debug!("connecting to {} cancelled", group.address());
        });
    }

    fn child_added(&self, meta: &RegisterMeta) {
        let address = &meta.address;
        let group = self.connector.group(address);
        let weight = meta.weight.min(self.connector.config().pool.max_weight);
        group.set_weight(&self.directory, weight);

        if group.is_available() {
            self.connector.add_channel_group(&self.directory, group);
            return;
        }
        let manager = self.connector.connection_manager();
        if manager.is_managed(address) {
            self.list_when_available(group);
            return;
        }

        let count = meta.conn_count.max(1);
        group.set_capacity(usize::try_from(count).unwrap_or(1));
        let connections: Vec<_> = (0..count).map(|_| self.connector.connect(address)).collect();
        for connection in &connections {
            manager.manage(connection.clone());
        }
        tracing::info!("connecting to {address} for {} x{count}", self.directory);

        self.registry.offline_listening(address, {
            let connector = self.connector.clone();
            let directory = self.directory.clone();
            let address = address.clone();
            let group = group.clone();
            Box::new(move || {
                connector.connection_manager().cancel_reconnect(&address);
                if !group.is_available() {
                    connector.remove_channel_group(&directory, &group);
                }
            })
        });

        self.list_on_first_connect(group, connections);
    }

    fn child_removed(&self, meta: &RegisterMeta) {
        let address = &meta.address;
        let group = self.connector.group(address);
        group.remove_weight(&self.directory);
        self.connector.remove_channel_group(&self.directory, &group);
        if self.connector.ref_count(&group) == 0 {
            self.connector.connection_manager().cancel_reconnect(address);
        }
        tracing::info!("{address} left {}", self.directory);
    }
}

impl NotifyListener for ConnectionWatcher {
    fn notify(&self, meta: &RegisterMeta, event: NotifyEvent) {
        match event {
            NotifyEvent::ChildAdded => self.child_added(meta),
            NotifyEvent::ChildRemoved => self.child_removed(meta),
        }
    }
}

impl std::fmt::Debug for ConnectionWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWatcher")
            .field("directory", &self.directory)
            .finish()
    }
}
