use std::{future::Future, sync::Arc, time::Duration};

use dashmap::DashMap;
use foldhash::fast::RandomState;
use tokio::{sync::Notify, time::Instant};

use super::{ConsumerProcessor, processor::ConsumerHandler};
use crate::{
    TaskSupervisor,
    config::Config,
    meta::{Address, ServiceMeta},
    transport::{
        ChannelGroup, Connection, ConnectionManager, ConnectionWatchdog, CopyOnWriteGroupList,
        DirectoryGroup,
    },
};

/// Consumer side connection pool: one channel group per provider address, one group list per
/// directory.
pub struct Connector {
    groups: DashMap<Address, Arc<ChannelGroup>, RandomState>,
    directories: DirectoryGroup,
    connections: ConnectionManager,
    handler: Arc<ConsumerHandler>,
    available: Notify,
    supervisor: Arc<TaskSupervisor>,
    config: Config,
}

impl Connector {
    #[must_use]
    pub fn new(processor: Arc<dyn ConsumerProcessor>, config: &Config) -> Self {
        Self {
            groups: DashMap::default(),
            directories: DirectoryGroup::default(),
            connections: ConnectionManager::default(),
            handler: Arc::new(ConsumerHandler(processor)),
            available: Notify::new(),
            supervisor: Arc::new(TaskSupervisor::create()),
            config: config.clone(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The group of `address`, created on first use.
    pub fn group(&self, address: &Address) -> Arc<ChannelGroup> {
        if let Some(group) = self.groups.get(address) {
            return group.clone();
        }
        self.groups
            .entry(address.clone())
            .or_insert_with(|| {
                let group = ChannelGroup::new(address.clone(), &self.config.pool);
                Arc::new(group)
            })
            .clone()
    }

    #[must_use]
    pub fn groups(&self) -> Vec<Arc<ChannelGroup>> {
        self.groups.iter().map(|g| g.value().clone()).collect()
    }

    /// The group list of `directory`, created on first use.
    pub fn directory(&self, directory: &ServiceMeta) -> Arc<CopyOnWriteGroupList> {
        self.directories.find(directory)
    }

    /// Lists `group` under `directory`. Returns `false` if it already was.
    pub fn add_channel_group(&self, directory: &ServiceMeta, group: Arc<ChannelGroup>) -> bool {
        let added = self.directory(directory).add_if_absent(group);
        self.available.notify_waiters();
        added
    }

    /// Unlists `group` from `directory`; once no directory lists it, its address stops
    /// reconnecting. Returns `false` if `group` was not listed under `directory`.
    pub fn remove_channel_group(&self, directory: &ServiceMeta, group: &ChannelGroup) -> bool {
        let removed = self.directory(directory).remove(group);
        if removed && self.ref_count(group) == 0 {
            self.connections.cancel_reconnect(group.address());
        }
        removed
    }

    /// How many directories list `group`.
    #[must_use]
    pub fn ref_count(&self, group: &ChannelGroup) -> usize {
        self.directories.ref_count(group)
    }

    #[must_use]
    pub fn is_directory_available(&self, directory: &ServiceMeta) -> bool {
        self.directory(directory)
            .snapshot()
            .iter()
            .any(|g| g.is_available())
    }

    /// Waits until some group of `directory` has a live connection.
    pub async fn wait_for_available(&self, directory: &ServiceMeta, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_directory_available(directory) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_directory_available(directory);
            }
        }
    }

    /// Wakes `wait_for_available` callers, e.g. after a group gained a connection.
    pub fn notify_available(&self) {
        self.available.notify_waiters();
    }

    /// Starts a watchdog-managed connection to `address`, feeding the address's group.
    pub fn connect(&self, address: &Address) -> Connection {
        let watchdog = ConnectionWatchdog::new(
            address.clone(),
            Some(self.group(address)),
            self.handler.clone(),
            self.supervisor.clone(),
            &self.config.transport,
        );
        let dialing = watchdog.clone();
        self.supervisor.spawn("provider connect", async move {
            if let Err(e) = dialing.connect().await {
                tracing::warn!("connect to {} failed: {e}", dialing.address());
                dialing.schedule_reconnect();
            }
        });
        Connection::new(watchdog)
    }

    /// Runs `task` until it finishes or the connector shuts down.
    pub(crate) fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.supervisor.spawn(name, task);
    }

    /// Resolves once every task of the connector has exited after `shutdown`.
    pub async fn join(&self) {
        self.supervisor.all_stopped().await;
    }

    #[must_use]
    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn shutdown(&self) {
        self.connections.cancel_all_reconnect();
        for group in self.groups() {
            group.close_all();
        }
        self.supervisor.stop();
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("groups", &self.groups.len())
            .field("directories", &self.directories.directories())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{DefaultConsumerProcessor, FutureTable};

    fn connector() -> Connector {
        let processor = DefaultConsumerProcessor::new(Arc::new(FutureTable::default()));
        Connector::new(Arc::new(processor), &Config::default())
    }

    #[tokio::test]
    async fn test_group_is_shared_per_address() {
        let connector = connector();
        let address = Address::new("10.0.0.1", 9000);
        let group = connector.group(&address);
        assert!(Arc::ptr_eq(&group, &connector.group(&address)));
        assert_eq!(connector.groups().len(), 1);

        let a = ServiceMeta::new("g", "a", "1.0");
        let b = ServiceMeta::new("g", "b", "1.0");
        assert!(connector.add_channel_group(&a, group.clone()));
        assert!(!connector.add_channel_group(&a, group.clone()));
        assert!(connector.add_channel_group(&b, group.clone()));
        assert_eq!(connector.ref_count(&group), 2);

        assert!(connector.remove_channel_group(&a, &group));
        assert!(!connector.remove_channel_group(&a, &group));
        assert_eq!(connector.ref_count(&group), 1);
        assert!(!connector.is_directory_available(&b));
        connector.shutdown();
    }

    #[tokio::test]
    async fn test_last_unlisting_cancels_reconnect() {
        let connector = connector();
        let address = Address::new("127.0.0.1", 1);
        let group = connector.group(&address);
        let connection = connector.connect(&address);
        connector.connection_manager().manage(connection.clone());

        let a = ServiceMeta::new("g", "a", "1.0");
        let b = ServiceMeta::new("g", "b", "1.0");
        connector.add_channel_group(&a, group.clone());
        connector.add_channel_group(&b, group.clone());

        connector.remove_channel_group(&a, &group);
        assert!(connector.connection_manager().is_managed(&address));
        connector.remove_channel_group(&b, &group);
        assert!(!connector.connection_manager().is_managed(&address));
        assert!(!connection.wait_connected().await);
        connector.shutdown();
    }

    #[tokio::test]
    async fn test_connect_fills_group() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = Address::from(listener.local_addr().unwrap());
        let connector = connector();
        let directory = ServiceMeta::new("g", "svc", "1.0");

        let connection = connector.connect(&address);
        let _accepted = listener.accept().await.unwrap();
        assert!(connection.wait_connected().await);
        connector.add_channel_group(&directory, connector.group(&address));
        assert!(
            connector
                .wait_for_available(&directory, Duration::from_secs(1))
                .await
        );
        connector.shutdown();
    }
}
