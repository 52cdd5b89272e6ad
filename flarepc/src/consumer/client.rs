use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use foldhash::fast::RandomState;

use super::{
    ConnectionWatcher, Connector, ConsumerProcessor, DefaultConsumerProcessor, FutureTable,
    ProxyBuilder,
};
use crate::{
    Result, TaskSupervisor,
    config::Config,
    meta::{Address, RegisterMeta, ServiceMeta},
    registry::{NotifyListener, OfflineListener, RegistryService},
};

/// The consumer runtime: outstanding calls, the provider connection pool and the registry
/// client, shared by every service proxy built from it.
pub struct Client {
    config: Config,
    futures: Arc<FutureTable>,
    connector: Arc<Connector>,
    registry: Arc<RegistryService>,
    watchers: DashMap<ServiceMeta, Arc<ConnectionWatcher>, RandomState>,
    supervisor: TaskSupervisor,
}

impl Client {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let futures = Arc::new(FutureTable::default());
        let processor = Arc::new(DefaultConsumerProcessor::new(futures.clone()));
        Self::with_processor(config, futures, processor)
    }

    /// A client whose responses go through `processor`, which must eventually hand them to
    /// `futures`.
    #[must_use]
    pub fn with_processor(
        config: &Config,
        futures: Arc<FutureTable>,
        processor: Arc<dyn ConsumerProcessor>,
    ) -> Self {
        let supervisor = TaskSupervisor::create();
        futures.start_scanner(&supervisor, config.invoke.timeout_scan_interval);
        Self {
            config: config.clone(),
            connector: Arc::new(Connector::new(processor, config)),
            registry: RegistryService::new(config),
            futures,
            watchers: DashMap::default(),
            supervisor,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn futures(&self) -> &Arc<FutureTable> {
        &self.futures
    }

    #[must_use]
    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RegistryService> {
        &self.registry
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` if an entry is not `host:port`.
    pub fn connect_to_registry_server(&self, addresses: &str) -> Result<()> {
        self.registry.connect_to_registry_server(addresses)
    }

    /// Subscribes `service` with a connection watcher, once per service.
    pub fn watch_connections(&self, service: &ServiceMeta) -> Arc<ConnectionWatcher> {
        if let Some(watcher) = self.watchers.get(service) {
            return watcher.clone();
        }
        let watcher = match self.watchers.entry(service.clone()) {
            Entry::Occupied(e) => return e.get().clone(),
            Entry::Vacant(e) => e
                .insert(Arc::new(ConnectionWatcher::new(
                    service.clone(),
                    self.connector.clone(),
                    self.registry.clone(),
                )))
                .clone(),
        };
        self.registry.subscribe(service, watcher.clone());
        watcher
    }

    /// Watches `service` and waits until one of its providers is connected.
    pub async fn await_connections(&self, service: &ServiceMeta, timeout: Duration) -> bool {
        self.watch_connections(service)
            .wait_for_available(timeout)
            .await
    }

    pub fn subscribe(&self, service: &ServiceMeta, listener: Arc<dyn NotifyListener>) {
        self.registry.subscribe(service, listener);
    }

    pub fn offline_listening(&self, address: &Address, listener: OfflineListener) {
        self.registry.offline_listening(address, listener);
    }

    #[must_use]
    pub fn lookup(&self, service: &ServiceMeta) -> Vec<RegisterMeta> {
        self.registry.lookup(service)
    }

    /// Starts building a proxy for `service`.
    #[must_use]
    pub fn proxy(&self, service: ServiceMeta) -> ProxyBuilder<'_> {
        ProxyBuilder::new(self, service)
    }

    pub fn shutdown(&self) {
        tracing::info!("shutting down client {}", self.config.app_name);
        self.registry.shutdown_gracefully();
        self.connector.shutdown();
        self.supervisor.stop();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("app_name", &self.config.app_name)
            .field("outstanding", &self.futures.len())
            .field("watched", &self.watchers.len())
            .finish()
    }
}
