use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Weak},
};

use dashmap::{DashMap, DashSet};
use foldhash::fast::RandomState;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use super::RegistryConnector;
use crate::{
    Error, ErrorKind, Result, TaskSupervisor,
    config::Config,
    meta::{Address, NotifyEvent, RegisterMeta, ServiceMeta},
};

/// Receives membership changes of a subscribed service.
pub trait NotifyListener: Send + Sync {
    fn notify(&self, meta: &RegisterMeta, event: NotifyEvent);
}

impl<F: Fn(&RegisterMeta, NotifyEvent) + Send + Sync> NotifyListener for F {
    fn notify(&self, meta: &RegisterMeta, event: NotifyEvent) {
        self(meta, event);
    }
}

/// Runs once when an address is reported offline.
pub type OfflineListener = Box<dyn FnOnce() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterState {
    Queued,
    Prepare,
    Done,
}

#[derive(Debug, Default)]
struct Membership {
    version: u64,
    metas: HashSet<RegisterMeta, RandomState>,
}

/// Client side of the registry protocol, shared by providers and consumers.
///
/// Publications go through a queue drained by a single worker; a failed publication is
/// queued again after `register_retry` unless it was unpublished meanwhile. Subscriptions
/// and publications are replayed on every registry connection that becomes active.
pub struct RegistryService {
    config: Config,
    queue: Mutex<VecDeque<RegisterMeta>>,
    queued: Notify,
    register_states: DashMap<RegisterMeta, RegisterState, RandomState>,
    subscribed: DashSet<ServiceMeta, RandomState>,
    listeners: DashMap<ServiceMeta, Vec<Arc<dyn NotifyListener>>, RandomState>,
    offline_listeners: DashMap<Address, Vec<OfflineListener>, RandomState>,
    registries: DashMap<ServiceMeta, Arc<RwLock<Membership>>, RandomState>,
    connectors: DashMap<Address, Arc<RegistryConnector>, RandomState>,
    supervisor: Arc<TaskSupervisor>,
    me: Weak<RegistryService>,
}

impl RegistryService {
    /// Creates the service and starts its publish worker.
    pub fn new(config: &Config) -> Arc<Self> {
        let service = Arc::new_cyclic(|me| Self {
            config: config.clone(),
            queue: Mutex::default(),
            queued: Notify::new(),
            register_states: DashMap::default(),
            subscribed: DashSet::default(),
            listeners: DashMap::default(),
            offline_listeners: DashMap::default(),
            registries: DashMap::default(),
            connectors: DashMap::default(),
            supervisor: Arc::new(TaskSupervisor::create()),
            me: me.clone(),
        });
        service
            .supervisor
            .spawn("register worker", service.clone().register_worker());
        service
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connects to every registry node of a comma separated `host:port` list.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if an entry is not `host:port`.
    pub fn connect_to_registry_server(&self, addresses: &str) -> Result<()> {
        let addresses = addresses
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Address>>>()?;
        if addresses.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "empty registry address list".into(),
            ));
        }
        for address in addresses {
            if self.connectors.contains_key(&address) {
                continue;
            }
            let connector = RegistryConnector::new(
                address.clone(),
                self.me.clone(),
                self.supervisor.clone(),
                &self.config,
            );
            self.connectors.insert(address, connector.clone());
            connector.start();
        }
        Ok(())
    }

    /// Whether any registry node is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connectors.iter().any(|c| c.is_connected())
    }

    /// Queues `meta` for publication.
    pub fn register(&self, meta: RegisterMeta) {
        if self.register_states.contains_key(&meta) {
            tracing::debug!("{meta:?} is already registered");
            return;
        }
        self.register_states
            .insert(meta.clone(), RegisterState::Queued);
        self.queue.lock().push_back(meta);
        self.queued.notify_one();
    }

    /// Withdraws `meta`. A publication still waiting in the queue is simply dropped.
    pub fn unregister(&self, meta: &RegisterMeta) {
        self.register_states.remove(meta);
        let dequeued = {
            let mut queue = self.queue.lock();
            let before = queue.len();
            queue.retain(|m| m != meta);
            queue.len() != before
        };
        if dequeued {
            return;
        }
        for connector in self.connectors() {
            if let Err(e) = connector.unregister(meta) {
                tracing::warn!("unregister {meta:?} from {} failed: {e}", connector.address());
            }
        }
    }

    /// Registers `listener` for membership changes of `service`.
    pub fn subscribe(&self, service: &ServiceMeta, listener: Arc<dyn NotifyListener>) {
        self.listeners
            .entry(service.clone())
            .or_default()
            .push(listener);
        self.subscribed.insert(service.clone());
        for connector in self.connectors() {
            if let Err(e) = connector.subscribe(service) {
                tracing::warn!("subscribe {service} on {} failed: {e}", connector.address());
            }
        }
    }

    /// Runs `listener` once `address` is reported offline.
    pub fn offline_listening(&self, address: &Address, listener: OfflineListener) {
        self.offline_listeners
            .entry(address.clone())
            .or_default()
            .push(listener);
    }

    /// Applies a membership update if `version` is newer than the last applied one, then
    /// fans it out to the service's listeners.
    pub fn notify(
        &self,
        service: &ServiceMeta,
        event: NotifyEvent,
        version: u64,
        metas: &[RegisterMeta],
    ) {
        if metas.is_empty() {
            return;
        }
        let membership = self
            .registries
            .entry(service.clone())
            .or_default()
            .clone();
        {
            let mut membership = membership.write();
            if version <= membership.version {
                tracing::warn!(
                    "drop stale {event:?} of {service}: version {version} <= {}",
                    membership.version
                );
                return;
            }
            for meta in metas {
                match event {
                    NotifyEvent::ChildAdded => membership.metas.insert(meta.clone()),
                    NotifyEvent::ChildRemoved => membership.metas.remove(meta),
                };
            }
            membership.version = version;
        }

        let listeners = self
            .listeners
            .get(service)
            .map(|l| l.clone())
            .unwrap_or_default();
        for listener in listeners {
            for meta in metas {
                listener.notify(meta, event);
            }
        }
    }

    /// Fires and drops every offline listener of `address`.
    pub fn offline(&self, address: &Address) {
        tracing::info!("{address} is offline");
        if let Some((_, listeners)) = self.offline_listeners.remove(address) {
            for listener in listeners {
                listener();
            }
        }
    }

    /// Current members of `service` as seen by this client.
    #[must_use]
    pub fn lookup(&self, service: &ServiceMeta) -> Vec<RegisterMeta> {
        self.registries
            .get(service)
            .map(|m| m.read().metas.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribed services with their current member counts.
    #[must_use]
    pub fn consumers(&self) -> HashMap<ServiceMeta, usize> {
        self.subscribed
            .iter()
            .map(|s| {
                let count = self.registries.get(&*s).map_or(0, |m| m.read().metas.len());
                (s.clone(), count)
            })
            .collect()
    }

    /// Registered metas and how far their publication got.
    #[must_use]
    pub fn providers(&self) -> HashMap<RegisterMeta, RegisterState> {
        self.register_states
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    #[must_use]
    pub fn register_state(&self, meta: &RegisterMeta) -> Option<RegisterState> {
        self.register_states.get(meta).map(|s| *s)
    }

    #[must_use]
    pub fn subscribed_services(&self) -> Vec<ServiceMeta> {
        self.subscribed.iter().map(|s| s.clone()).collect()
    }

    #[must_use]
    pub fn registered_metas(&self) -> Vec<RegisterMeta> {
        self.register_states.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.supervisor.is_stopped()
    }

    pub fn shutdown_gracefully(&self) {
        for connector in self.connectors() {
            connector.shutdown();
        }
        self.supervisor.stop();
    }

    fn connectors(&self) -> Vec<Arc<RegistryConnector>> {
        self.connectors.iter().map(|c| c.clone()).collect()
    }

    async fn take(&self) -> RegisterMeta {
        loop {
            let notified = self.queued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(meta) = self.queue.lock().pop_front() {
                return meta;
            }
            notified.await;
        }
    }

    async fn register_worker(self: Arc<Self>) {
        loop {
            let meta = self.take().await;
            self.set_state(&meta, RegisterState::Prepare);
            match self.publish(&meta) {
                Ok(()) => {
                    self.set_state(&meta, RegisterState::Done);
                    tracing::info!("registered {meta:?}");
                }
                Err(e) => {
                    tracing::error!("register {meta:?} failed: {e}, retry later");
                    self.retry_later(meta);
                }
            }
        }
    }

    fn set_state(&self, meta: &RegisterMeta, state: RegisterState) {
        if let Some(mut current) = self.register_states.get_mut(meta) {
            *current = state;
        }
    }

    fn publish(&self, meta: &RegisterMeta) -> Result<()> {
        let connectors = self.connectors();
        if connectors.is_empty() {
            return Err(Error::new(
                ErrorKind::RegistryNotConnected,
                "no registry server configured".into(),
            ));
        }
        for connector in connectors {
            connector.register(meta)?;
        }
        Ok(())
    }

    fn retry_later(&self, meta: RegisterMeta) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let delay = self.config.registry.register_retry;
        self.supervisor.spawn("register retry", async move {
            tokio::time::sleep(delay).await;
            if !me.register_states.contains_key(&meta) {
                return;
            }
            me.set_state(&meta, RegisterState::Queued);
            me.queue.lock().push_back(meta);
            me.queued.notify_one();
        });
    }
}

impl std::fmt::Debug for RegistryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryService")
            .field("registries", &self.connectors.len())
            .field("registered", &self.register_states.len())
            .field("subscribed", &self.subscribed.len())
            .finish()
    }
}
