use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

use arc_swap::ArcSwapOption;

use super::{NonAckRecord, NonAckTable, RegistryData, RegistryMessage, RegistryService};
use crate::{
    Error, ErrorKind, Result, SerializerType, TaskSupervisor,
    config::{Config, RegistryConfig},
    meta::{Address, NotifyEvent, RegisterMeta, ServiceMeta},
    protocol::{Frame, MessageCode, ack_frame},
    transport::{Channel, ConnectionWatchdog, FrameHandler},
};

/// One connection from a [`RegistryService`] to a registry node.
///
/// Every message it sends is kept until acknowledged and resent by a periodic scan on the
/// current connection. When a connection becomes active the connector replays the client's
/// subscriptions and publications over it.
pub struct RegistryConnector {
    address: Address,
    registry: Weak<RegistryService>,
    channel: ArcSwapOption<Channel>,
    watchdog: Arc<ConnectionWatchdog>,
    non_ack: NonAckTable<u64>,
    sequence: AtomicU64,
    config: RegistryConfig,
    supervisor: Arc<TaskSupervisor>,
}

/// Forwards connection events to the connector without keeping it alive.
struct ConnectorHandler(Weak<RegistryConnector>);

impl FrameHandler for ConnectorHandler {
    fn on_active(&self, channel: &Arc<Channel>) {
        if let Some(connector) = self.0.upgrade() {
            connector.on_active(channel);
        }
    }

    fn on_frame(&self, channel: &Arc<Channel>, frame: Frame) -> Result<()> {
        match self.0.upgrade() {
            Some(connector) => connector.on_frame(channel, frame),
            None => Err(Error::kind(ErrorKind::Shutdown)),
        }
    }

    fn on_inactive(&self, channel: &Arc<Channel>) {
        if let Some(connector) = self.0.upgrade() {
            connector.on_inactive(channel);
        }
    }
}

impl RegistryConnector {
    pub(crate) fn new(
        address: Address,
        registry: Weak<RegistryService>,
        supervisor: Arc<TaskSupervisor>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            watchdog: ConnectionWatchdog::new(
                address.clone(),
                None,
                Arc::new(ConnectorHandler(me.clone())),
                supervisor.clone(),
                &config.transport,
            ),
            address,
            registry,
            channel: ArcSwapOption::empty(),
            non_ack: NonAckTable::default(),
            sequence: AtomicU64::new(1),
            config: config.registry.clone(),
            supervisor,
        })
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.channel.load().as_ref().is_some_and(|c| c.is_active())
    }

    /// Number of sent messages not yet acknowledged.
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.non_ack.len()
    }

    /// Starts connecting and the ACK scan.
    pub(crate) fn start(self: &Arc<Self>) {
        let watchdog = self.watchdog.clone();
        self.supervisor.spawn("registry connect", async move {
            if let Err(e) = watchdog.connect().await {
                tracing::warn!("connect to registry {} failed: {e}", watchdog.address());
                watchdog.schedule_reconnect();
            }
        });

        let me = Arc::downgrade(self);
        let interval = self.config.ack_scan_interval;
        self.supervisor.spawn("registry ack scan", async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(connector) = me.upgrade() else {
                    return;
                };
                connector.resend_unacked();
            }
        });
    }

    pub(crate) fn shutdown(&self) {
        self.watchdog.stop();
        if let Some(channel) = self.channel.swap(None) {
            channel.close();
        }
    }

    /// Publishes `meta` unless it was already published over the current connection.
    ///
    /// # Errors
    ///
    /// Returns `RegistryNotConnected` without a live connection, or the write error.
    pub fn register(&self, meta: &RegisterMeta) -> Result<()> {
        let channel = self.current_channel()?;
        if !channel.attach_publish(meta) {
            return Ok(());
        }
        let data = RegistryData::Register(meta.clone());
        if let Err(e) = self.send(&channel, MessageCode::PublishService, data) {
            channel.detach_publish(meta);
            return Err(e);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `RegistryNotConnected` without a live connection, or the write error.
    pub fn unregister(&self, meta: &RegisterMeta) -> Result<()> {
        let channel = self.current_channel()?;
        channel.detach_publish(meta);
        self.send(
            &channel,
            MessageCode::PublishCancelService,
            RegistryData::Register(meta.clone()),
        )
    }

    /// Subscribes `service` unless already subscribed over the current connection. Without a
    /// connection this is a no-op; the subscription is replayed once one becomes active.
    ///
    /// # Errors
    ///
    /// Returns the write error.
    pub fn subscribe(&self, service: &ServiceMeta) -> Result<()> {
        let Some(channel) = self.channel.load_full() else {
            return Ok(());
        };
        if !channel.attach_subscribe(service) {
            return Ok(());
        }
        self.send(
            &channel,
            MessageCode::SubscribeService,
            RegistryData::Subscribe(service.clone()),
        )
    }

    fn current_channel(&self) -> Result<Arc<Channel>> {
        self.channel
            .load_full()
            .filter(|c| c.is_active())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::RegistryNotConnected,
                    format!("registry {} is not connected", self.address),
                )
            })
    }

    fn send(&self, channel: &Channel, code: MessageCode, data: RegistryData) -> Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let bytes =
            RegistryMessage::new(sequence, 0, data).encode(code, self.serializer())?;
        self.non_ack
            .insert(sequence, NonAckRecord::new(bytes.clone()));
        if let Err(e) = channel.try_write(bytes) {
            self.non_ack.ack(&sequence);
            return Err(e);
        }
        Ok(())
    }

    fn resend_unacked(&self) {
        let expired = self.non_ack.take_expired(self.config.ack_grace);
        if expired.is_empty() {
            return;
        }
        let channel = self.channel.load_full();
        for (sequence, mut record) in expired {
            if let Some(channel) = &channel {
                tracing::debug!("resend message {sequence} to registry {}", self.address);
                if let Err(e) = channel.try_write(record.bytes.clone()) {
                    tracing::warn!("resend message {sequence} failed: {e}");
                }
            }
            record.timestamp = tokio::time::Instant::now();
            self.non_ack.insert(sequence, record);
        }
    }

    fn serializer(&self) -> SerializerType {
        self.config.serializer
    }

    fn on_active(&self, channel: &Arc<Channel>) {
        tracing::info!("connected to registry {}", self.address);
        self.channel.store(Some(channel.clone()));
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        for service in registry.subscribed_services() {
            if let Err(e) = self.subscribe(&service) {
                tracing::warn!("resubscribe {service} failed: {e}");
            }
        }
        for meta in registry.registered_metas() {
            if let Err(e) = self.register(&meta) {
                tracing::warn!("republish {meta:?} failed: {e}");
            }
        }
    }

    fn on_frame(&self, channel: &Arc<Channel>, frame: Frame) -> Result<()> {
        let code = frame.header.code;
        match code {
            MessageCode::Ack => {
                if !self.non_ack.ack(&frame.header.id) {
                    tracing::debug!("duplicate ack {} from {}", frame.header.id, self.address);
                }
                return Ok(());
            }
            MessageCode::Heartbeat => return Ok(()),
            MessageCode::PublishService
            | MessageCode::PublishCancelService
            | MessageCode::OfflineNotice => {}
            _ => {
                tracing::warn!("unexpected {code:?} from registry {}", self.address);
                return Ok(());
            }
        }

        let message = RegistryMessage::decode(&frame)?;
        let Some(registry) = self.registry.upgrade() else {
            return Err(Error::kind(ErrorKind::Shutdown));
        };
        match (code, message.data) {
            (MessageCode::PublishService, RegistryData::Publish { service, metas }) => {
                registry.notify(&service, NotifyEvent::ChildAdded, message.version, &metas);
            }
            (MessageCode::PublishCancelService, RegistryData::Cancel { service, meta }) => {
                registry.notify(
                    &service,
                    NotifyEvent::ChildRemoved,
                    message.version,
                    std::slice::from_ref(&meta),
                );
            }
            (MessageCode::OfflineNotice, RegistryData::Offline(address)) => {
                registry.offline(&address);
                return Ok(());
            }
            (code, data) => {
                return Err(Error::new(
                    ErrorKind::BadRequest,
                    format!("{code:?} cannot carry {data:?}"),
                ));
            }
        }
        channel.try_write(ack_frame(message.sequence))
    }

    fn on_inactive(&self, channel: &Arc<Channel>) {
        tracing::warn!("disconnected from registry {}", self.address);
        let current = self.channel.load();
        if current.as_ref().is_some_and(|c| c.id() == channel.id()) {
            self.channel.store(None);
        }
    }
}

impl std::fmt::Debug for RegistryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConnector")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .field("pending_acks", &self.pending_acks())
            .finish()
    }
}
