use std::{
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use foldhash::fast::RandomState;

use super::{
    NonAckRecord, NonAckTable, RegisterInfoContext, RegistryData, RegistryMessage,
};
use crate::{
    Error, ErrorKind, Result, TaskSupervisor,
    config::Config,
    meta::{Address, RegisterMeta, ServiceMeta},
    protocol::{Frame, MessageCode, ack_frame},
    transport::{Channel, FrameHandler, IdlePolicy, Listener, start_channel},
};

/// A registry node.
///
/// Keeps the members of every published service with a per-service version, pushes every
/// change to the subscribers of that service, and resends pushes that were not acknowledged
/// unless a newer version superseded them. When a client connection drops, everything it
/// published is cancelled and its address is announced offline.
pub struct RegistryServer {
    info: RegisterInfoContext,
    subscribers: DashMap<u64, Arc<Channel>, RandomState>,
    non_ack: NonAckTable<(u64, u64)>,
    sequence: AtomicU64,
    config: Config,
    listener: Listener,
    supervisor: Arc<TaskSupervisor>,
    me: Weak<RegistryServer>,
}

impl RegistryServer {
    #[must_use]
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            info: RegisterInfoContext::default(),
            subscribers: DashMap::default(),
            non_ack: NonAckTable::default(),
            sequence: AtomicU64::new(1),
            config: config.clone(),
            listener: Listener::new(),
            supervisor: Arc::new(TaskSupervisor::create()),
            me: me.clone(),
        })
    }

    /// Listens on `addr` and starts the ACK scan. Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns `TcpBindFailed` if the address cannot be bound.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let me = self.me.clone();
        let addr = self
            .listener
            .start_listen(addr, move |stream, peer| {
                let Some(server) = me.upgrade() else {
                    return;
                };
                let idle = IdlePolicy::acceptor(&server.config.transport);
                match start_channel(
                    stream,
                    server.clone(),
                    &server.supervisor,
                    &server.config.transport,
                    idle,
                ) {
                    Ok(channel) => tracing::debug!("accepted {peer} as channel {}", channel.id()),
                    Err(e) => tracing::error!("accept {peer} failed: {e}"),
                }
            })
            .await?;

        let me = self.me.clone();
        let interval = self.config.registry.ack_scan_interval;
        self.supervisor.spawn("registry server ack scan", async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(server) = me.upgrade() else {
                    return;
                };
                server.resend_unacked();
            }
        });

        tracing::info!("registry server listening on {addr}");
        Ok(addr)
    }

    pub fn shutdown(&self) {
        self.listener.stop();
        self.supervisor.stop();
    }

    pub async fn join(&self) {
        self.listener.join().await;
        self.supervisor.all_stopped().await;
    }

    /// Adds `meta` to its service and pushes it to the service's subscribers. Publishing an
    /// address that is already a member changes nothing.
    pub fn handle_publish(&self, channel: &Arc<Channel>, mut meta: RegisterMeta) {
        fill_host(channel, &mut meta);
        channel.attach_publish(&meta);

        let service = meta.service.clone();
        let members = self.info.members(&service);
        let mut members = members.lock();
        if members.config().contains_key(&meta.address) {
            tracing::debug!("{meta:?} is already published");
            return;
        }
        members
            .config_mut()
            .insert(meta.address.clone(), meta.clone());
        self.info.add_service(&meta.address, &service);
        let version = members.new_version();
        tracing::info!("publish {} for {service}, version {version}", meta.address);

        let data = RegistryData::Publish {
            service: service.clone(),
            metas: vec![meta],
        };
        self.push_to_subscribers(&service, MessageCode::PublishService, version, &data);
    }

    /// Removes `meta` from its service and pushes the removal. The service itself stays,
    /// possibly empty.
    pub fn handle_cancel(&self, channel: &Arc<Channel>, mut meta: RegisterMeta) {
        fill_host(channel, &mut meta);
        channel.detach_publish(&meta);

        let service = meta.service.clone();
        let members = self.info.members(&service);
        let mut members = members.lock();
        if members.config_mut().remove(&meta.address).is_none() {
            return;
        }
        self.info.remove_service(&meta.address, &service);
        let version = members.new_version();
        tracing::info!("cancel {} for {service}, version {version}", meta.address);

        let data = RegistryData::Cancel {
            service: service.clone(),
            meta,
        };
        self.push_to_subscribers(&service, MessageCode::PublishCancelService, version, &data);
    }

    /// Marks `channel` as subscribed to `service` and sends it the current members, if any.
    pub fn handle_subscribe(&self, channel: &Arc<Channel>, service: ServiceMeta) {
        channel.attach_subscribe(&service);
        self.subscribers.insert(channel.id(), channel.clone());

        let members = self.info.members(&service);
        let members = members.lock();
        if members.config().is_empty() {
            return;
        }
        let data = RegistryData::Publish {
            service: service.clone(),
            metas: members.config().values().cloned().collect(),
        };
        self.push(channel, MessageCode::PublishService, &service, members.version(), &data);
    }

    /// Forgets the push `sequence` sent over `channel`. Duplicate ACKs are ignored.
    pub fn handle_ack(&self, channel: &Channel, sequence: u64) {
        if !self.non_ack.ack(&(sequence, channel.id())) {
            tracing::debug!("duplicate ack {sequence} on channel {}", channel.id());
        }
    }

    /// Tells every subscriber that `address` went away.
    pub fn handle_offline(&self, address: &Address) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let message = RegistryMessage::new(sequence, 0, RegistryData::Offline(address.clone()));
        let bytes = match message.encode(MessageCode::OfflineNotice, self.config.registry.serializer) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("encode offline notice of {address} failed: {e}");
                return;
            }
        };
        for channel in self.subscriber_channels() {
            if let Err(e) = channel.try_write(bytes.clone()) {
                tracing::warn!("offline notice to {} failed: {e}", channel.remote());
            }
        }
    }

    #[must_use]
    pub fn list_publisher_hosts(&self) -> Vec<Address> {
        self.info.publisher_hosts()
    }

    #[must_use]
    pub fn list_subscriber_addresses(&self) -> Vec<Address> {
        self.subscriber_channels()
            .iter()
            .map(|c| Address::from(c.remote()))
            .collect()
    }

    #[must_use]
    pub fn list_addresses_by_service(&self, service: &ServiceMeta) -> Vec<Address> {
        self.info.addresses_by_service(service)
    }

    #[must_use]
    pub fn list_services_by_address(&self, address: &Address) -> Vec<ServiceMeta> {
        self.info.services_by_address(address)
    }

    #[must_use]
    pub fn version(&self, service: &ServiceMeta) -> u64 {
        self.info.version(service)
    }

    /// Number of pushes not yet acknowledged.
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.non_ack.len()
    }

    fn subscriber_channels(&self) -> Vec<Arc<Channel>> {
        self.subscribers.iter().map(|c| c.value().clone()).collect()
    }

    /// Called with the service's lock held, so pushes of one service leave in version order.
    fn push_to_subscribers(
        &self,
        service: &ServiceMeta,
        code: MessageCode,
        version: u64,
        data: &RegistryData,
    ) {
        for channel in self.subscriber_channels() {
            if channel.is_subscribed(service) {
                self.push(&channel, code, service, version, data);
            }
        }
    }

    fn push(
        &self,
        channel: &Arc<Channel>,
        code: MessageCode,
        service: &ServiceMeta,
        version: u64,
        data: &RegistryData,
    ) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let message = RegistryMessage::new(sequence, version, data.clone());
        let bytes = match message.encode(code, self.config.registry.serializer) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("encode {code:?} of {service} failed: {e}");
                return;
            }
        };
        self.non_ack.insert(
            (sequence, channel.id()),
            NonAckRecord::new(bytes.clone())
                .for_version(service.clone(), version)
                .on_channel(channel.clone()),
        );
        if let Err(e) = channel.try_write(bytes) {
            tracing::warn!("push {code:?} of {service} to {} failed: {e}", channel.remote());
        }
    }

    fn resend_unacked(&self) {
        for (key, mut record) in self.non_ack.take_expired(self.config.registry.ack_grace) {
            if let Some(service) = &record.service
                && self.info.version(service) > record.version
            {
                tracing::debug!("drop superseded push {} of {service}", key.0);
                continue;
            }
            let Some(channel) = record.channel.clone() else {
                continue;
            };
            if !channel.is_active() {
                continue;
            }
            tracing::debug!("resend push {} to {}", key.0, channel.remote());
            if let Err(e) = channel.try_write(record.bytes.clone()) {
                tracing::warn!("resend push {} failed: {e}", key.0);
            }
            record.timestamp = tokio::time::Instant::now();
            self.non_ack.insert(key, record);
        }
    }
}

fn fill_host(channel: &Channel, meta: &mut RegisterMeta) {
    if meta.address.host.is_empty() {
        meta.address.host = channel.remote().ip().to_string();
    }
}

impl FrameHandler for RegistryServer {
    fn on_frame(&self, channel: &Arc<Channel>, frame: Frame) -> Result<()> {
        let code = frame.header.code;
        match code {
            MessageCode::Ack => {
                self.handle_ack(channel, frame.header.id);
                return Ok(());
            }
            MessageCode::Heartbeat => return Ok(()),
            MessageCode::PublishService
            | MessageCode::PublishCancelService
            | MessageCode::SubscribeService
            | MessageCode::OfflineNotice => {}
            _ => {
                tracing::warn!("unexpected {code:?} from {}", channel.remote());
                return Ok(());
            }
        }

        let message = RegistryMessage::decode(&frame)?;
        match (code, message.data) {
            (MessageCode::PublishService, RegistryData::Register(meta)) => {
                self.handle_publish(channel, meta);
            }
            (MessageCode::PublishCancelService, RegistryData::Register(meta)) => {
                self.handle_cancel(channel, meta);
            }
            (MessageCode::SubscribeService, RegistryData::Subscribe(service)) => {
                self.handle_subscribe(channel, service);
            }
            (MessageCode::OfflineNotice, RegistryData::Offline(address)) => {
                self.handle_offline(&address);
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
        tracing::info!("registry client {} disconnected", channel.remote());
        self.subscribers.remove(&channel.id());

        let mut offline = None;
        for meta in channel.published() {
            offline.get_or_insert_with(|| meta.address.clone());
            self.handle_cancel(channel, meta);
        }
        if let Some(address) = offline {
            self.handle_offline(&address);
        }
        let channel_id = channel.id();
        self.non_ack.retain(|(_, id), _| *id != channel_id);
    }
}

impl std::fmt::Debug for RegistryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryServer")
            .field("publishers", &self.info.publisher_hosts().len())
            .field("subscribers", &self.subscribers.len())
            .field("pending_acks", &self.pending_acks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        SerializerType,
        protocol::FrameDecoder,
        transport::detached_channel,
    };
    use bytes::{Bytes, BytesMut};
    use tokio::sync::mpsc::Receiver;

    fn service() -> ServiceMeta {
        ServiceMeta::new("g", "svc", "1.0")
    }

    fn meta(port: u16) -> RegisterMeta {
        RegisterMeta::new(Address::new("10.0.0.1", port), service())
    }

    fn next_message(receiver: &mut Receiver<Bytes>) -> (MessageCode, RegistryMessage) {
        let bytes = receiver.try_recv().unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        let frame = FrameDecoder::new(1 << 20).decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.serializer, SerializerType::MessagePack);
        (frame.header.code, RegistryMessage::decode(&frame).unwrap())
    }

    #[tokio::test]
    async fn test_publish_then_cancel_bumps_versions() {
        let server = RegistryServer::new(&Config::default());
        let (provider, _provider_rx) = detached_channel(16);
        let (consumer, mut consumer_rx) = detached_channel(16);

        server.handle_subscribe(&consumer, service());
        assert!(consumer_rx.try_recv().is_err());

        server.handle_publish(&provider, meta(9000));
        let (code, message) = next_message(&mut consumer_rx);
        assert_eq!(code, MessageCode::PublishService);
        assert_eq!(message.version, 1);
        assert_eq!(
            message.data,
            RegistryData::Publish {
                service: service(),
                metas: vec![meta(9000)]
            }
        );

        server.handle_publish(&provider, meta(9000));
        assert!(consumer_rx.try_recv().is_err());
        assert_eq!(server.version(&service()), 1);

        server.handle_cancel(&provider, meta(9000));
        let (code, message) = next_message(&mut consumer_rx);
        assert_eq!(code, MessageCode::PublishCancelService);
        assert_eq!(message.version, 2);
        assert!(server.list_addresses_by_service(&service()).is_empty());
        assert_eq!(server.pending_acks(), 2);

        server.handle_ack(&consumer, message.sequence);
        server.handle_ack(&consumer, message.sequence);
        assert_eq!(server.pending_acks(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_gets_snapshot() {
        let server = RegistryServer::new(&Config::default());
        let (provider, _provider_rx) = detached_channel(16);
        server.handle_publish(&provider, meta(9000));
        server.handle_publish(&provider, meta(9001));

        let (consumer, mut consumer_rx) = detached_channel(16);
        server.handle_subscribe(&consumer, service());
        let (code, message) = next_message(&mut consumer_rx);
        assert_eq!(code, MessageCode::PublishService);
        assert_eq!(message.version, 2);
        let RegistryData::Publish { metas, .. } = message.data else {
            panic!("expect a publish");
        };
        assert_eq!(metas.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_host_is_filled_from_peer() {
        let server = RegistryServer::new(&Config::default());
        let (provider, _provider_rx) = detached_channel(16);
        let anonymous = RegisterMeta::new(Address::new("", 9000), service());
        server.handle_publish(&provider, anonymous.clone());
        assert_eq!(
            server.list_addresses_by_service(&service()),
            vec![Address::new("127.0.0.1", 9000)]
        );

        server.handle_cancel(&provider, anonymous);
        assert!(server.list_publisher_hosts().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_cancels_and_announces_offline() {
        let server = RegistryServer::new(&Config::default());
        let (provider, _provider_rx) = detached_channel(16);
        let (consumer, mut consumer_rx) = detached_channel(16);
        server.handle_subscribe(&consumer, service());
        server.handle_publish(&provider, meta(9000));
        let _ = next_message(&mut consumer_rx);

        server.on_inactive(&provider);
        let (code, message) = next_message(&mut consumer_rx);
        assert_eq!(code, MessageCode::PublishCancelService);
        assert_eq!(message.version, 2);
        let (code, message) = next_message(&mut consumer_rx);
        assert_eq!(code, MessageCode::OfflineNotice);
        assert_eq!(message.data, RegistryData::Offline(Address::new("10.0.0.1", 9000)));
        assert_eq!(server.list_subscriber_addresses().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_notice_from_client_is_relayed() {
        let server = RegistryServer::new(&Config::default());
        let (reporter, mut reporter_rx) = detached_channel(16);
        let (consumer, mut consumer_rx) = detached_channel(16);
        server.handle_subscribe(&consumer, service());

        let address = Address::new("10.0.0.1", 9000);
        let bytes = RegistryMessage::new(7, 0, RegistryData::Offline(address.clone()))
            .encode(MessageCode::OfflineNotice, SerializerType::MessagePack)
            .unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        let frame = FrameDecoder::new(1 << 20).decode(&mut buf).unwrap().unwrap();
        server.on_frame(&reporter, frame).unwrap();

        let (code, message) = next_message(&mut consumer_rx);
        assert_eq!(code, MessageCode::OfflineNotice);
        assert_eq!(message.data, RegistryData::Offline(address));
        let ack = reporter_rx.try_recv().unwrap();
        let mut buf = BytesMut::from(&ack[..]);
        let frame = FrameDecoder::new(1 << 20).decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.code, MessageCode::Ack);
        assert_eq!(frame.header.id, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_push_is_not_resent() {
        let server = RegistryServer::new(&Config::default());
        let (provider, _provider_rx) = detached_channel(16);
        let (consumer, mut consumer_rx) = detached_channel(16);
        server.handle_subscribe(&consumer, service());
        server.handle_publish(&provider, meta(9000));
        let (_, first) = next_message(&mut consumer_rx);

        tokio::time::advance(std::time::Duration::from_secs(11)).await;
        server.resend_unacked();
        let (_, resent) = next_message(&mut consumer_rx);
        assert_eq!(resent, first);

        server.handle_publish(&provider, meta(9001));
        let _ = next_message(&mut consumer_rx);
        tokio::time::advance(std::time::Duration::from_secs(11)).await;
        server.resend_unacked();
        let (_, resent) = next_message(&mut consumer_rx);
        assert_eq!(resent.version, 2);
        assert!(consumer_rx.try_recv().is_err());
        assert_eq!(server.pending_acks(), 1);
    }
}
