use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use foldhash::fast::RandomState;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::{
    Error, ErrorKind, Result,
    meta::{RegisterMeta, ServiceMeta},
};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// One live TCP connection.
///
/// Writes go through a bounded queue drained by the connection's send loop. A channel also
/// remembers which services were published and subscribed over it, so that the registry
/// protocol can replay or cancel them per connection.
pub struct Channel {
    id: u64,
    remote: SocketAddr,
    sender: mpsc::Sender<Bytes>,
    closed: CancellationToken,
    published: Mutex<HashSet<RegisterMeta, RandomState>>,
    subscribed: Mutex<HashSet<ServiceMeta, RandomState>>,
}

impl Channel {
    pub(crate) fn new(remote: SocketAddr, sender: mpsc::Sender<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            sender,
            closed: CancellationToken::new(),
            published: Mutex::default(),
            subscribed: Mutex::default(),
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.closed.is_cancelled() && !self.sender.is_closed()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Queues `bytes`, waiting for room in the write queue.
    ///
    /// # Errors
    ///
    /// Returns `TcpSendMsgFailed` if the channel is closed.
    pub async fn write(&self, bytes: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        self.sender
            .send(bytes)
            .await
            .map_err(|_| self.closed_error())
    }

    /// Queues `bytes` without waiting, for callers that hold a lock.
    ///
    /// # Errors
    ///
    /// Returns `TcpSendMsgFailed` if the channel is closed or its write queue is full.
    pub fn try_write(&self, bytes: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        self.sender.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => Error::new(
                ErrorKind::TcpSendMsgFailed,
                format!("write queue of {} is full", self.remote),
            ),
            TrySendError::Closed(_) => self.closed_error(),
        })
    }

    fn closed_error(&self) -> Error {
        Error::new(
            ErrorKind::TcpSendMsgFailed,
            format!("channel {} to {} is closed", self.id, self.remote),
        )
    }

    /// Returns `false` if `meta` was already published over this channel.
    pub fn attach_publish(&self, meta: &RegisterMeta) -> bool {
        self.published.lock().insert(meta.clone())
    }

    pub fn detach_publish(&self, meta: &RegisterMeta) -> bool {
        self.published.lock().remove(meta)
    }

    #[must_use]
    pub fn published(&self) -> Vec<RegisterMeta> {
        self.published.lock().iter().cloned().collect()
    }

    /// Returns `false` if `service` was already subscribed over this channel.
    pub fn attach_subscribe(&self, service: &ServiceMeta) -> bool {
        self.subscribed.lock().insert(service.clone())
    }

    #[must_use]
    pub fn is_subscribed(&self, service: &ServiceMeta) -> bool {
        self.subscribed.lock().contains(service)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::meta::Address;

    /// A channel whose write queue is exposed to the test instead of a socket.
    pub(crate) fn detached_channel(capacity: usize) -> (Arc<Channel>, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let remote = "127.0.0.1:9000".parse().unwrap();
        (Channel::new(remote, sender), receiver)
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (channel, mut receiver) = detached_channel(4);
        channel.write(Bytes::from_static(b"a")).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap(), Bytes::from_static(b"a"));

        channel.close();
        assert!(!channel.is_active());
        let error = channel.write(Bytes::new()).await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::TcpSendMsgFailed);
    }

    #[test]
    fn test_try_write_full_queue() {
        let (channel, _receiver) = detached_channel(1);
        channel.try_write(Bytes::from_static(b"a")).unwrap();
        channel.try_write(Bytes::from_static(b"b")).unwrap_err();
    }

    #[test]
    fn test_attachments_are_sets() {
        let (channel, _receiver) = detached_channel(1);
        let service = ServiceMeta::new("g", "svc", "1.0");
        let meta = RegisterMeta::new(Address::new("10.0.0.1", 9000), service.clone());

        assert!(channel.attach_publish(&meta));
        assert!(!channel.attach_publish(&meta));
        assert_eq!(channel.published(), vec![meta.clone()]);
        assert!(channel.detach_publish(&meta));
        assert!(channel.published().is_empty());

        assert!(!channel.is_subscribed(&service));
        assert!(channel.attach_subscribe(&service));
        assert!(!channel.attach_subscribe(&service));
        assert!(channel.is_subscribed(&service));
    }
}
