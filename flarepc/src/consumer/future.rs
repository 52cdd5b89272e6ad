use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use foldhash::fast::RandomState;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::{sync::Notify, time::Instant};

use super::ConsumerHook;
use crate::{
    Error, ErrorKind, Result, SerializerType, TaskSupervisor,
    protocol::{Response, Status},
    transport::Channel,
};

type Listener = Box<dyn FnOnce(&Result<Bytes>) + Send>;

struct FutureInner {
    invoke_id: u64,
    channel: Option<Arc<Channel>>,
    broadcast: bool,
    serializer: SerializerType,
    timeout: Duration,
    start: Instant,
    sent: AtomicBool,
    hooks: Vec<Arc<dyn ConsumerHook>>,
    outcome: OnceLock<Result<Bytes>>,
    /// `None` once the listeners have been run.
    listeners: Mutex<Option<Vec<Listener>>>,
    done: Notify,
}

/// Result of one outstanding call, completed exactly once.
///
/// Completion stores the outcome, runs the listeners registered so far on the completing
/// task and wakes every waiter. Listeners registered after completion run immediately. Later
/// completions are ignored.
#[derive(Clone)]
pub struct InvokeFuture(Arc<FutureInner>);

impl InvokeFuture {
    pub(crate) fn new(
        invoke_id: u64,
        channel: Arc<Channel>,
        broadcast: bool,
        serializer: SerializerType,
        timeout: Duration,
        hooks: Vec<Arc<dyn ConsumerHook>>,
    ) -> Self {
        Self(Arc::new(FutureInner {
            invoke_id,
            channel: Some(channel),
            broadcast,
            serializer,
            timeout,
            start: Instant::now(),
            sent: AtomicBool::new(false),
            hooks,
            outcome: OnceLock::new(),
            listeners: Mutex::new(Some(Vec::new())),
            done: Notify::new(),
        }))
    }

    /// A future not bound to any channel, completed by its creator.
    #[must_use]
    pub fn detached(invoke_id: u64, serializer: SerializerType) -> Self {
        Self(Arc::new(FutureInner {
            invoke_id,
            channel: None,
            broadcast: false,
            serializer,
            timeout: Duration::MAX,
            start: Instant::now(),
            sent: AtomicBool::new(false),
            hooks: Vec::new(),
            outcome: OnceLock::new(),
            listeners: Mutex::new(Some(Vec::new())),
            done: Notify::new(),
        }))
    }

    #[must_use]
    pub fn invoke_id(&self) -> u64 {
        self.0.invoke_id
    }

    #[must_use]
    pub fn channel(&self) -> Option<&Arc<Channel>> {
        self.0.channel.as_ref()
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.0.timeout
    }

    /// The request left this process.
    pub fn mark_sent(&self) {
        self.0.sent.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.0.sent.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.0.outcome.get().is_some()
    }

    fn is_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.0.start) > self.0.timeout
    }

    /// Returns `false` if the future was already completed.
    pub fn complete(&self, outcome: Result<Bytes>) -> bool {
        if self.0.outcome.set(outcome).is_err() {
            return false;
        }
        let listeners = self.0.listeners.lock().take().unwrap_or_default();
        if let Some(outcome) = self.0.outcome.get() {
            for listener in listeners {
                listener(outcome);
            }
        }
        self.0.done.notify_waiters();
        true
    }

    /// Runs `listener` with the raw outcome, now if already completed.
    pub fn add_listener(&self, listener: impl FnOnce(&Result<Bytes>) + Send + 'static) {
        {
            let mut listeners = self.0.listeners.lock();
            if let Some(listeners) = listeners.as_mut() {
                listeners.push(Box::new(listener));
                return;
            }
        }
        if let Some(outcome) = self.0.outcome.get() {
            listener(outcome);
        }
    }

    /// Runs `listener` with the decoded outcome.
    pub fn add_typed_listener<V: DeserializeOwned>(
        &self,
        listener: impl FnOnce(Result<V>) + Send + 'static,
    ) {
        let serializer = self.0.serializer;
        self.add_listener(move |outcome| {
            listener(match outcome {
                Ok(payload) => serializer.deserialize(payload),
                Err(e) => Err(e.clone()),
            });
        });
    }

    /// Waits for the raw outcome.
    pub async fn outcome(&self) -> Result<Bytes> {
        loop {
            let notified = self.0.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.0.outcome.get() {
                return outcome.clone();
            }
            notified.await;
        }
    }

    /// Waits for the outcome and decodes it as `V`.
    ///
    /// # Errors
    ///
    /// Returns the call's error, or a deserialize error if the payload is not a `V`.
    pub async fn get<V: DeserializeOwned>(&self) -> Result<V> {
        let payload = self.outcome().await?;
        self.0.serializer.deserialize(&payload)
    }
}

impl std::fmt::Debug for InvokeFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeFuture")
            .field("invoke_id", &self.0.invoke_id)
            .field("sent", &self.is_sent())
            .field("done", &self.is_done())
            .finish()
    }
}

/// Outstanding calls of a client, keyed by invoke id, and by channel id too for broadcast
/// calls which share one invoke id across targets.
#[derive(Default)]
pub struct FutureTable {
    next_id: AtomicU64,
    round: DashMap<u64, InvokeFuture, RandomState>,
    broadcast: DashMap<(u64, u64), InvokeFuture, RandomState>,
}

impl FutureTable {
    pub fn next_invoke_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, future: &InvokeFuture) {
        match (future.0.broadcast, future.channel()) {
            (true, Some(channel)) => {
                self.broadcast
                    .insert((channel.id(), future.invoke_id()), future.clone());
            }
            _ => {
                self.round.insert(future.invoke_id(), future.clone());
            }
        }
    }

    fn remove(&self, channel_id: u64, invoke_id: u64) -> Option<InvokeFuture> {
        self.round
            .remove_if(&invoke_id, |_, f| {
                f.channel().is_none_or(|c| c.id() == channel_id)
            })
            .map(|(_, f)| f)
            .or_else(|| {
                self.broadcast
                    .remove(&(channel_id, invoke_id))
                    .map(|(_, f)| f)
            })
    }

    /// Completes the call `response` answers. Returns `false` for a late or unknown response.
    pub fn received(&self, channel_id: u64, response: Response) -> bool {
        let Some(future) = self.remove(channel_id, response.invoke_id) else {
            tracing::warn!(
                "drop late response {} on channel {channel_id}: {:?}",
                response.invoke_id,
                response.status
            );
            return false;
        };
        let remote = future.channel().map(|c| c.remote().to_string());
        if let Some(channel) = future.channel() {
            for hook in &future.0.hooks {
                hook.after(&response, channel);
            }
        }
        future.complete(response.into_outcome(remote.as_deref()))
    }

    /// Fails a call whose request could not be written.
    pub fn failed(&self, future: &InvokeFuture, error: &Error) {
        let channel_id = future.channel().map_or(0, |c| c.id());
        let response = Response::failure(
            future.invoke_id(),
            Status::ClientError,
            future.0.serializer,
            &Error::new(ErrorKind::ClientError, error.to_string()),
        );
        self.received(channel_id, response);
    }

    /// Times out every call past its deadline: `ServerTimeout` if the request was sent,
    /// `ClientTimeout` otherwise.
    pub fn scan_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<InvokeFuture> = self
            .round
            .iter()
            .map(|e| e.value().clone())
            .chain(self.broadcast.iter().map(|e| e.value().clone()))
            .filter(|f| !f.is_done() && f.is_timed_out(now))
            .collect();
        for future in expired {
            let status = if future.is_sent() {
                Status::ServerTimeout
            } else {
                Status::ClientTimeout
            };
            let channel_id = future.channel().map_or(0, |c| c.id());
            tracing::warn!(
                "invoke {} timed out after {:?}: {status:?}",
                future.invoke_id(),
                future.timeout()
            );
            self.received(channel_id, Response::local(future.invoke_id(), status));
        }
    }

    /// Runs [`Self::scan_timeouts`] every `interval` until `supervisor` stops.
    pub fn start_scanner(self: &Arc<Self>, supervisor: &TaskSupervisor, interval: Duration) {
        let table = Arc::downgrade(self);
        supervisor.spawn("invoke timeout scan", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(table) = table.upgrade() else {
                    return;
                };
                table.scan_timeouts();
            }
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.round.len() + self.broadcast.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for FutureTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureTable")
            .field("outstanding", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::detached_channel;
    use std::sync::atomic::AtomicUsize;

    fn round_future(table: &FutureTable, channel: &Arc<Channel>, timeout: Duration) -> InvokeFuture {
        let future = InvokeFuture::new(
            table.next_invoke_id(),
            channel.clone(),
            false,
            SerializerType::MessagePack,
            timeout,
            Vec::new(),
        );
        table.register(&future);
        future
    }

    #[tokio::test]
    async fn test_single_completion() {
        let table = FutureTable::default();
        let (channel, _rx) = detached_channel(1);
        let future = round_future(&table, &channel, Duration::from_secs(3));

        let payload = SerializerType::MessagePack.serialize(&42u32).unwrap();
        let response = Response::new(
            future.invoke_id(),
            Status::Ok,
            SerializerType::MessagePack,
            payload,
        );
        assert!(table.received(channel.id(), response.clone()));
        assert!(!table.received(channel.id(), response));
        assert!(!future.complete(Err(Error::kind(ErrorKind::ServerTimeout))));
        assert_eq!(future.get::<u32>().await.unwrap(), 42);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_listeners_before_and_after_completion() {
        let future = InvokeFuture::detached(1, SerializerType::Json);
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let fired = fired.clone();
            future.add_typed_listener(move |r: Result<String>| {
                assert_eq!(r.unwrap(), "ok");
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        future.complete(SerializerType::Json.serialize("ok"));
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        let late = fired.clone();
        future.add_listener(move |r| {
            assert!(r.is_ok());
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_kind_depends_on_sent() {
        let table = FutureTable::default();
        let (channel, _rx) = detached_channel(1);
        let unsent = round_future(&table, &channel, Duration::from_millis(100));
        let sent = round_future(&table, &channel, Duration::from_millis(100));
        sent.mark_sent();

        tokio::time::advance(Duration::from_millis(50)).await;
        table.scan_timeouts();
        assert!(!unsent.is_done() && !sent.is_done());

        tokio::time::advance(Duration::from_millis(60)).await;
        table.scan_timeouts();
        assert_eq!(unsent.outcome().await.unwrap_err().kind, ErrorKind::ClientTimeout);
        let error = sent.outcome().await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::ServerTimeout);
        assert_eq!(error.remote.as_deref(), Some("127.0.0.1:9000"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_futures_keyed_by_channel() {
        let table = FutureTable::default();
        let (a, _ra) = detached_channel(1);
        let (b, _rb) = detached_channel(1);
        let id = table.next_invoke_id();
        let futures: Vec<_> = [&a, &b]
            .into_iter()
            .map(|channel| {
                let future = InvokeFuture::new(
                    id,
                    channel.clone(),
                    true,
                    SerializerType::MessagePack,
                    Duration::from_secs(3),
                    Vec::new(),
                );
                table.register(&future);
                future
            })
            .collect();
        assert_eq!(table.len(), 2);

        assert!(table.received(b.id(), Response::local(id, Status::Ok)));
        assert!(!futures[0].is_done());
        assert!(futures[1].is_done());
        assert!(table.received(a.id(), Response::local(id, Status::ServiceNotFound)));
        assert_eq!(
            futures[0].outcome().await.unwrap_err().kind,
            ErrorKind::ServiceNotFound
        );
    }

    #[tokio::test]
    async fn test_write_failure_completes_with_client_error() {
        let table = FutureTable::default();
        let (channel, _rx) = detached_channel(1);
        let future = round_future(&table, &channel, Duration::from_secs(3));
        table.failed(&future, &Error::kind(ErrorKind::TcpSendMsgFailed));
        let error = future.outcome().await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::ClientError);
        assert!(error.msg.contains("TcpSendMsgFailed"));
    }
}
