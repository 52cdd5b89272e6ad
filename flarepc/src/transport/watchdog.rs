use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use tokio::sync::watch;

use super::{Channel, ChannelGroup, FrameHandler, IdlePolicy, dial, start_channel};
use crate::{
    Error, ErrorKind, Result, TaskSupervisor, config::TransportConfig, meta::Address,
    protocol::Frame,
};

const MAX_ATTEMPTS: u32 = 12;

/// Delay before reconnect attempt number `attempts`.
#[must_use]
pub fn backoff(attempts: u32) -> Duration {
    Duration::from_millis(2u64 << attempts.min(MAX_ATTEMPTS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectState {
    Pending,
    Connected,
    Cancelled,
}

/// Keeps one logical connection to an address alive.
///
/// The watchdog sits in front of the real frame handler: it adds new channels to the owning
/// group, removes them when they die, and reconnects with capped exponential backoff while
/// it is started and the group is under capacity. `stop()` flips it off immediately; a dial
/// already in flight completes and is then dropped.
pub struct ConnectionWatchdog {
    address: Address,
    group: Option<Arc<ChannelGroup>>,
    handler: Arc<dyn FrameHandler>,
    started: AtomicBool,
    attempts: AtomicU32,
    connected: watch::Sender<ConnectState>,
    supervisor: Arc<TaskSupervisor>,
    config: TransportConfig,
    me: Weak<ConnectionWatchdog>,
}

impl ConnectionWatchdog {
    pub fn new(
        address: Address,
        group: Option<Arc<ChannelGroup>>,
        handler: Arc<dyn FrameHandler>,
        supervisor: Arc<TaskSupervisor>,
        config: &TransportConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            address,
            group,
            handler,
            started: AtomicBool::new(true),
            attempts: AtomicU32::new(0),
            connected: watch::Sender::new(ConnectState::Pending),
            supervisor,
            config: config.clone(),
            me: me.clone(),
        })
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
        self.connected.send_if_modified(|state| {
            if *state == ConnectState::Pending {
                *state = ConnectState::Cancelled;
                true
            } else {
                false
            }
        });
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Resolves `true` once any connect succeeded, `false` if the watchdog was stopped first.
    pub async fn wait_connected(&self) -> bool {
        let mut rx = self.connected.subscribe();
        matches!(
            rx.wait_for(|state| *state != ConnectState::Pending)
                .await
                .as_deref(),
            Ok(ConnectState::Connected)
        )
    }

    /// One dial attempt. On success the new channel is already in the group.
    ///
    /// # Errors
    ///
    /// Returns `TcpConnectFailed` if the dial fails, `Shutdown` if the watchdog was stopped
    /// while dialing.
    pub async fn connect(&self) -> Result<Arc<Channel>> {
        let stream = dial(&self.address, self.config.connect_timeout).await?;
        let Some(me) = self.me.upgrade() else {
            return Err(Error::kind(ErrorKind::Shutdown));
        };
        if !self.is_started() || self.supervisor.is_stopped() {
            return Err(Error::new(
                ErrorKind::Shutdown,
                format!("reconnect to {} cancelled", self.address),
            ));
        }
        start_channel(
            stream,
            me,
            &self.supervisor,
            &self.config,
            IdlePolicy::dialer(&self.config),
        )
    }

    fn is_reconnect_needed(&self) -> bool {
        self.is_started()
            && !self.supervisor.is_stopped()
            && self
                .group
                .as_ref()
                .is_none_or(|group| group.len() < group.capacity())
    }

    pub(crate) fn schedule_reconnect(&self) {
        if !self.is_reconnect_needed() {
            tracing::debug!("no reconnect needed for {}", self.address);
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let attempts = self
            .attempts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some((n + 1).min(MAX_ATTEMPTS))
            })
            .map_or(MAX_ATTEMPTS, |n| (n + 1).min(MAX_ATTEMPTS));
        let delay = backoff(attempts);
        tracing::debug!("reconnect to {} in {delay:?} (attempt {attempts})", self.address);

        self.supervisor.spawn("reconnect", async move {
            tokio::time::sleep(delay).await;
            if !me.is_reconnect_needed() {
                tracing::warn!("cancel reconnecting to {}", me.address);
                return;
            }
            match me.connect().await {
                Ok(channel) => tracing::info!("reconnected to {} ({})", me.address, channel.id()),
                Err(e) => {
                    tracing::warn!("reconnect to {} failed: {e}", me.address);
                    me.schedule_reconnect();
                }
            }
        });
    }
}

impl FrameHandler for ConnectionWatchdog {
    fn on_active(&self, channel: &Arc<Channel>) {
        if !self.is_started() {
            channel.close();
            return;
        }
        self.attempts.store(0, Ordering::Release);
        if let Some(group) = &self.group {
            group.add(channel.clone());
        }
        self.handler.on_active(channel);
        self.connected.send_replace(ConnectState::Connected);
    }

    fn on_frame(&self, channel: &Arc<Channel>, frame: Frame) -> Result<()> {
        self.handler.on_frame(channel, frame)
    }

    fn on_inactive(&self, channel: &Arc<Channel>) {
        if let Some(group) = &self.group {
            group.remove(channel);
        }
        self.handler.on_inactive(channel);
        self.schedule_reconnect();
    }
}

impl std::fmt::Debug for ConnectionWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWatchdog")
            .field("address", &self.address)
            .field("started", &self.is_started())
            .field("attempts", &self.attempts())
            .finish()
    }
}
