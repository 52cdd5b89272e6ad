use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use foldhash::fast::RandomState;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};

use super::Channel;
use crate::{Error, ErrorKind, Result, config::PoolConfig, meta::Address, meta::ServiceMeta};

const NO_DEADLINE: u64 = u64::MAX;

/// All live connections to one remote address.
///
/// Readers take lock-free snapshots of the connection list; `add` and `remove` copy the list
/// under a lock. The group also carries the per-directory weights the load balancer reads and
/// the timestamps that drive warm-up and eviction.
pub struct ChannelGroup {
    address: Address,
    channels: ArcSwap<Vec<Arc<Channel>>>,
    write_lock: Mutex<()>,
    index: AtomicUsize,
    capacity: AtomicUsize,
    warm_up_millis: AtomicU64,
    /// Millis since `origin` of the last membership change.
    timestamp: AtomicU64,
    /// Millis since `origin` after which an empty group may be evicted.
    deadline: AtomicU64,
    weights: DashMap<ServiceMeta, u32, RandomState>,
    available: Notify,
    origin: Instant,
    config: PoolConfig,
}

impl ChannelGroup {
    #[must_use]
    pub fn new(address: Address, config: &PoolConfig) -> Self {
        Self {
            address,
            channels: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            index: AtomicUsize::new(0),
            capacity: AtomicUsize::new(1),
            warm_up_millis: AtomicU64::new(millis(config.warm_up)),
            timestamp: AtomicU64::new(0),
            deadline: AtomicU64::new(NO_DEADLINE),
            weights: DashMap::default(),
            available: Notify::new(),
            origin: Instant::now(),
            config: config.clone(),
        }
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[must_use]
    pub fn channels(&self) -> Arc<Vec<Arc<Channel>>> {
        self.channels.load_full()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.load().is_empty()
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.is_empty()
    }

    /// Round-robin over the live connections, waiting up to `wait_available` for one to
    /// appear.
    ///
    /// # Errors
    ///
    /// Returns `NoChannel` if the group stays empty.
    pub async fn next(&self) -> Result<Arc<Channel>> {
        loop {
            let channels = self.channels.load();
            if !channels.is_empty() {
                let index = self.index.fetch_add(1, Ordering::Relaxed);
                return Ok(channels[index % channels.len()].clone());
            }
            drop(channels);
            if !self.wait_for_available(self.config.wait_available).await {
                return Err(Error::new(
                    ErrorKind::NoChannel,
                    format!("no channel to {}", self.address),
                ));
            }
        }
    }

    /// Returns `false` if `channel` is already a member.
    pub fn add(&self, channel: Arc<Channel>) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.channels.load();
        if current.iter().any(|c| c.id() == channel.id()) {
            return false;
        }
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(channel);
        self.channels.store(Arc::new(next));

        self.timestamp.store(self.now_millis(), Ordering::Release);
        self.deadline.store(NO_DEADLINE, Ordering::Release);
        self.available.notify_waiters();
        true
    }

    /// Returns `false` if `channel` was not a member.
    pub fn remove(&self, channel: &Channel) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.channels.load();
        if !current.iter().any(|c| c.id() == channel.id()) {
            return false;
        }
        let next: Vec<_> = current
            .iter()
            .filter(|c| c.id() != channel.id())
            .cloned()
            .collect();
        let now = self.now_millis();
        self.timestamp.store(now, Ordering::Release);
        if next.is_empty() {
            self.deadline
                .store(now.saturating_add(millis(self.config.loss_interval)), Ordering::Release);
        }
        self.channels.store(Arc::new(next));
        true
    }

    /// Closes and forgets every connection.
    pub fn close_all(&self) {
        let _guard = self.write_lock.lock();
        for channel in self.channels.swap(Arc::default()).iter() {
            channel.close();
        }
    }

    /// Target number of connections; reconnects stop once it is reached.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
    }

    #[must_use]
    pub fn weight(&self, directory: &ServiceMeta) -> u32 {
        self.weights
            .get(directory)
            .map_or(self.config.default_weight, |w| *w)
    }

    pub fn set_weight(&self, directory: &ServiceMeta, weight: u32) {
        self.weights.insert(directory.clone(), weight);
    }

    pub fn remove_weight(&self, directory: &ServiceMeta) {
        self.weights.remove(directory);
    }

    #[must_use]
    pub fn warm_up(&self) -> Duration {
        Duration::from_millis(self.warm_up_millis.load(Ordering::Acquire))
    }

    pub fn set_warm_up(&self, warm_up: Duration) {
        self.warm_up_millis.store(millis(warm_up), Ordering::Release);
    }

    /// Time since the connection list last changed.
    #[must_use]
    pub fn up_time(&self) -> Duration {
        let since = self.timestamp.load(Ordering::Acquire);
        Duration::from_millis(self.now_millis().saturating_sub(since))
    }

    #[must_use]
    pub fn is_warm_up_complete(&self) -> bool {
        self.up_time() >= self.warm_up()
    }

    /// Whether the group has been empty for longer than the loss interval.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        let deadline = self.deadline.load(Ordering::Acquire);
        deadline != NO_DEADLINE && self.now_millis() > deadline
    }

    pub async fn wait_for_available(&self, timeout: Duration) -> bool {
        if self.is_available() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_available() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_available();
            }
        }
    }

    fn now_millis(&self) -> u64 {
        millis(self.origin.elapsed())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl std::fmt::Debug for ChannelGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelGroup")
            .field("address", &self.address)
            .field("channels", &self.len())
            .field("capacity", &self.capacity())
            .field("warm_up", &self.warm_up())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::detached_channel;

    fn group() -> ChannelGroup {
        ChannelGroup::new(Address::new("10.0.0.1", 9000), &PoolConfig::default())
    }

    #[tokio::test]
    async fn test_round_robin_over_channels() {
        let group = group();
        let (a, _ra) = detached_channel(1);
        let (b, _rb) = detached_channel(1);
        assert!(group.add(a.clone()));
        assert!(!group.add(a.clone()));
        assert!(group.add(b.clone()));

        let picked: Vec<u64> = [
            group.next().await.unwrap(),
            group.next().await.unwrap(),
            group.next().await.unwrap(),
        ]
        .iter()
        .map(|c| c.id())
        .collect();
        assert_eq!(picked, vec![a.id(), b.id(), a.id()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_group_acquires_deadline() {
        let group = group();
        let (a, _ra) = detached_channel(1);
        group.add(a.clone());
        assert!(group.is_available());
        assert!(!group.is_expired());

        assert!(group.remove(&a));
        assert!(!group.remove(&a));
        assert!(!group.is_available());
        assert!(!group.is_expired());

        tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
        assert!(group.is_expired());

        group.add(a);
        assert!(!group.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_on_empty_group_waits_then_fails() {
        let group = Arc::new(group());
        let error = group.next().await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::NoChannel);

        let waiter = tokio::spawn({
            let group = group.clone();
            async move { group.next().await.map(|c| c.id()) }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (a, _ra) = detached_channel(1);
        group.add(a.clone());
        assert_eq!(waiter.await.unwrap().unwrap(), a.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_up_restarts_on_membership_change() {
        let group = group();
        group.set_warm_up(Duration::from_secs(10));
        let (a, _ra) = detached_channel(1);
        group.add(a);
        assert!(!group.is_warm_up_complete());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(group.is_warm_up_complete());
        assert_eq!(group.up_time(), Duration::from_secs(10));
    }

    #[test]
    fn test_weights_per_directory() {
        let group = group();
        let svc = ServiceMeta::new("g", "svc", "1.0");
        assert_eq!(group.weight(&svc), 50);
        group.set_weight(&svc, 80);
        assert_eq!(group.weight(&svc), 80);
        group.remove_weight(&svc);
        assert_eq!(group.weight(&svc), 50);
    }
}
