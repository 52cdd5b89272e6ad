use std::{hash::Hash, sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::DashMap;
use foldhash::fast::RandomState;
use tokio::time::Instant;

use crate::{meta::ServiceMeta, transport::Channel};

/// A sent message waiting for its ACK.
#[derive(Debug, Clone)]
pub struct NonAckRecord {
    pub bytes: Bytes,
    /// Service and version the message was built for; retransmits of a superseded version
    /// are dropped.
    pub service: Option<ServiceMeta>,
    pub version: u64,
    /// Channel the message went out on, when the retransmit must reuse it.
    pub channel: Option<Arc<Channel>>,
    pub timestamp: Instant,
}

impl NonAckRecord {
    #[must_use]
    pub fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            service: None,
            version: 0,
            channel: None,
            timestamp: Instant::now(),
        }
    }

    #[must_use]
    pub fn for_version(mut self, service: ServiceMeta, version: u64) -> Self {
        self.service = Some(service);
        self.version = version;
        self
    }

    #[must_use]
    pub fn on_channel(mut self, channel: Arc<Channel>) -> Self {
        self.channel = Some(channel);
        self
    }
}

/// Unacknowledged messages, at most one record per key.
#[derive(Debug)]
pub struct NonAckTable<K: Eq + Hash> {
    records: DashMap<K, NonAckRecord, RandomState>,
}

impl<K: Eq + Hash> Default for NonAckTable<K> {
    fn default() -> Self {
        Self {
            records: DashMap::default(),
        }
    }
}

impl<K: Eq + Hash + Clone> NonAckTable<K> {
    pub fn insert(&self, key: K, record: NonAckRecord) {
        self.records.insert(key, record);
    }

    /// Removes the record for `key`. Returns `false` for an unknown or already acked key.
    pub fn ack(&self, key: &K) -> bool {
        self.records.remove(key).is_some()
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.records.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Removes and returns every record older than `grace`. Callers re-insert the ones they
    /// send again, with a fresh timestamp.
    pub fn take_expired(&self, grace: Duration) -> Vec<(K, NonAckRecord)> {
        let now = Instant::now();
        let keys: Vec<K> = self
            .records
            .iter()
            .filter(|e| now.duration_since(e.timestamp) > grace)
            .map(|e| e.key().clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| self.records.remove(&key))
            .collect()
    }

    pub fn retain(&self, f: impl FnMut(&K, &mut NonAckRecord) -> bool) {
        self.records.retain(f);
    }
}
