use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use foldhash::fast::RandomState;
use parking_lot::Mutex;

use super::ChannelGroup;
use crate::meta::{Address, ServiceMeta};

/// How many directory lists reference each channel group.
#[derive(Debug, Default)]
pub struct GroupRefCounts(DashMap<Address, usize, RandomState>);

impl GroupRefCounts {
    fn increment(&self, address: &Address) -> usize {
        let mut count = self.0.entry(address.clone()).or_insert(0);
        *count += 1;
        *count
    }

    fn decrement(&self, address: &Address) -> usize {
        let remaining = match self.0.get_mut(address) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return 0,
        };
        if remaining == 0 {
            self.0.remove_if(address, |_, count| *count == 0);
        }
        remaining
    }

    #[must_use]
    pub fn get(&self, address: &Address) -> usize {
        self.0.get(address).map_or(0, |count| *count)
    }
}

/// Ordered channel groups serving one directory.
///
/// Reads load an immutable snapshot without locking; `add_if_absent` and `remove` copy the
/// list under a lock held only by writers, so a snapshot taken before a mutation never
/// observes it.
#[derive(Debug)]
pub struct CopyOnWriteGroupList {
    groups: ArcSwap<Vec<Arc<ChannelGroup>>>,
    write_lock: Mutex<()>,
    ref_counts: Arc<GroupRefCounts>,
}

impl CopyOnWriteGroupList {
    #[must_use]
    pub fn new(ref_counts: Arc<GroupRefCounts>) -> Self {
        Self {
            groups: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            ref_counts,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<ChannelGroup>>> {
        self.groups.load_full()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.load().is_empty()
    }

    #[must_use]
    pub fn contains(&self, group: &ChannelGroup) -> bool {
        self.groups
            .load()
            .iter()
            .any(|g| g.address() == group.address())
    }

    /// Returns `false` if a group for the same address is already listed.
    pub fn add_if_absent(&self, group: Arc<ChannelGroup>) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.groups.load();
        if current.iter().any(|g| g.address() == group.address()) {
            return false;
        }
        self.ref_counts.increment(group.address());
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(group);
        self.groups.store(Arc::new(next));
        true
    }

    /// Returns `false` if no group for that address was listed.
    pub fn remove(&self, group: &ChannelGroup) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.groups.load();
        if !current.iter().any(|g| g.address() == group.address()) {
            return false;
        }
        let next: Vec<_> = current
            .iter()
            .filter(|g| g.address() != group.address())
            .cloned()
            .collect();
        self.groups.store(Arc::new(next));
        self.ref_counts.decrement(group.address());
        true
    }
}

/// Directory to channel-group list registry, plus the reference counts that decide when an
/// address may stop reconnecting.
#[derive(Debug, Default)]
pub struct DirectoryGroup {
    lists: DashMap<ServiceMeta, Arc<CopyOnWriteGroupList>, RandomState>,
    ref_counts: Arc<GroupRefCounts>,
}

impl DirectoryGroup {
    /// Returns the list for `directory`, creating it on first use.
    pub fn find(&self, directory: &ServiceMeta) -> Arc<CopyOnWriteGroupList> {
        if let Some(list) = self.lists.get(directory) {
            return list.clone();
        }
        self.lists
            .entry(directory.clone())
            .or_insert_with(|| Arc::new(CopyOnWriteGroupList::new(self.ref_counts.clone())))
            .clone()
    }

    #[must_use]
    pub fn ref_count(&self, group: &ChannelGroup) -> usize {
        self.ref_counts.get(group.address())
    }

    #[must_use]
    pub fn directories(&self) -> Vec<ServiceMeta> {
        self.lists.iter().map(|e| e.key().clone()).collect()
    }
}
