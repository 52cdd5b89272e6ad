use std::{
    cell::RefCell,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{meta::ServiceMeta, transport::ChannelGroup};

#[derive(
    clap::ValueEnum, Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, Hash,
)]
pub enum LoadBalancerType {
    #[default]
    Random,
    RoundRobin,
}

impl LoadBalancerType {
    #[must_use]
    pub fn create(self) -> Arc<dyn LoadBalancer> {
        match self {
            LoadBalancerType::Random => Arc::new(RandomLoadBalancer),
            LoadBalancerType::RoundRobin => Arc::new(RoundRobinLoadBalancer::default()),
        }
    }
}

/// Picks one of the groups serving a directory.
pub trait LoadBalancer: Send + Sync {
    fn select(
        &self,
        groups: &[Arc<ChannelGroup>],
        directory: &ServiceMeta,
    ) -> Option<Arc<ChannelGroup>>;
}

/// Configured weight of `group` for `directory`, ramped linearly from 0 over the group's
/// warm-up window.
#[must_use]
pub fn effective_weight(group: &ChannelGroup, directory: &ServiceMeta) -> u32 {
    let weight = group.weight(directory);
    let warm_up = group.warm_up().as_millis();
    let up_time = group.up_time().as_millis();
    if warm_up == 0 || up_time >= warm_up {
        return weight;
    }
    u32::try_from(u128::from(weight) * up_time / warm_up).unwrap_or(weight)
}

thread_local! {
    static WEIGHTS: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
}

/// Weighted random selection.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomLoadBalancer;

impl LoadBalancer for RandomLoadBalancer {
    fn select(
        &self,
        groups: &[Arc<ChannelGroup>],
        directory: &ServiceMeta,
    ) -> Option<Arc<ChannelGroup>> {
        match groups {
            [] => return None,
            [only] => return Some(only.clone()),
            _ => {}
        }

        WEIGHTS.with_borrow_mut(|weights| {
            weights.clear();
            let mut sum = 0u64;
            let mut same = true;
            for group in groups {
                let weight = effective_weight(group, directory);
                same &= weights.first().is_none_or(|first| *first == weight);
                sum += u64::from(weight);
                weights.push(weight);
            }

            let mut rng = rand::thread_rng();
            if same || sum == 0 {
                return Some(groups[rng.gen_range(0..groups.len())].clone());
            }
            let mut offset = rng.gen_range(0..sum);
            for (group, weight) in groups.iter().zip(weights.iter()) {
                let weight = u64::from(*weight);
                if offset < weight {
                    return Some(group.clone());
                }
                offset -= weight;
            }
            groups.last().cloned()
        })
    }
}

/// Ignores weights and cycles through the groups.
#[derive(Debug, Default)]
pub struct RoundRobinLoadBalancer {
    index: AtomicUsize,
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn select(
        &self,
        groups: &[Arc<ChannelGroup>],
        _directory: &ServiceMeta,
    ) -> Option<Arc<ChannelGroup>> {
        if groups.is_empty() {
            return None;
        }
        let index = self.index.fetch_add(1, Ordering::Relaxed);
        Some(groups[index % groups.len()].clone())
    }
}
