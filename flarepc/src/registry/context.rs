use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use foldhash::fast::RandomState;
use parking_lot::Mutex;

use crate::meta::{Address, RegisterMeta, ServiceMeta};

/// A value with a version that increases on every mutation.
#[derive(Debug, Default)]
pub struct ConfigWithVersion<T> {
    version: u64,
    config: T,
}

impl<T> ConfigWithVersion<T> {
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Bumps and returns the version.
    pub fn new_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    #[must_use]
    pub fn config(&self) -> &T {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut T {
        &mut self.config
    }
}

pub type ServiceMembers = Arc<Mutex<ConfigWithVersion<HashMap<Address, RegisterMeta>>>>;

/// Everything a registry node knows about published services.
#[derive(Debug, Default)]
pub struct RegisterInfoContext {
    members: DashMap<ServiceMeta, ServiceMembers, RandomState>,
    services_by_address: DashMap<Address, Vec<ServiceMeta>, RandomState>,
}

impl RegisterInfoContext {
    /// The members of `service`, created empty on first use. Mutations hold its lock.
    #[must_use]
    pub fn members(&self, service: &ServiceMeta) -> ServiceMembers {
        self.members.entry(service.clone()).or_default().clone()
    }

    /// Current version of `service`, zero if nothing was ever published.
    #[must_use]
    pub fn version(&self, service: &ServiceMeta) -> u64 {
        self.members
            .get(service)
            .map_or(0, |m| m.lock().version())
    }

    pub fn add_service(&self, address: &Address, service: &ServiceMeta) {
        let mut services = self.services_by_address.entry(address.clone()).or_default();
        if !services.contains(service) {
            services.push(service.clone());
        }
    }

    pub fn remove_service(&self, address: &Address, service: &ServiceMeta) {
        if let Some(mut services) = self.services_by_address.get_mut(address) {
            services.retain(|s| s != service);
        }
        self.services_by_address
            .remove_if(address, |_, services| services.is_empty());
    }

    #[must_use]
    pub fn services_by_address(&self, address: &Address) -> Vec<ServiceMeta> {
        self.services_by_address
            .get(address)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn addresses_by_service(&self, service: &ServiceMeta) -> Vec<Address> {
        self.members
            .get(service)
            .map(|m| m.lock().config().keys().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn publisher_hosts(&self) -> Vec<Address> {
        self.services_by_address
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_grow_per_service() {
        let context = RegisterInfoContext::default();
        let service = ServiceMeta::new("g", "svc", "1.0");
        assert_eq!(context.version(&service), 0);

        let members = context.members(&service);
        assert_eq!(members.lock().new_version(), 1);
        assert_eq!(members.lock().new_version(), 2);
        assert_eq!(context.version(&service), 2);
        assert_eq!(context.version(&ServiceMeta::new("g", "other", "1.0")), 0);
    }

    #[test]
    fn test_reverse_index() {
        let context = RegisterInfoContext::default();
        let address = Address::new("10.0.0.1", 9000);
        let a = ServiceMeta::new("g", "a", "1.0");
        let b = ServiceMeta::new("g", "b", "1.0");

        context.add_service(&address, &a);
        context.add_service(&address, &a);
        context.add_service(&address, &b);
        assert_eq!(context.services_by_address(&address), vec![a.clone(), b.clone()]);

        context.remove_service(&address, &a);
        assert_eq!(context.publisher_hosts(), vec![address.clone()]);
        context.remove_service(&address, &b);
        assert!(context.publisher_hosts().is_empty());
    }
}
