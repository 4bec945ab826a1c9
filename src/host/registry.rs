use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use super::{Address, Host};

/// Source of truth for the set of known hosts. Readers take a point-in-time
/// snapshot (an `Arc` clone of the whole map) so query plans never observe a
/// map mutating mid-iteration — a copy-on-write discipline applied at the
/// host-registry level rather than the per-pool level.
#[derive(Debug, Default)]
pub struct HostRegistry {
    inner: RwLock<HashMap<Address, Arc<Host>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self { inner: RwLock::new(HashMap::new()) }
    }

    /// Inserts a newly discovered host, or returns the existing record if
    /// one is already present for this address.
    pub fn get_or_insert(&self, address: Address) -> Arc<Host> {
        if let Some(host) = self.inner.read().unwrap().get(&address) {
            return host.clone();
        }
        let mut guard = self.inner.write().unwrap();
        guard
            .entry(address)
            .or_insert_with(|| Arc::new(Host::new(address)))
            .clone()
    }

    pub fn get(&self, address: &Address) -> Option<Arc<Host>> {
        self.inner.read().unwrap().get(address).cloned()
    }

    /// Removes a host discovered-gone by a REMOVED_NODE event or explicit
    /// user API call. Returns the removed record, if any.
    pub fn remove(&self, address: &Address) -> Option<Arc<Host>> {
        self.inner.write().unwrap().remove(address)
    }

    /// A point-in-time snapshot of every known host, safe to iterate without
    /// holding the registry lock.
    pub fn snapshot(&self) -> Vec<Arc<Host>> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces a host's metadata wholesale (used on MOVED_NODE / refreshed
    /// peers rows) rather than mutating fields in place, so any `Arc<Host>`
    /// held by an in-flight query plan keeps observing the snapshot it
    /// started with.
    pub fn replace(&self, address: Address, mut host: Host) -> Arc<Host> {
        host.bump_generation();
        let host = Arc::new(host);
        self.inner.write().unwrap().insert(address, host.clone());
        host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(n: u8) -> Address {
        Address::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, n)), 9042)
    }

    #[test]
    fn get_or_insert_is_idempotent() {
        let registry = HostRegistry::new();
        let h1 = registry.get_or_insert(addr(1));
        let h2 = registry.get_or_insert(addr(1));
        assert!(Arc::ptr_eq(&h1, &h2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_drops_from_snapshot() {
        let registry = HostRegistry::new();
        registry.get_or_insert(addr(1));
        registry.get_or_insert(addr(2));
        registry.remove(&addr(1));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].address, addr(2));
    }

    #[test]
    fn replace_bumps_generation() {
        let registry = HostRegistry::new();
        let original = registry.get_or_insert(addr(1));
        assert_eq!(original.generation(), 0);

        let mut updated = Host::new(addr(1));
        updated.rack = "rack1".into();
        let replaced = registry.replace(addr(1), updated);
        assert_eq!(replaced.generation(), 1);
        assert_eq!(replaced.rack, "rack1");
        // the old Arc the caller is still holding is untouched (COW).
        assert_eq!(original.rack, "");
    }
}
