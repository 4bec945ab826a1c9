//! Datacenter-aware policy: prefers the local datacenter, allowing a
//! bounded number of hosts per remote datacenter as a fallback.
//!
//! Grounded on the `dc_aware_policy` described in `load_balancing.hpp`:
//! emits LOCAL hosts in rotation first, appends up to
//! `used_hosts_per_remote_dc` REMOTE hosts, and IGNOREs the rest.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use super::{LoadBalancingPolicy, QueryPlan, QueryPlanRequest};
use crate::{
    host::{Address, Distance, Host},
    token_map::TokenMap,
};

pub struct DcAwarePolicy {
    local_dc: RwLock<String>,
    used_hosts_per_remote_dc: usize,
    /// The first `used_hosts_per_remote_dc` hosts discovered per remote
    /// datacenter; everything else in that DC is IGNOREd. Populated at
    /// `init`/`on_host_added` time, matching the original's "enabled remote
    /// hosts" bookkeeping rather than recomputed per `distance()` call.
    enabled_remote: RwLock<HashMap<String, HashSet<Address>>>,
    index: AtomicUsize,
}

impl DcAwarePolicy {
    /// `local_dc` may be empty, in which case `init` discovers it from the
    /// control connection's host.
    pub fn new(local_dc: impl Into<String>, used_hosts_per_remote_dc: usize) -> Self {
        Self {
            local_dc: RwLock::new(local_dc.into()),
            used_hosts_per_remote_dc,
            enabled_remote: RwLock::new(HashMap::new()),
            index: AtomicUsize::new(0),
        }
    }

    fn local_dc(&self) -> String {
        self.local_dc.read().unwrap().clone()
    }

    fn enable_if_room(&self, host: &Host) {
        if host.datacenter == self.local_dc() || self.used_hosts_per_remote_dc == 0 {
            return;
        }
        let mut enabled = self.enabled_remote.write().unwrap();
        let dc_set = enabled.entry(host.datacenter.clone()).or_default();
        if dc_set.len() < self.used_hosts_per_remote_dc {
            dc_set.insert(host.address);
        }
    }
}

impl LoadBalancingPolicy for DcAwarePolicy {
    fn init(&self, connected_host: Option<&Host>, hosts: &[Arc<Host>], local_dc: &str) {
        if self.local_dc().is_empty() {
            let discovered = if !local_dc.is_empty() {
                local_dc.to_string()
            } else {
                connected_host.map(|h| h.datacenter.clone()).unwrap_or_default()
            };
            *self.local_dc.write().unwrap() = discovered;
        }
        for host in hosts {
            self.enable_if_room(host);
        }
    }

    fn distance(&self, host: &Host) -> Distance {
        if host.datacenter == self.local_dc() {
            return Distance::Local;
        }
        let enabled = self.enabled_remote.read().unwrap();
        match enabled.get(&host.datacenter) {
            Some(set) if set.contains(&host.address) => Distance::Remote,
            _ => Distance::Ignore,
        }
    }

    fn on_host_added(&self, host: &Arc<Host>) {
        self.enable_if_room(host);
    }

    fn on_host_removed(&self, host: &Arc<Host>) {
        if let Some(set) = self.enabled_remote.write().unwrap().get_mut(&host.datacenter) {
            set.remove(&host.address);
        }
    }

    fn on_host_up(&self, host: &Arc<Host>) {
        self.enable_if_room(host);
    }

    fn on_host_down(&self, _host: &Arc<Host>) {}

    fn new_query_plan(
        &self,
        _request: &QueryPlanRequest,
        _token_map: Option<&TokenMap>,
        hosts: &[Arc<Host>],
    ) -> QueryPlan {
        let mut candidates: Vec<Arc<Host>> =
            hosts.iter().filter(|h| self.distance(h) != Distance::Ignore).cloned().collect();
        candidates.sort_by_key(|h| self.distance(h) != Distance::Local);

        if candidates.is_empty() {
            return Box::new(std::iter::empty());
        }
        let local_count = candidates.iter().filter(|h| self.distance(h) == Distance::Local).count();
        if local_count > 0 {
            let start = self.index.fetch_add(1, Ordering::Relaxed) % local_count;
            let (local, remote) = candidates.split_at_mut(local_count);
            local.rotate_left(start);
            let mut ordered = local.to_vec();
            ordered.extend_from_slice(remote);
            Box::new(ordered.into_iter())
        } else {
            Box::new(candidates.into_iter())
        }
    }
}
