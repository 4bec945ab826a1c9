//! Round-robin policy: the base of most policy chains.
//!
//! Grounded on `original_source/cpp-driver/src/round_robin_policy.hpp`'s
//! atomic rotating index, re-expressed with `AtomicUsize` instead of the
//! original's `uv_rwlock_t`-guarded counter.

use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};

use super::{LoadBalancingPolicy, QueryPlan, QueryPlanRequest};
use crate::{
    host::{Distance, Host},
    token_map::TokenMap,
};

/// Every host is LOCAL; each query plan starts at the next position in a
/// shared rotating index so concurrent requests spread evenly across hosts.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn init(&self, _connected_host: Option<&Host>, _hosts: &[Arc<Host>], _local_dc: &str) {}

    fn distance(&self, _host: &Host) -> Distance {
        Distance::Local
    }

    fn on_host_added(&self, _host: &Arc<Host>) {}
    fn on_host_removed(&self, _host: &Arc<Host>) {}
    fn on_host_up(&self, _host: &Arc<Host>) {}
    fn on_host_down(&self, _host: &Arc<Host>) {}

    fn new_query_plan(
        &self,
        _request: &QueryPlanRequest,
        _token_map: Option<&TokenMap>,
        hosts: &[Arc<Host>],
    ) -> QueryPlan {
        if hosts.is_empty() {
            return Box::new(std::iter::empty());
        }
        let len = hosts.len();
        let start = self.index.fetch_add(1, Ordering::Relaxed) % len;
        let rotated: Vec<Arc<Host>> =
            hosts[start..].iter().chain(hosts[..start].iter()).cloned().collect();
        Box::new(rotated.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn host(n: u8) -> Arc<Host> {
        Arc::new(Host::new(crate::host::Address::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, n)), 9042)))
    }

    #[test]
    fn successive_plans_start_at_different_hosts() {
        let policy = RoundRobinPolicy::new();
        let hosts = vec![host(1), host(2), host(3)];
        let request = QueryPlanRequest::default();

        let first: Vec<_> = policy.new_query_plan(&request, None, &hosts).collect();
        let second: Vec<_> = policy.new_query_plan(&request, None, &hosts).collect();

        assert_eq!(first.len(), 3);
        assert_ne!(first[0].address, second[0].address);
    }
}
