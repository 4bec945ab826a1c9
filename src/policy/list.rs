//! Whitelist/blacklist policies: filter a child policy's hosts by address
//! or datacenter.
//!
//! Grounded on `original_source/cpp-driver/src/blacklist_dc_policy.hpp`
//! (and its three siblings, not themselves present in `original_source/`
//! but identical in shape): a decorator holding a set and an "is this host
//! allowed" predicate, delegating everything else to its child.

use std::{collections::HashSet, sync::Arc};

use super::{LoadBalancingPolicy, QueryPlan, QueryPlanRequest};
use crate::{
    host::{Address, Distance, Host},
    token_map::TokenMap,
};

enum Filter {
    WhitelistAddresses(HashSet<Address>),
    BlacklistAddresses(HashSet<Address>),
    WhitelistDcs(HashSet<String>),
    BlacklistDcs(HashSet<String>),
}

impl Filter {
    fn allows(&self, host: &Host) -> bool {
        match self {
            Filter::WhitelistAddresses(set) => set.contains(&host.address),
            Filter::BlacklistAddresses(set) => !set.contains(&host.address),
            Filter::WhitelistDcs(set) => set.contains(&host.datacenter),
            Filter::BlacklistDcs(set) => !set.contains(&host.datacenter),
        }
    }
}

/// Composable address/DC filter wrapping a child policy. Construct with
/// [`ListPolicy::whitelist_addresses`], [`ListPolicy::blacklist_addresses`],
/// [`ListPolicy::whitelist_dcs`], or [`ListPolicy::blacklist_dcs`].
pub struct ListPolicy {
    child: Box<dyn LoadBalancingPolicy>,
    filter: Filter,
}

impl ListPolicy {
    pub fn whitelist_addresses(child: Box<dyn LoadBalancingPolicy>, addresses: HashSet<Address>) -> Self {
        Self { child, filter: Filter::WhitelistAddresses(addresses) }
    }

    pub fn blacklist_addresses(child: Box<dyn LoadBalancingPolicy>, addresses: HashSet<Address>) -> Self {
        Self { child, filter: Filter::BlacklistAddresses(addresses) }
    }

    pub fn whitelist_dcs(child: Box<dyn LoadBalancingPolicy>, dcs: HashSet<String>) -> Self {
        Self { child, filter: Filter::WhitelistDcs(dcs) }
    }

    pub fn blacklist_dcs(child: Box<dyn LoadBalancingPolicy>, dcs: HashSet<String>) -> Self {
        Self { child, filter: Filter::BlacklistDcs(dcs) }
    }
}

impl LoadBalancingPolicy for ListPolicy {
    fn init(&self, connected_host: Option<&Host>, hosts: &[Arc<Host>], local_dc: &str) {
        self.child.init(connected_host, hosts, local_dc);
    }

    fn distance(&self, host: &Host) -> Distance {
        if !self.filter.allows(host) {
            return Distance::Ignore;
        }
        self.child.distance(host)
    }

    fn on_host_added(&self, host: &Arc<Host>) {
        self.child.on_host_added(host);
    }
    fn on_host_removed(&self, host: &Arc<Host>) {
        self.child.on_host_removed(host);
    }
    fn on_host_up(&self, host: &Arc<Host>) {
        self.child.on_host_up(host);
    }
    fn on_host_down(&self, host: &Arc<Host>) {
        self.child.on_host_down(host);
    }

    fn new_query_plan(
        &self,
        request: &QueryPlanRequest,
        token_map: Option<&TokenMap>,
        hosts: &[Arc<Host>],
    ) -> QueryPlan {
        let allowed: Vec<Arc<Host>> = hosts.iter().filter(|h| self.filter.allows(h)).cloned().collect();
        self.child.new_query_plan(request, token_map, &allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RoundRobinPolicy;
    use std::net::{IpAddr, Ipv4Addr};

    fn host(n: u8) -> Arc<Host> {
        Arc::new(Host::new(Address::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, n)), 9042)))
    }

    #[test]
    fn blacklist_excludes_the_listed_address() {
        let mut blocked = HashSet::new();
        blocked.insert(host(2).address);
        let policy = ListPolicy::blacklist_addresses(Box::new(RoundRobinPolicy::new()), blocked);

        let hosts = vec![host(1), host(2), host(3)];
        let plan: Vec<_> = policy
            .new_query_plan(&QueryPlanRequest::default(), None, &hosts)
            .collect();

        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|h| h.address != host(2).address));
    }
}
