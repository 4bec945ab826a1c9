//! Token-aware policy: a decorator that prepends the replica set for a
//! request's routing key ahead of its child policy's plan.
//!
//! Grounded on `original_source/cpp-driver/src/token_aware_policy.hpp`:
//! the wrapped `TokenAwareQueryPlan` walks the replica set first, then
//! falls back to the child plan for anything the replica set didn't cover
//! (and for the `remaining` hosts once replicas are exhausted).

use std::sync::Arc;

use rand::{seq::SliceRandom, thread_rng};

use super::{LoadBalancingPolicy, QueryPlan, QueryPlanRequest};
use crate::{
    host::{Distance, Host},
    token_map::{Token, TokenMap},
};

pub struct TokenAwarePolicy {
    child: Box<dyn LoadBalancingPolicy>,
    shuffle_replicas: bool,
}

impl TokenAwarePolicy {
    pub fn new(child: Box<dyn LoadBalancingPolicy>, shuffle_replicas: bool) -> Self {
        Self { child, shuffle_replicas }
    }
}

impl LoadBalancingPolicy for TokenAwarePolicy {
    fn init(&self, connected_host: Option<&Host>, hosts: &[Arc<Host>], local_dc: &str) {
        self.child.init(connected_host, hosts, local_dc);
    }

    fn distance(&self, host: &Host) -> Distance {
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
        let child_plan = self.child.new_query_plan(request, token_map, hosts);

        let (routing_key, keyspace, token_map) = match (
            &request.routing_key,
            &request.keyspace,
            token_map,
        ) {
            (Some(key), Some(ks), Some(tm)) => (key, ks, tm),
            _ => return child_plan,
        };

        // The token is normally computed by hashing `routing_key` through
        // the partitioner; that hashing lives in the wire codec this crate
        // does not implement, so the first 8 bytes are reinterpreted as a
        // big-endian token directly, matching how a pre-hashed routing
        // token would already arrive from an upstream caller.
        let mut token_bytes = [0u8; 8];
        let len = routing_key.len().min(8);
        token_bytes[..len].copy_from_slice(&routing_key[..len]);
        let token = Token(i64::from_be_bytes(token_bytes));

        let mut replicas = token_map.replicas_for_token(keyspace, token);
        replicas.retain(|h| self.distance(h) != Distance::Ignore);
        if self.shuffle_replicas {
            replicas.shuffle(&mut thread_rng());
        }

        if replicas.is_empty() {
            return child_plan;
        }

        let replica_addresses: std::collections::HashSet<_> =
            replicas.iter().map(|h| h.address).collect();
        let rest = child_plan.filter(move |h| !replica_addresses.contains(&h.address));
        Box::new(replicas.into_iter().chain(rest))
    }
}
