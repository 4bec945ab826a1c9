//! Load-balancing policy interface and the concrete/decorator policies that
//! implement it.
//!
//! Grounded on `original_source/cpp-driver/src/load_balancing.hpp`'s
//! `LoadBalancingPolicy`/`QueryPlan` interface, re-expressed as Rust traits
//! rather than a `RefCounted` class hierarchy: composition (a policy
//! wrapping a `Box<dyn LoadBalancingPolicy>` child) replaces
//! `ChainedLoadBalancingPolicy`.

pub mod dc_aware;
pub mod latency_aware;
pub mod list;
pub mod round_robin;
pub mod token_aware;

use std::sync::Arc;

use crate::{
    host::{Distance, Host},
    token_map::TokenMap,
};

pub use dc_aware::DcAwarePolicy;
pub use latency_aware::LatencyAwarePolicy;
pub use list::ListPolicy;
pub use round_robin::RoundRobinPolicy;
pub use token_aware::TokenAwarePolicy;

/// A request-shaped view a policy needs to build a query plan: the
/// optional routing key (for token-aware prepending) and keyspace.
#[derive(Clone, Debug, Default)]
pub struct QueryPlanRequest {
    pub keyspace: Option<String>,
    pub routing_key: Option<bytes::Bytes>,
}

/// A one-shot, non-thread-safe ordered iterator over hosts for one request.
/// Query plans are one-shot and not thread-safe; each request gets its own.
pub type QueryPlan = Box<dyn Iterator<Item = Arc<Host>> + Send>;

/// Produces per-request ordered host iterators. Implementations may wrap a
/// child policy (token-aware, latency-aware, list policies all do) rather
/// than deriving from a base class.
pub trait LoadBalancingPolicy: Send + Sync {
    /// One-time setup; `local_dc` may be empty if the caller has not
    /// determined one (e.g. DC-aware policy discovers it from
    /// `connected_host`).
    fn init(&self, connected_host: Option<&Host>, hosts: &[Arc<Host>], local_dc: &str);

    fn distance(&self, host: &Host) -> Distance;

    fn on_host_added(&self, host: &Arc<Host>);
    fn on_host_removed(&self, host: &Arc<Host>);
    fn on_host_up(&self, host: &Arc<Host>);
    fn on_host_down(&self, host: &Arc<Host>);

    fn new_query_plan(
        &self,
        request: &QueryPlanRequest,
        token_map: Option<&TokenMap>,
        hosts: &[Arc<Host>],
    ) -> QueryPlan;
}
