//! Latency-aware policy: defers hosts whose recent average latency is an
//! outlier relative to the cluster minimum.
//!
//! Grounded on `original_source/cpp-driver/src/latency_aware_policy.hpp`'s
//! `Settings` defaults (`exclusion_threshold = 2.0`, `scale_ns = 100ms`,
//! `retry_period_ns = 10s`, `min_measured = 50`) and its periodic
//! min-average recomputation, re-expressed here as a lazily-recomputed
//! value behind a `Mutex` instead of a `PeriodicTask` driven by the event
//! loop, since this crate's policies are plain synchronous trait objects
//! with no loop of their own to schedule on.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use super::{LoadBalancingPolicy, QueryPlan, QueryPlanRequest};
use crate::{
    host::{Distance, Host},
    token_map::TokenMap,
};

#[derive(Clone, Copy, Debug)]
pub struct LatencyAwareSettings {
    pub exclusion_threshold: f64,
    pub scale: Duration,
    pub retry_period: Duration,
    pub update_rate: Duration,
    pub min_measured: u64,
}

impl Default for LatencyAwareSettings {
    fn default() -> Self {
        Self {
            exclusion_threshold: 2.0,
            scale: Duration::from_millis(100),
            retry_period: Duration::from_secs(10),
            update_rate: Duration::from_millis(100),
            min_measured: 50,
        }
    }
}

struct MinAverageCache {
    value: Option<Duration>,
    computed_at: Instant,
}

pub struct LatencyAwarePolicy {
    child: Box<dyn LoadBalancingPolicy>,
    settings: LatencyAwareSettings,
    min_average: Mutex<MinAverageCache>,
    /// Hosts currently deferred to the tail, and when their retry period
    /// expires.
    excluded_until: Mutex<std::collections::HashMap<crate::host::Address, Instant>>,
}

impl LatencyAwarePolicy {
    pub fn new(child: Box<dyn LoadBalancingPolicy>, settings: LatencyAwareSettings) -> Self {
        Self {
            child,
            settings,
            min_average: Mutex::new(MinAverageCache { value: None, computed_at: Instant::now() }),
            excluded_until: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn cluster_min_average(&self, hosts: &[Arc<Host>]) -> Option<Duration> {
        let mut cache = self.min_average.lock().unwrap();
        if cache.computed_at.elapsed() < self.settings.update_rate {
            return cache.value;
        }
        let min = hosts.iter().filter_map(|h| h.average_latency()).min();
        cache.value = min;
        cache.computed_at = Instant::now();
        min
    }

    fn is_excluded(&self, host: &Host) -> bool {
        let Some(min_average) = (*self.min_average.lock().unwrap()).value else { return false };
        let Some(average) = host.average_latency() else { return false };
        if average.as_secs_f64() <= min_average.as_secs_f64() * self.settings.exclusion_threshold {
            return false;
        }
        let mut excluded_until = self.excluded_until.lock().unwrap();
        let now = Instant::now();
        match excluded_until.get(&host.address) {
            Some(until) if now < *until => true,
            _ => {
                excluded_until.insert(host.address, now + self.settings.retry_period);
                true
            }
        }
    }
}

impl LoadBalancingPolicy for LatencyAwarePolicy {
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
        self.excluded_until.lock().unwrap().remove(&host.address);
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
        self.cluster_min_average(hosts);
        let child_plan = self.child.new_query_plan(request, token_map, hosts);

        let measured_enough =
            hosts.iter().filter(|h| h.average_latency().is_some()).count() as u64
                >= self.settings.min_measured;
        if !measured_enough {
            return child_plan;
        }

        let (deferred, preferred): (Vec<_>, Vec<_>) =
            child_plan.partition(|h| self.is_excluded(h));
        Box::new(preferred.into_iter().chain(deferred))
    }
}
