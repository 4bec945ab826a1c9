//! The host registry: the source of truth for cluster members and their
//! attributes.
//!
//! Grounded on `original_source/cpp-driver/src/host.hpp` for the fields a
//! `Host` carries. Mutation is serialized against concurrent readers with a
//! copy-on-write `Arc<RwLock<...>>` snapshot: readers clone the whole map
//! behind the lock rather than holding it while iterating.

mod registry;

use std::{
    net::IpAddr,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

pub use registry::HostRegistry;

/// The identity of a cluster node from the client's point of view: an IP
/// address plus the port the driver connects to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub host: IpAddr,
    pub port: u16,
}

impl Address {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }
}

/// Where a host sits relative to the driver, as reported by a
/// load-balancing policy's [`crate::policy::LoadBalancingPolicy::distance`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Distance {
    Local,
    Remote,
    Ignore,
}

/// A mutable record for one cluster member, keyed by [`Address`].
///
/// Ownership is shared by reference count between the host registry, pools,
/// and query plans. Mutation of the fields behind atomics is allowed from
/// any thread (they are load-hinting counters); mutation of `rack`/`dc`/
/// `tokens`/`version` is restricted to the control-connection event loop,
/// which replaces the whole [`Host`] behind the registry's lock rather than
/// mutating fields in place, so existing `Arc<Host>` holders keep observing
/// a consistent snapshot.
#[derive(Debug)]
pub struct Host {
    pub address: Address,
    pub rack: String,
    pub datacenter: String,
    pub partitioner: Option<String>,
    pub tokens: Vec<String>,
    pub release_version: String,

    /// Number of connections in this host's pool as of the last pool state
    /// transition the registry observed. A hint, not load-bearing.
    connection_count: AtomicU32,

    /// Number of requests currently in flight across this host's pool. A
    /// hint used by latency-aware policies, not load-bearing.
    inflight_count: AtomicU32,

    /// Exponentially-weighted moving average latency in nanoseconds, used by
    /// the latency-aware policy. `u64::MAX` means "no measurement yet".
    average_latency_nanos: AtomicU64,

    /// Bumped every time the control connection replaces this host's
    /// metadata (MOVED_NODE, a refreshed peers row). Lets long-lived query
    /// plans detect they are holding a stale snapshot without needing a
    /// lock.
    generation: AtomicU32,
}

impl Host {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            rack: String::new(),
            datacenter: String::new(),
            partitioner: None,
            tokens: Vec::new(),
            release_version: String::new(),
            connection_count: AtomicU32::new(0),
            inflight_count: AtomicU32::new(0),
            average_latency_nanos: AtomicU64::new(u64::MAX),
            generation: AtomicU32::new(0),
        }
    }

    pub fn connection_count(&self) -> u32 {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub fn set_connection_count(&self, count: u32) {
        self.connection_count.store(count, Ordering::Relaxed);
    }

    pub fn inflight_count(&self) -> u32 {
        self.inflight_count.load(Ordering::Relaxed)
    }

    pub fn record_inflight_delta(&self, delta: i32) {
        if delta >= 0 {
            self.inflight_count.fetch_add(delta as u32, Ordering::Relaxed);
        } else {
            self.inflight_count.fetch_sub((-delta) as u32, Ordering::Relaxed);
        }
    }

    pub fn average_latency(&self) -> Option<Duration> {
        match self.average_latency_nanos.load(Ordering::Relaxed) {
            u64::MAX => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    /// Folds a new latency sample into the exponentially-weighted moving
    /// average. `scale` is the smoothing factor in `(0.0, 1.0]`, matching
    /// the latency-aware policy's `scale` configuration knob.
    pub fn record_latency(&self, sample: Duration, scale: f64) {
        let sample_nanos = sample.as_nanos().min(u64::MAX as u128) as u64;
        loop {
            let prev = self.average_latency_nanos.load(Ordering::Relaxed);
            let next = if prev == u64::MAX {
                sample_nanos
            } else {
                let prev_f = prev as f64;
                let sample_f = sample_nanos as f64;
                ((prev_f * (1.0 - scale)) + (sample_f * scale)) as u64
            };
            if self
                .average_latency_nanos
                .compare_exchange(prev, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(n: u8) -> Address {
        Address::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, n)), 9042)
    }

    #[test]
    fn latency_average_converges_toward_samples() {
        let host = Host::new(addr(1));
        assert!(host.average_latency().is_none());

        host.record_latency(Duration::from_millis(100), 0.5);
        assert_eq!(host.average_latency(), Some(Duration::from_millis(100)));

        host.record_latency(Duration::from_millis(0), 0.5);
        assert_eq!(host.average_latency(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn inflight_delta_tracks_up_and_down() {
        let host = Host::new(addr(1));
        host.record_inflight_delta(3);
        host.record_inflight_delta(-1);
        assert_eq!(host.inflight_count(), 2);
    }
}
