//! Pool generation tracking and up/down status publication.
//!
//! `PoolGeneration` is an atomically-bumped counter used to mark in-flight
//! connections as stale after a pool clear; `StatusPublisher` gives the
//! pool's up/down status edge-triggered notification so listeners never see
//! two consecutive identical transitions.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::watch;

use super::conn::ConnectionGeneration;

/// The current "epoch" of a pool. Bumped on every `clear()`; connections
/// created before the bump are stale and should be replaced rather than
/// reused once noticed.
#[derive(Debug, Default)]
pub(crate) struct PoolGeneration(AtomicU32);

impl PoolGeneration {
    pub(crate) fn current(&self) -> ConnectionGeneration {
        ConnectionGeneration(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn bump(&self) -> ConnectionGeneration {
        ConnectionGeneration(self.0.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

/// The pool's externally-visible lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PoolStatus {
    /// No connections yet; still attempting the first establishment.
    Connecting,
    /// At least one connection is usable.
    Ready,
    /// Was `Ready`, but every connection has since been lost; the worker is
    /// retrying establishment with its configured reconnect policy.
    Down,
    /// Every establishment attempt hit a critical error (auth/protocol/
    /// keyspace); the pool will not recover without configuration changes.
    Critical,
    Closed,
}

/// Publishes [`PoolStatus`] transitions to anyone holding a receiver,
/// collapsing repeated identical transitions so listeners only observe true
/// edges (never two consecutive `Down`-equivalent notifications).
pub(crate) struct StatusPublisher {
    sender: watch::Sender<PoolStatus>,
}

impl StatusPublisher {
    pub(crate) fn new(initial: PoolStatus) -> (Self, watch::Receiver<PoolStatus>) {
        let (sender, receiver) = watch::channel(initial);
        (Self { sender }, receiver)
    }

    /// Publishes `status` only if it differs from the last published value,
    /// so listeners never see a spurious repeat transition.
    pub(crate) fn publish(&self, status: PoolStatus) {
        self.sender.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_bumps_are_monotonic_and_observable() {
        let gen = PoolGeneration::default();
        let first = gen.current();
        let bumped = gen.bump();
        assert_ne!(first, bumped);
        assert_eq!(gen.current(), bumped);
    }

    #[tokio::test]
    async fn status_publisher_collapses_repeated_transitions() {
        let (publisher, mut receiver) = StatusPublisher::new(PoolStatus::Connecting);
        publisher.publish(PoolStatus::Ready);
        assert_eq!(*receiver.borrow_and_update(), PoolStatus::Ready);

        publisher.publish(PoolStatus::Ready);
        assert!(!receiver.has_changed().unwrap());
    }
}
