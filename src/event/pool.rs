//! Connection-pool monitoring events describing pool and connection
//! lifecycle transitions for a single host's pool.

use crate::host::Address;

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    pub address: Address,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolReadyEvent {
    pub address: Address,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolClearedEvent {
    pub address: Address,
    /// Whether every connection in the pool was cleared, as opposed to only
    /// connections established before a specific generation bump.
    pub all_connections: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolClosedEvent {
    pub address: Address,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    pub address: Address,
    pub connection_id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectionReadyEvent {
    pub address: Address,
    pub connection_id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    pub address: Address,
    pub connection_id: u32,
    pub reason: ConnectionClosedReason,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The pool was cleared since the connection was created.
    Stale,
    /// The connection was idle longer than `max_idle_time`.
    Idle,
    /// A network or protocol error occurred while using the connection.
    Error,
    /// The connection was dropped during a read or write.
    Dropped,
    /// The pool the connection belonged to was closed.
    PoolClosed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectionCheckoutStartedEvent {
    pub address: Address,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectionCheckedOutEvent {
    pub address: Address,
    pub connection_id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectionCheckoutFailedEvent {
    pub address: Address,
    pub reason: ConnectionCheckoutFailedReason,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionCheckoutFailedReason {
    PoolClosed,
    Timeout,
    ConnectionError,
}

/// Implemented by user-supplied pool monitors. Every method has a no-op
/// default so a handler only needs to implement what it cares about.
pub trait PoolEventHandler: Send + Sync {
    fn handle_pool_created_event(&self, _event: PoolCreatedEvent) {}
    fn handle_pool_ready_event(&self, _event: PoolReadyEvent) {}
    fn handle_pool_cleared_event(&self, _event: PoolClearedEvent) {}
    fn handle_pool_closed_event(&self, _event: PoolClosedEvent) {}
    fn handle_connection_created_event(&self, _event: ConnectionCreatedEvent) {}
    fn handle_connection_ready_event(&self, _event: ConnectionReadyEvent) {}
    fn handle_connection_closed_event(&self, _event: ConnectionClosedEvent) {}
    fn handle_connection_checkout_started_event(&self, _event: ConnectionCheckoutStartedEvent) {}
    fn handle_connection_checked_out_event(&self, _event: ConnectionCheckedOutEvent) {}
    fn handle_connection_checkout_failed_event(&self, _event: ConnectionCheckoutFailedEvent) {}
}
