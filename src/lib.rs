//! Connection and request-routing core for a CQL driver targeting a
//! Cassandra-family cluster.
//!
//! This crate owns the parts of a driver that sit below the public,
//! ergonomic API: the control connection, the per-host connection pools,
//! the request processor that dispatches and retries requests according to
//! a pluggable load-balancing policy, and the host/topology model those
//! pieces share. The CQL wire codec's typed value encoding, TLS, and the
//! user-facing API are out of scope; see `protocol` for the narrow seam
//! this crate depends on instead.

pub mod error;
pub mod event;
pub mod host;
pub mod options;
pub(crate) mod pool;
pub mod protocol;
pub(crate) mod queue;
pub mod retry;
pub mod timestamp;
pub mod token_map;

pub(crate) mod control;
pub mod policy;
pub(crate) mod processor;
pub mod session;

pub(crate) mod runtime;
pub(crate) mod wait_for;

pub use control::{HostMetadata, TopologyCodec, TopologyEvent};
pub use error::{Error, ErrorKind, Result};
pub use host::{Address, Host};
pub use options::DriverOptions;
pub use processor::Request;
pub use session::Session;
pub use wait_for::WaitForOutcome;

/// A boxed future, used where a trait object is clearer than a generic bound.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
