//! Contains the `Error` and `Result` types used throughout the crate.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::host::Address;

/// The result type used by every fallible method in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur anywhere in the connection/request-routing core.
///
/// The inner [`ErrorKind`] is kept small and `Clone`-able (no boxed `dyn Any`
/// payload) since this core has no user-supplied custom-error escape hatch.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The kind of error that occurred.
    pub kind: Box<ErrorKind>,
    /// The wire-protocol phase that produced this error, if known; used by
    /// the retry policy to decide whether an attempt is safely retriable.
    pub(crate) phase: Option<HandshakePhase>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind: Box::new(kind), phase: None }
    }

    pub(crate) fn with_phase(kind: ErrorKind, phase: HandshakePhase) -> Self {
        Self { kind: Box::new(kind), phase: Some(phase) }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal { message: message.into() }.into()
    }

    /// Whether this error represents a connection-level failure (closed,
    /// defunct, stream exhaustion) as opposed to an application-level
    /// server error.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::ConnectionClosed { .. }
                | ErrorKind::NoStreams { .. }
                | ErrorKind::Io(_)
                | ErrorKind::ConnectTimeout { .. }
        )
    }

    /// Whether this error is a per-attempt timeout, as distinct from a
    /// connection-level failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::RequestTimedOut)
    }

    pub(crate) fn is_critical_establish_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::UnableToDetermineProtocol { .. }
                | ErrorKind::Authentication { .. }
                | ErrorKind::UnableToSetKeyspace { .. }
                | ErrorKind::InvalidTlsConfig { .. }
        )
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(err)).into()
    }
}

/// The handshake phase during which a connection-establishment error
/// occurred, used to decide whether pool/host state should be updated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum HandshakePhase {
    PreOptions,
    PostOptions,
    AfterCompletion,
}

/// The taxonomy of errors this crate's library side can produce. Server-side
/// errors (`BAD_CREDENTIALS`, `PROTOCOL_ERROR`, `UNAVAILABLE`, the
/// `*_TIMEOUT` family, etc.) are passed through verbatim via
/// [`ErrorKind::Server`].
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The driver could not be initialized (e.g. no contact points resolved).
    #[error("unable to initialize: {message}")]
    UnableToInit { message: String },

    /// No TCP/TLS/handshake attempt to any contact point succeeded.
    #[error("unable to connect: {message}")]
    UnableToConnect { message: String },

    /// Every configured protocol version was rejected, or the negotiated
    /// version fell below the minimum supported version.
    #[error("unable to determine a usable protocol version: {message}")]
    UnableToDetermineProtocol { message: String },

    /// The `USE <keyspace>` issued after STARTUP or on keyspace propagation
    /// failed.
    #[error("unable to set keyspace {keyspace:?}: {message}")]
    UnableToSetKeyspace { keyspace: String, message: String },

    /// The query plan for a request was exhausted without finding a usable
    /// host/connection.
    #[error("no hosts were available: {message}")]
    NoHostsAvailable { message: String },

    /// A connection's stream-id pool was exhausted.
    #[error("no stream ids available on connection to {address}")]
    NoStreams { address: Address },

    /// The per-event-loop request queue rejected a write because it is full.
    #[error("request queue is full")]
    RequestQueueFull,

    /// A request's per-attempt timeout elapsed before a response arrived.
    #[error("request timed out")]
    RequestTimedOut,

    /// A named execution profile was referenced but not configured.
    #[error("execution profile {name:?} is not registered")]
    ExecutionProfileInvalid { name: String },

    /// An idempotent-required parameter (e.g. a positional bind marker) was
    /// left unset.
    #[error("parameter left unset: {message}")]
    ParameterUnset { message: String },

    /// Authentication with the server failed or no provider was configured
    /// for a required mechanism.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// A connection was closed or marked defunct while a callback was
    /// pending on it.
    #[error("connection to {address} closed: {reason}")]
    ConnectionClosed { address: Address, reason: &'static str },

    /// TLS configuration was invalid (trust store, verification flags).
    #[error("invalid TLS configuration: {message}")]
    InvalidTlsConfig { message: String },

    /// Connecting to a host did not complete within `connect_timeout_ms`.
    #[error("connect timeout to {address}")]
    ConnectTimeout { address: Address },

    /// Waiting for schema agreement or tracing data exceeded its deadline.
    /// Non-fatal: the original response is still delivered to the caller.
    #[error("wait-for deadline exceeded: {message}")]
    WaitForTimedOut { message: String },

    /// A verbatim server-side error (`BAD_CREDENTIALS`, `UNAVAILABLE`,
    /// `READ_TIMEOUT`, `WRITE_TIMEOUT`, `PROTOCOL_ERROR`, ...).
    #[error("server error {code:#06x}: {message}")]
    Server { code: i32, message: String },

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// An invariant inside the core itself was violated; always a bug.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ErrorKind {
    /// The wire-protocol error code, for server errors that carry one.
    pub fn server_code(&self) -> Option<i32> {
        match self {
            ErrorKind::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
