//! Per-request retry decisions.
//!
//! Grounded on `original_source/cpp-driver/src/retry_policy.hpp`'s
//! `RetryPolicy` interface: decisions keyed on the server error sub-fields
//! (retry count, write type, required/received/alive replica counts),
//! expressed as an explicit decision enum rather than raising and catching
//! exceptions.

use crate::error::ErrorKind;

/// What the request processor should do next after a per-attempt failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reissue the same request on the connection/host that just failed.
    RetrySame,
    /// Reissue the request on the next host in the query plan.
    RetryNext,
    /// Treat the failure as a success with an empty result.
    Ignore,
    /// Surface the error to the caller; no further attempts.
    Rethrow,
}

/// Whether the failed request is safe to reissue, and the distinction
/// between connection-level errors (retried only when the request is
/// idempotent or the error is independently known to be safe) and
/// server-reported timeouts/unavailability (retried per their own
/// sub-fields regardless of idempotency).
#[derive(Clone, Copy, Debug)]
pub struct RetryContext {
    pub retry_count: u32,
    pub is_idempotent: bool,
}

/// A pluggable decision function consulted on every per-request error.
pub trait RetryPolicy: Send + Sync {
    fn on_error(&self, error: &ErrorKind, context: RetryContext) -> RetryDecision;
}

/// The default policy: connection-level errors retry on the next host when
/// the request is idempotent; read timeouts and unavailable errors always
/// retry once on the next host; write timeouts retry only when idempotent;
/// everything else is rethrown. Grounded on cpp-driver's
/// `DefaultRetryPolicy`.
#[derive(Debug, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn on_error(&self, error: &ErrorKind, context: RetryContext) -> RetryDecision {
        if context.retry_count > 0 {
            return RetryDecision::Rethrow;
        }
        match error {
            ErrorKind::ConnectionClosed { .. } | ErrorKind::NoStreams { .. } | ErrorKind::Io(_) => {
                if context.is_idempotent {
                    RetryDecision::RetryNext
                } else {
                    RetryDecision::Rethrow
                }
            }
            ErrorKind::RequestTimedOut => {
                if context.is_idempotent {
                    RetryDecision::RetryNext
                } else {
                    RetryDecision::Rethrow
                }
            }
            ErrorKind::Server { code, .. } => match *code {
                // READ_TIMEOUT
                0x1200 => RetryDecision::RetryNext,
                // UNAVAILABLE
                0x1000 => RetryDecision::RetryNext,
                // WRITE_TIMEOUT
                0x1100 => {
                    if context.is_idempotent {
                        RetryDecision::RetryNext
                    } else {
                        RetryDecision::Rethrow
                    }
                }
                _ => RetryDecision::Rethrow,
            },
            _ => RetryDecision::Rethrow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(idempotent: bool) -> RetryContext {
        RetryContext { retry_count: 0, is_idempotent: idempotent }
    }

    #[test]
    fn idempotent_connection_error_retries_on_next_host() {
        let policy = DefaultRetryPolicy;
        let decision = policy.on_error(
            &ErrorKind::ConnectionClosed {
                address: crate::host::Address::new("127.0.0.1".parse().unwrap(), 9042),
                reason: "closed",
            },
            context(true),
        );
        assert_eq!(decision, RetryDecision::RetryNext);
    }

    #[test]
    fn non_idempotent_connection_error_is_rethrown() {
        let policy = DefaultRetryPolicy;
        let decision = policy.on_error(
            &ErrorKind::ConnectionClosed {
                address: crate::host::Address::new("127.0.0.1".parse().unwrap(), 9042),
                reason: "closed",
            },
            context(false),
        );
        assert_eq!(decision, RetryDecision::Rethrow);
    }

    #[test]
    fn read_timeout_always_retries_once() {
        let policy = DefaultRetryPolicy;
        let decision = policy.on_error(
            &ErrorKind::Server { code: 0x1200, message: "read timeout".into() },
            context(false),
        );
        assert_eq!(decision, RetryDecision::RetryNext);
    }

    #[test]
    fn second_attempt_is_always_rethrown() {
        let policy = DefaultRetryPolicy;
        let decision = policy.on_error(
            &ErrorKind::Server { code: 0x1200, message: "read timeout".into() },
            RetryContext { retry_count: 1, is_idempotent: true },
        );
        assert_eq!(decision, RetryDecision::Rethrow);
    }
}
