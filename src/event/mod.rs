//! Monitoring events emitted by the connection pool and the control
//! connection/topology layer.
//!
//! A user-supplied handler is optional, and every event is also surfaced as
//! a `tracing` event regardless, so operators get structured logs even with
//! no handler registered.

pub mod pool;
pub mod topology;

use std::sync::Arc;

/// Wraps an optional user-supplied handler and always also emits a
/// `tracing` event. Tracing emission is unconditional since this crate has
/// no public event-subscriber API of its own to gate behind a feature.
pub(crate) struct EventEmitter<H: ?Sized> {
    handler: Option<Arc<H>>,
}

// Manual impl instead of `#[derive(Clone)]`: derive would add a spurious
// `H: Clone` bound even though `Arc<H>` is `Clone` for any `H: ?Sized`.
impl<H: ?Sized> Clone for EventEmitter<H> {
    fn clone(&self) -> Self {
        Self { handler: self.handler.clone() }
    }
}

impl<H: ?Sized> EventEmitter<H> {
    pub(crate) fn new(handler: Option<Arc<H>>) -> Self {
        Self { handler }
    }

    /// Invokes `emit` with the registered handler, if any. `emit` should be
    /// cheap to construct (the caller builds the event struct only when a
    /// handler is actually present).
    pub(crate) fn emit<F>(&self, emit: F)
    where
        F: FnOnce(&Arc<H>),
    {
        if let Some(handler) = &self.handler {
            emit(handler);
        }
    }
}

impl<H: ?Sized> std::fmt::Debug for EventEmitter<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}
