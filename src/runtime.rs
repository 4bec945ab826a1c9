//! Small async-runtime helpers shared by every actor-style component in this
//! crate (pool workers, the control connection, the request processor).
//!
//! A handle-counting shutdown-detection pattern (`WorkerHandle`/
//! `WorkerHandleListener`) and a task-join wrapper (`AsyncJoinHandle`),
//! targeting `tokio` only rather than abstracting over multiple async
//! runtimes.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::sync::mpsc;

use crate::error::{Error, ErrorKind, Result};

/// Spawns `fut` on the tokio runtime, returning a handle whose `Future`
/// impl resolves to a [`Result`] rather than tokio's `JoinError`.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle(tokio::task::spawn(fut))
}

/// A tokio join handle that surfaces task panics as [`ErrorKind::Internal`]
/// instead of a separate `JoinError` type, so callers can use `?` uniformly.
pub(crate) struct AsyncJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T> Future for AsyncJoinHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            result.map_err(|err| Error::internal(format!("background task panicked: {err}")))
        })
    }
}

/// Races `fut` against a `duration` timer, returning
/// [`ErrorKind::RequestTimedOut`] if the timer wins.
pub(crate) async fn with_timeout<F>(duration: Duration, fut: F) -> Result<F::Output>
where
    F: Future,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| ErrorKind::RequestTimedOut.into())
}

/// Handle to a worker task. Once every clone has been dropped, the worker's
/// paired [`WorkerHandleListener`] observes its channel close and the worker
/// can stop doing useful work (a pool with no handles left has no callers
/// left to serve).
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    _sender: mpsc::Sender<()>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle").finish()
    }
}

impl WorkerHandle {
    #[cfg(test)]
    pub(crate) fn new_mocked() -> Self {
        let (handle, _listener) = WorkerHandleListener::channel();
        handle
    }
}

/// The worker side of a [`WorkerHandle`] channel: used to detect when every
/// handle has gone away.
#[derive(Debug)]
pub(crate) struct WorkerHandleListener {
    receiver: mpsc::Receiver<()>,
}

impl WorkerHandleListener {
    /// Resolves once every [`WorkerHandle`] has been dropped. Intended to be
    /// raced inside a `select!` alongside the worker's real event sources,
    /// never polled standalone.
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        self.receiver.recv().await;
    }

    /// Non-blocking check for whether any handle is still alive.
    pub(crate) fn check_if_alive(&mut self) -> bool {
        !matches!(self.receiver.try_recv(), Err(mpsc::error::TryRecvError::Disconnected))
    }

    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        let (sender, receiver) = mpsc::channel(1);
        (WorkerHandle { _sender: sender }, WorkerHandleListener { receiver })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_handle_surfaces_panics_as_internal_error() {
        let handle = spawn(async { panic!("boom") });
        let result = handle.await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn join_handle_returns_output_on_success() {
        let handle = spawn(async { 42 });
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn worker_handle_listener_detects_all_drops() {
        let (handle, mut listener) = WorkerHandleListener::channel();
        assert!(listener.check_if_alive());
        drop(handle);
        listener.wait_for_all_handle_drops().await;
        assert!(!listener.check_if_alive());
    }

    #[tokio::test]
    async fn with_timeout_returns_request_timed_out() {
        let result: Result<()> =
            with_timeout(Duration::from_millis(5), std::future::pending()).await;
        assert!(matches!(result.unwrap_err().kind.as_ref(), ErrorKind::RequestTimedOut));
    }
}
