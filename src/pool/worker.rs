//! The per-host connection-pool actor.
//!
//! A single task owns all pool state, driven by a `select! { biased; ... }`
//! loop that prioritizes handle-drop shutdown and management commands over
//! routine maintenance. No checkout: the request processor picks a
//! connection directly out of the published snapshot in
//! [`super::manager::PoolManager`].

use std::{
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, watch};

use super::{
    conn::Connection,
    establish::ConnectionEstablisher,
    status::{PoolGeneration, PoolStatus, StatusPublisher},
    stream_manager::MAX_STREAMS,
};
use crate::{
    event::{
        pool::{
            ConnectionClosedReason, ConnectionCreatedEvent, ConnectionReadyEvent, PoolClearedEvent,
            PoolClosedEvent, PoolCreatedEvent, PoolReadyEvent,
        },
        EventEmitter,
    },
    host::Address,
    options::ReconnectPolicy,
    runtime::{WorkerHandle, WorkerHandleListener},
};

const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

pub(crate) enum PoolCommand {
    /// Marks every currently-open connection as belonging to a stale
    /// generation and bumps the pool's generation counter; the maintenance
    /// pass replaces them on its next tick.
    Clear,
    Close,
}

/// The shared, lock-guarded snapshot of a pool's live connections. Readers
/// (the request processor) take a cheap clone of the `Vec<Arc<Connection>>`
/// under the read lock and then iterate lock-free — a copy-on-read rather
/// than copy-on-write discipline, since connections are individually
/// reference-counted and cloning the vector is cheap.
pub(crate) type ConnectionSnapshot = Arc<RwLock<Vec<Arc<Connection>>>>;

pub(crate) struct ConnectionPoolWorker {
    address: Address,
    target_size: usize,
    establisher: ConnectionEstablisher,
    reconnect_policy: ReconnectPolicy,
    event_emitter: EventEmitter<dyn crate::event::pool::PoolEventHandler>,

    connections: ConnectionSnapshot,
    generation: Arc<PoolGeneration>,
    status: StatusPublisher,
    next_connection_id: u32,
    failure_count: u32,
    next_attempt_at: Instant,

    handle_listener: WorkerHandleListener,
    command_receiver: mpsc::Receiver<PoolCommand>,
}

impl ConnectionPoolWorker {
    pub(crate) fn start(
        address: Address,
        target_size: usize,
        establisher: ConnectionEstablisher,
        reconnect_policy: ReconnectPolicy,
        event_emitter: EventEmitter<dyn crate::event::pool::PoolEventHandler>,
    ) -> PoolHandle {
        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (command_sender, command_receiver) = mpsc::channel(32);
        let connections: ConnectionSnapshot = Arc::new(RwLock::new(Vec::new()));
        let generation = Arc::new(PoolGeneration::default());
        let (status, status_receiver) = StatusPublisher::new(PoolStatus::Connecting);

        event_emitter.emit(|h| h.handle_pool_created_event(PoolCreatedEvent { address }));

        let worker = ConnectionPoolWorker {
            address,
            target_size,
            establisher,
            reconnect_policy,
            event_emitter,
            connections: connections.clone(),
            generation,
            status,
            next_connection_id: 0,
            failure_count: 0,
            next_attempt_at: Instant::now(),
            handle_listener,
            command_receiver,
        };

        tokio::spawn(worker.execute());
        PoolHandle {
            address,
            connections,
            command_sender,
            status: status_receiver,
            _worker_handle: handle,
        }
    }

    async fn execute(mut self) {
        let mut maintenance_interval = tokio::time::interval(MAINTENANCE_FREQUENCY);

        loop {
            tokio::select! {
                biased;

                _ = self.handle_listener.wait_for_all_handle_drops() => break,
                Some(command) = self.command_receiver.recv() => {
                    match command {
                        PoolCommand::Clear => self.clear(),
                        PoolCommand::Close => break,
                    }
                }
                _ = maintenance_interval.tick() => self.maintain().await,
                else => break,
            }
        }

        self.close();
    }

    fn clear(&mut self) {
        let new_generation = self.generation.bump();
        let mut connections = self.connections.write().unwrap();
        for conn in connections.drain(..) {
            conn.emit_closed(ConnectionClosedReason::Stale);
        }
        drop(connections);
        let _ = new_generation;
        self.status.publish(PoolStatus::Down);
        self.event_emitter.emit(|h| h.handle_pool_cleared_event(PoolClearedEvent {
            address: self.address,
            all_connections: true,
        }));
    }

    fn close(&mut self) {
        let mut connections = self.connections.write().unwrap();
        for conn in connections.drain(..) {
            conn.emit_closed(ConnectionClosedReason::PoolClosed);
        }
        drop(connections);
        self.status.publish(PoolStatus::Closed);
        self.event_emitter.emit(|h| h.handle_pool_closed_event(PoolClosedEvent { address: self.address }));
    }

    async fn maintain(&mut self) {
        self.drop_defunct_and_stale();

        let current_len = self.connections.read().unwrap().len();
        if current_len >= self.target_size {
            return;
        }
        if Instant::now() < self.next_attempt_at {
            return;
        }

        let id = self.next_connection_id;
        self.next_connection_id += 1;
        let generation = self.generation.current();

        match self
            .establisher
            .establish(id, self.address, generation, self.event_emitter.clone())
            .await
        {
            Ok(conn) => {
                self.event_emitter.emit(|h| {
                    h.handle_connection_created_event(ConnectionCreatedEvent {
                        address: self.address,
                        connection_id: id,
                    })
                });
                self.event_emitter.emit(|h| {
                    h.handle_connection_ready_event(ConnectionReadyEvent {
                        address: self.address,
                        connection_id: id,
                    })
                });

                let was_empty = {
                    let mut connections = self.connections.write().unwrap();
                    let was_empty = connections.is_empty();
                    connections.push(conn);
                    was_empty
                };
                self.failure_count = 0;
                if was_empty {
                    self.status.publish(PoolStatus::Ready);
                    self.event_emitter
                        .emit(|h| h.handle_pool_ready_event(PoolReadyEvent { address: self.address }));
                }
            }
            Err(err) if err.is_critical_establish_error() => {
                self.status.publish(PoolStatus::Critical);
                tracing::error!(address = %self.address, error = %err, "pool establishment hit a critical error");
            }
            Err(err) => {
                self.failure_count += 1;
                self.next_attempt_at =
                    Instant::now() + self.reconnect_policy.delay_for_attempt(self.failure_count - 1);
                if self.connections.read().unwrap().is_empty() {
                    self.status.publish(PoolStatus::Down);
                }
                tracing::warn!(address = %self.address, error = %err, attempt = self.failure_count, "connection establishment failed, backing off");
            }
        }
    }

    fn drop_defunct_and_stale(&mut self) {
        let current_generation = self.generation.current();
        let mut connections = self.connections.write().unwrap();
        let before = connections.len();
        connections.retain(|conn| {
            let keep = !conn.is_defunct() && !conn.is_stale(current_generation);
            if !keep {
                let reason = if conn.is_stale(current_generation) {
                    ConnectionClosedReason::Stale
                } else {
                    ConnectionClosedReason::Error
                };
                conn.emit_closed(reason);
            }
            keep
        });
        if connections.len() < before && connections.is_empty() {
            self.status.publish(PoolStatus::Down);
        }
    }
}

/// A cheap, cloneable handle to one host's pool. Holding a clone keeps the
/// worker alive (via [`WorkerHandle`]'s reference-counting); dropping every
/// clone lets the worker notice via [`WorkerHandleListener`] and shut down.
#[derive(Clone)]
pub(crate) struct PoolHandle {
    pub(crate) address: Address,
    connections: ConnectionSnapshot,
    command_sender: mpsc::Sender<PoolCommand>,
    status: watch::Receiver<PoolStatus>,
    _worker_handle: WorkerHandle,
}

impl PoolHandle {
    /// A point-in-time snapshot of this pool's live connections, safe to
    /// iterate without holding any lock.
    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().unwrap().clone()
    }

    /// Returns the pool member with the smallest in-flight count that is
    /// neither defunct nor (by this hint) out of stream ids. Ties are broken
    /// arbitrarily by iteration order, per spec's `find_least_busy`.
    pub(crate) fn least_busy_connection(&self) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap()
            .iter()
            .filter(|conn| !conn.is_defunct() && (conn.inflight_count() as usize) < MAX_STREAMS)
            .min_by_key(|conn| conn.inflight_count())
            .cloned()
    }

    pub(crate) fn status(&self) -> PoolStatus {
        *self.status.borrow()
    }

    pub(crate) fn status_receiver(&self) -> watch::Receiver<PoolStatus> {
        self.status.clone()
    }

    /// Marks every connection stale; the worker replaces them on its next
    /// maintenance tick. Fire-and-forget: if the worker has already shut
    /// down there is nothing to clear.
    pub(crate) async fn clear(&self) {
        let _ = self.command_sender.send(PoolCommand::Clear).await;
    }
}

