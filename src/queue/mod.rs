//! Coalesces concurrent request submissions onto their target connections.
//!
//! Grounded on `original_source/cpp-driver/src/request_queue.cpp`'s
//! `RequestQueue`: callers push a request and a single background task
//! drains everything currently queued, writes each item to its connection,
//! and flushes each touched connection exactly once per drain instead of
//! once per request. The original signals its drain loop with a libuv
//! async handle and re-arms either immediately or via a timer; here a
//! [`tokio::sync::Notify`] plays the async handle's role and
//! [`tokio::time::sleep`] plays the timer's.
//!
//! The `flushes_without_writes_ > 5` idle-detection heuristic and the
//! `new_request_ratio` throttle are carried over unchanged: after five
//! consecutive empty drains the task parks on the channel instead of
//! polling, and the pause between a non-empty drain and the next one is
//! sized so the task spends roughly `new_request_ratio` percent of its time
//! processing rather than waiting.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::{
    error::{Error, ErrorKind, Result},
    pool::Connection,
    protocol::{Frame, Opcode},
};

struct QueueItem {
    connection: Arc<Connection>,
    opcode: Opcode,
    body: Bytes,
    responder: oneshot::Sender<Result<Frame>>,
}

/// A cheap, cloneable handle to the background flush task. Dropping every
/// clone lets the task's `recv()` return `None` and it exits.
#[derive(Clone)]
pub(crate) struct RequestQueue {
    sender: mpsc::Sender<QueueItem>,
    notify: Arc<Notify>,
}

impl RequestQueue {
    pub(crate) fn start(queue_size: usize, new_request_ratio: u8) -> Self {
        let (sender, receiver) = mpsc::channel(queue_size);
        let notify = Arc::new(Notify::new());
        let worker = RequestQueueWorker {
            receiver,
            notify: notify.clone(),
            new_request_ratio: new_request_ratio.clamp(1, 99),
            flushes_without_writes: 0,
        };
        tokio::spawn(worker.run());
        Self { sender, notify }
    }

    /// Enqueues a request for `connection` and awaits its response. Returns
    /// [`ErrorKind::RequestQueueFull`] immediately if the queue has no
    /// capacity rather than applying backpressure by waiting, matching the
    /// original's `MPMCQueue::enqueue` returning `false` on a full queue.
    pub(crate) async fn submit(
        &self,
        connection: Arc<Connection>,
        opcode: Opcode,
        body: Bytes,
    ) -> Result<Frame> {
        let (responder, response) = oneshot::channel();
        self.sender
            .try_send(QueueItem { connection, opcode, body, responder })
            .map_err(|_| ErrorKind::RequestQueueFull)?;
        self.notify.notify_one();

        response
            .await
            .map_err(|_| Error::internal("request queue worker dropped before a response arrived"))?
    }
}

struct RequestQueueWorker {
    receiver: mpsc::Receiver<QueueItem>,
    notify: Arc<Notify>,
    new_request_ratio: u8,
    flushes_without_writes: u32,
}

impl RequestQueueWorker {
    async fn run(mut self) {
        while let Some(first) = self.receiver.recv().await {
            let mut batch = vec![first];
            self.drain_into(&mut batch);
            #[cfg(feature = "tracing-unstable")]
            tracing::trace!(batch_len = batch.len(), "request queue draining a batch");
            self.flush_loop(batch).await;
        }
    }

    /// Repeatedly writes a batch, flushes each touched connection once, and
    /// decides whether to keep draining or go back to parking on the
    /// channel, mirroring `RequestQueue::handle_flush`'s re-arm logic.
    async fn flush_loop(&mut self, mut batch: Vec<QueueItem>) {
        loop {
            let start = std::time::Instant::now();
            let wrote_any = self.write_batch(batch).await;

            if wrote_any {
                self.flushes_without_writes = 0;
            } else {
                self.flushes_without_writes += 1;
                if self.flushes_without_writes > 5 {
                    return;
                }
            }

            batch = Vec::new();
            self.drain_into(&mut batch);
            if batch.is_empty() {
                let flush_time = start.elapsed();
                let ratio = self.new_request_ratio as u32;
                let processing_time = flush_time * (100 - ratio) / ratio;
                if processing_time >= Duration::from_millis(1) {
                    tokio::select! {
                        _ = tokio::time::sleep(processing_time) => {}
                        _ = self.notify.notified() => {}
                    }
                } else {
                    self.notify.notified().await;
                }
                self.drain_into(&mut batch);
                if batch.is_empty() {
                    return;
                }
            }
        }
    }

    fn drain_into(&mut self, batch: &mut Vec<QueueItem>) {
        while let Ok(item) = self.receiver.try_recv() {
            batch.push(item);
        }
    }

    /// Writes every item without flushing, flushes each distinct connection
    /// exactly once, and reports whether any write actually succeeded.
    async fn write_batch(&self, batch: Vec<QueueItem>) -> bool {
        let mut touched: HashMap<usize, Arc<Connection>> = HashMap::new();
        let mut wrote_any = false;

        for item in batch {
            let key = Arc::as_ptr(&item.connection) as usize;
            match item.connection.enqueue(item.opcode, item.body).await {
                Ok(rx) => {
                    wrote_any = true;
                    touched.entry(key).or_insert_with(|| item.connection.clone());
                    let connection = item.connection.clone();
                    let responder = item.responder;
                    tokio::spawn(async move {
                        let _ = responder.send(connection.await_response(rx).await);
                    });
                }
                Err(err) => {
                    let _ = item.responder.send(Err(err));
                }
            }
        }

        for connection in touched.into_values() {
            if connection.flush_writer().await.is_err() {
                connection.mark_defunct_external();
            }
        }

        wrote_any
    }
}
