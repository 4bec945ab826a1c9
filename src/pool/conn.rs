//! A single physical connection.
//!
//! A CQL connection multiplexes many concurrent requests over one socket
//! using the stream id in the frame header (see [`super::stream_manager`]).
//! `Connection` is therefore a cheaply-cloneable handle shared by every
//! caller that wants to use it concurrently, backed by a writer half guarded
//! by a mutex and a reader task that demultiplexes responses by stream id.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufWriter},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot, Mutex},
};

use super::stream_manager::StreamManager;
use crate::{
    error::{Error, ErrorKind, HandshakePhase, Result},
    event::{pool::ConnectionClosedReason, EventEmitter},
    host::Address,
    protocol::{use_keyspace_body, Consistency, Frame, Opcode, FRAME_HEADER_LEN},
};

/// Bumped every time the owning pool is cleared; a connection whose
/// `generation` no longer matches its pool's current generation is stale and
/// should be closed rather than reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ConnectionGeneration(pub(crate) u32);

/// A physical connection to one host, shared by every concurrent request
/// that picks it.
pub(crate) struct Connection {
    pub(crate) id: u32,
    pub(crate) address: Address,
    pub(crate) generation: ConnectionGeneration,
    pub(crate) time_created: Instant,
    pub(crate) protocol_version: u8,

    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    streams: Arc<Mutex<StreamManager<oneshot::Sender<Result<Frame>>>>>,
    /// Set by the reader task once the socket errors out or is closed; new
    /// requests are rejected immediately rather than hanging on a write to a
    /// half-dead socket.
    defunct: Arc<AtomicBool>,
    /// Requests currently awaiting a response; a cheap hint consulted by
    /// latency/least-busy load-balancing policies, not load-bearing.
    inflight: AtomicU32,

    /// The keyspace this connection has actually `USE`d, set once by
    /// [`ConnectionEstablisher::establish`] and kept current by
    /// [`Connection::ensure_keyspace`] thereafter. Compared against
    /// [`super::manager::PoolManager::keyspace`] before every request so a
    /// connection that missed a session-wide `USE` (e.g. one replaced after
    /// [`super::manager::PoolManager::set_keyspace`] already returned)
    /// catches up on its own, the way `pooled_connection.cpp`'s
    /// `PooledConnection::write` compares `pool_->manager()->keyspace()`
    /// against `connection_->keyspace()` before every write.
    current_keyspace: Mutex<Option<Arc<str>>>,

    /// Set by [`Connection::subscribe_events`] (only ever called by the
    /// control connection's own connection); server-pushed `EVENT` frames
    /// are forwarded here instead of being dropped as an unmatched stream.
    event_sender: Arc<Mutex<Option<mpsc::UnboundedSender<Frame>>>>,

    event_emitter: EventEmitter<dyn crate::event::pool::PoolEventHandler>,
}

impl Connection {
    /// Wraps an already-connected, already-handshaken socket. Spawns the
    /// background reader task that demultiplexes responses by stream id.
    pub(crate) fn from_parts(
        id: u32,
        address: Address,
        generation: ConnectionGeneration,
        protocol_version: u8,
        socket: TcpStream,
        event_emitter: EventEmitter<dyn crate::event::pool::PoolEventHandler>,
    ) -> Arc<Self> {
        let (read_half, write_half) = socket.into_split();
        let streams = Arc::new(Mutex::new(StreamManager::new()));
        let defunct = Arc::new(AtomicBool::new(false));
        let event_sender = Arc::new(Mutex::new(None));

        let conn = Arc::new(Self {
            id,
            address,
            generation,
            time_created: Instant::now(),
            protocol_version,
            writer: Mutex::new(BufWriter::new(write_half)),
            streams: streams.clone(),
            defunct: defunct.clone(),
            inflight: AtomicU32::new(0),
            current_keyspace: Mutex::new(None),
            event_sender: event_sender.clone(),
            event_emitter,
        });

        tokio::spawn(reader_loop(read_half, streams, defunct, event_sender));
        conn
    }

    /// Registers this connection as the control connection's event source:
    /// every `EVENT` frame the reader loop sees from now on is forwarded on
    /// the returned channel instead of being silently dropped as an
    /// unmatched stream. Only one subscriber is supported at a time,
    /// matching the CQL protocol's single `REGISTER` per connection.
    pub(crate) async fn subscribe_events(&self) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.event_sender.lock().await = Some(tx);
        rx
    }

    pub(crate) fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::Relaxed)
    }

    pub(crate) fn inflight_count(&self) -> u32 {
        self.inflight.load(Ordering::Relaxed)
    }

    pub(crate) fn is_stale(&self, current_generation: ConnectionGeneration) -> bool {
        self.generation != current_generation
    }

    /// Sends a request frame and awaits its matching response, demultiplexed
    /// by stream id. Can be called concurrently from many tasks sharing the
    /// same `Arc<Connection>`. Writes and flushes immediately; callers
    /// submitting many requests at once (the request processor's hot path)
    /// should prefer [`Connection::enqueue`] followed by a single
    /// [`Connection::flush_writer`], via [`crate::queue::RequestQueue`].
    pub(crate) async fn send(&self, opcode: Opcode, body: bytes::Bytes) -> Result<Frame> {
        let rx = self.enqueue(opcode, body).await?;
        if let Err(err) = self.flush_writer().await {
            self.mark_defunct();
            return Err(err.into());
        }
        self.await_response(rx).await
    }

    /// Registers a response waiter and writes the request frame's bytes, but
    /// does not flush the socket. Grounded on `RequestQueue::handle_flush` in
    /// `request_queue.cpp`, which separates each connection's writes from
    /// the single flush performed once per connection per drain pass.
    pub(crate) async fn enqueue(
        &self,
        opcode: Opcode,
        body: bytes::Bytes,
    ) -> Result<oneshot::Receiver<Result<Frame>>> {
        if self.is_defunct() {
            return Err(Error::with_phase(
                ErrorKind::ConnectionClosed { address: self.address, reason: "connection is defunct" },
                HandshakePhase::AfterCompletion,
            ));
        }

        let (tx, rx) = oneshot::channel();
        let stream = {
            let mut streams = self.streams.lock().await;
            streams.acquire(tx).ok_or(ErrorKind::NoStreams { address: self.address })?
        };
        #[cfg(feature = "tracing-unstable")]
        tracing::trace!(address = %self.address, stream, "acquired a stream id");

        let frame = Frame::request(self.protocol_version, stream, opcode, body);
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);

        self.inflight.fetch_add(1, Ordering::Relaxed);
        let write_result = {
            let mut writer = self.writer.lock().await;
            writer.write_all(&buf).await
        };

        if let Err(err) = write_result {
            self.streams.lock().await.release(stream);
            self.inflight.fetch_sub(1, Ordering::Relaxed);
            self.mark_defunct();
            return Err(err.into());
        }

        Ok(rx)
    }

    pub(crate) async fn flush_writer(&self) -> std::io::Result<()> {
        self.writer.lock().await.flush().await
    }

    pub(crate) async fn await_response(&self, rx: oneshot::Receiver<Result<Frame>>) -> Result<Frame> {
        let response = rx.await.map_err(|_| {
            Error::internal(format!("connection to {} closed before a response arrived", self.address))
        });
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        response?
    }

    /// Records the keyspace a handshake's own `USE` just applied, without
    /// issuing anything itself. Used once by
    /// [`super::establish::ConnectionEstablisher::establish`] right after a
    /// successful `USE`, so [`Connection::ensure_keyspace`] doesn't redo it
    /// on the connection's first real request.
    pub(crate) async fn set_current_keyspace(&self, keyspace: Option<Arc<str>>) {
        *self.current_keyspace.lock().await = keyspace;
    }

    /// Issues a chained `USE "<keyspace>"` if `desired` differs from what
    /// this connection last had set, mirroring
    /// `PooledConnection::write(RequestCallback*, Protected)`'s keyspace
    /// check in `pooled_connection.cpp`. `None` means no session-wide
    /// keyspace is configured, in which case nothing is done regardless of
    /// what this connection currently has set (CQL has no `USE` to clear a
    /// keyspace).
    pub(crate) async fn ensure_keyspace(&self, desired: Option<&Arc<str>>) -> Result<()> {
        {
            let current = self.current_keyspace.lock().await;
            if current.as_deref() == desired.map(|ks| ks.as_ref()) {
                return Ok(());
            }
        }
        let Some(keyspace) = desired else {
            return Ok(());
        };

        let body = use_keyspace_body(keyspace, Consistency::One);
        let response = self.send(Opcode::Query, body).await?;
        if response.is_error() {
            self.mark_defunct();
            return Err(ErrorKind::UnableToSetKeyspace {
                keyspace: keyspace.to_string(),
                message: response.error_kind().to_string(),
            }
            .into());
        }

        *self.current_keyspace.lock().await = Some(keyspace.clone());
        Ok(())
    }

    fn mark_defunct(&self) {
        self.defunct.store(true, Ordering::Relaxed);
    }

    /// Same as the private `mark_defunct`, exposed for callers outside this
    /// module ([`crate::queue`]'s failed-flush path, [`crate::control`]'s
    /// empty-`system.local`-response path) that have no other way to report
    /// a connection-level failure they observed.
    pub(crate) fn mark_defunct_external(&self) {
        self.mark_defunct();
    }

    pub(crate) fn closed_event(
        &self,
        reason: ConnectionClosedReason,
    ) -> crate::event::pool::ConnectionClosedEvent {
        crate::event::pool::ConnectionClosedEvent {
            address: self.address,
            connection_id: self.id,
            reason,
        }
    }

    pub(crate) fn emit_closed(&self, reason: ConnectionClosedReason) {
        self.event_emitter.emit(|handler| {
            handler.handle_connection_closed_event(self.closed_event(reason));
        });
    }
}

/// Reads frames off the socket forever, resolving the oneshot registered for
/// each frame's stream id. Ends (marking the connection defunct) on the
/// first I/O error or clean EOF.
async fn reader_loop(
    mut read_half: OwnedReadHalf,
    streams: Arc<Mutex<StreamManager<oneshot::Sender<Result<Frame>>>>>,
    defunct: Arc<AtomicBool>,
    event_sender: Arc<Mutex<Option<mpsc::UnboundedSender<Frame>>>>,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        match read_frame(&mut read_half, &mut buf).await {
            Ok(Some(frame)) => {
                if frame.opcode == Opcode::Event {
                    if let Some(sender) = &*event_sender.lock().await {
                        let _ = sender.send(frame);
                    }
                    continue;
                }
                let pending = streams.lock().await.release(frame.stream);
                if let Some(sender) = pending {
                    let result = if frame.is_error() {
                        Err(frame.error_kind().into())
                    } else {
                        Ok(frame)
                    };
                    let _ = sender.send(result);
                }
                // else: a response for a stream id nobody is waiting on
                // anymore (already timed out and abandoned) - dropped.
            }
            Ok(None) => break,
            Err(err) => {
                defunct.store(true, Ordering::Relaxed);
                fail_all_pending(&streams, err).await;
                break;
            }
        }
    }
}

async fn fail_all_pending(
    streams: &Mutex<StreamManager<oneshot::Sender<Result<Frame>>>>,
    err: Error,
) {
    let pending = streams.lock().await.drain();
    for sender in pending {
        let _ = sender.send(Err(err.clone()));
    }
}

async fn read_frame(read_half: &mut OwnedReadHalf, buf: &mut BytesMut) -> Result<Option<Frame>> {
    while buf.len() < FRAME_HEADER_LEN {
        if !fill(read_half, buf).await? {
            return Ok(None);
        }
    }
    let header = Frame::decode_header(&buf[..FRAME_HEADER_LEN])?;
    buf.split_to(FRAME_HEADER_LEN);

    while buf.len() < header.body_len {
        if !fill(read_half, buf).await? {
            return Err(Error::internal("connection closed mid-frame"));
        }
    }
    Ok(Some(Frame::finish(header, buf)?))
}

async fn fill(read_half: &mut OwnedReadHalf, buf: &mut BytesMut) -> Result<bool> {
    let mut scratch = [0u8; 4096];
    let n = read_half.read(&mut scratch).await?;
    if n == 0 {
        return Ok(false);
    }
    buf.extend_from_slice(&scratch[..n]);
    Ok(true)
}

/// Resolves a CQL contact point's configured address to a concrete socket
/// address, accounting for the wildcard-bind peer-address substitution rule:
/// a `rpc_address`/`peer` row reporting `0.0.0.0` really means "same address
/// the control connection is already talking to", grounded on
/// `original_source/cpp-driver/src/control_connection.cpp`'s handling of
/// `bind_any_ipv4`/`bind_any_ipv6` rpc addresses.
pub(crate) fn resolve_peer_address(control_connection_peer: SocketAddr, reported: Address) -> Address {
    let is_wildcard = match reported.host {
        std::net::IpAddr::V4(v4) => v4.is_unspecified(),
        std::net::IpAddr::V6(v6) => v6.is_unspecified(),
    };
    if is_wildcard {
        Address::new(control_connection_peer.ip(), reported.port)
    } else {
        reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn wildcard_rpc_address_is_substituted_with_peer_ip() {
        let control_peer: SocketAddr = "10.0.0.5:9042".parse().unwrap();
        let reported = Address::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9042);
        let resolved = resolve_peer_address(control_peer, reported);
        assert_eq!(resolved.host, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn concrete_rpc_address_is_kept_as_is() {
        let control_peer: SocketAddr = "10.0.0.5:9042".parse().unwrap();
        let reported = Address::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 9042);
        let resolved = resolve_peer_address(control_peer, reported);
        assert_eq!(resolved, reported);
    }

    #[test]
    fn stale_generation_detected() {
        let gen_a = ConnectionGeneration(1);
        let gen_b = ConnectionGeneration(2);
        assert_ne!(gen_a, gen_b);
    }
}
