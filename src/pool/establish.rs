//! The connector: turns a bare [`Address`] into a handshaked, pooled
//! [`Connection`].
//!
//! A reusable, cloneable establisher holding shared configuration, with a
//! `connect_timeout`-bounded connect step followed by a CQL
//! `STARTUP`/`READY`/`AUTHENTICATE` handshake step with protocol-version
//! negotiation. TLS is out of scope, so there is no TLS configuration here.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

use bytes::{BufMut, BytesMut};
use tokio::net::TcpStream;

use super::conn::{Connection, ConnectionGeneration};
use crate::{
    error::{Error, ErrorKind, HandshakePhase, Result},
    event::EventEmitter,
    host::Address,
    options::AuthProvider,
    protocol::{use_keyspace_body, Consistency, Opcode, SUPPORTED_PROTOCOL_VERSIONS},
    runtime,
};

/// Shared, cheaply-cloneable configuration used to establish every
/// connection a pool creates.
///
/// `keyspace` is shared (not copied) with [`super::manager::PoolManager`]:
/// both hold the same `Arc<RwLock<Option<Arc<str>>>>`, so a
/// [`super::manager::PoolManager::set_keyspace`] call is immediately visible
/// to every connection this establisher handshakes afterward, without either
/// side needing to notify the other.
#[derive(Clone)]
pub(crate) struct ConnectionEstablisher {
    pub(crate) connect_timeout: Duration,
    pub(crate) auth_provider: Option<AuthProvider>,
    pub(crate) startup_options: Vec<(String, String)>,
    keyspace: Arc<RwLock<Option<Arc<str>>>>,
}

impl ConnectionEstablisher {
    pub(crate) fn new(
        connect_timeout: Duration,
        auth_provider: Option<AuthProvider>,
        startup_options: Vec<(String, String)>,
        keyspace: Option<String>,
    ) -> Self {
        let keyspace = Arc::new(RwLock::new(keyspace.map(|k| Arc::from(k.as_str()))));
        Self { connect_timeout, auth_provider, startup_options, keyspace }
    }

    /// The shared keyspace cell this establisher consults on every
    /// handshake, for [`super::manager::PoolManager`] to read and write
    /// through rather than tracking its own, separate copy.
    pub(crate) fn keyspace_cell(&self) -> Arc<RwLock<Option<Arc<str>>>> {
        self.keyspace.clone()
    }

    async fn make_stream(&self, address: Address) -> Result<TcpStream> {
        let socket_addr = std::net::SocketAddr::new(address.host, address.port);
        let stream = match runtime::with_timeout(self.connect_timeout, TcpStream::connect(socket_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(io_err)) => return Err(io_err.into()),
            Err(_) => return Err(ErrorKind::ConnectTimeout { address }.into()),
        };

        let socket = socket2::Socket::from(stream.into_std()?);
        let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        socket.set_tcp_keepalive(&keepalive)?;
        Ok(TcpStream::from_std(socket.into())?)
    }

    /// Connects, negotiates a protocol version, and completes the
    /// `STARTUP`/`AUTHENTICATE` handshake, returning a pooled connection
    /// ready to serve requests.
    ///
    /// Each protocol version is tried on its own fresh TCP connection
    /// (`TcpStream` can't be cloned, and a connection that has already sent
    /// a rejected `STARTUP` is not safely reusable) starting from the
    /// newest version and falling back to older ones until one is accepted
    /// or the list is exhausted. After `STARTUP`/`AUTHENTICATE` completes,
    /// a configured keyspace is applied with a `USE` before the connection
    /// is handed back. Critical establishment errors (authentication
    /// failure, an invalid keyspace) abort immediately rather than falling
    /// back, since a different protocol version will not fix them; see
    /// [`Error::is_critical_establish_error`].
    pub(crate) async fn establish(
        &self,
        id: u32,
        address: Address,
        generation: ConnectionGeneration,
        event_emitter: EventEmitter<dyn crate::event::pool::PoolEventHandler>,
    ) -> Result<Arc<Connection>> {
        let mut last_err = None;
        for (idx, &version) in SUPPORTED_PROTOCOL_VERSIONS.iter().enumerate() {
            let socket = match self.make_stream(address).await {
                Ok(socket) => socket,
                Err(err) => return Err(err),
            };
            socket.set_nodelay(true).ok();

            let conn =
                Connection::from_parts(id, address, generation, version, socket, event_emitter.clone());

            match self.startup(&conn).await {
                Ok(()) => {
                    self.apply_keyspace(&conn).await?;
                    return Ok(conn);
                }
                Err(err) if err.is_critical_establish_error() => return Err(err),
                Err(err) => {
                    let is_last = idx + 1 == SUPPORTED_PROTOCOL_VERSIONS.len();
                    last_err = Some(err);
                    if is_last {
                        break;
                    }
                }
            }
        }

        Err(Error::with_phase(
            ErrorKind::UnableToDetermineProtocol {
                message: format!(
                    "server at {address} rejected every supported protocol version ({:?}); last error: {}",
                    SUPPORTED_PROTOCOL_VERSIONS,
                    last_err.map(|e| e.to_string()).unwrap_or_default(),
                ),
            },
            HandshakePhase::PreOptions,
        ))
    }

    async fn startup(&self, conn: &Connection) -> Result<()> {
        let mut body = BytesMut::new();
        body.put_u16(self.startup_options.len() as u16);
        for (key, value) in &self.startup_options {
            put_short_string(&mut body, key);
            put_short_string(&mut body, value);
        }

        let response = conn.send(Opcode::Startup, body.freeze()).await?;
        match response.opcode {
            Opcode::Ready => Ok(()),
            Opcode::Authenticate => self.authenticate(conn).await,
            Opcode::Error => Err(Error::with_phase(response.error_kind(), HandshakePhase::PreOptions)),
            other => Err(Error::with_phase(
                ErrorKind::UnableToConnect {
                    message: format!("unexpected opcode {other:?} in response to STARTUP"),
                },
                HandshakePhase::PreOptions,
            )),
        }
    }

    async fn authenticate(&self, conn: &Connection) -> Result<()> {
        let Some(provider) = &self.auth_provider else {
            return Err(Error::with_phase(
                ErrorKind::Authentication {
                    message: "server requires authentication but no credentials were configured"
                        .into(),
                },
                HandshakePhase::PostOptions,
            ));
        };

        let mut body = BytesMut::new();
        let token = provider.initial_response();
        body.put_i32(token.len() as i32);
        body.extend_from_slice(&token);

        let response = conn.send(Opcode::AuthResponse, body.freeze()).await?;
        match response.opcode {
            Opcode::AuthSuccess => Ok(()),
            Opcode::Error => {
                Err(Error::with_phase(response.error_kind(), HandshakePhase::PostOptions))
            }
            other => Err(Error::with_phase(
                ErrorKind::Authentication {
                    message: format!("unexpected opcode {other:?} during authentication"),
                },
                HandshakePhase::PostOptions,
            )),
        }
    }

    /// Issues `USE "<keyspace>"` if a keyspace is configured, reading it
    /// from the shared cell rather than a constructor-time snapshot so a
    /// [`super::manager::PoolManager::set_keyspace`] call that lands between
    /// two connection attempts is still picked up. A failure here is always
    /// critical: it isn't protocol-version-dependent, so falling back to an
    /// older version would not help.
    async fn apply_keyspace(&self, conn: &Connection) -> Result<()> {
        let Some(keyspace) = self.keyspace.read().unwrap().clone() else {
            return Ok(());
        };

        let body = use_keyspace_body(&keyspace, Consistency::One);
        let response = conn.send(Opcode::Query, body).await?;
        if response.is_error() {
            return Err(Error::with_phase(
                ErrorKind::UnableToSetKeyspace {
                    keyspace: keyspace.to_string(),
                    message: response.error_kind().to_string(),
                },
                HandshakePhase::AfterCompletion,
            ));
        }
        conn.set_current_keyspace(Some(keyspace)).await;
        Ok(())
    }
}

fn put_short_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}
