//! The control connection: one dedicated connection per session that
//! discovers cluster topology, keeps the [`HostRegistry`] and [`TokenMap`]
//! current, and receives the server's pushed `EVENT` frames.
//!
//! A single actor task, started with `start()`, alternates between "not yet
//! connected" (working through a bootstrap plan of candidate addresses) and
//! "connected" (an event-driven loop that runs until the connection dies),
//! reconnecting on its own schedule rather than being driven externally.
//!
//! Row-level decoding of `system.local`/`system.peers`/`system_schema.keyspaces`
//! and of `EVENT` bodies is delegated to a caller-supplied [`TopologyCodec`],
//! for the same reason [`crate::wait_for`] delegates row interpretation to a
//! closure: this crate does not implement the CQL typed-value/result-set
//! codec (see `protocol`'s module doc).

use std::{
    collections::{BTreeMap, HashMap},
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::{BufMut, BytesMut};
use rand::{seq::SliceRandom, thread_rng};
use tokio::sync::{mpsc, watch};

use crate::{
    error::Result,
    event::{
        topology::{
            ControlConnectionFailedEvent, ControlConnectionOpenedEvent, HostAddedEvent,
            HostDownEvent, HostRemovedEvent, HostUpEvent, TopologyEventHandler,
        },
        EventEmitter,
    },
    host::{Address, Host, HostRegistry},
    options::DriverOptions,
    pool::{Connection, ConnectionEstablisher},
    protocol::{query_body, Consistency, Frame, Opcode, QueryParams, QueryValue},
    runtime::{self, WorkerHandle, WorkerHandleListener},
    token_map::{ReplicationStrategy, Token, TokenMap},
};

const SELECT_LOCAL: &str =
    "SELECT rack, data_center, release_version, partitioner FROM system.local WHERE key='local'";
const SELECT_LOCAL_TOKENS: &str =
    "SELECT rack, data_center, release_version, partitioner, tokens FROM system.local WHERE key='local'";
const SELECT_PEERS: &str = "SELECT peer, rpc_address, rack, data_center, release_version FROM system.peers";
const SELECT_PEERS_TOKENS: &str =
    "SELECT peer, rpc_address, rack, data_center, release_version, tokens FROM system.peers";
const SELECT_SINGLE_PEER: &str =
    "SELECT peer, rpc_address, rack, data_center, release_version, tokens FROM system.peers WHERE peer = ?";
const SELECT_KEYSPACES_20: &str = "SELECT keyspace_name, strategy_class, strategy_options FROM system.schema_keyspaces";
const SELECT_KEYSPACES_30: &str = "SELECT keyspace_name, replication FROM system_schema.keyspaces";

/// Delay before retrying the bootstrap plan after a READY control
/// connection that was previously established dies; short, since the
/// cluster topology is already known and any live host can pick it back up.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Metadata about one host read from `system.local`/`system.peers`, already
/// narrowed to what this crate's registry and token map need. Decoding the
/// raw `[bytes]` column values into this shape is the codec's job.
#[derive(Clone, Debug, Default)]
pub struct HostMetadata {
    pub datacenter: String,
    pub rack: String,
    pub release_version: String,
    pub partitioner: Option<String>,
    pub tokens: Vec<String>,
}

/// A cluster-membership or schema change the server pushed on the event
/// connection. Schema changes are narrowed to "a keyspace's replication
/// changed, rebuild the token map" rather than the full
/// table/view/function/type object graph cpp-driver's `on_event` also
/// tracks, per this crate's scope (no schema-metadata object model).
#[derive(Clone, Debug)]
pub enum TopologyEvent {
    NewNode(Address),
    RemovedNode(Address),
    MovedNode(Address),
    Up(Address),
    Down(Address),
    KeyspaceChanged,
}

/// The decoding boundary between this crate's control connection and the
/// CQL result-set codec it does not implement. A real driver built on this
/// core supplies an implementation backed by its typed-value decoder.
pub trait TopologyCodec: Send + Sync {
    /// Decodes the single row `system.local` returns, if any.
    fn decode_local(&self, frame: &Frame) -> Option<HostMetadata>;

    /// Decodes every row of a `system.peers` response, resolving each row's
    /// effective address per the wildcard-`rpc_address`/duplicate-self-row
    /// rules (`original_source/cpp-driver/src/control_connection.cpp`'s
    /// `determine_address_for_peer_host`). `connected_address` is this
    /// connection's own peer, needed to apply those rules; a row resolving
    /// to `connected_address` itself is dropped by the codec rather than
    /// returned, matching the known duplicate-self-row behavior.
    fn decode_peers(&self, frame: &Frame, connected_address: Address) -> Vec<(Address, HostMetadata)>;

    /// Decodes the single row a `WHERE peer = ?` query against
    /// `system.peers` returns, for `NEW_NODE`/`MOVED_NODE` refreshes.
    fn decode_single_peer(&self, frame: &Frame, connected_address: Address) -> Option<(Address, HostMetadata)>;

    /// Decodes a keyspace-replication query's rows into (keyspace name,
    /// strategy) pairs.
    fn decode_keyspaces(&self, frame: &Frame) -> Vec<(String, ReplicationStrategy)>;

    /// Decodes a pushed `EVENT` frame, if it describes something this crate
    /// tracks. Returns `None` for event subtypes outside this crate's scope.
    fn decode_event(&self, frame: &Frame) -> Option<TopologyEvent>;
}

/// A cheap, cloneable handle exposing the control connection's current view
/// of the cluster to the request processor and session.
#[derive(Clone)]
pub(crate) struct ControlHandle {
    connected_host: watch::Receiver<Option<Address>>,
    token_map: watch::Receiver<Option<Arc<TokenMap>>>,
    _worker_handle: WorkerHandle,
}

impl ControlHandle {
    pub(crate) fn connected_host(&self) -> Option<Address> {
        *self.connected_host.borrow()
    }

    pub(crate) fn token_map(&self) -> Option<Arc<TokenMap>> {
        self.token_map.borrow().clone()
    }

    pub(crate) fn token_map_receiver(&self) -> watch::Receiver<Option<Arc<TokenMap>>> {
        self.token_map.clone()
    }

    #[cfg(test)]
    pub(crate) fn new_mocked(
        connected_host: watch::Receiver<Option<Address>>,
        token_map: watch::Receiver<Option<Arc<TokenMap>>>,
    ) -> Self {
        Self { connected_host, token_map, _worker_handle: WorkerHandle::new_mocked() }
    }
}

pub(crate) struct ControlConnection {
    options: Arc<DriverOptions>,
    registry: Arc<HostRegistry>,
    establisher: ConnectionEstablisher,
    codec: Arc<dyn TopologyCodec>,
    event_emitter: EventEmitter<dyn TopologyEventHandler>,

    next_connection_id: u32,
    release_version: Option<String>,
    partitioner: Option<String>,
    keyspace_strategies: HashMap<String, ReplicationStrategy>,

    /// Whether a READY control connection has ever been reached. Before the
    /// first one, bootstrap-plan exhaustion backs off per
    /// [`DriverOptions::reconnect_policy`] (mirroring the per-host pools'
    /// own establishment backoff); afterwards, a dead control connection is
    /// something any live host can immediately pick back up, so the retry
    /// delay is short and constant instead.
    reached_ready: bool,
    bootstrap_failures: u32,

    connected_host: watch::Sender<Option<Address>>,
    token_map: watch::Sender<Option<Arc<TokenMap>>>,
    handle_listener: WorkerHandleListener,
}

impl ControlConnection {
    pub(crate) fn start(
        options: Arc<DriverOptions>,
        registry: Arc<HostRegistry>,
        establisher: ConnectionEstablisher,
        codec: Arc<dyn TopologyCodec>,
        event_emitter: EventEmitter<dyn TopologyEventHandler>,
    ) -> ControlHandle {
        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (connected_host_tx, connected_host_rx) = watch::channel(None);
        let (token_map_tx, token_map_rx) = watch::channel(None);

        let worker = ControlConnection {
            options,
            registry,
            establisher,
            codec,
            event_emitter,
            next_connection_id: 0,
            release_version: None,
            partitioner: None,
            keyspace_strategies: HashMap::new(),
            reached_ready: false,
            bootstrap_failures: 0,
            connected_host: connected_host_tx,
            token_map: token_map_tx,
            handle_listener,
        };

        tokio::spawn(worker.execute());

        ControlHandle {
            connected_host: connected_host_rx,
            token_map: token_map_rx,
            _worker_handle: handle,
        }
    }

    async fn execute(mut self) {
        loop {
            let connection = tokio::select! {
                _ = self.handle_listener.wait_for_all_handle_drops() => return,
                connection = self.attempt_bootstrap() => connection,
            };

            let delay = match connection {
                Some((connection, events)) => {
                    self.reached_ready = true;
                    self.bootstrap_failures = 0;
                    self.connected_host.send_replace(Some(connection.address));
                    self.event_emitter.emit(|h| {
                        h.handle_control_connection_opened_event(ControlConnectionOpenedEvent {
                            address: connection.address,
                        })
                    });

                    tokio::select! {
                        _ = self.handle_listener.wait_for_all_handle_drops() => return,
                        _ = self.run_ready(&connection, events) => {}
                    }
                    self.connected_host.send_replace(None);
                    RECONNECT_DELAY
                }
                None => {
                    self.bootstrap_failures += 1;
                    if self.reached_ready {
                        RECONNECT_DELAY
                    } else {
                        self.options.reconnect_policy.delay_for_attempt(self.bootstrap_failures - 1)
                    }
                }
            };

            tokio::select! {
                _ = self.handle_listener.wait_for_all_handle_drops() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Works through a bootstrap plan until one address yields a fully
    /// discovered, event-subscribed connection, or the plan is exhausted.
    async fn attempt_bootstrap(&mut self) -> Option<(Arc<Connection>, mpsc::UnboundedReceiver<Frame>)> {
        let plan = self.build_bootstrap_plan().await;
        if plan.is_empty() {
            tracing::error!("no hosts available to bootstrap the control connection");
            return None;
        }

        for address in plan {
            match self.connect_and_bootstrap(address).await {
                Ok(result) => return Some(result),
                Err(err) => {
                    tracing::warn!(%address, error = %err, "control connection bootstrap attempt failed");
                    self.event_emitter.emit(|h| {
                        h.handle_control_connection_failed_event(ControlConnectionFailedEvent {
                            address,
                            message: err.to_string(),
                        })
                    });
                }
            }
        }
        None
    }

    /// Known hosts from the registry (shuffled if configured) on a
    /// reconnect; the configured contact points, resolved, on first
    /// connect. Mirrors `ControlStartupQueryPlan`'s two-phase address list.
    async fn build_bootstrap_plan(&self) -> Vec<Address> {
        let known = self.registry.snapshot();
        let mut addresses: Vec<Address> = if !known.is_empty() {
            known.iter().map(|host| host.address).collect()
        } else {
            resolve_contact_points(
                &self.options.contact_points,
                self.options.port,
                self.options.resolve_timeout,
                self.options.use_hostname_resolution,
            )
            .await
        };

        if self.options.use_randomized_contact_points {
            addresses.shuffle(&mut thread_rng());
        }
        addresses
    }

    async fn connect_and_bootstrap(
        &mut self,
        address: Address,
    ) -> Result<(Arc<Connection>, mpsc::UnboundedReceiver<Frame>)> {
        let id = self.next_connection_id;
        self.next_connection_id += 1;

        let connection = self
            .establisher
            .establish(id, address, crate::pool::conn::ConnectionGeneration(0), EventEmitter::new(None))
            .await?;

        if let Err(err) = self.query_hosts(&connection).await {
            connection.mark_defunct_external();
            return Err(err);
        }

        if self.options.use_schema || self.options.token_aware_routing {
            let release_version = self.release_version.clone().unwrap_or_default();
            if let Err(err) = self.query_schema(&connection, &release_version).await {
                tracing::warn!(%address, error = %err, "schema query failed during control connection bootstrap, continuing without a token map");
            }
        }

        self.register_for_events(&connection).await?;
        let events = connection.subscribe_events().await;
        Ok((connection, events))
    }

    /// Queries `system.local`/`system.peers` and installs every row into the
    /// registry. If `system.local` returns no row the connected host is
    /// unusable as a control connection; the caller defuncts the connection
    /// and moves on to the next candidate.
    async fn query_hosts(&mut self, connection: &Arc<Connection>) -> Result<()> {
        let local_cql = if self.options.token_aware_routing { SELECT_LOCAL_TOKENS } else { SELECT_LOCAL };
        let peers_cql = if self.options.token_aware_routing { SELECT_PEERS_TOKENS } else { SELECT_PEERS };

        let local_frame = query(connection, local_cql, Consistency::One).await?;
        let peers_frame = query(connection, peers_cql, Consistency::One).await?;

        let Some(local) = self.codec.decode_local(&local_frame) else {
            return Err(crate::error::ErrorKind::Internal {
                message: format!("system.local returned no row from {}", connection.address),
            }
            .into());
        };

        self.partitioner = local.partitioner.clone();
        self.release_version = Some(local.release_version.clone());
        self.registry.replace(connection.address, host_from_metadata(connection.address, local));

        for (address, metadata) in self.codec.decode_peers(&peers_frame, connection.address) {
            self.registry.replace(address, host_from_metadata(address, metadata));
        }

        Ok(())
    }

    /// Refreshes a single peer row (`NEW_NODE`/`MOVED_NODE`), used instead of
    /// a full `query_hosts` re-scan so a topology event touches only the
    /// host it names.
    async fn refresh_single_host(&mut self, connection: &Arc<Connection>, address: Address) -> Result<()> {
        let mut params = QueryParams::new(Consistency::One);
        params.values.push(QueryValue::Set(inet_bytes(address.host)));
        let body = query_body(SELECT_SINGLE_PEER, &params);

        let response = connection.send(Opcode::Query, body).await?;
        if response.is_error() {
            return Err(response.error_kind().into());
        }
        if let Some((resolved, metadata)) = self.codec.decode_single_peer(&response, connection.address) {
            self.registry.replace(resolved, host_from_metadata(resolved, metadata));
            self.rebuild_token_map();
        }
        Ok(())
    }

    /// Queries the replication strategy of every keyspace and rebuilds the
    /// token map from the current registry snapshot. `release_version`
    /// selects the pre-3.0 `system.schema_keyspaces` table from the
    /// `system_schema.keyspaces` table newer clusters use.
    async fn query_schema(&mut self, connection: &Arc<Connection>, release_version: &str) -> Result<()> {
        let cql = if uses_system_schema_keyspaces(release_version) { SELECT_KEYSPACES_30 } else { SELECT_KEYSPACES_20 };
        let frame = query(connection, cql, Consistency::One).await?;
        self.keyspace_strategies = self.codec.decode_keyspaces(&frame).into_iter().collect();
        self.rebuild_token_map();
        Ok(())
    }

    /// Rebuilds the whole token map from the current registry snapshot and
    /// the last-known per-keyspace replication strategies. Each host's
    /// `tokens` column is a list of decimal-string Murmur3 token values
    /// (`original_source/cpp-driver/src/token_map.cpp`'s row-processing
    /// loop parses the same column the same way); unparseable entries are
    /// skipped rather than failing the whole rebuild.
    fn rebuild_token_map(&mut self) {
        let hosts = self.registry.snapshot();
        let mut token_map = TokenMap::empty(self.partitioner.clone().unwrap_or_default());

        for (keyspace, strategy) in &self.keyspace_strategies {
            let mut ring = BTreeMap::new();
            for host in &hosts {
                for token_str in &host.tokens {
                    match token_str.parse::<i64>() {
                        Ok(value) => {
                            ring.insert(Token(value), host.clone());
                        }
                        Err(_) => tracing::debug!(
                            address = %host.address,
                            token = %token_str,
                            "skipping unparseable token"
                        ),
                    }
                }
            }
            token_map.set_keyspace_ring(keyspace.clone(), strategy.clone(), ring);
        }

        self.token_map.send_replace(Some(Arc::new(token_map)));
    }

    async fn register_for_events(&self, connection: &Arc<Connection>) -> Result<()> {
        let mut types = vec!["TOPOLOGY_CHANGE", "STATUS_CHANGE"];
        if self.options.use_schema || self.options.token_aware_routing {
            types.push("SCHEMA_CHANGE");
        }

        let mut body = BytesMut::new();
        body.put_u16(types.len() as u16);
        for event_type in types {
            body.put_u16(event_type.len() as u16);
            body.extend_from_slice(event_type.as_bytes());
        }

        let response = connection.send(Opcode::Register, body.freeze()).await?;
        if response.is_error() {
            return Err(response.error_kind().into());
        }
        Ok(())
    }

    /// The steady-state loop: reacts to pushed `EVENT` frames and notices if
    /// the connection died silently (its reader task ended without anyone
    /// observing it, since nothing else polls this connection once the
    /// bootstrap queries are done).
    async fn run_ready(&mut self, connection: &Arc<Connection>, mut events: mpsc::UnboundedReceiver<Frame>) {
        let mut health_check = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_check.tick().await;

        loop {
            tokio::select! {
                frame = events.recv() => {
                    match frame {
                        Some(frame) => self.handle_event(connection, frame).await,
                        None => return,
                    }
                }
                _ = health_check.tick() => {
                    if connection.is_defunct() {
                        return;
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, connection: &Arc<Connection>, frame: Frame) {
        let Some(event) = self.codec.decode_event(&frame) else { return };

        match event {
            TopologyEvent::NewNode(address) => {
                if self.registry.get(&address).is_none() {
                    self.registry.get_or_insert(address);
                    if let Err(err) = self.refresh_single_host(connection, address).await {
                        tracing::warn!(%address, error = %err, "failed to refresh a newly added host");
                    }
                    self.event_emitter.emit(|h| h.handle_host_added_event(HostAddedEvent { address }));
                }
            }
            TopologyEvent::RemovedNode(address) => {
                if self.registry.remove(&address).is_some() {
                    self.rebuild_token_map();
                    self.event_emitter.emit(|h| h.handle_host_removed_event(HostRemovedEvent { address }));
                } else {
                    // The source's REMOVED_NODE handling looks the host up and, if
                    // it is not found, still calls into `remove_host_and_build` with
                    // the null result rather than skipping the rebuild. The intent
                    // behind removing a host that was never known is not something
                    // this crate resolves by guessing; nothing further happens here
                    // beyond the log line below.
                    tracing::debug!(%address, "REMOVED_NODE for a host that isn't in the registry");
                }
            }
            TopologyEvent::MovedNode(address) => {
                if self.registry.get(&address).is_some() {
                    if let Err(err) = self.refresh_single_host(connection, address).await {
                        tracing::warn!(%address, error = %err, "failed to refresh a moved host");
                    }
                } else {
                    tracing::debug!(%address, "MOVED_NODE for a host that isn't in the registry");
                }
            }
            TopologyEvent::Up(address) => {
                self.event_emitter.emit(|h| h.handle_host_up_event(HostUpEvent { address }));
            }
            TopologyEvent::Down(address) => {
                self.event_emitter.emit(|h| h.handle_host_down_event(HostDownEvent { address }));
            }
            TopologyEvent::KeyspaceChanged => {
                if self.options.use_schema || self.options.token_aware_routing {
                    let release_version = self.release_version.clone().unwrap_or_default();
                    if let Err(err) = self.query_schema(connection, &release_version).await {
                        tracing::warn!(error = %err, "failed to refresh schema after a keyspace change event");
                    }
                }
            }
        }
    }
}

/// The CQL `inet` wire value: the raw 4 or 16 address bytes, no length
/// prefix (the surrounding `[bytes]` framing in [`QueryValue::Set`] already
/// carries the length). Unlike decoding an arbitrary result-set column,
/// constructing this one bind value doesn't require the general typed-value
/// codec this crate leaves out of scope.
fn inet_bytes(ip: IpAddr) -> bytes::Bytes {
    match ip {
        IpAddr::V4(v4) => bytes::Bytes::copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => bytes::Bytes::copy_from_slice(&v6.octets()),
    }
}

fn host_from_metadata(address: Address, metadata: HostMetadata) -> Host {
    let mut host = Host::new(address);
    host.datacenter = metadata.datacenter;
    host.rack = metadata.rack;
    host.release_version = metadata.release_version;
    host.partitioner = metadata.partitioner;
    host.tokens = metadata.tokens;
    host
}

fn uses_system_schema_keyspaces(release_version: &str) -> bool {
    release_version
        .split('.')
        .next()
        .and_then(|major| major.parse::<u32>().ok())
        .is_some_and(|major| major >= 3)
}

async fn query(connection: &Arc<Connection>, cql: &str, consistency: Consistency) -> Result<Frame> {
    let body = query_body(cql, &QueryParams::new(consistency));
    let response = connection.send(Opcode::Query, body).await?;
    if response.is_error() {
        return Err(response.error_kind().into());
    }
    Ok(response)
}

/// Resolves contact points to concrete addresses. Entries that already
/// parse as an IP address skip DNS entirely; everything else goes through
/// `tokio::net::lookup_host`, bounded by `resolve_timeout`, unless hostname
/// resolution is disabled, in which case unparseable entries are dropped
/// with a warning.
async fn resolve_contact_points(
    contact_points: &[String],
    port: u16,
    resolve_timeout: Duration,
    use_hostname_resolution: bool,
) -> Vec<Address> {
    let mut addresses = Vec::new();
    for contact_point in contact_points {
        if let Ok(ip) = contact_point.parse::<IpAddr>() {
            addresses.push(Address::new(ip, port));
            continue;
        }
        if !use_hostname_resolution {
            tracing::warn!(%contact_point, "not an IP address and hostname resolution is disabled, skipping");
            continue;
        }

        let lookup_target = format!("{contact_point}:{port}");
        match runtime::with_timeout(resolve_timeout, tokio::net::lookup_host(lookup_target)).await {
            Ok(Ok(resolved)) => {
                addresses.extend(resolved.map(|socket_addr: SocketAddr| Address::new(socket_addr.ip(), port)));
            }
            Ok(Err(err)) => tracing::warn!(%contact_point, error = %err, "failed to resolve contact point"),
            Err(_) => tracing::warn!(%contact_point, "contact point resolution timed out"),
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_system_schema_keyspaces_at_version_3_and_above() {
        assert!(!uses_system_schema_keyspaces("2.2.19"));
        assert!(uses_system_schema_keyspaces("3.0.24"));
        assert!(uses_system_schema_keyspaces("4.1.0"));
        assert!(!uses_system_schema_keyspaces(""));
    }

    #[test]
    fn host_from_metadata_carries_every_field() {
        let address = Address::new(IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)), 9042);
        let metadata = HostMetadata {
            datacenter: "dc1".into(),
            rack: "rack1".into(),
            release_version: "4.0.1".into(),
            partitioner: Some("Murmur3Partitioner".into()),
            tokens: vec!["12345".into()],
        };
        let host = host_from_metadata(address, metadata);
        assert_eq!(host.datacenter, "dc1");
        assert_eq!(host.tokens, vec!["12345".to_string()]);
    }

    #[tokio::test]
    async fn resolve_contact_points_accepts_literal_ip_addresses() {
        let resolved = resolve_contact_points(&["127.0.0.1".to_string()], 9042, Duration::from_secs(1), true).await;
        assert_eq!(resolved, vec![Address::new(IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)), 9042)]);
    }

    #[tokio::test]
    async fn resolve_contact_points_skips_unresolvable_names_when_disabled() {
        let resolved =
            resolve_contact_points(&["not-an-ip".to_string()], 9042, Duration::from_secs(1), false).await;
        assert!(resolved.is_empty());
    }
}
