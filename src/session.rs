//! The crate's main entry point: owns the control connection, the per-host
//! pools, the load-balancing policy chain, and a small fixed group of
//! request processors, and fans every call out across that group.
//!
//! `Session` is a cheap, cloneable handle (an `Arc` around its shared
//! state), the same way the driver this crate's dispatch shape is modeled
//! on hands out a cloneable `Client` backed by a single `Arc<ClientInner>`:
//! cloning a `Session` and moving clones into separate tasks is the
//! expected way to share one connection to a cluster across concurrent
//! callers.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use uuid::Uuid;

use crate::{
    control::{ControlConnection, ControlHandle, TopologyCodec},
    error::{ErrorKind, Result},
    event::EventEmitter,
    host::{Address, Host, HostRegistry},
    options::DriverOptions,
    policy::{DcAwarePolicy, LatencyAwarePolicy, LoadBalancingPolicy, TokenAwarePolicy},
    pool::{ConnectionEstablisher, PoolManager},
    processor::{Request, RequestProcessor},
    protocol::{Frame, Opcode},
    retry::{DefaultRetryPolicy, RetryPolicy},
    runtime::{WorkerHandle, WorkerHandleListener},
    timestamp::{ServerSideTimestampGenerator, TimestampGenerator},
    wait_for::WaitForOutcome,
};

/// How many [`RequestProcessor`]s a session fans work out across. Fixed
/// rather than configurable: each processor is a lightweight tokio task
/// with its own request queue, not an OS thread, so there is little reason
/// to size this off CPU count the way a connector's native IO-thread pool
/// would be.
const PROCESSOR_COUNT: usize = 4;

/// How often the background reconciliation task compares the host registry
/// against the pool map and the policy chain's own bookkeeping.
const POOL_RECONCILE_INTERVAL: Duration = Duration::from_millis(200);

/// A connected session against a cluster.
///
/// Construct one with [`Session::connect`], supplying a [`TopologyCodec`]
/// implementation able to decode `system.local`/`system.peers`/schema rows
/// (this crate has no typed-value/result-set decoder of its own; see the
/// `protocol` module documentation for that boundary).
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    options: Arc<DriverOptions>,
    registry: Arc<HostRegistry>,
    pool_manager: Arc<PoolManager>,
    control: ControlHandle,
    policy: Arc<dyn LoadBalancingPolicy>,
    processors: Vec<Arc<RequestProcessor>>,
    next_processor: AtomicUsize,
    _reconciler_handle: WorkerHandle,
}

impl Session {
    /// Builds the load-balancing policy chain, starts the control
    /// connection, and spawns the background pool-reconciliation task and
    /// the fixed group of request processors. Returns immediately without
    /// waiting for an initial control connection to be reached; topology
    /// discovery and pool creation happen in the background, the same way
    /// connecting a client does not block on its monitors becoming ready.
    ///
    /// Must be called from inside a running tokio runtime; it spawns the
    /// control connection's actor task and the pool-reconciliation task
    /// directly rather than deferring that to a first `poll`.
    pub fn connect(options: DriverOptions, codec: Arc<dyn TopologyCodec>) -> Result<Self> {
        if options.contact_points.is_empty() {
            return Err(ErrorKind::UnableToInit { message: "no contact points configured".to_string() }.into());
        }

        let options = Arc::new(options);
        let registry = Arc::new(HostRegistry::new());

        let establisher = ConnectionEstablisher::new(
            options.connect_timeout,
            options.auth_provider.clone(),
            options.startup_options(),
            options.keyspace.clone(),
        );

        let pool_event_emitter = EventEmitter::new(options.pool_event_handler.clone());
        let pool_manager = Arc::new(PoolManager::new(&options, establisher.clone(), pool_event_emitter));

        let topology_event_emitter = EventEmitter::new(options.topology_event_handler.clone());
        let control = ControlConnection::start(
            options.clone(),
            registry.clone(),
            establisher,
            codec,
            topology_event_emitter,
        );

        let policy = build_policy_chain(&options);

        let (reconciler_handle, reconciler_listener) = WorkerHandleListener::channel();
        tokio::spawn(reconcile_pools(
            registry.clone(),
            pool_manager.clone(),
            policy.clone(),
            control.clone(),
            options.clone(),
            reconciler_listener,
        ));

        let processors = (0..PROCESSOR_COUNT)
            .map(|_| {
                Arc::new(RequestProcessor::new(
                    options.clone(),
                    registry.clone(),
                    pool_manager.clone(),
                    control.clone(),
                    policy.clone(),
                    default_retry_policy(),
                    default_timestamp_generator(),
                ))
            })
            .collect();

        Ok(Self {
            inner: Arc::new(SessionInner {
                options,
                registry,
                pool_manager,
                control,
                policy,
                processors,
                next_processor: AtomicUsize::new(0),
                _reconciler_handle: reconciler_handle,
            }),
        })
    }

    /// Dispatches `request` on the next processor in round-robin order.
    pub async fn execute(&self, request: Request) -> Result<Frame> {
        self.next_processor().execute(request).await
    }

    /// Convenience for issuing a bare opcode/body request with the default
    /// routing and retry metadata (non-idempotent, no pinned host, the
    /// default execution profile).
    pub async fn execute_simple(&self, opcode: Opcode, body: Bytes) -> Result<Frame> {
        self.execute(Request::new(opcode, body)).await
    }

    /// Propagates a `USE <keyspace>` to every open connection and to future
    /// ones. See [`PoolManager::set_keyspace`] for the consistency
    /// guarantee this provides once it returns.
    pub async fn use_keyspace(&self, keyspace: &str) -> Result<()> {
        self.inner.pool_manager.set_keyspace(keyspace).await
    }

    /// The cluster members currently known to this session.
    pub fn known_hosts(&self) -> Vec<Arc<Host>> {
        self.inner.registry.snapshot()
    }

    /// The address the control connection currently considers connected, if
    /// any.
    pub fn control_connection_address(&self) -> Option<Address> {
        self.inner.control.connected_host()
    }

    /// Polls `address` for schema agreement, using whichever processor this
    /// session would pick next. Exposed on `Session` rather than only on
    /// the processor so a caller does not need to reach into dispatch
    /// internals to check agreement after a schema-changing statement.
    pub async fn wait_for_schema_agreement(
        &self,
        address: Address,
        schema_agrees: impl FnMut(&Frame, &Frame) -> bool,
    ) -> Result<WaitForOutcome<()>> {
        self.next_processor()
            .wait_for_schema_agreement(address, self.inner.options.max_schema_wait_time, schema_agrees)
            .await
    }

    pub async fn wait_for_tracing_data(
        &self,
        address: Address,
        session_id: Uuid,
        has_row: impl FnMut(&Frame) -> bool,
    ) -> Result<WaitForOutcome<()>> {
        self.next_processor()
            .wait_for_tracing_data(address, session_id, self.inner.options.max_tracing_wait_time, has_row)
            .await
    }

    fn next_processor(&self) -> &Arc<RequestProcessor> {
        let index = self.inner.next_processor.fetch_add(1, Ordering::Relaxed) % self.inner.processors.len();
        &self.inner.processors[index]
    }
}

fn default_retry_policy() -> Arc<dyn RetryPolicy> {
    Arc::new(DefaultRetryPolicy)
}

fn default_timestamp_generator() -> Arc<dyn TimestampGenerator> {
    Arc::new(ServerSideTimestampGenerator)
}

/// Builds the DC-aware/token-aware/latency-aware decorator chain
/// [`DriverOptions`] describes. `DcAwarePolicy` sits at the base (it already
/// rotates local hosts itself rather than needing a `RoundRobinPolicy`
/// child); `TokenAwarePolicy` wraps it when token-aware routing is
/// enabled; an optional `LatencyAwarePolicy` wraps the result.
fn build_policy_chain(options: &DriverOptions) -> Arc<dyn LoadBalancingPolicy> {
    let base: Box<dyn LoadBalancingPolicy> =
        Box::new(DcAwarePolicy::new(options.local_dc.clone(), options.used_hosts_per_remote_dc));

    let routed: Box<dyn LoadBalancingPolicy> = if options.token_aware_routing {
        Box::new(TokenAwarePolicy::new(base, options.token_aware_shuffle_replicas))
    } else {
        base
    };

    match options.latency_aware_settings {
        Some(settings) => Arc::new(LatencyAwarePolicy::new(routed, settings)),
        None => Arc::from(routed),
    }
}

/// Keeps the pool map and the policy chain's host bookkeeping in step with
/// the host registry the control connection maintains, since nothing else
/// pushes "a host appeared/disappeared" notifications to either of them.
async fn reconcile_pools(
    registry: Arc<HostRegistry>,
    pool_manager: Arc<PoolManager>,
    policy: Arc<dyn LoadBalancingPolicy>,
    control: ControlHandle,
    options: Arc<DriverOptions>,
    mut handle_listener: WorkerHandleListener,
) {
    let mut interval = tokio::time::interval(POOL_RECONCILE_INTERVAL);
    loop {
        tokio::select! {
            _ = handle_listener.wait_for_all_handle_drops() => return,
            _ = interval.tick() => {}
        }

        let hosts = registry.snapshot();
        let connected_host = control.connected_host().and_then(|address| registry.get(&address));
        policy.init(connected_host.as_deref(), &hosts, &options.local_dc);

        let known: HashSet<Address> = hosts.iter().map(|host| host.address).collect();

        for host in &hosts {
            if pool_manager.get(&host.address).is_none() {
                pool_manager.get_or_create(host.address);
                policy.on_host_added(host);
            }
        }

        for address in pool_manager.addresses() {
            if known.contains(&address) {
                continue;
            }
            pool_manager.remove(&address);
            if let Some(host) = registry.get(&address) {
                policy.on_host_removed(&host);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{control::HostMetadata, token_map::ReplicationStrategy};

    struct NullCodec;

    impl TopologyCodec for NullCodec {
        fn decode_local(&self, _frame: &Frame) -> Option<HostMetadata> {
            None
        }
        fn decode_peers(&self, _frame: &Frame, _connected_address: Address) -> Vec<(Address, HostMetadata)> {
            Vec::new()
        }
        fn decode_single_peer(&self, _frame: &Frame, _connected_address: Address) -> Option<(Address, HostMetadata)> {
            None
        }
        fn decode_keyspaces(&self, _frame: &Frame) -> Vec<(String, ReplicationStrategy)> {
            Vec::new()
        }
        fn decode_event(&self, _frame: &Frame) -> Option<crate::control::TopologyEvent> {
            None
        }
    }

    fn test_options() -> DriverOptions {
        DriverOptions::builder().contact_points(vec!["127.0.0.1".to_string()]).build()
    }

    #[test]
    fn connect_rejects_empty_contact_points() {
        let options = DriverOptions::builder().contact_points(Vec::<String>::new()).build();
        let err = Session::connect(options, Arc::new(NullCodec)).unwrap_err();
        assert!(matches!(err.kind.as_ref(), ErrorKind::UnableToInit { .. }));
    }

    #[tokio::test]
    async fn connect_starts_with_an_empty_host_list_and_round_robins_processors() {
        let session = Session::connect(test_options(), Arc::new(NullCodec)).unwrap();
        assert!(session.known_hosts().is_empty());
        assert_eq!(session.inner.processors.len(), PROCESSOR_COUNT);

        let first = Arc::as_ptr(session.next_processor());
        let mut saw_different = false;
        for _ in 0..PROCESSOR_COUNT {
            if Arc::as_ptr(session.next_processor()) != first {
                saw_different = true;
                break;
            }
        }
        assert!(saw_different, "round-robin should eventually pick a different processor");
    }

    #[tokio::test]
    async fn execute_on_an_empty_session_reports_no_hosts_available() {
        let session = Session::connect(test_options(), Arc::new(NullCodec)).unwrap();
        let result = session.execute_simple(Opcode::Query, Bytes::from_static(b"noop")).await;
        assert!(matches!(result.unwrap_err().kind.as_ref(), ErrorKind::NoHostsAvailable { .. }));
    }
}
