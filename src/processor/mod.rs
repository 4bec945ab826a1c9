//! Dispatches one request at a time: builds a query plan, picks a
//! connection per host the plan names, submits the request through this
//! processor's own [`RequestQueue`], and consults the retry policy on
//! failure.
//!
//! Each [`RequestProcessor`] owns a dedicated queue, the same way the
//! original driver this crate's request-dispatch shape is ported from runs
//! one request queue per event-loop thread rather than sharing a single
//! queue across every connection; [`crate::session::Session`] fans requests
//! out across a small, fixed number of processors round-robin instead of
//! spinning one queue per connection.

use std::{sync::Arc, time::Instant};

use bytes::Bytes;

use crate::{
    control::ControlHandle,
    error::{ErrorKind, Result},
    host::{Address, Host, HostRegistry},
    options::{DriverOptions, ExecutionProfile},
    policy::{LoadBalancingPolicy, QueryPlan, QueryPlanRequest},
    pool::{Connection, PoolManager},
    protocol::{Frame, Opcode},
    queue::RequestQueue,
    retry::{RetryContext, RetryDecision, RetryPolicy},
    runtime,
    timestamp::TimestampGenerator,
    wait_for::{self, WaitForOutcome},
};

/// The exponential-moving-average smoothing factor fed into
/// [`Host::record_latency`] on every successful response. Unrelated to
/// [`crate::policy::LatencyAwarePolicy`]'s own `scale` setting, which shapes
/// how stale an average has to look before a host is deferred, not how the
/// average itself is computed.
const LATENCY_SMOOTHING_FACTOR: f64 = 0.1;

/// One request dispatched through [`RequestProcessor::execute`]: an
/// already wire-encoded opcode/body pair plus the routing and retry
/// metadata the processor needs without itself interpreting the body.
pub struct Request {
    pub opcode: Opcode,
    pub body: Bytes,
    pub keyspace: Option<String>,
    pub routing_key: Option<Bytes>,
    pub is_idempotent: bool,
    pub execution_profile: Option<String>,
    /// Bypasses the load-balancing policy entirely and sends only to this
    /// host, used for session-level `set_host`-style pinning. `None` for the
    /// common case of letting the policy pick.
    pub pinned_host: Option<Address>,
}

impl Request {
    pub fn new(opcode: Opcode, body: Bytes) -> Self {
        Self {
            opcode,
            body,
            keyspace: None,
            routing_key: None,
            is_idempotent: false,
            execution_profile: None,
            pinned_host: None,
        }
    }
}

pub(crate) struct RequestProcessor {
    options: Arc<DriverOptions>,
    registry: Arc<HostRegistry>,
    pool_manager: Arc<PoolManager>,
    control: ControlHandle,
    policy: Arc<dyn LoadBalancingPolicy>,
    retry_policy: Arc<dyn RetryPolicy>,
    timestamp_generator: Arc<dyn TimestampGenerator>,
    queue: RequestQueue,
}

impl RequestProcessor {
    pub(crate) fn new(
        options: Arc<DriverOptions>,
        registry: Arc<HostRegistry>,
        pool_manager: Arc<PoolManager>,
        control: ControlHandle,
        policy: Arc<dyn LoadBalancingPolicy>,
        retry_policy: Arc<dyn RetryPolicy>,
        timestamp_generator: Arc<dyn TimestampGenerator>,
    ) -> Self {
        let queue = RequestQueue::start(options.queue_size_io, options.new_request_ratio);
        Self { options, registry, pool_manager, control, policy, retry_policy, timestamp_generator, queue }
    }

    pub(crate) fn timestamp_generator(&self) -> &Arc<dyn TimestampGenerator> {
        &self.timestamp_generator
    }

    fn resolve_profile(&self, name: Option<&str>) -> Result<Option<ExecutionProfile>> {
        match name {
            None => Ok(None),
            Some(name) => self
                .options
                .execution_profiles
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| ErrorKind::ExecutionProfileInvalid { name: name.to_string() }.into()),
        }
    }

    fn build_plan(&self, request: &Request, profile: Option<&ExecutionProfile>) -> QueryPlan {
        if let Some(pinned) = request.pinned_host {
            return match self.registry.get(&pinned) {
                Some(host) => Box::new(std::iter::once(host)),
                None => Box::new(std::iter::empty()),
            };
        }

        let plan_request =
            QueryPlanRequest { keyspace: request.keyspace.clone(), routing_key: request.routing_key.clone() };
        let hosts = self.registry.snapshot();
        let token_map = self.control.token_map();
        let policy = profile.and_then(|p| p.load_balancing_policy.as_ref()).unwrap_or(&self.policy);
        policy.new_query_plan(&plan_request, token_map.as_deref(), &hosts)
    }

    /// Builds a query plan, submits the request to the least-busy connection
    /// of each host the plan names in turn, and applies the retry policy's
    /// decision on every per-attempt failure. Returns the first successful
    /// response, the final rethrown error, or [`ErrorKind::NoHostsAvailable`]
    /// if the plan is exhausted without ever reaching a usable connection.
    pub(crate) async fn execute(&self, request: Request) -> Result<Frame> {
        let profile = self.resolve_profile(request.execution_profile.as_deref())?;
        let request_timeout = profile.as_ref().map(|p| p.request_timeout).unwrap_or(self.options.request_timeout);
        let retry_policy = profile.as_ref().and_then(|p| p.retry_policy.clone()).unwrap_or_else(|| self.retry_policy.clone());

        let mut plan = self.build_plan(&request, profile.as_ref());
        let mut current = plan.next();
        let mut retry_count = 0u32;

        loop {
            let Some(host) = current.take() else {
                return Err(ErrorKind::NoHostsAvailable {
                    message: "query plan exhausted without finding a usable connection".to_string(),
                }
                .into());
            };

            let Some(connection) = self.pool_manager.least_busy_connection(&host.address) else {
                current = plan.next();
                continue;
            };

            match self.attempt(&host, &connection, &request, request_timeout).await {
                Ok(frame) => return Ok(frame),
                Err(err) => {
                    let decision = retry_policy.on_error(
                        err.kind.as_ref(),
                        RetryContext { retry_count, is_idempotent: request.is_idempotent },
                    );
                    retry_count += 1;
                    match decision {
                        RetryDecision::RetrySame => current = Some(host),
                        RetryDecision::RetryNext => current = plan.next(),
                        RetryDecision::Ignore => return Ok(Frame::empty_result(connection.protocol_version)),
                        RetryDecision::Rethrow => return Err(err),
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        host: &Arc<Host>,
        connection: &Arc<Connection>,
        request: &Request,
        request_timeout: std::time::Duration,
    ) -> Result<Frame> {
        connection.ensure_keyspace(self.pool_manager.keyspace().as_ref()).await?;

        host.record_inflight_delta(1);
        let started_at = Instant::now();
        let result = runtime::with_timeout(
            request_timeout,
            self.queue.submit(connection.clone(), request.opcode, request.body.clone()),
        )
        .await
        .and_then(|inner| inner);
        host.record_inflight_delta(-1);

        if result.is_ok() {
            host.record_latency(started_at.elapsed(), LATENCY_SMOOTHING_FACTOR);
        }
        result
    }

    /// Picks a connection to `address` and polls schema agreement on it.
    /// Exposed separately from [`RequestProcessor::execute`] because a
    /// schema-change response's own agreement predicate is evaluated by a
    /// caller that has decoded the `RESULT` body this crate does not parse.
    pub(crate) async fn wait_for_schema_agreement(
        &self,
        address: Address,
        max_wait_time: std::time::Duration,
        schema_agrees: impl FnMut(&Frame, &Frame) -> bool,
    ) -> Result<WaitForOutcome<()>> {
        let connection = self
            .pool_manager
            .least_busy_connection(&address)
            .ok_or_else(|| ErrorKind::NoHostsAvailable {
                message: format!("no connection available to {address} for schema agreement"),
            })?;
        wait_for::wait_for_schema_agreement(&connection, max_wait_time, schema_agrees).await
    }

    pub(crate) async fn wait_for_tracing_data(
        &self,
        address: Address,
        session_id: uuid::Uuid,
        max_wait_time: std::time::Duration,
        has_row: impl FnMut(&Frame) -> bool,
    ) -> Result<WaitForOutcome<()>> {
        let connection = self
            .pool_manager
            .least_busy_connection(&address)
            .ok_or_else(|| ErrorKind::NoHostsAvailable {
                message: format!("no connection available to {address} for tracing data"),
            })?;
        wait_for::wait_for_tracing_data(&connection, session_id, max_wait_time, has_row).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::EventEmitter,
        policy::RoundRobinPolicy,
        pool::ConnectionEstablisher,
        retry::DefaultRetryPolicy,
        timestamp::ServerSideTimestampGenerator,
    };

    fn options() -> Arc<DriverOptions> {
        Arc::new(DriverOptions::builder().contact_points(vec!["127.0.0.1".to_string()]).build())
    }

    #[tokio::test]
    async fn execute_reports_no_hosts_available_on_an_empty_registry() {
        let options = options();
        let registry = Arc::new(HostRegistry::new());
        let establisher = ConnectionEstablisher::new(std::time::Duration::from_secs(5), None, vec![], None);
        let pool_manager = Arc::new(PoolManager::new(&options, establisher, EventEmitter::new(None)));
        let (_control_tx, control_rx) = tokio::sync::watch::channel(None);
        let (_token_tx, token_rx) = tokio::sync::watch::channel(None);
        let control = crate::control::ControlHandle::new_mocked(control_rx, token_rx);

        let processor = RequestProcessor::new(
            options,
            registry,
            pool_manager,
            control,
            Arc::new(RoundRobinPolicy::new()),
            Arc::new(DefaultRetryPolicy),
            Arc::new(ServerSideTimestampGenerator),
        );

        let request = Request::new(Opcode::Query, Bytes::from_static(b"noop"));
        let result = processor.execute(request).await;
        assert!(matches!(result.unwrap_err().kind.as_ref(), ErrorKind::NoHostsAvailable { .. }));
    }

    #[test]
    fn resolve_profile_rejects_an_unregistered_name() {
        let options = options();
        let registry = Arc::new(HostRegistry::new());
        let establisher = ConnectionEstablisher::new(std::time::Duration::from_secs(5), None, vec![], None);
        let pool_manager = Arc::new(PoolManager::new(&options, establisher, EventEmitter::new(None)));
        let (_control_tx, control_rx) = tokio::sync::watch::channel(None);
        let (_token_tx, token_rx) = tokio::sync::watch::channel(None);
        let control = crate::control::ControlHandle::new_mocked(control_rx, token_rx);

        let processor = RequestProcessor::new(
            options,
            registry,
            pool_manager,
            control,
            Arc::new(RoundRobinPolicy::new()),
            Arc::new(DefaultRetryPolicy),
            Arc::new(ServerSideTimestampGenerator),
        );

        let err = processor.resolve_profile(Some("missing")).unwrap_err();
        assert!(matches!(err.kind.as_ref(), ErrorKind::ExecutionProfileInvalid { .. }));
    }
}
