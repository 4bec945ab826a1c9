//! Driver-wide configuration.
//!
//! A `typed_builder`-derived struct with `#[builder(default = ...)]` per
//! field, `Derivative`-driven `Debug`/`PartialEq` that skip non-Debug
//! trait-object fields (the event handlers), and `Arc<dyn Handler>` fields
//! for optional user monitors.

use std::{collections::HashMap, sync::Arc, time::Duration};

use derivative::Derivative;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::{
    event::{pool::PoolEventHandler, topology::TopologyEventHandler},
    policy::{latency_aware::LatencyAwareSettings, LoadBalancingPolicy},
    protocol::Consistency,
    retry::RetryPolicy,
};

/// How the control connection and pools back off between reconnect
/// attempts after a connection-establishment failure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReconnectPolicy {
    /// Always wait the same amount of time between attempts.
    Constant { delay: Duration },
    /// Double the delay after each failure, up to `max`.
    Exponential { base: Duration, max: Duration },
}

impl ReconnectPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Constant { delay } => delay,
            ReconnectPolicy::Exponential { base, max } => {
                let shift = attempt.min(31);
                base.checked_mul(1u32 << shift).unwrap_or(max).min(max)
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        // Grounded in `original_source/cpp-driver`'s default exponential
        // reconnection policy (2s base, 2min cap).
        ReconnectPolicy::Exponential { base: Duration::from_secs(2), max: Duration::from_secs(120) }
    }
}

/// A credential provider. Only plain-text `PasswordAuthenticator`-style
/// credentials are modeled; anything more exotic (SASL mechanisms, OIDC) is
/// out of scope.
#[derive(Clone, Debug)]
pub struct AuthProvider {
    pub username: String,
    pub password: String,
}

impl AuthProvider {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }

    /// The `AUTH_RESPONSE` initial token for `PasswordAuthenticator`:
    /// `\0<username>\0<password>`.
    pub(crate) fn initial_response(&self) -> Vec<u8> {
        let mut token = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        token
    }
}

/// A named bundle of per-request settings, selectable per-query.
///
/// `retry_policy`/`load_balancing_policy` override [`crate::Session`]'s
/// session-wide policies for requests that select this profile; when left
/// unset the request falls back to the session-wide ones, the same way
/// `consistency`/`serial_consistency` fall back to whatever the caller
/// already encoded into the request body if the profile doesn't override
/// them.
#[derive(Clone, Derivative, TypedBuilder)]
#[derivative(Debug)]
#[builder(field_defaults(setter(into)))]
pub struct ExecutionProfile {
    #[builder(default = Consistency::LocalOne)]
    pub consistency: Consistency,
    #[builder(default = Duration::from_secs(12))]
    pub request_timeout: Duration,
    #[builder(default)]
    pub serial_consistency: Option<Consistency>,
    #[derivative(Debug = "ignore")]
    #[builder(default)]
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
    #[derivative(Debug = "ignore")]
    #[builder(default)]
    pub load_balancing_policy: Option<Arc<dyn LoadBalancingPolicy>>,
}

impl Default for ExecutionProfile {
    fn default() -> Self {
        ExecutionProfile::builder().build()
    }
}

/// Top-level configuration consumed by [`crate::Session::connect`]; the one
/// struct every other component reads its tunables from.
#[derive(Derivative, TypedBuilder)]
#[derivative(Debug)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct DriverOptions {
    /// Initial contact points: hostnames or addresses, resolved at connect
    /// time.
    pub contact_points: Vec<String>,

    #[builder(default = 9042)]
    pub port: u16,

    /// `None` means auto-negotiate starting from the newest supported
    /// version.
    #[builder(default)]
    pub protocol_version: Option<u8>,

    /// Connections opened per pool once steady, grounded in the original
    /// driver's default core connections per host (`2`).
    #[builder(default = 2)]
    pub num_connections_per_host: usize,

    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,

    #[builder(default = Duration::from_secs(12))]
    pub request_timeout: Duration,

    #[builder(default = Duration::from_secs(2))]
    pub resolve_timeout: Duration,

    #[builder(default)]
    pub reconnect_policy: ReconnectPolicy,

    #[builder(default)]
    pub execution_profiles: HashMap<String, ExecutionProfile>,

    #[builder(default = true)]
    pub use_schema: bool,

    #[builder(default = true)]
    pub token_aware_routing: bool,

    #[builder(default = true)]
    pub token_aware_shuffle_replicas: bool,

    #[builder(default = true)]
    pub use_hostname_resolution: bool,

    #[builder(default = false)]
    pub use_randomized_contact_points: bool,

    /// Grounded in the original driver's `DEFAULT_CONNECTION_HEARTBEAT_INTERVAL_SECS` (30s).
    #[builder(default = Duration::from_secs(30))]
    pub heartbeat_interval: Duration,

    #[builder(default)]
    pub connection_idle_timeout: Option<Duration>,

    #[builder(default = Duration::from_secs(10))]
    pub max_schema_wait_time: Duration,

    #[builder(default = Duration::from_secs(10))]
    pub max_tracing_wait_time: Duration,

    #[builder(default = Consistency::One)]
    pub tracing_consistency: Consistency,

    /// Bounded capacity of each connection's outbound request queue.
    #[builder(default = 8192)]
    pub queue_size_io: usize,

    #[builder(default = Duration::from_micros(200))]
    pub coalesce_delay: Duration,

    /// Ratio of new-request reads to flush-queue drains the request queue
    /// alternates between while coalescing, grounded in the original
    /// driver's `new_request_ratio` throttle (default 50%).
    #[builder(default = 50)]
    pub new_request_ratio: u8,

    #[builder(default)]
    pub keyspace: Option<String>,

    #[builder(default)]
    pub auth_provider: Option<AuthProvider>,

    #[builder(default = "rust-cql-core".to_string())]
    pub application_name: String,

    #[builder(default)]
    pub application_version: Option<String>,

    #[builder(default_code = "Uuid::new_v4()")]
    pub client_id: Uuid,

    #[builder(default = false)]
    pub no_compact: bool,

    #[derivative(Debug = "ignore")]
    #[builder(default)]
    pub pool_event_handler: Option<Arc<dyn PoolEventHandler>>,

    #[derivative(Debug = "ignore")]
    #[builder(default)]
    pub topology_event_handler: Option<Arc<dyn TopologyEventHandler>>,

    /// Preferred data center for the DC-aware policy chain every
    /// [`crate::Session`] builds. Empty discovers it from the first contact
    /// point reached, mirroring `cass_cluster_set_load_balance_dc_aware`'s
    /// "local DC inferred from the connected host" behavior when none is set.
    #[builder(default)]
    pub local_dc: String,

    /// Remote-DC hosts kept reachable as a fallback, same default (`0`, no
    /// remote hosts considered) as `cass_cluster_set_load_balance_dc_aware`.
    #[builder(default = 0)]
    pub used_hosts_per_remote_dc: usize,

    /// Wraps the DC-aware/token-aware chain in a [`LatencyAwarePolicy`] using
    /// these settings when set.
    ///
    /// [`LatencyAwarePolicy`]: crate::policy::LatencyAwarePolicy
    #[builder(default)]
    pub latency_aware_settings: Option<LatencyAwareSettings>,
}

impl DriverOptions {
    pub(crate) fn startup_options(&self) -> Vec<(String, String)> {
        let mut opts = vec![
            ("CQL_VERSION".to_string(), "3.0.0".to_string()),
            ("DRIVER_NAME".to_string(), "cqlcore".to_string()),
            ("DRIVER_VERSION".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ("CLIENT_ID".to_string(), self.client_id.to_string()),
        ];
        if !self.application_name.is_empty() {
            opts.push(("APPLICATION_NAME".to_string(), self.application_name.clone()));
        }
        if let Some(version) = &self.application_version {
            opts.push(("APPLICATION_VERSION".to_string(), version.clone()));
        }
        if self.no_compact {
            opts.push(("NO_COMPACT".to_string(), "true".to_string()));
        }
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_reconnect_caps_at_max() {
        let policy = ReconnectPolicy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn startup_options_include_required_keys() {
        let opts = DriverOptions::builder().contact_points(vec!["127.0.0.1".to_string()]).build();
        let startup = opts.startup_options();
        assert!(startup.iter().any(|(k, _)| k == "CQL_VERSION"));
        assert!(startup.iter().any(|(k, _)| k == "CLIENT_ID"));
    }

    #[test]
    fn auth_provider_initial_response_format() {
        let provider = AuthProvider::new("alice", "hunter2");
        let token = provider.initial_response();
        assert_eq!(token, b"\0alice\0hunter2");
    }
}
