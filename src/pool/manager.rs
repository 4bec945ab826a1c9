//! The top-level pool manager: the address→pool map and the keyspace the
//! whole session is currently using.
//!
//! A cloneable handle wrapping the address-keyed pool map and the keyspace
//! `RwLock<Arc<str>>` every connection's handshake and every new `USE`
//! statement needs to agree on.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use bytes::Bytes;

use super::{
    conn::Connection,
    establish::ConnectionEstablisher,
    worker::{ConnectionPoolWorker, PoolHandle},
};
use crate::{
    error::{ErrorKind, Result},
    event::EventEmitter,
    host::Address,
    options::{DriverOptions, ReconnectPolicy},
    protocol::{use_keyspace_body, Consistency, Opcode},
};

/// Owns one pool per known host plus the keyspace every connection should
/// be using.
pub(crate) struct PoolManager {
    pools: RwLock<HashMap<Address, PoolHandle>>,
    keyspace: Arc<RwLock<Option<Arc<str>>>>,
    target_size: usize,
    establisher: ConnectionEstablisher,
    reconnect_policy: ReconnectPolicy,
    event_emitter: EventEmitter<dyn crate::event::pool::PoolEventHandler>,
}

impl PoolManager {
    pub(crate) fn new(
        options: &DriverOptions,
        establisher: ConnectionEstablisher,
        event_emitter: EventEmitter<dyn crate::event::pool::PoolEventHandler>,
    ) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            keyspace: establisher.keyspace_cell(),
            target_size: options.num_connections_per_host,
            establisher,
            reconnect_policy: options.reconnect_policy,
            event_emitter,
        }
    }

    /// Returns the pool for `address`, creating and starting it if this is
    /// the first time the address has been seen.
    pub(crate) fn get_or_create(&self, address: Address) -> PoolHandle {
        if let Some(pool) = self.pools.read().unwrap().get(&address) {
            return pool.clone();
        }
        let mut pools = self.pools.write().unwrap();
        pools
            .entry(address)
            .or_insert_with(|| {
                ConnectionPoolWorker::start(
                    address,
                    self.target_size,
                    self.establisher.clone(),
                    self.reconnect_policy,
                    self.event_emitter.clone(),
                )
            })
            .clone()
    }

    pub(crate) fn get(&self, address: &Address) -> Option<PoolHandle> {
        self.pools.read().unwrap().get(address).cloned()
    }

    /// The least-busy connection in `address`'s pool, if the pool exists and
    /// has at least one usable member.
    pub(crate) fn least_busy_connection(&self, address: &Address) -> Option<Arc<Connection>> {
        self.get(address)?.least_busy_connection()
    }

    /// Drops the pool for `address` entirely (e.g. on a `REMOVED_NODE`
    /// event); the pool's own worker notices via `WorkerHandleListener` once
    /// this was the last handle and shuts itself down.
    pub(crate) fn remove(&self, address: &Address) {
        self.pools.write().unwrap().remove(address);
    }

    pub(crate) fn addresses(&self) -> Vec<Address> {
        self.pools.read().unwrap().keys().copied().collect()
    }

    pub(crate) fn keyspace(&self) -> Option<Arc<str>> {
        self.keyspace.read().unwrap().clone()
    }

    /// Sets the session-wide keyspace and propagates a `USE "<keyspace>"` to
    /// every connection currently open across every pool. Connections
    /// established afterwards read the same shared cell (see
    /// [`ConnectionEstablisher::keyspace_cell`]) during their own handshake,
    /// so they pick up the new keyspace without this method needing to track
    /// or notify them individually.
    ///
    /// Once this returns, any connection whose `USE` succeeded is
    /// guaranteed consistent with `self.keyspace()` as observed from any
    /// thread, because the write to the lock happens-before the snapshot
    /// any reader takes afterward.
    pub(crate) async fn set_keyspace(&self, keyspace: &str) -> Result<()> {
        let keyspace_arc: Arc<str> = Arc::from(keyspace);
        *self.keyspace.write().unwrap() = Some(keyspace_arc.clone());

        let mut connections = Vec::new();
        for pool in self.pools.read().unwrap().values() {
            connections.extend(pool.connections());
        }

        let body = use_keyspace_body(keyspace, Consistency::One);
        let mut failures = Vec::new();
        for conn in connections {
            if let Err(err) = send_use(&conn, &body).await {
                failures.push(err);
            }
        }

        if let Some(err) = failures.into_iter().next() {
            return Err(ErrorKind::UnableToSetKeyspace {
                keyspace: keyspace.to_string(),
                message: err.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

async fn send_use(conn: &Connection, body: &Bytes) -> Result<()> {
    let response = conn.send(Opcode::Query, body.clone()).await?;
    if response.is_error() {
        return Err(response.error_kind().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyspace_starts_unset_without_configuration() {
        let options = DriverOptions::builder().contact_points(vec!["127.0.0.1".to_string()]).build();
        let establisher = ConnectionEstablisher::new(std::time::Duration::from_secs(5), None, vec![], None);
        let manager = PoolManager::new(&options, establisher, EventEmitter::new(None));
        assert!(manager.keyspace().is_none());
    }

    #[test]
    fn keyspace_starts_set_from_establisher_configuration() {
        let options = DriverOptions::builder().contact_points(vec!["127.0.0.1".to_string()]).build();
        let establisher = ConnectionEstablisher::new(
            std::time::Duration::from_secs(5),
            None,
            vec![],
            Some("my_ks".to_string()),
        );
        let manager = PoolManager::new(&options, establisher, EventEmitter::new(None));
        assert_eq!(manager.keyspace().as_deref(), Some("my_ks"));
    }
}
