//! Per-host connection pools and the manager that owns one per address.
//!
//! A CQL connection multiplexes many concurrent requests over a single
//! socket via stream ids (see [`stream_manager`]), so there is no
//! checkout/check-in API: the request processor picks a connection out of
//! [`manager::PoolManager::get_or_create`]'s snapshot directly and calls
//! [`conn::Connection::send`] on it.

pub(crate) mod conn;
pub(crate) mod establish;
pub(crate) mod manager;
pub(crate) mod status;
pub(crate) mod stream_manager;
pub(crate) mod worker;

pub(crate) use conn::Connection;
pub(crate) use establish::ConnectionEstablisher;
pub(crate) use manager::PoolManager;
pub(crate) use status::PoolStatus;
pub(crate) use worker::PoolHandle;
