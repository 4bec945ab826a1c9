//! A generic polling helper used for schema agreement and tracing-data
//! retrieval.
//!
//! Issues a batch of sub-queries on a connection, evaluates a completion
//! predicate over the results, and either finishes, sleeps
//! `retry_wait_time` and re-issues, or times out non-fatally. Expressed as
//! one type parameterized by a predicate closure rather than two
//! near-identical callback types, since the two use cases differ only in
//! which queries they issue and how they read the result.
//!
//! Row-level interpretation of the queries' results (reading the
//! `schema_version` column, checking `system_traces.sessions` row count) is
//! the caller's concern: this crate does not implement result-set decoding,
//! so the predicate closures below receive the raw response [`Frame`]s
//! rather than decoded rows.

use std::{future::Future, sync::Arc, time::Duration};

use crate::{
    error::Result,
    pool::Connection,
    protocol::{query_body, Consistency, Frame, Opcode, QueryParams},
};

/// The outcome of a wait-for poll loop. `TimedOut` is deliberately not an
/// `Err` variant: schema-agreement and tracing-fetch timeouts are treated as
/// non-fatal, passing the original response through.
pub enum WaitForOutcome<T> {
    Satisfied(T),
    TimedOut,
}

/// Polls `issue_and_check` until it reports satisfaction or `max_wait_time`
/// elapses, sleeping `retry_wait_time` between attempts.
///
/// `issue_and_check` should run its sub-queries and return `Some(value)`
/// once the predicate holds, or `None` to request another attempt after the
/// retry interval.
pub(crate) async fn poll_until<F, Fut, T>(
    max_wait_time: Duration,
    retry_wait_time: Duration,
    mut issue_and_check: F,
) -> Result<WaitForOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + max_wait_time;

    loop {
        if let Some(value) = issue_and_check().await? {
            return Ok(WaitForOutcome::Satisfied(value));
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(WaitForOutcome::TimedOut);
        }
        tokio::time::sleep(retry_wait_time.min(deadline - now)).await;
        if tokio::time::Instant::now() >= deadline {
            return Ok(WaitForOutcome::TimedOut);
        }
    }
}

async fn query(connection: &Arc<Connection>, cql: &str, consistency: Consistency) -> Result<Frame> {
    let body = query_body(cql, &QueryParams::new(consistency));
    let response = connection.send(Opcode::Query, body).await?;
    if response.is_error() {
        return Err(response.error_kind().into());
    }
    Ok(response)
}

/// Schema agreement: issues the local/peers schema-version queries on
/// `connection` in a batch and calls `schema_agrees` with both response
/// frames to evaluate the predicate — typically "the connected host's
/// `system.local.schema_version` equals every live peer's
/// `system.peers.schema_version`, hosts reported down by the session
/// excluded".
pub(crate) async fn wait_for_schema_agreement(
    connection: &Arc<Connection>,
    max_wait_time: Duration,
    mut schema_agrees: impl FnMut(&Frame, &Frame) -> bool,
) -> Result<WaitForOutcome<()>> {
    poll_until(max_wait_time, Duration::from_millis(200), || async {
        let local = query(connection, "SELECT schema_version FROM system.local WHERE key='local'", Consistency::One).await?;
        let peers =
            query(connection, "SELECT peer, rpc_address, schema_version FROM system.peers", Consistency::One).await?;
        Ok(schema_agrees(&local, &peers).then_some(()))
    })
    .await
}

/// Tracing-data retrieval: `system_traces.sessions[session_id]` returns at
/// least one row. `has_row` evaluates the response frame for that.
pub(crate) async fn wait_for_tracing_data(
    connection: &Arc<Connection>,
    session_id: uuid::Uuid,
    max_wait_time: Duration,
    mut has_row: impl FnMut(&Frame) -> bool,
) -> Result<WaitForOutcome<()>> {
    let cql = format!("SELECT session_id FROM system_traces.sessions WHERE session_id = {session_id}");
    poll_until(max_wait_time, Duration::from_millis(3), || async {
        let response = query(connection, &cql, Consistency::One).await?;
        Ok(has_row(&response).then_some(()))
    })
    .await
}
