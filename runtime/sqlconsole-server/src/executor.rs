use std::time::Instant;

use sqlconsole_db::{CancelToken, Store, StoreError};
use tracing::debug;

use crate::encoder::{self, Table};
use crate::protocol::Response;

/// Request text answered with pool telemetry instead of being executed.
pub const STATS_COMMAND: &str = "stats";

/// Runs one request against `store`.
///
/// Query faults come back as an error response. `None` means the session
/// token fired mid-query and nothing should be sent.
pub async fn execute<S: Store>(store: &S, query: &str, cancel: &CancelToken) -> Option<Response> {
    if query == STATS_COMMAND {
        return Some(Response::stats(store.pool_stats()));
    }

    let started = Instant::now();
    match run(store, query, cancel).await {
        Ok(table) => {
            let elapsed = started.elapsed();
            debug!(rows = table.rows.len(), ?elapsed, "query succeeded");
            Some(Response::table(table, elapsed))
        }
        Err(err) if err.is_cancelled() => None,
        Err(err) => {
            debug!(error = %err, "query failed");
            Some(Response::error(&err))
        }
    }
}

async fn run<S: Store>(store: &S, query: &str, cancel: &CancelToken) -> Result<Table, StoreError> {
    let cursor = store.query(query, cancel).await?;
    encoder::encode(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCursor, FakeStore, Fault, sqlite_store};
    use sqlconsole_db::{DynamicValue, ScanType};

    #[tokio::test]
    async fn stats_never_touches_the_store() {
        let store = FakeStore::default().with_query_error(StoreError::Query("boom".into()));
        let response = execute(&store, "stats", &CancelToken::new())
            .await
            .expect("response");
        assert!(response.stats.is_some());
        assert!(response.err.is_empty());
        assert!(response.columns.is_empty() && response.rows.is_empty());
        assert_eq!(store.query_count(), 0);
    }

    #[tokio::test]
    async fn near_miss_stats_is_executed_as_sql() {
        let store = FakeStore::default();
        for text in ["STATS", " stats", "stats;"] {
            let response = execute(&store, text, &CancelToken::new())
                .await
                .expect("response");
            assert!(response.stats.is_none());
        }
        assert_eq!(store.query_count(), 3);
    }

    #[tokio::test]
    async fn every_failure_point_reports_raw_text() {
        let query_fault = FakeStore::default()
            .with_query_error(StoreError::Pool("timed out waiting for a pooled connection".into()));
        let response = execute(&query_fault, "SELECT 1", &CancelToken::new())
            .await
            .expect("response");
        assert_eq!(response.err, "timed out waiting for a pooled connection");
        assert!(response.duration.is_empty());

        for fault in [Fault::Columns, Fault::Scan, Fault::Finish] {
            let cursor = FakeCursor::new(
                &[("n", ScanType::Int)],
                vec![vec![DynamicValue::Int(1)]],
            )
            .with_fault(fault);
            let store = FakeStore::with_cursor(cursor);
            let response = execute(&store, "SELECT n", &CancelToken::new())
                .await
                .expect("response");
            assert!(!response.err.is_empty());
            assert!(response.columns.is_empty() && response.rows.is_empty());
            assert!(response.stats.is_none());
        }
    }

    #[tokio::test]
    async fn cancelled_query_yields_no_response() {
        let store = FakeStore::default().hanging();
        let cancel = CancelToken::new();
        let pending = execute(&store, "SELECT pg_sleep(60)", &cancel);
        cancel.cancel();
        assert!(pending.await.is_none());
    }

    #[tokio::test]
    async fn sqlite_values_keep_their_types() {
        let (_dir, store) = sqlite_store();
        let response = execute(
            store.as_ref(),
            "SELECT 1 AS i, 2.5 AS f, 'x' AS t, x'00ff' AS b, NULL AS n",
            &CancelToken::new(),
        )
        .await
        .expect("response");
        assert_eq!(response.columns, vec!["i", "f", "t", "b", "n"]);
        assert_eq!(
            response.rows,
            vec![vec![
                DynamicValue::Int(1),
                DynamicValue::Float(2.5),
                DynamicValue::Text("x".into()),
                DynamicValue::Bytes(vec![0, 255]),
                DynamicValue::Null,
            ]]
        );
        assert!(!response.duration.is_empty());
    }

    #[tokio::test]
    async fn statements_without_result_columns_succeed() {
        let (_dir, store) = sqlite_store();
        let response = execute(
            store.as_ref(),
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)",
            &CancelToken::new(),
        )
        .await
        .expect("response");
        assert!(response.err.is_empty());
        assert!(response.columns.is_empty());
        assert!(!response.duration.is_empty());

        let response = execute(store.as_ref(), "SELECT id, body FROM notes", &CancelToken::new())
            .await
            .expect("response");
        assert_eq!(response.columns, vec!["id", "body"]);
        assert!(response.rows.is_empty());
    }
}
