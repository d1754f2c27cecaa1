use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::classify::PathClassifier;
use crate::config::AutopsyConfig;
use crate::record::{MetricType, QueryPayload, TimeWindow};
use crate::redact::Redactor;
use crate::store::MetricStore;
use crate::{days_before, format_rfc3339, round_to, AutopsyError};

const SLOW_QUERY_RECORD_LIMIT: usize = 10;

/// Result of an operator action; never carries raw internals in `message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminOutcome {
    pub success: bool,
    pub message: String,
    pub detail: Option<String>,
    pub affected: Option<usize>,
}

impl AdminOutcome {
    fn ok(message: String, affected: Option<usize>) -> Self {
        Self {
            success: true,
            message,
            detail: None,
            affected,
        }
    }

    fn failed(message: &str, detail: Option<String>) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            detail,
            affected: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlowQueryRow {
    pub sql: String,
    pub duration_ms: f64,
    pub origin_file: String,
    pub origin_line: u32,
    pub recorded_at: String,
}

/// Collection is passive, so a refresh only acknowledges the request.
#[must_use]
pub fn request_refresh() -> AdminOutcome {
    tracing::info!("refresh requested");
    AdminOutcome::ok(
        "Data refresh initiated. Please reload the page to see updated results.".to_string(),
        None,
    )
}

/// Deletes records older than `retention_days` before `now`.
#[must_use]
pub fn purge_expired(
    store: &dyn MetricStore,
    retention_days: u32,
    now: OffsetDateTime,
) -> AdminOutcome {
    let cutoff = days_before(now, retention_days);
    match store.purge_before(cutoff) {
        Ok(removed) => {
            tracing::info!(removed, retention_days, "expired records purged");
            AdminOutcome::ok(
                format!("Successfully cleared {removed} old records"),
                Some(removed),
            )
        }
        Err(err) => {
            tracing::warn!(error = %err, "purge failed");
            AdminOutcome::failed(
                "Database error occurred while clearing data",
                Some(err.to_string()),
            )
        }
    }
}

/// Slow queries recorded for `extension_slug` during the last 24 hours, newest first.
///
/// Reads at most the 10 most recent query records. SQL is redacted and cut
/// to `display_query_length`; file paths are relativized.
///
/// # Errors
/// Returns [`AutopsyError::Validation`] for an empty slug and
/// [`AutopsyError::Storage`] when the store cannot be read.
pub fn recent_slow_queries(
    store: &dyn MetricStore,
    config: &AutopsyConfig,
    extension_slug: &str,
    now: OffsetDateTime,
) -> Result<Vec<SlowQueryRow>, AutopsyError> {
    let slug = extension_slug.trim();
    if slug.is_empty() {
        return Err(AutopsyError::Validation(
            "Plugin parameter is required".to_string(),
        ));
    }

    let window = TimeWindow::new(now - Duration::DAY, now)?;
    let records = store
        .list_recent_for_extension(slug, MetricType::Query, &window, SLOW_QUERY_RECORD_LIMIT)
        .map_err(|err| AutopsyError::Storage(format!("failed to read query records: {err}")))?;

    let redactor = Redactor::new()?;
    let classifier = PathClassifier::new(&config.layout);
    let mut rows = Vec::new();
    for record in records {
        let payload: QueryPayload = match record.decode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable query record");
                continue;
            }
        };
        let recorded_at = format_rfc3339(record.recorded_at)?;
        rows.extend(payload.slow_queries.into_iter().map(|query| SlowQueryRow {
            sql: redactor.sanitize(&query.sql_text, config.display_query_length),
            duration_ms: round_to(query.duration_seconds * 1000.0, 2),
            origin_file: classifier.relativize(&query.origin_file),
            origin_line: query.origin_line,
            recorded_at: recorded_at.clone(),
        }));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AttributedQuery, MetricRecord, MetricRecordInput};
    use crate::store::InMemoryMetricStore;
    use anyhow::anyhow;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn at(value: &str) -> OffsetDateTime {
        must_ok(crate::parse_rfc3339_utc(value))
    }

    fn slow_payload(sql: &str, file: &str) -> QueryPayload {
        let query = AttributedQuery {
            sql_text: sql.to_string(),
            duration_seconds: 0.0734,
            origin_extension: "shop".to_string(),
            origin_file: file.to_string(),
            origin_line: 51,
            slow: true,
        };
        QueryPayload {
            query_count: 1,
            total_time: 0.0734,
            average_time: 0.0734,
            slow_query_count: 1,
            queries: vec![query.clone()],
            slow_queries: vec![query],
            slow_queries_omitted: 0,
        }
    }

    fn put(store: &InMemoryMetricStore, slug: &str, payload: &QueryPayload, ts: &str) {
        let input = must_ok(MetricRecordInput::new(slug, MetricType::Query, payload, "/", at(ts)));
        let _ = must_ok(store.append(&input));
    }

    struct BrokenStore;

    impl MetricStore for BrokenStore {
        fn append(&self, _input: &MetricRecordInput) -> anyhow::Result<MetricRecord> {
            Err(anyhow!("disk I/O error"))
        }

        fn list_window(
            &self,
            _window: &TimeWindow,
            _metric_type: Option<MetricType>,
        ) -> anyhow::Result<Vec<MetricRecord>> {
            Err(anyhow!("disk I/O error"))
        }

        fn list_recent_for_extension(
            &self,
            _extension_slug: &str,
            _metric_type: MetricType,
            _window: &TimeWindow,
            _limit: usize,
        ) -> anyhow::Result<Vec<MetricRecord>> {
            Err(anyhow!("disk I/O error"))
        }

        fn purge_before(&self, _cutoff: OffsetDateTime) -> anyhow::Result<usize> {
            Err(anyhow!("disk I/O error"))
        }
    }

    #[test]
    fn refresh_is_an_acknowledgement() {
        let outcome = request_refresh();
        assert!(outcome.success);
        assert_eq!(
            outcome.message,
            "Data refresh initiated. Please reload the page to see updated results."
        );
    }

    #[test]
    fn purge_reports_removed_count() {
        let store = InMemoryMetricStore::new();
        put(&store, "shop", &QueryPayload::default(), "2026-01-01T00:00:00Z");
        put(&store, "shop", &QueryPayload::default(), "2026-02-27T00:00:00Z");

        let outcome = purge_expired(&store, 30, at("2026-03-01T00:00:00Z"));
        assert!(outcome.success);
        assert_eq!(outcome.message, "Successfully cleared 1 old records");
        assert_eq!(outcome.affected, Some(1));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn purge_failure_hides_internals_in_message() {
        let outcome = purge_expired(&BrokenStore, 30, at("2026-03-01T00:00:00Z"));
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Database error occurred while clearing data");
        assert_eq!(outcome.detail.as_deref(), Some("disk I/O error"));
    }

    #[test]
    fn slow_queries_require_a_slug() {
        let store = InMemoryMetricStore::new();
        let err = recent_slow_queries(&store, &AutopsyConfig::v1(), "  ", at("2026-03-01T00:00:00Z"));
        assert_eq!(
            err,
            Err(AutopsyError::Validation("Plugin parameter is required".to_string()))
        );
    }

    #[test]
    fn slow_queries_are_recent_sanitized_and_newest_first() {
        let store = InMemoryMetricStore::new();
        let config = AutopsyConfig::v1();
        put(
            &store,
            "shop",
            &slow_payload("SELECT * FROM t WHERE token = 'abc'", "extensions/shop/a.php"),
            "2026-03-01T08:00:00Z",
        );
        put(
            &store,
            "shop",
            &slow_payload("SELECT 2", "/var/www/html/wp-content/plugins/shop/b.php"),
            "2026-03-01T09:00:00Z",
        );
        put(&store, "shop", &slow_payload("SELECT old", ""), "2026-02-27T09:00:00Z");
        put(&store, "other", &slow_payload("SELECT other", ""), "2026-03-01T09:30:00Z");

        let rows = must_ok(recent_slow_queries(&store, &config, "shop", at("2026-03-01T12:00:00Z")));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sql, "SELECT 2");
        assert_eq!(rows[0].origin_file, "extensions/shop/b.php");
        assert_eq!(rows[1].sql, "SELECT * FROM t WHERE token = [REDACTED]");
        assert!((rows[1].duration_ms - 73.4).abs() < 1e-9);
        assert_eq!(rows[1].recorded_at, "2026-03-01T08:00:00Z");
    }

    #[test]
    fn slow_query_lookup_surfaces_storage_errors() {
        let result = recent_slow_queries(
            &BrokenStore,
            &AutopsyConfig::v1(),
            "shop",
            at("2026-03-01T00:00:00Z"),
        );
        assert!(matches!(result, Err(AutopsyError::Storage(_))));
    }
}
