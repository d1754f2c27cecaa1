use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::classify::PathClassifier;
use crate::config::AutopsyConfig;
use crate::record::{AttributedQuery, MetricRecordInput, MetricType, QueryPayload};
use crate::redact::Redactor;
use crate::resolve::{ResolvedOrigin, StackFrame, StackResolver, StackTraceParser};
use crate::AutopsyError;

pub const NOT_LOGGED: &str = "[not logged]";

/// One entry of the query-execution layer's own log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggedQuery {
    pub sql: String,
    pub duration_seconds: f64,
    pub stack: Option<String>,
}

/// The query-execution layer as seen by the tracker.
pub trait QueryLog {
    /// Whether the layer keeps per-query timings and traces.
    fn detailed_logging_enabled(&self) -> bool;

    fn executed_queries(&self) -> Vec<LoggedQuery>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum QueryTrackerState {
    Disabled,
    Idle,
    Intercepting,
    Analyzing,
    Persisted,
}

/// A query seen while it executed, before the authoritative log is read.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveQuery {
    pub id: Ulid,
    pub sql: String,
    pub duration_seconds: f64,
    pub origin: ResolvedOrigin,
    consumed: bool,
}

#[derive(Debug, Default)]
struct QueryAccumulator {
    queries: Vec<AttributedQuery>,
    slow_queries: Vec<AttributedQuery>,
    total_time: f64,
}

#[derive(Debug, Clone)]
struct QuerySettings {
    slow_threshold_seconds: f64,
    sample_size: usize,
    max_slow_queries: usize,
    max_query_length: usize,
    log_queries: bool,
    log_paths: bool,
}

#[derive(Debug)]
pub struct QueryTracker {
    state: QueryTrackerState,
    settings: QuerySettings,
    classifier: PathClassifier,
    redactor: Redactor,
    parser: StackTraceParser,
    live: Vec<LiveQuery>,
    per_extension: BTreeMap<String, QueryAccumulator>,
    notice: Option<String>,
}

impl QueryTracker {
    /// Builds a tracker; without detailed query logging it starts and stays disabled.
    ///
    /// # Errors
    /// Returns [`AutopsyError::Configuration`] if the redaction or stack patterns
    /// fail to compile.
    pub fn new(
        config: &AutopsyConfig,
        classifier: PathClassifier,
        detailed_logging: bool,
    ) -> Result<Self, AutopsyError> {
        let (state, notice) = if detailed_logging {
            (QueryTrackerState::Idle, None)
        } else {
            let notice = "Query tracking is disabled: the database layer is not recording \
                          per-query timings. Enable detailed query logging to measure queries."
                .to_string();
            tracing::warn!("{notice}");
            (QueryTrackerState::Disabled, Some(notice))
        };

        Ok(Self {
            state,
            settings: QuerySettings {
                slow_threshold_seconds: config.slow_query_threshold_seconds,
                sample_size: config.query_sample_size,
                max_slow_queries: config.max_stored_slow_queries,
                max_query_length: config.max_query_length,
                log_queries: config.log_queries,
                log_paths: config.log_paths,
            },
            classifier,
            redactor: Redactor::new()?,
            parser: StackTraceParser::new()?,
            live: Vec::new(),
            per_extension: BTreeMap::new(),
            notice,
        })
    }

    #[must_use]
    pub fn state(&self) -> QueryTrackerState {
        self.state
    }

    /// Operator-facing explanation when the tracker disabled itself.
    #[must_use]
    pub fn operator_notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    #[must_use]
    pub fn live_queries(&self) -> &[LiveQuery] {
        &self.live
    }

    /// Buffers a query as it executes; unattributed queries are discarded.
    pub fn intercept(
        &mut self,
        sql: &str,
        duration_seconds: f64,
        frames: &[StackFrame],
    ) -> Option<Ulid> {
        if !matches!(
            self.state,
            QueryTrackerState::Idle | QueryTrackerState::Intercepting
        ) {
            return None;
        }
        self.state = QueryTrackerState::Intercepting;

        let origin = StackResolver::new(&self.classifier).resolve(frames)?;
        let id = Ulid::new();
        self.live.push(LiveQuery {
            id,
            sql: sql.to_string(),
            duration_seconds,
            origin,
            consumed: false,
        });
        Some(id)
    }

    /// Re-walks the authoritative log and groups attributed queries by extension.
    ///
    /// Runs once; later calls are ignored.
    pub fn analyze(&mut self, log: &dyn QueryLog) {
        if !matches!(
            self.state,
            QueryTrackerState::Idle | QueryTrackerState::Intercepting
        ) {
            tracing::debug!(state = ?self.state, "query analysis skipped");
            return;
        }
        self.state = QueryTrackerState::Analyzing;

        let mut dropped = 0_usize;
        for logged in log.executed_queries() {
            let Some(origin) = self.origin_for(&logged) else {
                dropped += 1;
                continue;
            };
            let query = self.attribute(&logged, &origin);
            let entry = self.per_extension.entry(origin.slug).or_default();
            entry.total_time += query.duration_seconds;
            if query.slow {
                entry.slow_queries.push(query.clone());
            }
            entry.queries.push(query);
        }

        tracing::debug!(
            extensions = self.per_extension.len(),
            dropped,
            "query log analyzed"
        );
    }

    /// Per-extension totals as `(query_count, total_time_seconds)`.
    #[must_use]
    pub fn extension_totals(&self) -> BTreeMap<String, (u64, f64)> {
        self.per_extension
            .iter()
            .map(|(slug, acc)| (slug.clone(), (count(acc.queries.len()), acc.total_time)))
            .collect()
    }

    /// One query record per extension seen during analysis.
    ///
    /// # Errors
    /// Returns [`AutopsyError::Payload`] when a payload cannot be encoded.
    pub fn records(
        &self,
        page_context: &str,
        recorded_at: OffsetDateTime,
    ) -> Result<Vec<MetricRecordInput>, AutopsyError> {
        self.per_extension
            .iter()
            .filter(|(_, acc)| !acc.queries.is_empty())
            .map(|(slug, acc)| {
                let payload = self.payload_for(acc);
                MetricRecordInput::new(slug, MetricType::Query, &payload, page_context, recorded_at)
            })
            .collect()
    }

    pub fn mark_persisted(&mut self) {
        if self.state == QueryTrackerState::Analyzing {
            self.state = QueryTrackerState::Persisted;
        }
    }

    fn origin_for(&mut self, logged: &LoggedQuery) -> Option<ResolvedOrigin> {
        let frames = logged
            .stack
            .as_deref()
            .map(|text| self.parser.parse(text))
            .unwrap_or_default();

        if !frames.is_empty() {
            return StackResolver::new(&self.classifier).resolve(&frames);
        }

        // No usable trace: fall back to the origin seen when the query ran.
        let live = self
            .live
            .iter_mut()
            .find(|entry| !entry.consumed && entry.sql == logged.sql)?;
        live.consumed = true;
        Some(live.origin.clone())
    }

    fn attribute(&self, logged: &LoggedQuery, origin: &ResolvedOrigin) -> AttributedQuery {
        let duration_seconds = logged.duration_seconds.max(0.0);
        AttributedQuery {
            sql_text: if self.settings.log_queries {
                self.redactor
                    .sanitize(&logged.sql, self.settings.max_query_length)
            } else {
                NOT_LOGGED.to_string()
            },
            duration_seconds,
            origin_extension: origin.slug.clone(),
            origin_file: if self.settings.log_paths {
                self.classifier.relativize(&origin.file)
            } else {
                String::new()
            },
            origin_line: origin.line,
            slow: duration_seconds > self.settings.slow_threshold_seconds,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn payload_for(&self, acc: &QueryAccumulator) -> QueryPayload {
        let query_count = acc.queries.len();
        let stored_slow = acc.slow_queries.len().min(self.settings.max_slow_queries);
        QueryPayload {
            query_count: count(query_count),
            total_time: acc.total_time,
            average_time: if query_count == 0 {
                0.0
            } else {
                acc.total_time / query_count as f64
            },
            slow_query_count: count(acc.slow_queries.len()),
            queries: acc
                .queries
                .iter()
                .take(self.settings.sample_size)
                .cloned()
                .collect(),
            slow_queries: acc.slow_queries[..stored_slow].to_vec(),
            slow_queries_omitted: count(acc.slow_queries.len() - stored_slow),
        }
    }
}

fn count(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstallLayout;

    const EXT: &str = "/var/www/html/wp-content/plugins";
    const CORE: &str = "/var/www/html/wp-includes";

    struct FixtureLog {
        detailed: bool,
        entries: Vec<LoggedQuery>,
    }

    impl QueryLog for FixtureLog {
        fn detailed_logging_enabled(&self) -> bool {
            self.detailed
        }

        fn executed_queries(&self) -> Vec<LoggedQuery> {
            self.entries.clone()
        }
    }

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn config() -> AutopsyConfig {
        let mut config = AutopsyConfig::v1();
        config.layout = InstallLayout::conventional("/var/www/html", "https://shop.example");
        config
    }

    fn tracker(config: &AutopsyConfig, detailed: bool) -> QueryTracker {
        must_ok(QueryTracker::new(
            config,
            PathClassifier::new(&config.layout),
            detailed,
        ))
    }

    fn logged(sql: &str, seconds: f64, stack: &str) -> LoggedQuery {
        LoggedQuery {
            sql: sql.to_string(),
            duration_seconds: seconds,
            stack: Some(stack.to_string()),
        }
    }

    fn ext_stack(slug: &str) -> String {
        format!("{CORE}/class-wpdb.php(2100)\n{EXT}/{slug}/src/Repo.php(88): Repo->find()")
    }

    fn at() -> OffsetDateTime {
        must_ok(crate::parse_rfc3339_utc("2026-03-01T12:00:00Z"))
    }

    #[test]
    fn disabled_tracker_warns_and_writes_nothing() {
        let config = config();
        let mut tracker = tracker(&config, false);
        assert_eq!(tracker.state(), QueryTrackerState::Disabled);
        assert!(tracker.operator_notice().is_some());

        let frames = vec![StackFrame::new(&format!("{EXT}/foo/a.php"), 1, None)];
        assert_eq!(tracker.intercept("SELECT 1", 0.001, &frames), None);
        tracker.analyze(&FixtureLog {
            detailed: false,
            entries: vec![logged("SELECT 1", 0.2, &ext_stack("foo"))],
        });
        assert_eq!(tracker.state(), QueryTrackerState::Disabled);
        assert!(must_ok(tracker.records("/", at())).is_empty());
    }

    #[test]
    fn queries_group_by_innermost_extension_and_flag_slow_ones() {
        let config = config();
        let mut tracker = tracker(&config, true);
        tracker.analyze(&FixtureLog {
            detailed: true,
            entries: vec![
                logged("SELECT * FROM cache WHERE k = 'a'", 0.02, &ext_stack("foo-cache")),
                logged("SELECT * FROM cache WHERE k = 'b'", 0.08, &ext_stack("foo-cache")),
                logged("SELECT 1", 0.5, &format!("{CORE}/load.php(10)")),
                logged("SELECT * FROM forms", 0.01, &ext_stack("forms")),
            ],
        });

        let records = must_ok(tracker.records("/checkout", at()));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].extension_slug, "foo-cache");
        let payload: QueryPayload = must_ok(serde_json::from_value(records[0].payload.clone()));
        assert_eq!(payload.query_count, 2);
        assert_eq!(payload.slow_query_count, 1);
        assert!((payload.total_time - 0.1).abs() < 1e-9);
        assert!((payload.average_time - 0.05).abs() < 1e-9);
        assert_eq!(payload.slow_queries[0].origin_file, "extensions/foo-cache/src/Repo.php");
        assert_eq!(payload.slow_queries[0].origin_line, 88);
    }

    #[test]
    fn query_text_is_redacted_and_truncated_before_storage() {
        let config = config();
        let mut tracker = tracker(&config, true);
        let long_tail = "x".repeat(3000);
        tracker.analyze(&FixtureLog {
            detailed: true,
            entries: vec![
                logged(
                    "SELECT * FROM users WHERE user_email = 'a@b.io' AND user_pass = 'pw'",
                    0.01,
                    &ext_stack("members"),
                ),
                logged(&format!("SELECT '{long_tail}'"), 0.01, &ext_stack("members")),
            ],
        });
        let records = must_ok(tracker.records("/", at()));
        let payload: QueryPayload = must_ok(serde_json::from_value(records[0].payload.clone()));
        assert_eq!(
            payload.queries[0].sql_text,
            "SELECT * FROM users WHERE user_email = '[EMAIL]' AND user_pass = [REDACTED]"
        );
        assert_eq!(payload.queries[1].sql_text.chars().count(), 1000);
    }

    #[test]
    fn privacy_toggles_drop_text_and_paths() {
        let mut config = config();
        config.log_queries = false;
        config.log_paths = false;
        let mut tracker = tracker(&config, true);
        tracker.analyze(&FixtureLog {
            detailed: true,
            entries: vec![logged("SELECT secret", 0.3, &ext_stack("foo"))],
        });
        let records = must_ok(tracker.records("/", at()));
        let payload: QueryPayload = must_ok(serde_json::from_value(records[0].payload.clone()));
        assert_eq!(payload.queries[0].sql_text, NOT_LOGGED);
        assert_eq!(payload.queries[0].origin_file, "");
        assert_eq!(payload.slow_query_count, 1);
    }

    #[test]
    fn entries_without_trace_fall_back_to_live_interception() {
        let config = config();
        let mut tracker = tracker(&config, true);
        let frames = vec![
            StackFrame::new(&format!("{CORE}/class-wpdb.php"), 1, None),
            StackFrame::new(&format!("{EXT}/shop/cart.php"), 31, Some("cart_totals")),
        ];
        assert!(tracker.intercept("SELECT total FROM cart", 0.004, &frames).is_some());
        assert_eq!(tracker.intercept("SELECT 1", 0.001, &[]), None);
        assert_eq!(tracker.state(), QueryTrackerState::Intercepting);
        assert_eq!(tracker.live_queries().len(), 1);

        tracker.analyze(&FixtureLog {
            detailed: true,
            entries: vec![
                LoggedQuery {
                    sql: "SELECT total FROM cart".to_string(),
                    duration_seconds: 0.006,
                    stack: None,
                },
                LoggedQuery {
                    sql: "SELECT total FROM cart".to_string(),
                    duration_seconds: 0.007,
                    stack: None,
                },
            ],
        });

        let totals = tracker.extension_totals();
        assert_eq!(totals.len(), 1);
        let (queries, seconds) = totals["shop"];
        assert_eq!(queries, 1);
        assert!((seconds - 0.006).abs() < 1e-12);
    }

    #[test]
    fn slow_query_list_is_capped_with_an_omission_count() {
        let mut config = config();
        config.max_stored_slow_queries = 2;
        config.query_sample_size = 3;
        let mut tracker = tracker(&config, true);
        let entries = (0..5)
            .map(|index| logged(&format!("SELECT {index}"), 0.2, &ext_stack("heavy")))
            .collect();
        tracker.analyze(&FixtureLog {
            detailed: true,
            entries,
        });
        let records = must_ok(tracker.records("/", at()));
        let payload: QueryPayload = must_ok(serde_json::from_value(records[0].payload.clone()));
        assert_eq!(payload.slow_query_count, 5);
        assert_eq!(payload.slow_queries.len(), 2);
        assert_eq!(payload.slow_queries_omitted, 3);
        assert_eq!(payload.queries.len(), 3);
    }

    #[test]
    fn analysis_runs_once_and_then_persists() {
        let config = config();
        let mut tracker = tracker(&config, true);
        let log = FixtureLog {
            detailed: true,
            entries: vec![logged("SELECT 1", 0.01, &ext_stack("foo"))],
        };
        tracker.analyze(&log);
        tracker.analyze(&log);
        assert_eq!(tracker.extension_totals()["foo"].0, 1);
        tracker.mark_persisted();
        assert_eq!(tracker.state(), QueryTrackerState::Persisted);
    }
}
