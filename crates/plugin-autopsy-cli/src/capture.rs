//! Replay of a captured request lifecycle through a [`RequestScope`].
//!
//! A capture file is the JSON rendering of what a host integration observed
//! while serving one request: memory readings, hook callbacks with their
//! declaring files, queries with their stack traces, the query layer's own
//! log, registered assets, and the rendered head markup.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use plugin_autopsy_core::{
    AssetSizer, AutopsyConfig, CallbackRef, HookCheckpoint, LifecycleCheckpoint, LoggedQuery,
    MemoryProbe, MetricStore, PersistSummary, QueryLog, RegisteredAsset, RenderContext,
    RequestCollaborators, RequestScope, StackTraceParser,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemoryReading {
    pub resident_bytes: u64,
    #[serde(default)]
    pub peak_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureEvent {
    Snapshot {
        checkpoint: LifecycleCheckpoint,
        memory: MemoryReading,
    },
    BeginHook {
        checkpoint: HookCheckpoint,
        #[serde(default)]
        callbacks: Vec<CallbackRef>,
        memory: MemoryReading,
    },
    EndHook {
        checkpoint: HookCheckpoint,
        memory: MemoryReading,
    },
    Query {
        sql: String,
        duration_seconds: f64,
        #[serde(default)]
        stack: String,
    },
    Assets {
        context: RenderContext,
        assets: Vec<RegisteredAsset>,
    },
    HeadMarkup {
        context: RenderContext,
        markup: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestCapture {
    pub page_context: String,
    #[serde(default = "detailed_logging_default")]
    pub detailed_query_logging: bool,
    pub baseline: MemoryReading,
    #[serde(rename = "final")]
    pub final_reading: MemoryReading,
    #[serde(default)]
    pub events: Vec<CaptureEvent>,
    #[serde(default)]
    pub query_log: Vec<LoggedQuery>,
    /// Byte sizes keyed by asset URL, as measured by the host.
    #[serde(default)]
    pub asset_sizes: BTreeMap<String, u64>,
}

fn detailed_logging_default() -> bool {
    true
}

impl RequestCapture {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read capture file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid capture JSON in {}", path.display()))
    }
}

/// Memory probe whose readings are set by the replay as events are applied.
#[derive(Debug, Default)]
pub struct ReplayProbe {
    resident: Cell<u64>,
    peak: Cell<u64>,
}

impl ReplayProbe {
    #[must_use]
    pub fn starting_at(reading: MemoryReading) -> Self {
        let probe = Self::default();
        probe.set(reading);
        probe
    }

    pub fn set(&self, reading: MemoryReading) {
        self.resident.set(reading.resident_bytes);
        let peak = reading
            .peak_bytes
            .max(reading.resident_bytes)
            .max(self.peak.get());
        self.peak.set(peak);
    }
}

impl MemoryProbe for ReplayProbe {
    fn resident_bytes(&self) -> u64 {
        self.resident.get()
    }

    fn peak_bytes(&self) -> u64 {
        self.peak.get()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapturedQueryLog {
    detailed: bool,
    entries: Vec<LoggedQuery>,
}

impl CapturedQueryLog {
    #[must_use]
    pub fn new(detailed: bool, entries: Vec<LoggedQuery>) -> Self {
        Self { detailed, entries }
    }
}

impl QueryLog for CapturedQueryLog {
    fn detailed_logging_enabled(&self) -> bool {
        self.detailed
    }

    fn executed_queries(&self) -> Vec<LoggedQuery> {
        if self.detailed {
            self.entries.clone()
        } else {
            Vec::new()
        }
    }
}

/// Answers sizes from the capture; unlisted URLs count as 0 bytes.
#[derive(Debug, Clone, Default)]
pub struct CapturedSizes {
    sizes: BTreeMap<String, u64>,
}

impl CapturedSizes {
    #[must_use]
    pub fn new(sizes: BTreeMap<String, u64>) -> Self {
        Self { sizes }
    }
}

impl AssetSizer for CapturedSizes {
    fn byte_size(&self, src: &str) -> u64 {
        self.sizes.get(src).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub page_context: String,
    pub events_applied: usize,
    pub operator_notice: Option<String>,
    pub summary: PersistSummary,
}

/// Drives one request scope through every captured event and finishes it.
///
/// `sizer` overrides the captured asset sizes when the caller wants live
/// measurement.
///
/// # Errors
/// Returns an error when the configuration is rejected or the stack trace
/// pattern cannot be built. Storage failures surface as `summary.dropped`.
pub fn replay(
    capture: &RequestCapture,
    config: &AutopsyConfig,
    store: &dyn MetricStore,
    sizer: Option<&dyn AssetSizer>,
) -> Result<ReplayOutcome> {
    let parser = StackTraceParser::new().map_err(|err| anyhow::anyhow!(err.to_string()))?;
    let probe = ReplayProbe::starting_at(capture.baseline);
    let query_log = CapturedQueryLog::new(capture.detailed_query_logging, capture.query_log.clone());
    let captured_sizes = CapturedSizes::new(capture.asset_sizes.clone());

    let collaborators = RequestCollaborators {
        store,
        query_log: &query_log,
        probe: &probe,
        sizer: sizer.unwrap_or(&captured_sizes),
    };
    let mut scope = RequestScope::begin(config, collaborators, &capture.page_context)
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    let operator_notice = scope.queries().operator_notice().map(str::to_string);

    for event in &capture.events {
        match event {
            CaptureEvent::Snapshot { checkpoint, memory } => {
                probe.set(*memory);
                let _ = scope.snapshot(*checkpoint);
            }
            CaptureEvent::BeginHook {
                checkpoint,
                callbacks,
                memory,
            } => {
                probe.set(*memory);
                scope.begin_hook(*checkpoint, callbacks);
            }
            CaptureEvent::EndHook { checkpoint, memory } => {
                probe.set(*memory);
                scope.end_hook(*checkpoint);
            }
            CaptureEvent::Query {
                sql,
                duration_seconds,
                stack,
            } => {
                let frames = parser.parse(stack);
                let _ = scope.on_query(sql, *duration_seconds, &frames);
            }
            CaptureEvent::Assets { context, assets } => {
                let _ = scope.capture_assets(*context, assets);
            }
            CaptureEvent::HeadMarkup { context, markup } => {
                let _ = scope.scan_head_markup(*context, markup);
            }
        }
    }

    probe.set(capture.final_reading);
    let summary = scope.finish();
    tracing::debug!(events = capture.events.len(), "capture replayed");

    Ok(ReplayOutcome {
        page_context: capture.page_context.clone(),
        events_applied: capture.events.len(),
        operator_notice,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugin_autopsy_core::{InMemoryMetricStore, MetricType};
    use serde_json::json;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_capture() -> RequestCapture {
        let value = json!({
            "page_context": "/shop/",
            "baseline": {"resident_bytes": 2_000_000, "peak_bytes": 2_000_000},
            "final": {"resident_bytes": 2_900_000, "peak_bytes": 3_100_000},
            "events": [
                {"kind": "snapshot", "checkpoint": "extensions_loaded",
                 "memory": {"resident_bytes": 2_400_000}},
                {"kind": "begin_hook", "checkpoint": "enqueue_scripts",
                 "callbacks": [
                    {"name": "shop_enqueue",
                     "declared_in": "/var/www/html/wp-content/plugins/shop/shop.php"},
                    {"name": "forms_enqueue",
                     "declared_in": "/var/www/html/wp-content/plugins/forms/forms.php"}
                 ],
                 "memory": {"resident_bytes": 2_500_000}},
                {"kind": "end_hook", "checkpoint": "enqueue_scripts",
                 "memory": {"resident_bytes": 2_800_000}},
                {"kind": "query", "sql": "SELECT * FROM wp_shop_orders", "duration_seconds": 0.08,
                 "stack": "#0 /var/www/html/wp-content/plugins/shop/includes/db.php(51): Shop\\Db->orders()\n#1 /var/www/html/wp-includes/plugin.php(324)"},
                {"kind": "assets", "context": "front", "assets": [
                    {"handle": "shop-js", "kind": "script",
                     "src": "https://example.com/wp-content/plugins/shop/app.js", "version": null}
                ]},
                {"kind": "head_markup", "context": "front",
                 "markup": "<link rel=\"stylesheet\" href=\"https://example.com/wp-content/plugins/forms/forms.css\">"}
            ],
            "query_log": [
                {"sql": "SELECT * FROM wp_shop_orders", "duration_seconds": 0.0812,
                 "stack": "/var/www/html/wp-content/plugins/shop/includes/db.php(51): Shop\\Db->orders()"}
            ],
            "asset_sizes": {
                "https://example.com/wp-content/plugins/shop/app.js": 48_000,
                "https://example.com/wp-content/plugins/forms/forms.css": 9_000
            }
        });
        match serde_json::from_value(value) {
            Ok(capture) => capture,
            Err(err) => panic!("invalid fixture capture: {err}"),
        }
    }

    #[test]
    fn replay_persists_records_for_every_tracker() {
        let store = InMemoryMetricStore::new();
        let outcome = must(replay(&fixture_capture(), &AutopsyConfig::v1(), &store, None));

        assert_eq!(outcome.events_applied, 6);
        assert_eq!(outcome.operator_notice, None);
        assert_eq!(outcome.summary.dropped, 0);
        assert_eq!(outcome.summary.query_records, 1);
        assert_eq!(outcome.summary.asset_records, 2);
        // system record plus shop and forms
        assert_eq!(outcome.summary.memory_records, 3);

        let records = store.records();
        assert!(records
            .iter()
            .any(|r| r.metric_type == MetricType::Query && r.extension_slug == "shop"));
        assert!(records
            .iter()
            .any(|r| r.metric_type == MetricType::Asset && r.extension_slug == "forms"));
    }

    #[test]
    fn replay_without_detailed_logging_reports_a_notice() {
        let store = InMemoryMetricStore::new();
        let mut capture = fixture_capture();
        capture.detailed_query_logging = false;

        let outcome = must(replay(&capture, &AutopsyConfig::v1(), &store, None));
        assert!(outcome.operator_notice.is_some());
        assert_eq!(outcome.summary.query_records, 0);
    }

    #[test]
    fn probe_peak_never_decreases() {
        let probe = ReplayProbe::starting_at(MemoryReading {
            resident_bytes: 10,
            peak_bytes: 50,
        });
        probe.set(MemoryReading {
            resident_bytes: 30,
            peak_bytes: 0,
        });
        assert_eq!(probe.resident_bytes(), 30);
        assert_eq!(probe.peak_bytes(), 50);
        probe.set(MemoryReading {
            resident_bytes: 70,
            peak_bytes: 0,
        });
        assert_eq!(probe.peak_bytes(), 70);
    }

    #[test]
    fn unlisted_asset_urls_size_to_zero() {
        let sizes = CapturedSizes::new(BTreeMap::from([("a.js".to_string(), 5)]));
        assert_eq!(sizes.byte_size("a.js"), 5);
        assert_eq!(sizes.byte_size("b.js"), 0);
    }
}
