//! Per-request resource attribution for extension-based host applications.
//!
//! Trackers observe one request at a time through a [`RequestScope`], attribute
//! queries, assets, and memory growth to the extension that caused them, and
//! persist one [`MetricRecordInput`] per extension and metric type through a
//! [`MetricStore`]. [`Reports`] later folds stored records into ranked,
//! time-windowed profiles.

use time::{Duration, OffsetDateTime, UtcOffset};

pub mod admin;
pub mod aggregate;
pub mod asset;
pub mod classify;
pub mod config;
pub mod context;
pub mod memory;
pub mod query;
pub mod record;
pub mod redact;
pub mod report;
pub mod resolve;
pub mod store;

pub use admin::{purge_expired, recent_slow_queries, request_refresh, AdminOutcome, SlowQueryRow};
pub use aggregate::{
    build_profiles, impact_score, percentile, performance_score, ExtensionProfile, ImpactLevel,
};
pub use asset::{
    AssetKind, AssetSizer, AssetSource, AssetTracker, AssetTrackerState, LocalOrRemoteSizer,
    RegisteredAsset, RenderContext,
};
pub use classify::{Classification, OriginKind, PathClassifier};
pub use config::{
    AutopsyConfig, ImpactWeights, InstallLayout, PerformanceWeights, RecommendationThresholds,
    WeightedTerm,
};
pub use context::{PersistSummary, RequestCollaborators, RequestScope};
pub use memory::{
    HookCheckpoint, LifecycleCheckpoint, MemoryProbe, MemoryTracker, MemoryTrackerState,
    ProcessMemoryProbe,
};
pub use query::{LoggedQuery, QueryLog, QueryTracker, QueryTrackerState};
pub use record::{
    AssetPayload, AssetUsage, AttributedQuery, CheckpointShare, ExtensionMemoryPayload,
    HookAttribution, MemorySnapshot, MetricRecord, MetricRecordInput, MetricType, QueryPayload,
    SystemMemoryPayload, TimeRange, TimeWindow,
};
pub use redact::Redactor;
pub use report::{
    display_name, format_bytes, AssetBreakdown, AssetRow, ComparisonRow, MemoryBreakdown,
    MemoryRow, Overview, Priority, QueryBreakdown, QueryRow, Recommendation, Reports, ScoreLevel,
};
pub use resolve::{
    parse_stack_trace, CallbackRef, ResolvedOrigin, StackFrame, StackResolver, StackTraceParser,
};
pub use store::{InMemoryMetricStore, MetricStore};

/// Slug credited with resources that live under the theme root.
pub const THEME_SLUG: &str = "active-theme";
/// Slug credited with resources that live under a core root.
pub const CORE_SLUG: &str = "core";
/// Slug used when an asset URL cannot be classified.
pub const UNKNOWN_SLUG: &str = "unknown";
/// Reserved slug of the per-request system memory record.
pub const SYSTEM_MEMORY_SLUG: &str = "system_memory";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AutopsyError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("payload error: {0}")]
    Payload(String),
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AutopsyError::Validation`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AutopsyError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AutopsyError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AutopsyError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AutopsyError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AutopsyError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            AutopsyError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Milliseconds since the unix epoch, used as the sortable time key in stores.
#[must_use]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    let millis = value.unix_timestamp_nanos() / 1_000_000;
    i64::try_from(millis).unwrap_or(i64::MAX)
}

#[must_use]
pub fn days_before(value: OffsetDateTime, days: u32) -> OffsetDateTime {
    value - Duration::days(i64::from(days))
}

pub(crate) fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.min(max).max(min)
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn rfc3339_round_trip_keeps_utc() {
        let parsed = must_ok(parse_rfc3339_utc("2026-03-01T08:30:00Z"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-03-01T08:30:00Z");
    }

    #[test]
    fn non_utc_timestamps_are_rejected() {
        assert!(parse_rfc3339_utc("2026-03-01T08:30:00+02:00").is_err());
    }

    #[test]
    fn unix_millis_orders_subsecond_timestamps() {
        let earlier = must_ok(parse_rfc3339_utc("2026-03-01T08:30:00.5Z"));
        let later = must_ok(parse_rfc3339_utc("2026-03-01T08:30:01Z"));
        assert!(unix_millis(earlier) < unix_millis(later));
        assert_eq!(unix_millis(later) - unix_millis(earlier), 500);
    }

    #[test]
    fn round_to_keeps_requested_precision() {
        assert!((round_to(340.004_9, 2) - 340.0).abs() < f64::EPSILON);
        assert!((clamp(120.0, 0.0, 30.0) - 30.0).abs() < f64::EPSILON);
    }
}
