use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

use crate::AutopsyError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Query,
    Asset,
    Memory,
}

impl MetricType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Asset => "asset",
            Self::Memory => "memory",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "query" => Some(Self::Query),
            "asset" => Some(Self::Asset),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributedQuery {
    pub sql_text: String,
    pub duration_seconds: f64,
    pub origin_extension: String,
    pub origin_file: String,
    pub origin_line: u32,
    pub slow: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryPayload {
    pub query_count: u64,
    pub total_time: f64,
    pub average_time: f64,
    pub slow_query_count: u64,
    pub queries: Vec<AttributedQuery>,
    pub slow_queries: Vec<AttributedQuery>,
    pub slow_queries_omitted: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Script,
    Style,
}

impl AssetKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Style => "style",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "script" | "js" => Some(Self::Script),
            "style" | "css" => Some(Self::Style),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RenderContext {
    Front,
    Admin,
}

impl RenderContext {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Front => "front",
            Self::Admin => "admin",
        }
    }
}

/// How an asset was discovered during the request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssetSource {
    Registered,
    Markup,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetUsage {
    pub extension_slug: String,
    pub kind: AssetKind,
    pub byte_size: u64,
    pub handle: Option<String>,
    pub src: String,
    pub context: RenderContext,
    pub source: AssetSource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AssetPayload {
    pub js_files: u64,
    pub css_files: u64,
    pub total_js_size: u64,
    pub total_css_size: u64,
    pub total_size: u64,
    pub js_details: Vec<AssetUsage>,
    pub css_details: Vec<AssetUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemorySnapshot {
    pub checkpoint: String,
    pub resident_bytes: u64,
    pub peak_bytes: u64,
    /// Unix seconds with sub-second precision.
    pub wall_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HookAttribution {
    pub checkpoint: String,
    pub bytes_before: u64,
    pub bytes_after: u64,
    /// Negative when memory was released; never clamped.
    pub delta: i64,
    pub responsible_extensions: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointShare {
    pub checkpoint: String,
    pub bytes: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtensionMemoryPayload {
    pub total_memory: f64,
    pub percentage_of_total: f64,
    pub peak_memory: u64,
    pub hook_usage: Vec<CheckpointShare>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SystemMemoryPayload {
    pub initial_memory: u64,
    pub final_memory: u64,
    pub peak_memory: u64,
    pub total_increase: i64,
    pub snapshots: Vec<MemorySnapshot>,
    pub hooks: Vec<HookAttribution>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRecord {
    pub record_seq: i64,
    pub record_id: Ulid,
    pub extension_slug: String,
    pub metric_type: MetricType,
    pub payload: Value,
    pub page_context: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl MetricRecord {
    /// Decodes the payload into its typed form; absent fields decode as zero.
    ///
    /// # Errors
    /// Returns [`AutopsyError::Payload`] when the stored payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AutopsyError> {
        serde_json::from_value(self.payload.clone()).map_err(|err| {
            AutopsyError::Payload(format!(
                "record {} ({} for {}) has an unreadable payload: {err}",
                self.record_id,
                self.metric_type.as_str(),
                self.extension_slug
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRecordInput {
    pub record_id: Option<Ulid>,
    pub extension_slug: String,
    pub metric_type: MetricType,
    pub payload: Value,
    pub page_context: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl MetricRecordInput {
    /// Builds an input from a typed payload.
    ///
    /// # Errors
    /// Returns [`AutopsyError::Payload`] when the payload cannot be serialized.
    pub fn new<P: Serialize>(
        extension_slug: &str,
        metric_type: MetricType,
        payload: &P,
        page_context: &str,
        recorded_at: OffsetDateTime,
    ) -> Result<Self, AutopsyError> {
        let payload = serde_json::to_value(payload)
            .map_err(|err| AutopsyError::Payload(format!("failed to encode payload: {err}")))?;
        Ok(Self {
            record_id: None,
            extension_slug: extension_slug.to_string(),
            metric_type,
            payload,
            page_context: page_context.to_string(),
            recorded_at,
        })
    }

    /// Validates a record before append.
    ///
    /// # Errors
    /// Returns [`AutopsyError::Validation`] when the slug is empty, the payload
    /// is not an object, or the timestamp is not UTC.
    pub fn validate(&self) -> Result<(), AutopsyError> {
        if self.extension_slug.trim().is_empty() {
            return Err(AutopsyError::Validation(
                "extension_slug MUST be provided for every record".to_string(),
            ));
        }

        if !self.payload.is_object() {
            return Err(AutopsyError::Validation(
                "payload MUST be a JSON object".to_string(),
            ));
        }

        if self.recorded_at.offset() != UtcOffset::UTC {
            return Err(AutopsyError::Validation(
                "recorded_at MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }
}

/// Report ranges offered to operators.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    LastHour,
    #[default]
    #[serde(rename = "24h")]
    LastDay,
    #[serde(rename = "7d")]
    LastWeek,
    #[serde(rename = "30d")]
    LastMonth,
}

impl TimeRange {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LastHour => "1h",
            Self::LastDay => "24h",
            Self::LastWeek => "7d",
            Self::LastMonth => "30d",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "1h" => Some(Self::LastHour),
            "24h" => Some(Self::LastDay),
            "7d" => Some(Self::LastWeek),
            "30d" => Some(Self::LastMonth),
            _ => None,
        }
    }

    #[must_use]
    pub fn duration(self) -> Duration {
        match self {
            Self::LastHour => Duration::HOUR,
            Self::LastDay => Duration::DAY,
            Self::LastWeek => Duration::WEEK,
            Self::LastMonth => Duration::days(30),
        }
    }
}

/// Inclusive `[start, end]` interval over record timestamps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct TimeWindow {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl TimeWindow {
    /// # Errors
    /// Returns [`AutopsyError::Validation`] when `start` is after `end`.
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self, AutopsyError> {
        if start > end {
            return Err(AutopsyError::Validation(
                "time window start MUST NOT be after end".to_string(),
            ));
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn ending_at(range: TimeRange, end: OffsetDateTime) -> Self {
        Self {
            start: end - range.duration(),
            end,
        }
    }

    #[must_use]
    pub fn contains(&self, at: OffsetDateTime) -> bool {
        self.start <= at && at <= self.end
    }
}
