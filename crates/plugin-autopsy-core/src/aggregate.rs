use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{AutopsyConfig, ImpactWeights, PerformanceWeights};
use crate::record::{AssetPayload, ExtensionMemoryPayload, MetricRecord, MetricType, QueryPayload};
use crate::report::display_name;
use crate::{clamp, round_to, SYSTEM_MEMORY_SLUG};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
}

impl ImpactLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_impact_score(score: f64) -> Self {
        if score > 70.0 {
            Self::High
        } else if score > 40.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Cross-dimension totals for one extension over a time window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtensionProfile {
    pub slug: String,
    pub display_name: String,
    pub query_count: u64,
    pub query_time_ms: f64,
    pub slow_query_count: u64,
    pub asset_count: u64,
    pub asset_bytes: u64,
    /// Mean bytes credited per memory record.
    pub memory_bytes: f64,
    /// Mean share of request memory growth per memory record.
    pub memory_percent: f64,
    pub impact_score: f64,
    pub impact_level: ImpactLevel,
    pub performance_score: f64,
}

#[derive(Debug, Default)]
struct ProfileAccumulator {
    query_count: u64,
    query_seconds: f64,
    slow_query_count: u64,
    asset_count: u64,
    asset_bytes: u64,
    memory_bytes: f64,
    memory_percent: f64,
    memory_records: u32,
}

impl ProfileAccumulator {
    fn fold(&mut self, record: &MetricRecord) {
        let folded = match record.metric_type {
            MetricType::Query => record.decode::<QueryPayload>().map(|payload| {
                self.query_count += payload.query_count;
                self.query_seconds += payload.total_time;
                self.slow_query_count += payload.slow_query_count;
            }),
            MetricType::Asset => record.decode::<AssetPayload>().map(|payload| {
                self.asset_count += payload.js_files + payload.css_files;
                self.asset_bytes = self.asset_bytes.saturating_add(payload.total_size);
            }),
            MetricType::Memory => record.decode::<ExtensionMemoryPayload>().map(|payload| {
                self.memory_bytes += payload.total_memory;
                self.memory_percent += payload.percentage_of_total;
                self.memory_records += 1;
            }),
        };

        if let Err(err) = folded {
            tracing::warn!(error = %err, "skipping unreadable metric record");
        }
    }

    fn into_profile(self, slug: &str, config: &AutopsyConfig) -> ExtensionProfile {
        let (memory_bytes, memory_percent) = if self.memory_records == 0 {
            (0.0, 0.0)
        } else {
            let n = f64::from(self.memory_records);
            (self.memory_bytes / n, self.memory_percent / n)
        };

        #[allow(clippy::cast_precision_loss)]
        let (query_count, asset_count) = (self.query_count as f64, self.asset_count as f64);
        let query_time_ms = round_to(self.query_seconds * 1000.0, 2);

        let impact_score = impact_score(
            &config.impact_weights,
            query_count,
            memory_percent,
            asset_count,
            query_time_ms,
        );
        let performance_score = performance_score(
            &config.performance_weights,
            query_count,
            memory_percent,
            asset_count,
            query_time_ms,
        );

        ExtensionProfile {
            slug: slug.to_string(),
            display_name: display_name(slug),
            query_count: self.query_count,
            query_time_ms,
            slow_query_count: self.slow_query_count,
            asset_count: self.asset_count,
            asset_bytes: self.asset_bytes,
            memory_bytes: round_to(memory_bytes, 2),
            memory_percent: round_to(memory_percent, 2),
            impact_score,
            impact_level: ImpactLevel::from_impact_score(impact_score),
            performance_score,
        }
    }
}

/// Sum of four capped terms; "how much of a problem" an extension is.
#[must_use]
pub fn impact_score(
    weights: &ImpactWeights,
    query_count: f64,
    memory_percent: f64,
    asset_count: f64,
    query_time_ms: f64,
) -> f64 {
    let score = weights.query_count.apply(query_count)
        + weights.memory_percent.apply(memory_percent)
        + weights.asset_count.apply(asset_count)
        + weights.query_time_ms.apply(query_time_ms);
    clamp(score, 0.0, 100.0).round()
}

/// 100 minus four capped penalties; "how good" an extension is.
#[must_use]
pub fn performance_score(
    weights: &PerformanceWeights,
    query_count: f64,
    memory_percent: f64,
    asset_count: f64,
    query_time_ms: f64,
) -> f64 {
    let penalty = weights.db_queries.apply(query_count)
        + weights.memory_percent.apply(memory_percent)
        + weights.asset_count.apply(asset_count)
        + weights.db_time_ms.apply(query_time_ms);
    clamp(100.0 - penalty, 0.0, 100.0).round()
}

/// Folds window records into one profile per extension, ranked by impact.
///
/// The system memory record is excluded. A metric type with no records for an
/// extension contributes zero. Ties are broken by slug, and the result does
/// not depend on input order.
#[must_use]
pub fn build_profiles(records: &[MetricRecord], config: &AutopsyConfig) -> Vec<ExtensionProfile> {
    let mut ordered: Vec<&MetricRecord> = records
        .iter()
        .filter(|record| record.extension_slug != SYSTEM_MEMORY_SLUG)
        .collect();
    ordered.sort_by(|a, b| {
        a.extension_slug
            .cmp(&b.extension_slug)
            .then_with(|| a.metric_type.cmp(&b.metric_type))
            .then_with(|| a.recorded_at.cmp(&b.recorded_at))
            .then_with(|| a.record_id.cmp(&b.record_id))
    });

    let mut per_extension: BTreeMap<&str, ProfileAccumulator> = BTreeMap::new();
    for record in ordered {
        per_extension
            .entry(record.extension_slug.as_str())
            .or_default()
            .fold(record);
    }

    let mut profiles: Vec<ExtensionProfile> = per_extension
        .into_iter()
        .map(|(slug, acc)| acc.into_profile(slug, config))
        .collect();
    profiles.sort_by(|a, b| {
        b.impact_score
            .total_cmp(&a.impact_score)
            .then_with(|| a.slug.cmp(&b.slug))
    });
    profiles
}

/// Nearest-rank percentile; 0 for an empty input.
#[must_use]
pub fn percentile(values: &[f64], percentile_rank: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let position = (percentile_rank * sorted.len() as f64).ceil() as usize;
    let index = position.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}
