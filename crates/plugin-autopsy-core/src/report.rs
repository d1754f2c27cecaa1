use std::cmp::Reverse;
use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::aggregate::{build_profiles, percentile, ExtensionProfile, ImpactLevel};
use crate::config::AutopsyConfig;
use crate::record::{
    AssetPayload, MemorySnapshot, MetricRecord, MetricType, SystemMemoryPayload, TimeWindow,
};
use crate::store::MetricStore;
use crate::{round_to, CORE_SLUG, SYSTEM_MEMORY_SLUG, THEME_SLUG};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Bucket of a 0-100 performance score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScoreLevel {
    Good,
    Medium,
    Poor,
}

impl ScoreLevel {
    #[must_use]
    pub fn from_performance_score(score: f64) -> Self {
        if score > 80.0 {
            Self::Good
        } else if score > 60.0 {
            Self::Medium
        } else {
            Self::Poor
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Medium => "medium",
            Self::Poor => "poor",
        }
    }

    #[must_use]
    pub fn verdict(self) -> &'static str {
        match self {
            Self::Good => "Good performance",
            Self::Medium => "Consider optimization",
            Self::Poor => "Needs attention - consider alternatives",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Overview {
    pub window: TimeWindow,
    pub total_extensions: usize,
    pub total_queries: u64,
    pub total_assets: u64,
    pub peak_memory: u64,
    pub impact_p50: f64,
    pub impact_p90: f64,
    pub top_extensions: Vec<ExtensionProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRow {
    pub slug: String,
    pub display_name: String,
    pub query_count: u64,
    pub total_time_ms: f64,
    pub average_time_ms: f64,
    pub slow_query_count: u64,
    pub status: ImpactLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryBreakdown {
    pub window: TimeWindow,
    pub total_queries: u64,
    pub total_time_ms: f64,
    pub average_time_ms: f64,
    pub slow_query_count: u64,
    pub rows: Vec<QueryRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetRow {
    pub slug: String,
    pub display_name: String,
    pub js_files: u64,
    pub css_files: u64,
    pub js_bytes: u64,
    pub css_bytes: u64,
    pub total_bytes: u64,
    pub status: ImpactLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetBreakdown {
    pub window: TimeWindow,
    pub total_files: u64,
    pub total_bytes: u64,
    pub largest: Option<String>,
    pub rows: Vec<AssetRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRow {
    pub slug: String,
    pub display_name: String,
    pub memory_bytes: f64,
    pub percentage: f64,
    pub level: ImpactLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryBreakdown {
    pub window: TimeWindow,
    pub initial_memory: u64,
    pub peak_memory: u64,
    pub total_increase: i64,
    /// Snapshot sequence of the most recent request in the window.
    pub timeline: Vec<MemorySnapshot>,
    pub rows: Vec<MemoryRow>,
    pub high_usage: Vec<MemoryRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recommendation {
    /// `None` for site-wide advice.
    pub slug: Option<String>,
    pub title: String,
    pub priority: Priority,
    pub description: String,
    pub actions: Vec<String>,
    pub potential_savings: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonRow {
    pub slug: String,
    pub display_name: String,
    pub db_queries: u64,
    pub db_time_ms: f64,
    pub memory_percent: f64,
    pub asset_count: u64,
    pub asset_bytes: u64,
    pub performance_score: f64,
    pub score_level: ScoreLevel,
    pub db_level: ImpactLevel,
    pub memory_level: ImpactLevel,
    pub asset_level: ImpactLevel,
    pub verdict: String,
}

/// Read-side report builders over a [`MetricStore`].
#[derive(Clone, Copy)]
pub struct Reports<'a> {
    store: &'a dyn MetricStore,
    config: &'a AutopsyConfig,
}

impl<'a> Reports<'a> {
    #[must_use]
    pub fn new(store: &'a dyn MetricStore, config: &'a AutopsyConfig) -> Self {
        Self { store, config }
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn get_overview(&self, window: &TimeWindow) -> Result<Overview> {
        let records = self.store.list_window(window, None)?;
        let mut profiles = build_profiles(&records, self.config);

        let impact_scores: Vec<f64> = profiles.iter().map(|p| p.impact_score).collect();
        let peak_memory = system_memory_payloads(&records)
            .map(|payload| payload.peak_memory)
            .max()
            .unwrap_or(0);
        let total_extensions = profiles.len();
        let total_queries = profiles.iter().map(|p| p.query_count).sum();
        let total_assets = profiles.iter().map(|p| p.asset_count).sum();
        profiles.truncate(self.config.leaderboard_size);

        Ok(Overview {
            window: *window,
            total_extensions,
            total_queries,
            total_assets,
            peak_memory,
            impact_p50: percentile(&impact_scores, 0.5),
            impact_p90: percentile(&impact_scores, 0.9),
            top_extensions: profiles,
        })
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn get_query_breakdown(&self, window: &TimeWindow) -> Result<QueryBreakdown> {
        let records = self.store.list_window(window, Some(MetricType::Query))?;
        let mut rows: Vec<QueryRow> = build_profiles(&records, self.config)
            .into_iter()
            .map(|profile| {
                let average_time_ms = average(profile.query_time_ms, profile.query_count);
                let status = if profile.query_count > 50 || profile.slow_query_count > 0 {
                    ImpactLevel::High
                } else if profile.query_count > 20 || average_time_ms > 10.0 {
                    ImpactLevel::Medium
                } else {
                    ImpactLevel::Low
                };
                QueryRow {
                    slug: profile.slug,
                    display_name: profile.display_name,
                    query_count: profile.query_count,
                    total_time_ms: profile.query_time_ms,
                    average_time_ms,
                    slow_query_count: profile.slow_query_count,
                    status,
                }
            })
            .collect();
        rows.sort_by(|a, b| {
            b.total_time_ms
                .total_cmp(&a.total_time_ms)
                .then_with(|| a.slug.cmp(&b.slug))
        });

        let total_queries = rows.iter().map(|row| row.query_count).sum();
        let total_time_ms = round_to(rows.iter().map(|row| row.total_time_ms).sum(), 2);
        Ok(QueryBreakdown {
            window: *window,
            total_queries,
            total_time_ms,
            average_time_ms: average(total_time_ms, total_queries),
            slow_query_count: rows.iter().map(|row| row.slow_query_count).sum(),
            rows,
        })
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn get_asset_breakdown(&self, window: &TimeWindow) -> Result<AssetBreakdown> {
        let records = self.store.list_window(window, Some(MetricType::Asset))?;
        let mut totals: BTreeMap<&str, AssetPayload> = BTreeMap::new();
        for record in &records {
            let payload: AssetPayload = match record.decode() {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable asset record");
                    continue;
                }
            };
            let entry = totals.entry(record.extension_slug.as_str()).or_default();
            entry.js_files += payload.js_files;
            entry.css_files += payload.css_files;
            entry.total_js_size = entry.total_js_size.saturating_add(payload.total_js_size);
            entry.total_css_size = entry.total_css_size.saturating_add(payload.total_css_size);
            entry.total_size = entry.total_size.saturating_add(payload.total_size);
        }

        let mut rows: Vec<AssetRow> = totals
            .into_iter()
            .map(|(slug, payload)| {
                let files = payload.js_files + payload.css_files;
                let status = if payload.total_size > 1_000_000 || files > 10 {
                    ImpactLevel::High
                } else if payload.total_size > 500_000 || files > 5 {
                    ImpactLevel::Medium
                } else {
                    ImpactLevel::Low
                };
                AssetRow {
                    slug: slug.to_string(),
                    display_name: display_name(slug),
                    js_files: payload.js_files,
                    css_files: payload.css_files,
                    js_bytes: payload.total_js_size,
                    css_bytes: payload.total_css_size,
                    total_bytes: payload.total_size,
                    status,
                }
            })
            .collect();
        rows.sort_by(|a, b| {
            b.total_bytes
                .cmp(&a.total_bytes)
                .then_with(|| a.slug.cmp(&b.slug))
        });

        Ok(AssetBreakdown {
            window: *window,
            total_files: rows.iter().map(|row| row.js_files + row.css_files).sum(),
            total_bytes: rows.iter().map(|row| row.total_bytes).sum(),
            largest: rows.first().map(|row| row.slug.clone()),
            rows,
        })
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn get_memory_breakdown(&self, window: &TimeWindow) -> Result<MemoryBreakdown> {
        let records = self.store.list_window(window, Some(MetricType::Memory))?;
        let latest_system = system_memory_payloads(&records).last().unwrap_or_default();

        let mut rows: Vec<MemoryRow> = build_profiles(&records, self.config)
            .into_iter()
            .map(|profile| MemoryRow {
                level: memory_level(profile.memory_percent),
                slug: profile.slug,
                display_name: profile.display_name,
                memory_bytes: profile.memory_bytes,
                percentage: profile.memory_percent,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.memory_bytes
                .total_cmp(&a.memory_bytes)
                .then_with(|| a.slug.cmp(&b.slug))
        });
        let high_usage = rows
            .iter()
            .filter(|row| row.percentage > 15.0)
            .cloned()
            .collect();

        Ok(MemoryBreakdown {
            window: *window,
            initial_memory: latest_system.initial_memory,
            peak_memory: latest_system.peak_memory,
            total_increase: latest_system.total_increase,
            timeline: latest_system.snapshots,
            rows,
            high_usage,
        })
    }

    /// Rule-based advice per extension, highest priority first.
    #[allow(clippy::missing_errors_doc)]
    pub fn get_recommendations(&self, window: &TimeWindow) -> Result<Vec<Recommendation>> {
        let records = self.store.list_window(window, None)?;
        let profiles = build_profiles(&records, self.config);
        let thresholds = &self.config.recommendation_thresholds;
        let mut recommendations = Vec::new();

        for profile in &profiles {
            let name = profile.display_name.as_str();
            let slug = Some(profile.slug.clone());

            if profile.query_count > thresholds.query_count {
                recommendations.push(Recommendation {
                    slug: slug.clone(),
                    title: "High Database Query Count".to_string(),
                    priority: if profile.query_count > thresholds.query_count_high {
                        Priority::High
                    } else {
                        Priority::Medium
                    },
                    description: format!(
                        "{name} is making {} database queries, which is significantly high and may slow down the site.",
                        profile.query_count
                    ),
                    actions: actions(&[
                        "Consider implementing caching for this extension",
                        "Look for alternative extensions with better performance",
                        "Contact the extension developer about optimization",
                    ]),
                    potential_savings: format!(
                        "Reducing queries could improve page load time by {:.0}ms",
                        profile.query_time_ms.trunc()
                    ),
                });
            }

            if profile.slow_query_count > 0 {
                recommendations.push(Recommendation {
                    slug: slug.clone(),
                    title: "Slow Database Queries Detected".to_string(),
                    priority: Priority::High,
                    description: format!(
                        "{name} has {} slow queries that are impacting performance.",
                        profile.slow_query_count
                    ),
                    actions: actions(&[
                        "Review and optimize slow queries",
                        "Add database indexes if needed",
                        "Consider query optimization or caching",
                    ]),
                    potential_savings:
                        "Optimizing slow queries can significantly improve response times"
                            .to_string(),
                });
            }

            if profile.memory_percent > thresholds.memory_percent {
                let memory = format_bytes(profile.memory_bytes);
                recommendations.push(Recommendation {
                    slug: slug.clone(),
                    title: "High Memory Usage".to_string(),
                    priority: if profile.memory_percent > thresholds.memory_percent_high {
                        Priority::High
                    } else {
                        Priority::Medium
                    },
                    description: format!(
                        "{name} is using {memory} of memory ({:.1}% of total), which is quite high.",
                        profile.memory_percent
                    ),
                    actions: actions(&[
                        "Check for memory leaks in the extension",
                        "Consider alternatives with lower memory footprint",
                        "Increase server memory if this extension is essential",
                    ]),
                    potential_savings: format!("Reducing memory usage by {memory}"),
                });
            }

            if profile.asset_bytes > thresholds.asset_bytes {
                #[allow(clippy::cast_precision_loss)]
                let size = format_bytes(profile.asset_bytes as f64);
                recommendations.push(Recommendation {
                    slug,
                    title: "Large Asset Files".to_string(),
                    priority: if profile.asset_bytes > thresholds.asset_bytes_high {
                        Priority::High
                    } else {
                        Priority::Medium
                    },
                    description: format!(
                        "{name} is loading {size} of CSS/JS files, which may slow down page loading."
                    ),
                    actions: actions(&[
                        "Minify and compress CSS/JS files",
                        "Load assets only on pages where needed",
                        "Use a CDN for faster asset delivery",
                        "Consider combining multiple small files",
                    ]),
                    potential_savings: format!(
                        "File optimization could reduce load time by reducing {size} of assets"
                    ),
                });
            }
        }

        if profiles.len() > thresholds.max_active_extensions {
            recommendations.push(Recommendation {
                slug: None,
                title: "Too Many Active Plugins".to_string(),
                priority: Priority::Medium,
                description: format!(
                    "{} extensions are active. Having too many can slow down the site even if each one is optimized.",
                    profiles.len()
                ),
                actions: actions(&[
                    "Review and deactivate unused extensions",
                    "Look for extensions that provide multiple features",
                    "Consider custom development for simple features",
                ]),
                potential_savings: "Reducing extension count can improve overall site performance"
                    .to_string(),
            });
        }

        recommendations.sort_by(|a, b| {
            (Reverse(a.priority), a.slug.as_deref())
                .cmp(&(Reverse(b.priority), b.slug.as_deref()))
        });
        Ok(recommendations)
    }

    /// Extensions ordered worst-first by performance score.
    #[allow(clippy::missing_errors_doc)]
    pub fn get_comparison(&self, window: &TimeWindow) -> Result<Vec<ComparisonRow>> {
        let records = self.store.list_window(window, None)?;
        let mut rows: Vec<ComparisonRow> = build_profiles(&records, self.config)
            .into_iter()
            .map(|profile| {
                let score_level = ScoreLevel::from_performance_score(profile.performance_score);
                #[allow(clippy::cast_precision_loss)]
                let (db_queries, asset_count) =
                    (profile.query_count as f64, profile.asset_count as f64);
                ComparisonRow {
                    db_level: dimension_level(db_queries, 5.0, 15.0),
                    memory_level: dimension_level(profile.memory_percent, 5.0, 15.0),
                    asset_level: dimension_level(asset_count, 3.0, 8.0),
                    slug: profile.slug,
                    display_name: profile.display_name,
                    db_queries: profile.query_count,
                    db_time_ms: profile.query_time_ms,
                    memory_percent: profile.memory_percent,
                    asset_count: profile.asset_count,
                    asset_bytes: profile.asset_bytes,
                    performance_score: profile.performance_score,
                    score_level,
                    verdict: score_level.verdict().to_string(),
                }
            })
            .collect();
        rows.sort_by(|a, b| {
            a.performance_score
                .total_cmp(&b.performance_score)
                .then_with(|| a.slug.cmp(&b.slug))
        });
        Ok(rows)
    }
}

/// Human-readable name for a slug.
#[must_use]
pub fn display_name(slug: &str) -> String {
    match slug {
        CORE_SLUG => "Core".to_string(),
        THEME_SLUG => "Active Theme".to_string(),
        SYSTEM_MEMORY_SLUG => "System Memory".to_string(),
        _ => slug
            .split(['-', '_'])
            .filter(|word| !word.is_empty())
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// `1536` -> `"1.5 KB"`, base 1024, two decimals at most.
#[must_use]
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if !bytes.is_finite() || bytes.abs() < 1.0 {
        return "0 B".to_string();
    }

    let mut value = bytes.abs();
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let sign = if bytes < 0.0 { "-" } else { "" };
    format!("{sign}{} {}", round_to(value, 2), UNITS[unit])
}

fn system_memory_payloads(records: &[MetricRecord]) -> impl Iterator<Item = SystemMemoryPayload> + '_ {
    records
        .iter()
        .filter(|record| {
            record.metric_type == MetricType::Memory && record.extension_slug == SYSTEM_MEMORY_SLUG
        })
        .filter_map(|record| record.decode::<SystemMemoryPayload>().ok())
}

fn memory_level(percentage: f64) -> ImpactLevel {
    if percentage > 20.0 {
        ImpactLevel::High
    } else if percentage > 10.0 {
        ImpactLevel::Medium
    } else {
        ImpactLevel::Low
    }
}

fn dimension_level(value: f64, low: f64, medium: f64) -> ImpactLevel {
    if value <= low {
        ImpactLevel::Low
    } else if value <= medium {
        ImpactLevel::Medium
    } else {
        ImpactLevel::High
    }
}

fn average(total_ms: f64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let count = count as f64;
    round_to(total_ms / count, 2)
}

fn actions(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_string()).collect()
}
