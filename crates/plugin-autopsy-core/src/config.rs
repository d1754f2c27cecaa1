use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{clamp, AutopsyError};

/// Where the host keeps extensions, themes, and its own code, on disk and on the web.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallLayout {
    pub site_root: String,
    pub site_url: String,
    pub content_dir: String,
    pub content_url: String,
    pub extensions_dir: String,
    pub extensions_url: String,
    pub themes_dir: String,
    pub themes_url: String,
    pub core_dirs: Vec<String>,
    pub core_url_paths: Vec<String>,
}

impl InstallLayout {
    #[must_use]
    pub fn conventional(site_root: &str, site_url: &str) -> Self {
        let root = site_root.trim_end_matches('/');
        let url = site_url.trim_end_matches('/');
        Self {
            site_root: root.to_string(),
            site_url: url.to_string(),
            content_dir: format!("{root}/wp-content"),
            content_url: format!("{url}/wp-content"),
            extensions_dir: format!("{root}/wp-content/plugins"),
            extensions_url: format!("{url}/wp-content/plugins"),
            themes_dir: format!("{root}/wp-content/themes"),
            themes_url: format!("{url}/wp-content/themes"),
            core_dirs: vec![format!("{root}/wp-includes"), format!("{root}/wp-admin")],
            core_url_paths: vec!["/wp-includes".to_string(), "/wp-admin".to_string()],
        }
    }

    fn validate(&self) -> Result<(), AutopsyError> {
        for (name, value) in [
            ("site_root", &self.site_root),
            ("extensions_dir", &self.extensions_dir),
            ("extensions_url", &self.extensions_url),
            ("themes_dir", &self.themes_dir),
        ] {
            if value.trim().is_empty() {
                return Err(AutopsyError::Configuration(format!(
                    "layout.{name} MUST be provided"
                )));
            }
        }

        if self.extensions_dir == self.themes_dir {
            return Err(AutopsyError::Configuration(
                "layout.extensions_dir and layout.themes_dir MUST differ".to_string(),
            ));
        }

        Ok(())
    }
}

/// One capped sub-score: `clamp(value / divisor * weight, 0, cap)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WeightedTerm {
    pub divisor: f64,
    pub weight: f64,
    pub cap: f64,
}

impl WeightedTerm {
    #[must_use]
    pub const fn new(divisor: f64, weight: f64, cap: f64) -> Self {
        Self {
            divisor,
            weight,
            cap,
        }
    }

    #[must_use]
    pub fn apply(&self, value: f64) -> f64 {
        clamp(value / self.divisor * self.weight, 0.0, self.cap)
    }

    fn validate(&self, name: &str) -> Result<(), AutopsyError> {
        if !(self.divisor.is_finite() && self.divisor > 0.0) {
            return Err(AutopsyError::Configuration(format!(
                "{name}.divisor MUST be > 0"
            )));
        }
        if !(self.weight.is_finite() && self.weight >= 0.0) {
            return Err(AutopsyError::Configuration(format!(
                "{name}.weight MUST be >= 0"
            )));
        }
        if !(0.0..=100.0).contains(&self.cap) {
            return Err(AutopsyError::Configuration(format!(
                "{name}.cap MUST be in [0, 100]"
            )));
        }
        Ok(())
    }
}

/// Terms summed into `impact_score` ("how much of a problem").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ImpactWeights {
    pub query_count: WeightedTerm,
    pub memory_percent: WeightedTerm,
    pub asset_count: WeightedTerm,
    pub query_time_ms: WeightedTerm,
}

impl ImpactWeights {
    #[must_use]
    pub const fn v1() -> Self {
        Self {
            query_count: WeightedTerm::new(10.0, 20.0, 30.0),
            memory_percent: WeightedTerm::new(10.0, 25.0, 35.0),
            asset_count: WeightedTerm::new(5.0, 15.0, 20.0),
            query_time_ms: WeightedTerm::new(100.0, 15.0, 15.0),
        }
    }

    fn terms(&self) -> [(&'static str, WeightedTerm); 4] {
        [
            ("impact_weights.query_count", self.query_count),
            ("impact_weights.memory_percent", self.memory_percent),
            ("impact_weights.asset_count", self.asset_count),
            ("impact_weights.query_time_ms", self.query_time_ms),
        ]
    }
}

/// Penalties subtracted from 100 to form `performance_score` ("how good").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PerformanceWeights {
    pub db_queries: WeightedTerm,
    pub memory_percent: WeightedTerm,
    pub asset_count: WeightedTerm,
    pub db_time_ms: WeightedTerm,
}

impl PerformanceWeights {
    #[must_use]
    pub const fn v1() -> Self {
        Self {
            db_queries: WeightedTerm::new(5.0, 10.0, 30.0),
            memory_percent: WeightedTerm::new(5.0, 15.0, 25.0),
            asset_count: WeightedTerm::new(3.0, 10.0, 20.0),
            db_time_ms: WeightedTerm::new(50.0, 15.0, 25.0),
        }
    }

    fn terms(&self) -> [(&'static str, WeightedTerm); 4] {
        [
            ("performance_weights.db_queries", self.db_queries),
            ("performance_weights.memory_percent", self.memory_percent),
            ("performance_weights.asset_count", self.asset_count),
            ("performance_weights.db_time_ms", self.db_time_ms),
        ]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RecommendationThresholds {
    pub query_count: u64,
    pub query_count_high: u64,
    pub memory_percent: f64,
    pub memory_percent_high: f64,
    pub asset_bytes: u64,
    pub asset_bytes_high: u64,
    pub max_active_extensions: usize,
}

impl RecommendationThresholds {
    #[must_use]
    pub const fn v1() -> Self {
        Self {
            query_count: 50,
            query_count_high: 100,
            memory_percent: 20.0,
            memory_percent_high: 30.0,
            asset_bytes: 500_000,
            asset_bytes_high: 1_000_000,
            max_active_extensions: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct AutopsyConfig {
    pub layout: InstallLayout,
    pub slow_query_threshold_seconds: f64,
    pub query_sample_size: usize,
    pub max_stored_slow_queries: usize,
    pub max_query_length: usize,
    pub display_query_length: usize,
    pub memory_top_checkpoints: usize,
    pub asset_head_timeout_ms: u64,
    pub retention_days: u32,
    pub log_queries: bool,
    pub log_paths: bool,
    pub log_memory: bool,
    pub log_assets: bool,
    pub leaderboard_size: usize,
    pub impact_weights: ImpactWeights,
    pub performance_weights: PerformanceWeights,
    pub recommendation_thresholds: RecommendationThresholds,
}

impl AutopsyConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            layout: InstallLayout::conventional("/var/www/html", "https://example.com"),
            slow_query_threshold_seconds: 0.05,
            query_sample_size: 10,
            max_stored_slow_queries: 50,
            max_query_length: 1000,
            display_query_length: 500,
            memory_top_checkpoints: 3,
            asset_head_timeout_ms: 5000,
            retention_days: 30,
            log_queries: true,
            log_paths: true,
            log_memory: true,
            log_assets: true,
            leaderboard_size: 10,
            impact_weights: ImpactWeights::v1(),
            performance_weights: PerformanceWeights::v1(),
            recommendation_thresholds: RecommendationThresholds::v1(),
        }
    }

    /// Validates numeric bounds, layout roots, and scoring tables.
    ///
    /// # Errors
    /// Returns [`AutopsyError::Configuration`] when a field is outside its
    /// allowed bounds.
    pub fn validate(&self) -> Result<(), AutopsyError> {
        self.layout.validate()?;

        if !(self.slow_query_threshold_seconds.is_finite()
            && self.slow_query_threshold_seconds > 0.0)
        {
            return Err(AutopsyError::Configuration(
                "slow_query_threshold_seconds MUST be > 0".to_string(),
            ));
        }

        for (name, value) in [
            ("query_sample_size", self.query_sample_size),
            ("max_stored_slow_queries", self.max_stored_slow_queries),
            ("memory_top_checkpoints", self.memory_top_checkpoints),
            ("leaderboard_size", self.leaderboard_size),
        ] {
            if value == 0 {
                return Err(AutopsyError::Configuration(format!("{name} MUST be >= 1")));
            }
        }

        // Both limits must leave room for the truncation marker.
        for (name, value) in [
            ("max_query_length", self.max_query_length),
            ("display_query_length", self.display_query_length),
        ] {
            if value < 64 {
                return Err(AutopsyError::Configuration(format!("{name} MUST be >= 64")));
            }
        }

        if !(1..=5000).contains(&self.asset_head_timeout_ms) {
            return Err(AutopsyError::Configuration(
                "asset_head_timeout_ms MUST be in [1, 5000]".to_string(),
            ));
        }

        if self.retention_days == 0 {
            return Err(AutopsyError::Configuration(
                "retention_days MUST be >= 1".to_string(),
            ));
        }

        for (name, term) in self
            .impact_weights
            .terms()
            .into_iter()
            .chain(self.performance_weights.terms())
        {
            term.validate(name)?;
        }

        let thresholds = &self.recommendation_thresholds;
        if thresholds.query_count > thresholds.query_count_high
            || thresholds.memory_percent > thresholds.memory_percent_high
            || thresholds.asset_bytes > thresholds.asset_bytes_high
        {
            return Err(AutopsyError::Configuration(
                "recommendation thresholds MUST NOT exceed their high counterparts".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`AutopsyError::Configuration`] when JSON decoding fails
    /// or decoded values violate configuration constraints.
    pub fn from_json(value: &Value) -> Result<Self, AutopsyError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            AutopsyError::Configuration(format!("invalid configuration JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for AutopsyConfig {
    fn default() -> Self {
        Self::v1()
    }
}
