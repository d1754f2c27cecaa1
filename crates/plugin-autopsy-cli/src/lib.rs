//! Operator command surface for stored attribution metrics.
//!
//! Hosts that embed the tool should go through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_report`] and [`run_admin`] for direct execution against any
//!   [`MetricStore`].
//! - [`capture::replay`] to push a captured request lifecycle through the trackers.

#![allow(clippy::cast_precision_loss)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use plugin_autopsy_core::{
    format_bytes, format_rfc3339, now_utc, parse_rfc3339_utc, purge_expired, recent_slow_queries,
    request_refresh, AdminOutcome, AssetBreakdown, AssetSizer, AutopsyConfig, ComparisonRow,
    LocalOrRemoteSizer, MemoryBreakdown, MetricStore, Overview, QueryBreakdown, Recommendation,
    Reports, SlowQueryRow, TimeRange, TimeWindow,
};
use plugin_autopsy_store_sqlite::SqliteMetricStore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod capture;

use capture::{RequestCapture, ReplayOutcome};

#[derive(Debug, Parser)]
#[command(name = "autopsy")]
#[command(about = "Per-request extension resource attribution")]
pub struct Cli {
    #[arg(long, default_value = "./plugin_autopsy.sqlite3")]
    db: PathBuf,

    /// JSON configuration file; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Report {
        #[command(subcommand)]
        command: Box<ReportCommand>,
    },
    Admin {
        #[command(subcommand)]
        command: Box<AdminCommand>,
    },
    Record(RecordArgs),
}

#[derive(Debug, Subcommand)]
pub enum ReportCommand {
    Overview(ReportArgs),
    Queries(ReportArgs),
    Assets(ReportArgs),
    Memory(ReportArgs),
    Recommendations(ReportArgs),
    Comparison(ReportArgs),
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    #[arg(long, value_enum, default_value = "24h")]
    range: RangeArg,
    /// End of the window (RFC3339, UTC); defaults to now.
    #[arg(long)]
    as_of: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum AdminCommand {
    Refresh,
    Purge(PurgeArgs),
    SlowQueries(SlowQueriesArgs),
}

#[derive(Debug, Args)]
pub struct PurgeArgs {
    /// Overrides `retention_days` from the configuration.
    #[arg(long)]
    retention_days: Option<u32>,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
pub struct SlowQueriesArgs {
    #[arg(long)]
    extension: String,
    #[arg(long)]
    as_of: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    #[arg(long)]
    capture: PathBuf,
    /// Size assets from disk or with HEAD requests instead of the captured sizes.
    #[arg(long)]
    measure_assets: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RangeArg {
    #[value(name = "1h")]
    LastHour,
    #[value(name = "24h")]
    LastDay,
    #[value(name = "7d")]
    LastWeek,
    #[value(name = "30d")]
    LastMonth,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration loading, store open/migrate, or command
/// execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Admin { command } => match *command {
            AdminCommand::Refresh => {
                print_admin_outcome(&request_refresh());
                Ok(())
            }
            admin_command => {
                let store = open_store(&cli.db)?;
                run_admin(admin_command, &store, &config)
            }
        },
        Command::Report { command } => {
            let store = open_store(&cli.db)?;
            run_report(*command, &store, &config)
        }
        Command::Record(args) => {
            let store = open_store(&cli.db)?;
            run_record(&args, &store, &config)
        }
    }
}

/// Executes a report command against an existing store.
///
/// # Errors
/// Returns an error when `--as-of` is invalid or the store cannot be read.
pub fn run_report(
    command: ReportCommand,
    store: &dyn MetricStore,
    config: &AutopsyConfig,
) -> Result<()> {
    let reports = Reports::new(store, config);
    match command {
        ReportCommand::Overview(args) => {
            let (range, window) = report_window(&args)?;
            let overview = reports.get_overview(&window)?;
            if args.json {
                print_json(&build_report_payload("overview.v1", range, &overview)?)?;
            } else {
                print_overview(range, &overview);
            }
        }
        ReportCommand::Queries(args) => {
            let (range, window) = report_window(&args)?;
            let breakdown = reports.get_query_breakdown(&window)?;
            if args.json {
                print_json(&build_report_payload("queries.v1", range, &breakdown)?)?;
            } else {
                print_query_breakdown(range, &breakdown);
            }
        }
        ReportCommand::Assets(args) => {
            let (range, window) = report_window(&args)?;
            let breakdown = reports.get_asset_breakdown(&window)?;
            if args.json {
                print_json(&build_report_payload("assets.v1", range, &breakdown)?)?;
            } else {
                print_asset_breakdown(range, &breakdown);
            }
        }
        ReportCommand::Memory(args) => {
            let (range, window) = report_window(&args)?;
            let breakdown = reports.get_memory_breakdown(&window)?;
            if args.json {
                print_json(&build_report_payload("memory.v1", range, &breakdown)?)?;
            } else {
                print_memory_breakdown(range, &breakdown);
            }
        }
        ReportCommand::Recommendations(args) => {
            let (range, window) = report_window(&args)?;
            let recommendations = reports.get_recommendations(&window)?;
            if args.json {
                print_json(&build_report_payload(
                    "recommendations.v1",
                    range,
                    &recommendations,
                )?)?;
            } else {
                print_recommendations(&recommendations);
            }
        }
        ReportCommand::Comparison(args) => {
            let (range, window) = report_window(&args)?;
            let rows = reports.get_comparison(&window)?;
            if args.json {
                print_json(&build_report_payload("comparison.v1", range, &rows)?)?;
            } else {
                print_comparison(&rows);
            }
        }
    }
    Ok(())
}

/// Executes an administrative command against an existing store.
///
/// # Errors
/// Returns an error when an argument is invalid or the operation fails; a
/// failed purge still prints its outcome first.
pub fn run_admin(
    command: AdminCommand,
    store: &dyn MetricStore,
    config: &AutopsyConfig,
) -> Result<()> {
    match command {
        AdminCommand::Refresh => {
            print_admin_outcome(&request_refresh());
            Ok(())
        }
        AdminCommand::Purge(args) => {
            let retention_days = args.retention_days.unwrap_or(config.retention_days);
            if retention_days == 0 {
                return Err(anyhow!("--retention-days MUST be >= 1"));
            }
            let now = parse_optional_utc(args.as_of.as_deref())?;
            let outcome = purge_expired(store, retention_days, now);
            print_admin_outcome(&outcome);
            if outcome.success {
                Ok(())
            } else {
                Err(anyhow!(outcome.message))
            }
        }
        AdminCommand::SlowQueries(args) => {
            let now = parse_optional_utc(args.as_of.as_deref())?;
            let rows = recent_slow_queries(store, config, &args.extension, now)
                .map_err(|err| anyhow!(err.to_string()))?;
            if args.json {
                print_json(&SlowQueriesJsonPayload {
                    contract_version: "slow_queries.v1".to_string(),
                    extension: args.extension.trim().to_string(),
                    rows,
                })?;
            } else {
                print_slow_queries(&rows);
            }
            Ok(())
        }
    }
}

fn run_record(args: &RecordArgs, store: &dyn MetricStore, config: &AutopsyConfig) -> Result<()> {
    let capture = RequestCapture::load(&args.capture)?;
    let outcome = if args.measure_assets {
        let sizer = LocalOrRemoteSizer::new(config.layout.clone(), config.asset_head_timeout_ms);
        let sizer: &dyn AssetSizer = &sizer;
        capture::replay(&capture, config, store, Some(sizer))?
    } else {
        capture::replay(&capture, config, store, None)?
    };

    if args.json {
        print_json(&RecordJsonPayload {
            contract_version: "record.v1".to_string(),
            outcome,
        })?;
    } else {
        print_record_outcome(&outcome);
    }
    Ok(())
}

fn open_store(db_path: &Path) -> Result<SqliteMetricStore> {
    let store = SqliteMetricStore::open(db_path)?;
    store.migrate()?;
    Ok(store)
}

fn load_config(path: Option<&Path>) -> Result<AutopsyConfig> {
    let Some(path) = path else {
        return Ok(AutopsyConfig::v1());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("configuration file {} must be valid JSON", path.display()))?;
    let config = AutopsyConfig::from_json(&value).map_err(|err| anyhow!(err.to_string()))?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

fn map_range(value: RangeArg) -> TimeRange {
    match value {
        RangeArg::LastHour => TimeRange::LastHour,
        RangeArg::LastDay => TimeRange::LastDay,
        RangeArg::LastWeek => TimeRange::LastWeek,
        RangeArg::LastMonth => TimeRange::LastMonth,
    }
}

fn report_window(args: &ReportArgs) -> Result<(TimeRange, TimeWindow)> {
    let range = map_range(args.range);
    let end = parse_optional_utc(args.as_of.as_deref())?;
    Ok((range, TimeWindow::ending_at(range, end)))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid --as-of value: {err}")),
        None => Ok(now_utc()),
    }
}

fn print_json<T: Serialize>(payload: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(payload)?);
    Ok(())
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ReportJsonPayload<T> {
    contract_version: String,
    range: TimeRange,
    generated_at: String,
    report: T,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SlowQueriesJsonPayload {
    contract_version: String,
    extension: String,
    rows: Vec<SlowQueryRow>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RecordJsonPayload {
    contract_version: String,
    outcome: ReplayOutcome,
}

fn build_report_payload<'r, T: Serialize>(
    contract_version: &str,
    range: TimeRange,
    report: &'r T,
) -> Result<ReportJsonPayload<&'r T>> {
    Ok(ReportJsonPayload {
        contract_version: contract_version.to_string(),
        range,
        generated_at: format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?,
        report,
    })
}

fn print_overview(range: TimeRange, overview: &Overview) {
    println!(
        "range={} extensions={} queries={} assets={} peak_memory={} impact_p50={:.0} impact_p90={:.0}",
        range.as_str(),
        overview.total_extensions,
        overview.total_queries,
        overview.total_assets,
        format_bytes(overview.peak_memory as f64),
        overview.impact_p50,
        overview.impact_p90
    );
    println!(
        "{:<32} {:<8} {:<10} {:<7} {:<10} {:<10} {:<7} {:<7} perf",
        "extension", "queries", "query_ms", "assets", "asset_size", "memory", "impact", "level"
    );
    println!("{}", "-".repeat(110));
    for profile in &overview.top_extensions {
        println!(
            "{:<32} {:<8} {:<10.2} {:<7} {:<10} {:<10} {:<7.0} {:<7} {:.0}",
            profile.display_name,
            profile.query_count,
            profile.query_time_ms,
            profile.asset_count,
            format_bytes(profile.asset_bytes as f64),
            format_bytes(profile.memory_bytes),
            profile.impact_score,
            profile.impact_level.as_str(),
            profile.performance_score
        );
    }
}

fn print_query_breakdown(range: TimeRange, breakdown: &QueryBreakdown) {
    println!(
        "range={} total_queries={} total_ms={:.2} average_ms={:.2} slow={}",
        range.as_str(),
        breakdown.total_queries,
        breakdown.total_time_ms,
        breakdown.average_time_ms,
        breakdown.slow_query_count
    );
    println!(
        "{:<32} {:<8} {:<12} {:<12} {:<6} status",
        "extension", "queries", "total_ms", "average_ms", "slow"
    );
    println!("{}", "-".repeat(90));
    for row in &breakdown.rows {
        println!(
            "{:<32} {:<8} {:<12.2} {:<12.2} {:<6} {}",
            row.display_name,
            row.query_count,
            row.total_time_ms,
            row.average_time_ms,
            row.slow_query_count,
            row.status.as_str()
        );
    }
}

fn print_asset_breakdown(range: TimeRange, breakdown: &AssetBreakdown) {
    println!(
        "range={} files={} total={} largest={}",
        range.as_str(),
        breakdown.total_files,
        format_bytes(breakdown.total_bytes as f64),
        breakdown.largest.as_deref().unwrap_or("n/a")
    );
    println!(
        "{:<32} {:<4} {:<4} {:<10} {:<10} {:<10} status",
        "extension", "js", "css", "js_size", "css_size", "total"
    );
    println!("{}", "-".repeat(90));
    for row in &breakdown.rows {
        println!(
            "{:<32} {:<4} {:<4} {:<10} {:<10} {:<10} {}",
            row.display_name,
            row.js_files,
            row.css_files,
            format_bytes(row.js_bytes as f64),
            format_bytes(row.css_bytes as f64),
            format_bytes(row.total_bytes as f64),
            row.status.as_str()
        );
    }
}

fn print_memory_breakdown(range: TimeRange, breakdown: &MemoryBreakdown) {
    println!(
        "range={} initial={} peak={} increase={} snapshots={}",
        range.as_str(),
        format_bytes(breakdown.initial_memory as f64),
        format_bytes(breakdown.peak_memory as f64),
        format_bytes(breakdown.total_increase as f64),
        breakdown.timeline.len()
    );
    println!("{:<32} {:<12} {:<8} level", "extension", "memory", "percent");
    println!("{}", "-".repeat(70));
    for row in &breakdown.rows {
        println!(
            "{:<32} {:<12} {:<8.1} {}",
            row.display_name,
            format_bytes(row.memory_bytes),
            row.percentage,
            row.level.as_str()
        );
    }
    if !breakdown.high_usage.is_empty() {
        let names = breakdown
            .high_usage
            .iter()
            .map(|row| row.display_name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        println!("high_usage={names}");
    }
}

fn print_recommendations(recommendations: &[Recommendation]) {
    if recommendations.is_empty() {
        println!("no recommendations");
        return;
    }
    for item in recommendations {
        println!(
            "[{}] {} ({})",
            item.priority.as_str(),
            item.title,
            item.slug.as_deref().unwrap_or("site")
        );
        println!("  {}", item.description);
        for action in &item.actions {
            println!("  - {action}");
        }
        println!("  potential_savings={}", item.potential_savings);
    }
}

fn print_comparison(rows: &[ComparisonRow]) {
    println!(
        "{:<32} {:<8} {:<10} {:<8} {:<10} {:<6} verdict",
        "extension", "queries", "query_ms", "memory%", "assets", "score"
    );
    println!("{}", "-".repeat(110));
    for row in rows {
        println!(
            "{:<32} {:<8} {:<10.2} {:<8.1} {:<10} {:<6.0} {}",
            row.display_name,
            row.db_queries,
            row.db_time_ms,
            row.memory_percent,
            format_bytes(row.asset_bytes as f64),
            row.performance_score,
            row.verdict
        );
    }
}

fn print_admin_outcome(outcome: &AdminOutcome) {
    println!(
        "success={} message={}",
        if outcome.success { "yes" } else { "no" },
        outcome.message
    );
    if let Some(detail) = &outcome.detail {
        println!("detail={detail}");
    }
}

fn print_slow_queries(rows: &[SlowQueryRow]) {
    println!("{:<20} {:<10} {:<48} sql", "recorded_at", "ms", "origin");
    println!("{}", "-".repeat(110));
    for row in rows {
        let origin = format!("{}:{}", row.origin_file, row.origin_line);
        println!(
            "{:<20} {:<10.2} {:<48} {}",
            row.recorded_at, row.duration_ms, origin, row.sql
        );
    }
}

fn print_record_outcome(outcome: &ReplayOutcome) {
    println!(
        "page={} events={} written={} dropped={} query_records={} asset_records={} memory_records={}",
        outcome.page_context,
        outcome.events_applied,
        outcome.summary.written,
        outcome.summary.dropped,
        outcome.summary.query_records,
        outcome.summary.asset_records,
        outcome.summary.memory_records
    );
    if let Some(notice) = &outcome.operator_notice {
        println!("notice={notice}");
    }
}
