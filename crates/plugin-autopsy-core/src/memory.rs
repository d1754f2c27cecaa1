use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::classify::PathClassifier;
use crate::config::AutopsyConfig;
use crate::record::{
    CheckpointShare, ExtensionMemoryPayload, HookAttribution, MemorySnapshot, MetricRecordInput,
    MetricType, SystemMemoryPayload,
};
use crate::resolve::{CallbackRef, StackResolver};
use crate::{now_utc, AutopsyError, SYSTEM_MEMORY_SLUG};

/// Request lifecycle points where a memory snapshot is taken, in firing order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleCheckpoint {
    ExtensionsLoaded,
    Init,
    FullyLoaded,
    PreRender,
    HeadRendered,
    FooterRendered,
    Shutdown,
}

impl LifecycleCheckpoint {
    pub const ALL: [Self; 7] = [
        Self::ExtensionsLoaded,
        Self::Init,
        Self::FullyLoaded,
        Self::PreRender,
        Self::HeadRendered,
        Self::FooterRendered,
        Self::Shutdown,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExtensionsLoaded => "extensions_loaded",
            Self::Init => "init",
            Self::FullyLoaded => "fully_loaded",
            Self::PreRender => "pre_render",
            Self::HeadRendered => "head_rendered",
            Self::FooterRendered => "footer_rendered",
            Self::Shutdown => "shutdown",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|checkpoint| checkpoint.as_str() == value)
    }
}

/// Checkpoints where extensions commonly register callbacks and memory growth is split among them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HookCheckpoint {
    EnqueueScripts,
    AdminEnqueueScripts,
    Ajax,
    AjaxNopriv,
    RestApiInit,
    AdminInit,
    AdminMenu,
    WidgetsInit,
}

impl HookCheckpoint {
    pub const ALL: [Self; 8] = [
        Self::EnqueueScripts,
        Self::AdminEnqueueScripts,
        Self::Ajax,
        Self::AjaxNopriv,
        Self::RestApiInit,
        Self::AdminInit,
        Self::AdminMenu,
        Self::WidgetsInit,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnqueueScripts => "enqueue_scripts",
            Self::AdminEnqueueScripts => "admin_enqueue_scripts",
            Self::Ajax => "ajax",
            Self::AjaxNopriv => "ajax_nopriv",
            Self::RestApiInit => "rest_api_init",
            Self::AdminInit => "admin_init",
            Self::AdminMenu => "admin_menu",
            Self::WidgetsInit => "widgets_init",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|checkpoint| checkpoint.as_str() == value)
    }
}

pub trait MemoryProbe {
    fn resident_bytes(&self) -> u64;
    fn peak_bytes(&self) -> u64;
}

/// Reads the current process's resident and peak set sizes from `/proc/self/status`.
///
/// Reports 0 on platforms without procfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemoryProbe;

impl ProcessMemoryProbe {
    fn read_field(field: &str) -> u64 {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| parse_status_field(&status, field))
            .unwrap_or(0)
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_bytes(&self) -> u64 {
        Self::read_field("VmRSS")
    }

    fn peak_bytes(&self) -> u64 {
        Self::read_field("VmHWM")
    }
}

/// `VmRSS:     1234 kB` -> `1234 * 1024`.
fn parse_status_field(status: &str, field: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        let rest = line.strip_prefix(field)?.strip_prefix(':')?;
        let mut parts = rest.split_whitespace();
        let value = parts.next()?.parse::<u64>().ok()?;
        match parts.next() {
            Some("kB") => value.checked_mul(1024),
            None => Some(value),
            Some(_) => None,
        }
    })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTrackerState {
    Disabled,
    Initialized,
    Snapshotting,
    HookTracking,
    Finalizing,
    Persisted,
}

#[derive(Debug)]
struct OpenHook {
    bytes_before: u64,
    responsible: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct MemoryAccumulator {
    total: f64,
    per_checkpoint: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy)]
struct Finalized {
    final_memory: u64,
    peak_memory: u64,
    total_increase: i64,
}

/// Tracks memory growth across the request and splits hook deltas among the
/// extensions whose callbacks ran there.
///
/// Each responsible extension is credited `delta / N` for a checkpoint with
/// `N` distinct responsible extensions, regardless of how many callbacks it
/// registered there or what they actually cost.
#[derive(Debug)]
pub struct MemoryTracker {
    state: MemoryTrackerState,
    classifier: PathClassifier,
    top_checkpoints: usize,
    baseline: u64,
    snapshots: Vec<MemorySnapshot>,
    hooks: Vec<HookAttribution>,
    open_hooks: BTreeMap<HookCheckpoint, OpenHook>,
    per_extension: BTreeMap<String, MemoryAccumulator>,
    finalized: Option<Finalized>,
}

impl MemoryTracker {
    /// Captures the baseline reading that every later increase is measured against.
    #[must_use]
    pub fn new(config: &AutopsyConfig, classifier: PathClassifier, probe: &dyn MemoryProbe) -> Self {
        let (state, baseline) = if config.log_memory {
            (MemoryTrackerState::Initialized, probe.resident_bytes())
        } else {
            (MemoryTrackerState::Disabled, 0)
        };
        Self {
            state,
            classifier,
            top_checkpoints: config.memory_top_checkpoints,
            baseline,
            snapshots: Vec::new(),
            hooks: Vec::new(),
            open_hooks: BTreeMap::new(),
            per_extension: BTreeMap::new(),
            finalized: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> MemoryTrackerState {
        self.state
    }

    #[must_use]
    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    #[must_use]
    pub fn snapshots(&self) -> &[MemorySnapshot] {
        &self.snapshots
    }

    #[must_use]
    pub fn hooks(&self) -> &[HookAttribution] {
        &self.hooks
    }

    /// Running per-extension totals in bytes; may be negative.
    #[must_use]
    pub fn extension_totals(&self) -> BTreeMap<String, f64> {
        self.per_extension
            .iter()
            .map(|(slug, acc)| (slug.clone(), acc.total))
            .collect()
    }

    fn tracking(&self) -> bool {
        matches!(
            self.state,
            MemoryTrackerState::Initialized
                | MemoryTrackerState::Snapshotting
                | MemoryTrackerState::HookTracking
        )
    }

    fn settle_state(&mut self) {
        self.state = if self.open_hooks.is_empty() {
            MemoryTrackerState::Snapshotting
        } else {
            MemoryTrackerState::HookTracking
        };
    }

    /// Records a snapshot; a checkpoint that already has one is left untouched.
    ///
    /// Returns whether a snapshot was recorded.
    pub fn snapshot(&mut self, checkpoint: LifecycleCheckpoint, probe: &dyn MemoryProbe) -> bool {
        if !self.tracking() {
            return false;
        }
        let recorded = self.push_snapshot(checkpoint, probe);
        self.settle_state();
        recorded
    }

    /// Takes `bytes_before` and resolves the callbacks registered at `checkpoint`.
    pub fn begin_hook(
        &mut self,
        checkpoint: HookCheckpoint,
        callbacks: &[CallbackRef],
        probe: &dyn MemoryProbe,
    ) {
        if !self.tracking() {
            return;
        }
        if self.open_hooks.contains_key(&checkpoint) {
            tracing::debug!(checkpoint = checkpoint.as_str(), "hook already open");
            return;
        }

        let resolver = StackResolver::new(&self.classifier);
        let responsible: BTreeSet<String> = callbacks
            .iter()
            .filter_map(|callback| resolver.resolve_callback(callback))
            .map(|classification| classification.slug)
            .collect();

        self.open_hooks.insert(
            checkpoint,
            OpenHook {
                bytes_before: probe.resident_bytes(),
                responsible,
            },
        );
        self.state = MemoryTrackerState::HookTracking;
    }

    /// Takes `bytes_after` and splits the delta among the responsible extensions.
    pub fn end_hook(&mut self, checkpoint: HookCheckpoint, probe: &dyn MemoryProbe) {
        if !self.tracking() {
            return;
        }
        let bytes_after = probe.resident_bytes();
        self.close_hook(checkpoint, bytes_after);
        self.settle_state();
    }

    /// Closes open hooks, takes the final snapshot, and fixes the total increase.
    ///
    /// Runs once; later calls are ignored.
    pub fn finalize(&mut self, probe: &dyn MemoryProbe) {
        if !self.tracking() {
            return;
        }
        self.state = MemoryTrackerState::Finalizing;

        let final_memory = probe.resident_bytes();
        let open: Vec<HookCheckpoint> = self.open_hooks.keys().copied().collect();
        for checkpoint in open {
            tracing::debug!(
                checkpoint = checkpoint.as_str(),
                "closing hook left open at finalization"
            );
            self.close_hook(checkpoint, final_memory);
        }
        let _ = self.push_snapshot(LifecycleCheckpoint::Shutdown, probe);

        let peak_memory = self
            .snapshots
            .iter()
            .map(|snapshot| snapshot.peak_bytes)
            .chain([probe.peak_bytes(), final_memory, self.baseline])
            .max()
            .unwrap_or(final_memory);

        self.finalized = Some(Finalized {
            final_memory,
            peak_memory,
            total_increase: signed_delta(self.baseline, final_memory),
        });
    }

    /// The system record followed by one record per extension with a non-zero total.
    ///
    /// Empty until [`MemoryTracker::finalize`] has run.
    ///
    /// # Errors
    /// Returns [`AutopsyError::Payload`] when a payload cannot be encoded.
    pub fn records(
        &self,
        page_context: &str,
        recorded_at: OffsetDateTime,
    ) -> Result<Vec<MetricRecordInput>, AutopsyError> {
        let Some(finalized) = self.finalized else {
            return Ok(Vec::new());
        };

        let system = SystemMemoryPayload {
            initial_memory: self.baseline,
            final_memory: finalized.final_memory,
            peak_memory: finalized.peak_memory,
            total_increase: finalized.total_increase,
            snapshots: self.snapshots.clone(),
            hooks: self.hooks.clone(),
        };
        let mut records = vec![MetricRecordInput::new(
            SYSTEM_MEMORY_SLUG,
            MetricType::Memory,
            &system,
            page_context,
            recorded_at,
        )?];

        #[allow(clippy::cast_precision_loss)]
        let total_increase = finalized.total_increase as f64;
        for (slug, acc) in &self.per_extension {
            if acc.total.abs() < f64::EPSILON {
                continue;
            }
            let percentage_of_total = if finalized.total_increase > 0 {
                acc.total / total_increase * 100.0
            } else {
                0.0
            };
            let payload = ExtensionMemoryPayload {
                total_memory: acc.total,
                percentage_of_total,
                peak_memory: finalized.peak_memory,
                hook_usage: self.top_checkpoints_for(acc),
            };
            records.push(MetricRecordInput::new(
                slug,
                MetricType::Memory,
                &payload,
                page_context,
                recorded_at,
            )?);
        }

        Ok(records)
    }

    pub fn mark_persisted(&mut self) {
        if self.state == MemoryTrackerState::Finalizing {
            self.state = MemoryTrackerState::Persisted;
        }
    }

    fn push_snapshot(&mut self, checkpoint: LifecycleCheckpoint, probe: &dyn MemoryProbe) -> bool {
        let name = checkpoint.as_str();
        if self.snapshots.iter().any(|snapshot| snapshot.checkpoint == name) {
            return false;
        }
        self.snapshots.push(MemorySnapshot {
            checkpoint: name.to_string(),
            resident_bytes: probe.resident_bytes(),
            peak_bytes: probe.peak_bytes(),
            wall_time: wall_time(now_utc()),
        });
        true
    }

    fn close_hook(&mut self, checkpoint: HookCheckpoint, bytes_after: u64) {
        let Some(open) = self.open_hooks.remove(&checkpoint) else {
            tracing::debug!(checkpoint = checkpoint.as_str(), "hook ended without begin");
            return;
        };

        let delta = signed_delta(open.bytes_before, bytes_after);
        if !open.responsible.is_empty() {
            #[allow(clippy::cast_precision_loss)]
            let share = delta as f64 / open.responsible.len() as f64;
            for slug in &open.responsible {
                let acc = self.per_extension.entry(slug.clone()).or_default();
                acc.total += share;
                *acc
                    .per_checkpoint
                    .entry(checkpoint.as_str().to_string())
                    .or_insert(0.0) += share;
            }
        }

        self.hooks.push(HookAttribution {
            checkpoint: checkpoint.as_str().to_string(),
            bytes_before: open.bytes_before,
            bytes_after,
            delta,
            responsible_extensions: open.responsible,
        });
    }

    fn top_checkpoints_for(&self, acc: &MemoryAccumulator) -> Vec<CheckpointShare> {
        let mut shares: Vec<CheckpointShare> = acc
            .per_checkpoint
            .iter()
            .map(|(checkpoint, bytes)| CheckpointShare {
                checkpoint: checkpoint.clone(),
                bytes: *bytes,
            })
            .collect();
        shares.sort_by(|a, b| {
            b.bytes
                .total_cmp(&a.bytes)
                .then_with(|| a.checkpoint.cmp(&b.checkpoint))
        });
        shares.truncate(self.top_checkpoints);
        shares
    }
}

fn signed_delta(before: u64, after: u64) -> i64 {
    let delta = i128::from(after) - i128::from(before);
    i64::try_from(delta).unwrap_or(if delta < 0 { i64::MIN } else { i64::MAX })
}

#[allow(clippy::cast_precision_loss)]
fn wall_time(at: OffsetDateTime) -> f64 {
    at.unix_timestamp_nanos() as f64 / 1_000_000_000.0
}
