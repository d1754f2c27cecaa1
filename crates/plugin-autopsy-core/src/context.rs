use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::asset::{AssetSizer, AssetTracker, RegisteredAsset, RenderContext};
use crate::classify::PathClassifier;
use crate::config::AutopsyConfig;
use crate::memory::{HookCheckpoint, LifecycleCheckpoint, MemoryProbe, MemoryTracker};
use crate::query::{QueryLog, QueryTracker};
use crate::record::{MetricRecordInput, MetricType};
use crate::resolve::{CallbackRef, StackFrame};
use crate::store::MetricStore;
use crate::{now_utc, AutopsyError};

/// Host-side collaborators a request scope reads from and writes to.
#[derive(Clone, Copy)]
pub struct RequestCollaborators<'s> {
    pub store: &'s dyn MetricStore,
    pub query_log: &'s dyn QueryLog,
    pub probe: &'s dyn MemoryProbe,
    pub sizer: &'s dyn AssetSizer,
}

/// What one request scope wrote when it finished.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PersistSummary {
    pub written: usize,
    pub dropped: usize,
    pub query_records: usize,
    pub asset_records: usize,
    pub memory_records: usize,
}

impl PersistSummary {
    fn count(&mut self, metric_type: MetricType) {
        self.written += 1;
        match metric_type {
            MetricType::Query => self.query_records += 1,
            MetricType::Asset => self.asset_records += 1,
            MetricType::Memory => self.memory_records += 1,
        }
    }
}

/// Owns the three trackers for a single request.
///
/// Finalization and persistence run exactly once: through [`RequestScope::finish`]
/// or, on any other exit path including unwinding, when the scope is dropped.
/// Storage failures are logged and counted, never raised.
pub struct RequestScope<'s> {
    collaborators: RequestCollaborators<'s>,
    page_context: String,
    queries: QueryTracker,
    assets: AssetTracker,
    memory: MemoryTracker,
    finished: bool,
}

impl<'s> RequestScope<'s> {
    /// Validates `config`, takes the memory baseline, and arms the trackers.
    ///
    /// # Errors
    /// Returns [`AutopsyError::Configuration`] for an invalid configuration or
    /// when a built-in pattern fails to compile.
    pub fn begin(
        config: &AutopsyConfig,
        collaborators: RequestCollaborators<'s>,
        page_context: &str,
    ) -> Result<Self, AutopsyError> {
        config.validate()?;
        let classifier = PathClassifier::new(&config.layout);

        let queries = QueryTracker::new(
            config,
            classifier.clone(),
            collaborators.query_log.detailed_logging_enabled(),
        )?;
        let assets = AssetTracker::new(classifier.clone(), config.log_assets)?;
        let memory = MemoryTracker::new(config, classifier, collaborators.probe);

        tracing::debug!(page_context, "request scope opened");
        Ok(Self {
            collaborators,
            page_context: page_context.to_string(),
            queries,
            assets,
            memory,
            finished: false,
        })
    }

    #[must_use]
    pub fn queries(&self) -> &QueryTracker {
        &self.queries
    }

    #[must_use]
    pub fn assets(&self) -> &AssetTracker {
        &self.assets
    }

    #[must_use]
    pub fn memory(&self) -> &MemoryTracker {
        &self.memory
    }

    pub fn snapshot(&mut self, checkpoint: LifecycleCheckpoint) -> bool {
        self.memory.snapshot(checkpoint, self.collaborators.probe)
    }

    pub fn begin_hook(&mut self, checkpoint: HookCheckpoint, callbacks: &[CallbackRef]) {
        self.memory
            .begin_hook(checkpoint, callbacks, self.collaborators.probe);
    }

    pub fn end_hook(&mut self, checkpoint: HookCheckpoint) {
        self.memory.end_hook(checkpoint, self.collaborators.probe);
    }

    pub fn on_query(
        &mut self,
        sql: &str,
        duration_seconds: f64,
        frames: &[StackFrame],
    ) -> Option<Ulid> {
        self.queries.intercept(sql, duration_seconds, frames)
    }

    pub fn capture_assets(&mut self, context: RenderContext, assets: &[RegisteredAsset]) -> usize {
        self.assets
            .capture_registered(context, assets, self.collaborators.sizer)
    }

    pub fn scan_head_markup(&mut self, context: RenderContext, markup: &str) -> usize {
        self.assets
            .scan_markup(context, markup, self.collaborators.sizer)
    }

    /// Finalizes every tracker and appends their records.
    pub fn finish(mut self) -> PersistSummary {
        self.finalize_and_persist()
    }

    fn finalize_and_persist(&mut self) -> PersistSummary {
        if self.finished {
            return PersistSummary::default();
        }
        self.finished = true;

        self.queries.analyze(self.collaborators.query_log);
        self.assets.analyze();
        self.memory.finalize(self.collaborators.probe);

        let recorded_at = now_utc();
        let page_context = self.page_context.as_str();
        let batches = [
            (MetricType::Query, self.queries.records(page_context, recorded_at)),
            (MetricType::Asset, self.assets.records(page_context, recorded_at)),
            (MetricType::Memory, self.memory.records(page_context, recorded_at)),
        ];

        let mut summary = PersistSummary::default();
        for (metric_type, batch) in batches {
            match batch {
                Ok(inputs) => self.append_all(metric_type, &inputs, &mut summary),
                Err(err) => {
                    tracing::warn!(
                        metric_type = metric_type.as_str(),
                        error = %err,
                        "failed to build metric records"
                    );
                    summary.dropped += 1;
                }
            }
        }

        self.queries.mark_persisted();
        self.assets.mark_persisted();
        self.memory.mark_persisted();

        tracing::info!(
            page_context,
            written = summary.written,
            dropped = summary.dropped,
            "request metrics persisted"
        );
        summary
    }

    fn append_all(
        &self,
        metric_type: MetricType,
        inputs: &[MetricRecordInput],
        summary: &mut PersistSummary,
    ) {
        for input in inputs {
            match self.collaborators.store.append(input) {
                Ok(_) => summary.count(metric_type),
                Err(err) => {
                    tracing::warn!(
                        metric_type = metric_type.as_str(),
                        extension = input.extension_slug.as_str(),
                        error = %err,
                        "metric record lost"
                    );
                    summary.dropped += 1;
                }
            }
        }
    }
}

impl Drop for RequestScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finalize_and_persist();
        }
    }
}
