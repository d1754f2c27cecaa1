use std::cell::RefCell;

use anyhow::{anyhow, Result};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::record::{MetricRecord, MetricRecordInput, MetricType, TimeWindow};

/// Append-only time-series storage for metric records.
///
/// `append` must be atomic per record: a concurrent reader sees either the
/// whole record or nothing.
pub trait MetricStore {
    #[allow(clippy::missing_errors_doc)]
    fn append(&self, input: &MetricRecordInput) -> Result<MetricRecord>;

    /// Records inside `window`, oldest first.
    #[allow(clippy::missing_errors_doc)]
    fn list_window(
        &self,
        window: &TimeWindow,
        metric_type: Option<MetricType>,
    ) -> Result<Vec<MetricRecord>>;

    /// Records of one extension inside `window`, newest first, at most `limit`.
    #[allow(clippy::missing_errors_doc)]
    fn list_recent_for_extension(
        &self,
        extension_slug: &str,
        metric_type: MetricType,
        window: &TimeWindow,
        limit: usize,
    ) -> Result<Vec<MetricRecord>>;

    /// Deletes records strictly older than `cutoff`; returns how many were removed.
    #[allow(clippy::missing_errors_doc)]
    fn purge_before(&self, cutoff: OffsetDateTime) -> Result<usize>;
}

/// Process-local store for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryMetricStore {
    records: RefCell<Vec<MetricRecord>>,
}

impl InMemoryMetricStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    #[must_use]
    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.borrow().clone()
    }
}

impl MetricStore for InMemoryMetricStore {
    fn append(&self, input: &MetricRecordInput) -> Result<MetricRecord> {
        input
            .validate()
            .map_err(|err| anyhow!("record validation failed: {err}"))?;

        let mut records = self.records.borrow_mut();
        let record_seq = i64::try_from(records.len())? + 1;
        let record = MetricRecord {
            record_seq,
            record_id: input.record_id.unwrap_or_else(Ulid::new),
            extension_slug: input.extension_slug.clone(),
            metric_type: input.metric_type,
            payload: input.payload.clone(),
            page_context: input.page_context.clone(),
            recorded_at: input.recorded_at,
        };
        records.push(record.clone());
        Ok(record)
    }

    fn list_window(
        &self,
        window: &TimeWindow,
        metric_type: Option<MetricType>,
    ) -> Result<Vec<MetricRecord>> {
        let mut matching: Vec<MetricRecord> = self
            .records
            .borrow()
            .iter()
            .filter(|record| window.contains(record.recorded_at))
            .filter(|record| metric_type.is_none() || metric_type == Some(record.metric_type))
            .cloned()
            .collect();
        matching.sort_by_key(|record| (record.recorded_at, record.record_seq));
        Ok(matching)
    }

    fn list_recent_for_extension(
        &self,
        extension_slug: &str,
        metric_type: MetricType,
        window: &TimeWindow,
        limit: usize,
    ) -> Result<Vec<MetricRecord>> {
        let mut matching: Vec<MetricRecord> = self
            .list_window(window, Some(metric_type))?
            .into_iter()
            .filter(|record| record.extension_slug == extension_slug)
            .collect();
        matching.reverse();
        matching.truncate(limit);
        Ok(matching)
    }

    fn purge_before(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let mut records = self.records.borrow_mut();
        let before = records.len();
        records.retain(|record| record.recorded_at >= cutoff);
        Ok(before - records.len())
    }
}
