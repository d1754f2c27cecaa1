#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use plugin_autopsy_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, unix_millis, AutopsyError, MetricRecord,
    MetricRecordInput, MetricStore, MetricType, TimeWindow,
};
use rusqlite::{params, Connection};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const METRICS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_METRICS_V1: &str = r"
CREATE TABLE IF NOT EXISTS metric_records (
    record_seq INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL UNIQUE,
    extension_slug TEXT NOT NULL,
    metric_type TEXT NOT NULL CHECK (metric_type IN ('query', 'asset', 'memory')),
    payload_json TEXT NOT NULL,
    page_context TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    recorded_at_ms INTEGER NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_metric_records_no_update
BEFORE UPDATE ON metric_records
BEGIN
    SELECT RAISE(FAIL, 'metric_records is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_metric_records_slug_type_time
    ON metric_records(extension_slug, metric_type, recorded_at_ms);
CREATE INDEX IF NOT EXISTS idx_metric_records_time
    ON metric_records(recorded_at_ms);
";

const SELECT_RECORD_COLUMNS: &str = "SELECT
        record_seq, record_id, extension_slug, metric_type,
        payload_json, page_context, recorded_at
     FROM metric_records";

/// `SQLite`-backed [`MetricStore`]. Rows are never updated; retention deletes them.
pub struct SqliteMetricStore {
    conn: Connection,
}

impl SqliteMetricStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_METRICS_V1)
            .context("failed to apply metrics schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![METRICS_MIGRATION_VERSION, now],
            )
            .context("failed to register metrics schema migration")?;

        tracing::debug!(version = METRICS_MIGRATION_VERSION, "metrics schema ready");
        Ok(())
    }

    pub fn record_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM metric_records", [], |row| row.get(0))
            .context("failed to count metric records")?;
        Ok(u64::try_from(count)?)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl MetricStore for SqliteMetricStore {
    fn append(&self, input: &MetricRecordInput) -> Result<MetricRecord> {
        input
            .validate()
            .map_err(|err| anyhow!("record validation failed: {err}"))?;

        let record_id = input.record_id.unwrap_or_else(Ulid::new);

        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start record transaction")?;

        tx.execute(
            "INSERT INTO metric_records(
                record_id, extension_slug, metric_type, payload_json,
                page_context, recorded_at, recorded_at_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record_id.to_string(),
                input.extension_slug,
                input.metric_type.as_str(),
                serde_json::to_string(&input.payload).context("failed to serialize payload")?,
                input.page_context,
                format_rfc3339(input.recorded_at).map_err(|err| anyhow!(err.to_string()))?,
                unix_millis(input.recorded_at),
            ],
        )
        .context("failed to append metric record")?;

        let record_seq = tx.last_insert_rowid();
        tx.commit().context("failed to commit record transaction")?;

        Ok(MetricRecord {
            record_seq,
            record_id,
            extension_slug: input.extension_slug.clone(),
            metric_type: input.metric_type,
            payload: input.payload.clone(),
            page_context: input.page_context.clone(),
            recorded_at: input.recorded_at,
        })
    }

    fn list_window(
        &self,
        window: &TimeWindow,
        metric_type: Option<MetricType>,
    ) -> Result<Vec<MetricRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_RECORD_COLUMNS}
             WHERE recorded_at_ms BETWEEN ?1 AND ?2
               AND (?3 IS NULL OR metric_type = ?3)
             ORDER BY recorded_at_ms ASC, record_seq ASC"
        ))?;
        let rows = stmt.query_map(
            params![
                unix_millis(window.start),
                unix_millis(window.end),
                metric_type.map(MetricType::as_str),
            ],
            parse_record_row,
        )?;

        let mut records = collect_rows(rows)?;
        records.retain(|record| window.contains(record.recorded_at));
        Ok(records)
    }

    fn list_recent_for_extension(
        &self,
        extension_slug: &str,
        metric_type: MetricType,
        window: &TimeWindow,
        limit: usize,
    ) -> Result<Vec<MetricRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_RECORD_COLUMNS}
             WHERE extension_slug = ?1
               AND metric_type = ?2
               AND recorded_at_ms BETWEEN ?3 AND ?4
             ORDER BY recorded_at_ms DESC, record_seq DESC
             LIMIT ?5"
        ))?;
        let rows = stmt.query_map(
            params![
                extension_slug,
                metric_type.as_str(),
                unix_millis(window.start),
                unix_millis(window.end),
                i64::try_from(limit).unwrap_or(i64::MAX),
            ],
            parse_record_row,
        )?;

        let mut records = collect_rows(rows)?;
        records.retain(|record| window.contains(record.recorded_at));
        Ok(records)
    }

    fn purge_before(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM metric_records WHERE recorded_at_ms < ?1",
                params![unix_millis(cutoff)],
            )
            .context("failed to purge expired metric records")?;
        tracing::debug!(removed, "purged metric records");
        Ok(removed)
    }
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricRecord> {
    let record_id_raw: String = row.get(1)?;
    let metric_type_raw: String = row.get(3)?;
    let payload_json: String = row.get(4)?;

    let record_id = Ulid::from_string(&record_id_raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid record_id ULID: {record_id_raw}"),
            )),
        )
    })?;

    let metric_type = MetricType::parse(&metric_type_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid metric_type: {metric_type_raw}"),
            )),
        )
    })?;

    let payload: Value = serde_json::from_str(&payload_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid payload_json: {err}"),
            )),
        )
    })?;

    let recorded_at = parse_rfc3339_utc(&row.get::<_, String>(6)?).map_err(to_sql_error)?;

    Ok(MetricRecord {
        record_seq: row.get(0)?,
        record_id,
        extension_slug: row.get(2)?,
        metric_type,
        payload,
        page_context: row.get(5)?,
        recorded_at,
    })
}

fn to_sql_error(err: AutopsyError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        6,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
