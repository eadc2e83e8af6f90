//! Batch loading of canonical records into the master table.
//!
//! Rows travel as JSON batches through `jsonb_populate_recordset`, and the
//! master table's unique keys (`log_id`, `insert_id`) make re-ingest a no-op:
//! `ON CONFLICT DO NOTHING` absorbs duplicates instead of failing the batch.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use glasspane_common::CanonicalLog;

use crate::error::Result;

/// Versioned DDL executed idempotently at startup.
const SCHEMA_SQL: &str = include_str!("../sql/master_logs.sql");

/// Schema name the DDL file is written against; rewritten when the deployment
/// uses a different master dataset.
const SCHEMA_SQL_DATASET: &str = "central_logging_v1";

const ETL_VERSION: &str = "1.0.0";
const DEFAULT_LOAD_BATCH: usize = 500;

/// The master schema DDL, rewritten for the configured dataset.
pub fn schema_sql(dataset: &str) -> String {
    if dataset == SCHEMA_SQL_DATASET {
        SCHEMA_SQL.to_string()
    } else {
        SCHEMA_SQL.replace(SCHEMA_SQL_DATASET, dataset)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoadStats {
    pub loaded: u64,
    pub duplicates: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct Loader {
    pool: PgPool,
    dataset: String,
}

impl Loader {
    pub fn new(pool: PgPool, dataset: &str) -> Self {
        Self {
            pool,
            dataset: dataset.to_string(),
        }
    }

    fn master_table(&self) -> String {
        format!("{}.master_logs", self.dataset)
    }

    fn jobs_table(&self) -> String {
        format!("{}.etl_jobs", self.dataset)
    }

    /// Execute the versioned schema DDL. Safe to run on every startup.
    pub async fn ensure_tables(&self) -> Result<()> {
        let sql = schema_sql(&self.dataset);

        for statement in sql.split(';') {
            let statement = statement.trim();
            if statement.is_empty() || statement.lines().all(|l| l.trim().starts_with("--")) {
                continue;
            }
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!(dataset = %self.dataset, "Ensured master logging tables exist");
        Ok(())
    }

    /// Insert one batch of canonical logs, stamping load-time bookkeeping.
    /// Returns how many rows were actually inserted; conflicts with existing
    /// `log_id`/`insert_id` rows count as duplicates, not failures.
    pub async fn load(&self, logs: &[CanonicalLog], batch_id: Uuid) -> Result<LoadStats> {
        if logs.is_empty() {
            return Ok(LoadStats::default());
        }

        let etl_timestamp = Utc::now();
        let rows: Vec<serde_json::Value> = logs
            .iter()
            .map(|log| {
                let mut stamped = log.clone();
                stamped.etl_timestamp = Some(etl_timestamp);
                stamped.etl_version = Some(ETL_VERSION.to_string());
                stamped.etl_batch_id = Some(batch_id);
                serde_json::to_value(&stamped).unwrap_or(serde_json::Value::Null)
            })
            .filter(|v| !v.is_null())
            .collect();

        let query = format!(
            r#"
            INSERT INTO {master}
            SELECT * FROM jsonb_populate_recordset(NULL::{master}, $1)
            ON CONFLICT DO NOTHING
            "#,
            master = self.master_table()
        );

        let result = sqlx::query(&query)
            .bind(serde_json::Value::Array(rows))
            .execute(&self.pool)
            .await?;

        let loaded = result.rows_affected();
        let duplicates = logs.len() as u64 - loaded;
        if duplicates > 0 {
            debug!(duplicates, "Skipped already-loaded rows");
        }

        Ok(LoadStats {
            loaded,
            duplicates,
            failed: 0,
        })
    }

    /// Load logs in sub-batches with per-job bookkeeping. A failing sub-batch
    /// is counted and skipped; the stream keeps loading.
    pub async fn load_batch(
        &self,
        logs: &[CanonicalLog],
        stream_id: &str,
        batch_size: usize,
    ) -> Result<LoadStats> {
        let batch_size = if batch_size == 0 { DEFAULT_LOAD_BATCH } else { batch_size };
        let batch_id = Uuid::new_v4();
        let job_id = self.start_job(stream_id, batch_id, logs.len() as i64).await;

        let mut stats = LoadStats::default();

        for chunk in logs.chunks(batch_size) {
            match self.load(chunk, batch_id).await {
                Ok(chunk_stats) => {
                    stats.loaded += chunk_stats.loaded;
                    stats.duplicates += chunk_stats.duplicates;
                }
                Err(e) => {
                    error!(stream_id, error = %e, "Sub-batch load failed");
                    stats.failed += chunk.len() as u64;
                }
            }
        }

        if let Some(job_id) = job_id {
            self.complete_job(job_id, &stats).await;
        }

        info!(
            stream_id,
            loaded = stats.loaded,
            duplicates = stats.duplicates,
            failed = stats.failed,
            "Load batch complete"
        );
        Ok(stats)
    }

    async fn start_job(&self, stream_id: &str, batch_id: Uuid, total: i64) -> Option<Uuid> {
        let job_id = Uuid::new_v4();
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {} (job_id, job_type, batch_id, stream_id, status, started_at, config)
            VALUES ($1, 'LOAD', $2, $3, 'RUNNING', now(), $4)
            "#,
            self.jobs_table()
        ))
        .bind(job_id)
        .bind(batch_id)
        .bind(stream_id)
        .bind(serde_json::json!({ "total_records": total }))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Some(job_id),
            Err(e) => {
                // Job bookkeeping never blocks the load itself.
                warn!(error = %e, "Could not open load job row");
                None
            }
        }
    }

    async fn complete_job(&self, job_id: Uuid, stats: &LoadStats) {
        let status = if stats.failed == 0 { "SUCCESS" } else { "FAILED" };
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = $2, completed_at = now(),
                records_processed = $3, records_failed = $4
            WHERE job_id = $1
            "#,
            self.jobs_table()
        ))
        .bind(job_id)
        .bind(status)
        .bind((stats.loaded + stats.duplicates) as i64)
        .bind(stats.failed as i64)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(error = %e, "Could not update load job row");
        }
    }

    /// Count (dry run) or delete source rows older than the cutoff. Defaults
    /// to dry run everywhere it is called from the pipeline.
    pub async fn cleanup_source_table(
        &self,
        dataset: &str,
        table: &str,
        before: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<i64> {
        if dry_run {
            let count: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {dataset}.{table} WHERE timestamp < $1"
            ))
            .bind(before)
            .fetch_one(&self.pool)
            .await?;
            info!(dataset, table, count, "Dry run: rows eligible for cleanup");
            Ok(count)
        } else {
            let result = sqlx::query(&format!(
                "DELETE FROM {dataset}.{table} WHERE timestamp < $1"
            ))
            .bind(before)
            .execute(&self.pool)
            .await?;
            info!(dataset, table, deleted = result.rows_affected(), "Cleaned up source table");
            Ok(result.rows_affected() as i64)
        }
    }
}
