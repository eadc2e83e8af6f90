//! Pipeline run bookkeeping: run records, rolling summaries, and alerts on
//! failed runs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::pipeline::{PipelineResult, PipelineStatus};

/// How many error strings are persisted per run.
const MAX_STORED_ERRORS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunRecord {
    pub pipeline_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
    pub streams_processed: i32,
    pub total_extracted: i64,
    pub total_normalized: i64,
    pub total_transformed: i64,
    pub total_loaded: i64,
    pub errors: Option<serde_json::Value>,
    pub stream_results: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlertRecord {
    pub alert_id: Uuid,
    pub alert_type: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub period_hours: i64,
    pub total_jobs: i64,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub total_logs_loaded: i64,
    pub total_errors: i64,
    pub success_rate: f64,
}

#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
    dataset: String,
}

impl JobStore {
    pub fn new(pool: PgPool, dataset: &str) -> Self {
        Self {
            pool,
            dataset: dataset.to_string(),
        }
    }

    fn runs_table(&self) -> String {
        format!("{}.pipeline_runs", self.dataset)
    }

    fn alerts_table(&self) -> String {
        format!("{}.etl_alerts", self.dataset)
    }

    /// Persist a run record. A FAILED run also opens an alert. Bookkeeping
    /// failures are logged, never propagated into the pipeline result.
    pub async fn record_run(&self, result: &PipelineResult) {
        let errors: Vec<&String> = result.errors.iter().take(MAX_STORED_ERRORS).collect();

        let insert = sqlx::query(&format!(
            r#"
            INSERT INTO {} (pipeline_id, started_at, completed_at, status,
                            streams_processed, total_extracted, total_normalized,
                            total_transformed, total_loaded, errors, stream_results)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (pipeline_id) DO UPDATE SET
                completed_at = EXCLUDED.completed_at,
                status = EXCLUDED.status,
                streams_processed = EXCLUDED.streams_processed,
                total_extracted = EXCLUDED.total_extracted,
                total_normalized = EXCLUDED.total_normalized,
                total_transformed = EXCLUDED.total_transformed,
                total_loaded = EXCLUDED.total_loaded,
                errors = EXCLUDED.errors,
                stream_results = EXCLUDED.stream_results
            "#,
            self.runs_table()
        ))
        .bind(result.pipeline_id)
        .bind(result.started_at)
        .bind(result.completed_at)
        .bind(result.status.as_str())
        .bind(result.streams_processed as i32)
        .bind(result.total_extracted as i64)
        .bind(result.total_normalized as i64)
        .bind(result.total_transformed as i64)
        .bind(result.total_loaded as i64)
        .bind(serde_json::to_value(&errors).unwrap_or(serde_json::Value::Null))
        .bind(serde_json::to_value(&result.stream_results).unwrap_or(serde_json::Value::Null))
        .execute(&self.pool)
        .await;

        if let Err(e) = insert {
            warn!(error = %e, "Could not record pipeline run");
            return;
        }

        if result.status == PipelineStatus::Failed {
            self.create_alert(
                "pipeline_failed",
                &format!("Pipeline {} failed", result.pipeline_id),
                serde_json::json!({
                    "pipeline_id": result.pipeline_id,
                    "errors": errors,
                }),
            )
            .await;
        }
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunRecord>> {
        let rows: Vec<RunRecord> = sqlx::query_as(&format!(
            "SELECT * FROM {} ORDER BY started_at DESC LIMIT $1",
            self.runs_table()
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn running_runs(&self) -> Result<Vec<RunRecord>> {
        let rows: Vec<RunRecord> = sqlx::query_as(&format!(
            "SELECT * FROM {} WHERE status = 'RUNNING' ORDER BY started_at DESC",
            self.runs_table()
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_run(&self, pipeline_id: Uuid) -> Result<Option<RunRecord>> {
        let row: Option<RunRecord> = sqlx::query_as(&format!(
            "SELECT * FROM {} WHERE pipeline_id = $1",
            self.runs_table()
        ))
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Roll-up over the trailing window. Success rate is a percentage.
    pub async fn metrics_summary(&self, hours: i64) -> Result<MetricsSummary> {
        let cutoff = Utc::now() - Duration::hours(hours);

        let runs: Vec<RunRecord> = sqlx::query_as(&format!(
            "SELECT * FROM {} WHERE started_at >= $1",
            self.runs_table()
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let total_jobs = runs.len() as i64;
        let completed_jobs = runs.iter().filter(|r| r.status == "COMPLETED").count() as i64;
        let failed_jobs = runs.iter().filter(|r| r.status == "FAILED").count() as i64;
        let total_logs_loaded: i64 = runs.iter().map(|r| r.total_loaded).sum();
        let total_errors: i64 = runs
            .iter()
            .map(|r| {
                r.errors
                    .as_ref()
                    .and_then(|e| e.as_array())
                    .map(|a| a.len() as i64)
                    .unwrap_or(0)
            })
            .sum();

        Ok(MetricsSummary {
            period_hours: hours,
            total_jobs,
            completed_jobs,
            failed_jobs,
            total_logs_loaded,
            total_errors,
            success_rate: if total_jobs > 0 {
                completed_jobs as f64 / total_jobs as f64 * 100.0
            } else {
                0.0
            },
        })
    }

    pub async fn create_alert(&self, alert_type: &str, message: &str, details: serde_json::Value) {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {} (alert_id, alert_type, message, details)
            VALUES ($1, $2, $3, $4)
            "#,
            self.alerts_table()
        ))
        .bind(Uuid::new_v4())
        .bind(alert_type)
        .bind(message)
        .bind(details)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => warn!(alert_type, message, "Alert created"),
            Err(e) => warn!(error = %e, "Could not create alert"),
        }
    }

    pub async fn unacknowledged_alerts(&self, limit: i64) -> Result<Vec<AlertRecord>> {
        let rows: Vec<AlertRecord> = sqlx::query_as(&format!(
            r#"
            SELECT * FROM {}
            WHERE NOT acknowledged
            ORDER BY created_at DESC
            LIMIT $1
            "#,
            self.alerts_table()
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn acknowledge_alert(&self, alert_id: Uuid) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET acknowledged = true WHERE alert_id = $1",
            self.alerts_table()
        ))
        .bind(alert_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
