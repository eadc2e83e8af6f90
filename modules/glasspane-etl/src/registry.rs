//! Stream registry: discovery, registration, and sync state for log source
//! tables.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{error, info, warn};

use glasspane_common::{LogStream, StreamDirection, StreamFlow};

use crate::error::Result;

/// Columns that mark a table as a log source during discovery.
const LOG_MARKER_COLUMNS: [&str; 3] = ["timestamp", "severity", "log_name"];

#[derive(Clone)]
pub struct StreamRegistry {
    pool: PgPool,
    master_dataset: String,
    project: String,
}

#[derive(sqlx::FromRow)]
struct StreamRow {
    stream_id: String,
    stream_name: String,
    source_dataset: String,
    source_table: String,
    stream_direction: String,
    stream_flow: String,
    coordinates: Option<serde_json::Value>,
    enabled: bool,
    priority: i32,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    last_sync_at: Option<DateTime<Utc>>,
    last_sync_offset: i64,
    total_records_synced: i64,
    row_count: Option<i64>,
}

impl From<StreamRow> for LogStream {
    fn from(row: StreamRow) -> Self {
        let coordinates = row
            .coordinates
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        LogStream {
            stream_id: row.stream_id,
            stream_name: row.stream_name,
            source_dataset: row.source_dataset,
            source_table: row.source_table,
            direction: StreamDirection::parse(&row.stream_direction),
            flow: StreamFlow::parse(&row.stream_flow),
            coordinates,
            enabled: row.enabled,
            priority: row.priority,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_sync_at: row.last_sync_at,
            last_sync_offset: row.last_sync_offset,
            total_records_synced: row.total_records_synced,
            row_count: row.row_count,
        }
    }
}

impl StreamRegistry {
    pub fn new(pool: PgPool, project: &str, master_dataset: &str) -> Self {
        Self {
            pool,
            master_dataset: master_dataset.to_string(),
            project: project.to_string(),
        }
    }

    fn streams_table(&self) -> String {
        format!("{}.log_streams", self.master_dataset)
    }

    /// Discover log streams by scanning candidate schemas. A table qualifies
    /// when it is a non-empty base table with at least one log marker column.
    /// Errors on one schema never abort the others.
    pub async fn discover(&self, datasets: &[String]) -> Result<Vec<LogStream>> {
        let mut discovered = Vec::new();
        let now = Utc::now();

        for dataset in datasets {
            match self.discover_dataset(dataset, now).await {
                Ok(mut streams) => discovered.append(&mut streams),
                Err(e) => error!(dataset, error = %e, "Error scanning dataset"),
            }
        }

        Ok(discovered)
    }

    async fn discover_dataset(
        &self,
        dataset: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<LogStream>> {
        let tables: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT table_name FROM information_schema.tables
            WHERE table_schema = $1 AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
        )
        .bind(dataset)
        .fetch_all(&self.pool)
        .await?;

        let mut streams = Vec::new();

        for table in tables {
            // Registry bookkeeping tables never count as sources.
            if dataset == self.master_dataset
                && matches!(
                    table.as_str(),
                    "master_logs" | "log_streams" | "etl_jobs" | "pipeline_runs" | "etl_alerts"
                )
            {
                continue;
            }

            let columns = self.table_columns(dataset, &table).await?;
            if !LOG_MARKER_COLUMNS.iter().any(|c| columns.contains(&c.to_string())) {
                continue;
            }

            let row_count = match self.count_rows(dataset, &table).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(dataset, table, error = %e, "Could not count table rows");
                    continue;
                }
            };
            if row_count == 0 {
                continue;
            }

            let mut stream = LogStream::from_table(dataset, &table, &self.project, now);
            stream.row_count = Some(row_count);

            info!(
                stream_id = %stream.stream_id,
                direction = %stream.direction,
                flow = %stream.flow,
                rows = row_count,
                "Discovered stream"
            );
            streams.push(stream);
        }

        Ok(streams)
    }

    /// Column names of a source table, from the information schema.
    pub async fn table_columns(&self, dataset: &str, table: &str) -> Result<Vec<String>> {
        let columns: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            "#,
        )
        .bind(dataset)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(columns)
    }

    async fn count_rows(&self, dataset: &str, table: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {dataset}.{table}"))
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Upsert a stream, preserving its sync state on conflict.
    pub async fn register(&self, stream: &LogStream) -> Result<()> {
        let coordinates = serde_json::to_value(&stream.coordinates)
            .unwrap_or(serde_json::Value::Null);

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (stream_id, stream_name, source_dataset, source_table,
                            stream_direction, stream_flow, coordinates, enabled,
                            priority, created_at, row_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (stream_id) DO UPDATE SET
                stream_name = EXCLUDED.stream_name,
                stream_direction = EXCLUDED.stream_direction,
                stream_flow = EXCLUDED.stream_flow,
                coordinates = EXCLUDED.coordinates,
                row_count = EXCLUDED.row_count,
                updated_at = now()
            "#,
            self.streams_table()
        ))
        .bind(&stream.stream_id)
        .bind(&stream.stream_name)
        .bind(&stream.source_dataset)
        .bind(&stream.source_table)
        .bind(stream.direction.as_str())
        .bind(stream.flow.as_str())
        .bind(&coordinates)
        .bind(stream.enabled)
        .bind(stream.priority)
        .bind(stream.created_at)
        .bind(stream.row_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Advance a stream's sync state. The offset is monotonic: an older
    /// offset never overwrites a newer one. `records_synced` is additive.
    pub async fn update_sync(
        &self,
        stream_id: &str,
        offset: i64,
        records_synced: i64,
    ) -> Result<()> {
        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET last_sync_at = now(),
                last_sync_offset = GREATEST(last_sync_offset, $2),
                total_records_synced = total_records_synced + $3,
                updated_at = now()
            WHERE stream_id = $1
            "#,
            self.streams_table()
        ))
        .bind(stream_id)
        .bind(offset)
        .bind(records_synced)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_stream(&self, stream_id: &str) -> Result<Option<LogStream>> {
        let row: Option<StreamRow> = sqlx::query_as(&format!(
            "SELECT * FROM {} WHERE stream_id = $1",
            self.streams_table()
        ))
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(LogStream::from))
    }

    /// All registered streams; pass `enabled_only` to skip disabled ones.
    pub async fn all_streams(&self, enabled_only: bool) -> Result<Vec<LogStream>> {
        let query = if enabled_only {
            format!(
                "SELECT * FROM {} WHERE enabled ORDER BY priority DESC, stream_id",
                self.streams_table()
            )
        } else {
            format!("SELECT * FROM {} ORDER BY stream_id", self.streams_table())
        };

        let rows: Vec<StreamRow> = sqlx::query_as(&query).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(LogStream::from).collect())
    }

    /// Streams whose discovery row count exceeds the synced offset.
    pub async fn pending_streams(&self) -> Result<Vec<LogStream>> {
        let streams = self.all_streams(true).await?;
        Ok(streams.into_iter().filter(|s| s.has_pending_rows()).collect())
    }

    pub async fn set_enabled(&self, stream_id: &str, enabled: bool) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET enabled = $2, updated_at = now() WHERE stream_id = $1",
            self.streams_table()
        ))
        .bind(stream_id)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
