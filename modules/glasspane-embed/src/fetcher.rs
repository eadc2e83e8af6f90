//! Fetching rows to embed, from the master table or directly from a raw
//! source table.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use glasspane_common::{GlasspaneError, LogStream};
use glasspane_etl::Extractor;

use crate::record::LogEntry;

type Result<T> = std::result::Result<T, GlasspaneError>;

/// Where the worker reads rows from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchSource {
    /// The normalized master table (the usual mode).
    #[default]
    Master,
    /// The raw source table named by the job.
    Source,
}

#[async_trait]
pub trait RecordFetcher: Send + Sync {
    /// Fetch up to `limit` rows of the stream at `offset`, newest first.
    async fn fetch(&self, table: &str, offset: i64, limit: i64) -> Result<Vec<LogEntry>>;
}

#[derive(sqlx::FromRow)]
struct MasterRow {
    log_id: Uuid,
    event_timestamp: DateTime<Utc>,
    severity: String,
    service_name: String,
    resource_type: Option<String>,
    stream_id: String,
    message: String,
    text_payload: Option<String>,
    json_payload: Option<serde_json::Value>,
    proto_payload: Option<serde_json::Value>,
    trace_id: Option<String>,
    span_id: Option<String>,
    trace_sampled: Option<bool>,
    http_method: Option<String>,
    http_url: Option<String>,
    http_status: Option<i32>,
    http_latency_ms: Option<f64>,
    http_user_agent: Option<String>,
    http_remote_ip: Option<String>,
    http_request_size: Option<i64>,
    http_response_size: Option<i64>,
    labels: Option<serde_json::Value>,
    resource_labels: Option<serde_json::Value>,
    source_file: Option<String>,
    source_line: Option<i64>,
    source_function: Option<String>,
    operation_id: Option<String>,
    operation_producer: Option<String>,
}

pub struct WarehouseFetcher {
    pool: PgPool,
    master_dataset: String,
    project: String,
    source: FetchSource,
}

impl WarehouseFetcher {
    pub fn new(pool: PgPool, master_dataset: &str, project: &str, source: FetchSource) -> Self {
        Self {
            pool,
            master_dataset: master_dataset.to_string(),
            project: project.to_string(),
            source,
        }
    }

    async fn fetch_master(&self, stream_id: &str, offset: i64, limit: i64) -> Result<Vec<LogEntry>> {
        let query = format!(
            r#"
            SELECT log_id, event_timestamp, severity, service_name, resource_type,
                   stream_id, message, text_payload, json_payload, proto_payload,
                   trace_id, span_id, trace_sampled,
                   http_method, http_url, http_status, http_latency_ms,
                   http_user_agent, http_remote_ip, http_request_size, http_response_size,
                   labels, resource_labels, source_file, source_line, source_function,
                   operation_id, operation_producer
            FROM {}.master_logs
            WHERE stream_id = $1
            ORDER BY event_timestamp DESC
            LIMIT $2 OFFSET $3
            "#,
            self.master_dataset
        );

        let rows: Vec<MasterRow> = sqlx::query_as(&query)
            .bind(stream_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GlasspaneError::Database(e.to_string()))?;

        debug!(stream_id, offset, count = rows.len(), "Fetched master rows");
        Ok(rows.into_iter().map(|r| self.master_row_to_entry(r)).collect())
    }

    fn master_row_to_entry(&self, row: MasterRow) -> LogEntry {
        let (dataset, table_name) = split_stream_id(&row.stream_id);

        let http_request = if row.http_method.is_some() || row.http_url.is_some() {
            Some(serde_json::json!({
                "requestMethod": row.http_method,
                "requestUrl": row.http_url,
                "status": row.http_status,
                "latency": row.http_latency_ms.map(|ms| format!("{}s", ms / 1000.0)),
                "userAgent": row.http_user_agent,
                "remoteIp": row.http_remote_ip,
                "requestSize": row.http_request_size,
                "responseSize": row.http_response_size,
            }))
        } else {
            None
        };

        let source_location = row.source_file.as_ref().map(|file| {
            serde_json::json!({
                "file": file,
                "line": row.source_line,
                "function": row.source_function,
            })
        });

        let operation = if row.operation_id.is_some() || row.operation_producer.is_some() {
            Some(serde_json::json!({
                "id": row.operation_id,
                "producer": row.operation_producer,
            }))
        } else {
            None
        };

        LogEntry {
            log_id: row.log_id,
            timestamp: row.event_timestamp,
            severity: row.severity,
            service_name: row.service_name,
            resource_type: row.resource_type.unwrap_or_else(|| "unknown".to_string()),
            table_name,
            dataset,
            text_payload: row.text_payload.or(Some(row.message)).filter(|t| !t.is_empty()),
            json_payload: row.json_payload,
            proto_payload: row.proto_payload,
            trace_id: row.trace_id,
            span_id: row.span_id,
            trace_sampled: row.trace_sampled,
            http_request,
            labels: json_to_btree(row.labels.as_ref()),
            resource_labels: json_to_btree(row.resource_labels.as_ref()),
            source_location,
            operation,
        }
    }

    async fn fetch_source(&self, stream_id: &str, offset: i64, limit: i64) -> Result<Vec<LogEntry>> {
        let (dataset, table) = split_stream_id(stream_id);
        let stream = LogStream::from_table(&dataset, &table, &self.project, Utc::now());

        let extractor = Extractor::new(self.pool.clone());
        let raw = extractor
            .extract_page(&stream, offset, limit, None)
            .await
            .map_err(|e| GlasspaneError::Extraction(e.to_string()))?;

        Ok(raw
            .into_iter()
            .map(|r| {
                let service_name = r
                    .resource_labels
                    .get("service_name")
                    .or_else(|| r.resource_labels.get("function_name"))
                    .cloned()
                    .or_else(|| r.resource_type.clone())
                    .unwrap_or_else(|| "unknown".to_string());

                LogEntry {
                    log_id: r.log_id,
                    timestamp: r.timestamp,
                    severity: r.severity.as_str().to_string(),
                    service_name,
                    resource_type: r.resource_type.unwrap_or_else(|| "unknown".to_string()),
                    table_name: table.clone(),
                    dataset: dataset.clone(),
                    text_payload: r.text_payload,
                    json_payload: r.json_payload,
                    proto_payload: r.proto_payload.or(r.audit_payload),
                    trace_id: r
                        .trace
                        .map(|t| t.rsplit('/').next().unwrap_or(t.as_str()).to_string()),
                    span_id: r.span_id,
                    trace_sampled: r.trace_sampled,
                    http_request: r.http_request,
                    labels: r.labels.into_iter().collect(),
                    resource_labels: r.resource_labels.into_iter().collect(),
                    source_location: r.source_location,
                    operation: r.operation,
                }
            })
            .collect())
    }
}

#[async_trait]
impl RecordFetcher for WarehouseFetcher {
    async fn fetch(&self, table: &str, offset: i64, limit: i64) -> Result<Vec<LogEntry>> {
        match self.source {
            FetchSource::Master => self.fetch_master(table, offset, limit).await,
            FetchSource::Source => self.fetch_source(table, offset, limit).await,
        }
    }
}

fn split_stream_id(stream_id: &str) -> (String, String) {
    match stream_id.split_once('.') {
        Some((dataset, table)) => (dataset.to_string(), table.to_string()),
        None => ("unknown".to_string(), stream_id.to_string()),
    }
}

fn json_to_btree(value: Option<&serde_json::Value>) -> BTreeMap<String, String> {
    let Some(serde_json::Value::Object(map)) = value else {
        return BTreeMap::new();
    };
    map.iter()
        .map(|(k, v)| {
            let rendered = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), rendered)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_split_into_dataset_and_table() {
        assert_eq!(
            split_stream_id("org_logs.stderr"),
            ("org_logs".to_string(), "stderr".to_string())
        );
        assert_eq!(
            split_stream_id("bare_table"),
            ("unknown".to_string(), "bare_table".to_string())
        );
    }
}
