//! Schema-adaptive extraction of raw log pages from source tables.
//!
//! Source tables differ wildly in shape, so the extractor inspects the
//! information schema first and selects only the columns that exist out of a
//! fixed catalog. Missing optional columns surface as `None` on the record.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{error, info, warn};

use glasspane_common::{LogStream, RawLogRecord, Severity};
use uuid::Uuid;

use crate::error::{EtlError, Result};

/// Core columns shared by most log tables.
const CORE_COLUMNS: [&str; 8] = [
    "timestamp",
    "severity",
    "insert_id",
    "log_name",
    "receive_timestamp",
    "trace",
    "span_id",
    "trace_sampled",
];

/// Payload columns, at most one of which is usually populated per row.
const PAYLOAD_COLUMNS: [&str; 4] = [
    "text_payload",
    "json_payload",
    "proto_payload",
    "audit_payload",
];

/// Structured context columns (all jsonb in the warehouse).
const CONTEXT_COLUMNS: [&str; 5] = [
    "resource",
    "http_request",
    "operation",
    "source_location",
    "labels",
];

/// The columns of one source table that intersect the catalog.
#[derive(Debug, Clone)]
pub struct ColumnSet {
    selected: Vec<String>,
    present: HashSet<String>,
}

impl ColumnSet {
    fn from_schema(schema: &[String]) -> Self {
        let present: HashSet<String> = schema.iter().cloned().collect();
        let selected = CORE_COLUMNS
            .iter()
            .chain(PAYLOAD_COLUMNS.iter())
            .chain(CONTEXT_COLUMNS.iter())
            .filter(|c| present.contains(**c))
            .map(|c| c.to_string())
            .collect();
        Self { present, selected }
    }

    pub fn has(&self, column: &str) -> bool {
        self.present.contains(column)
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    fn select_list(&self) -> String {
        self.selected.join(", ")
    }
}

#[derive(Clone)]
pub struct Extractor {
    pool: PgPool,
}

impl Extractor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The catalog columns a source table actually has.
    pub async fn column_set(&self, dataset: &str, table: &str) -> Result<ColumnSet> {
        let schema: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            "#,
        )
        .bind(dataset)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        Ok(ColumnSet::from_schema(&schema))
    }

    /// Extract one page of up to `limit` records, newest first. When `hours`
    /// is set and the table has a timestamp, the page is restricted to that
    /// window.
    pub async fn extract_page(
        &self,
        stream: &LogStream,
        offset: i64,
        limit: i64,
        hours: Option<i64>,
    ) -> Result<Vec<RawLogRecord>> {
        let cols = self
            .column_set(&stream.source_dataset, &stream.source_table)
            .await?;
        if cols.is_empty() {
            return Err(EtlError::Extraction(format!(
                "no known log columns in {}",
                stream.stream_id
            )));
        }

        let mut query = format!(
            "SELECT {} FROM {}.{}",
            cols.select_list(),
            stream.source_dataset,
            stream.source_table
        );

        let cutoff = match (hours, cols.has("timestamp")) {
            (Some(h), true) => {
                query.push_str(" WHERE timestamp >= $3");
                Some(Utc::now() - Duration::hours(h))
            }
            _ => None,
        };

        if cols.has("timestamp") {
            query.push_str(" ORDER BY timestamp DESC");
        }
        query.push_str(" LIMIT $1 OFFSET $2");

        info!(
            stream_id = %stream.stream_id,
            offset,
            limit,
            "Extracting page"
        );

        let mut q = sqlx::query(&query).bind(limit).bind(offset);
        if let Some(cutoff) = cutoff {
            q = q.bind(cutoff);
        }

        let rows = q.fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());

        for row in &rows {
            match row_to_record(row, stream, &cols) {
                Ok(record) => records.push(record),
                Err(e) => warn!(stream_id = %stream.stream_id, error = %e, "Skipping bad row"),
            }
        }

        Ok(records)
    }

    /// Drive pagination over a stream, invoking `on_page` for each page.
    /// Stops on a short page or after `max_batches`. Extraction errors end
    /// iteration for this stream but are not fatal.
    pub async fn extract_batch<F>(
        &self,
        stream: &LogStream,
        batch_size: i64,
        max_batches: Option<u32>,
        start_offset: i64,
        hours: Option<i64>,
        mut on_page: F,
    ) -> Result<i64>
    where
        F: FnMut(Vec<RawLogRecord>) -> Result<()>,
    {
        let mut offset = start_offset;
        let mut batch_count = 0u32;

        loop {
            let page = match self.extract_page(stream, offset, batch_size, hours).await {
                Ok(page) => page,
                Err(e) => {
                    error!(stream_id = %stream.stream_id, error = %e, "Extraction stopped");
                    break;
                }
            };

            if page.is_empty() {
                break;
            }

            let page_len = page.len() as i64;
            on_page(page)?;

            offset += page_len;
            batch_count += 1;

            if max_batches.is_some_and(|max| batch_count >= max) {
                break;
            }
            if page_len < batch_size {
                break;
            }
        }

        info!(
            stream_id = %stream.stream_id,
            batches = batch_count,
            records = offset - start_offset,
            "Completed extraction"
        );
        Ok(offset - start_offset)
    }

    /// Count records in a stream, optionally within a trailing window.
    pub async fn count_records(&self, stream: &LogStream, hours: Option<i64>) -> Result<i64> {
        let cols = self
            .column_set(&stream.source_dataset, &stream.source_table)
            .await?;

        let base = format!(
            "SELECT COUNT(*) FROM {}.{}",
            stream.source_dataset, stream.source_table
        );

        let count: i64 = match (hours, cols.has("timestamp")) {
            (Some(h), true) => {
                sqlx::query_scalar(&format!("{base} WHERE timestamp >= $1"))
                    .bind(Utc::now() - Duration::hours(h))
                    .fetch_one(&self.pool)
                    .await?
            }
            _ => sqlx::query_scalar(&base).fetch_one(&self.pool).await?,
        };

        Ok(count)
    }
}

fn row_to_record(row: &PgRow, stream: &LogStream, cols: &ColumnSet) -> Result<RawLogRecord> {
    let get_text = |col: &str| -> Option<String> {
        if cols.has(col) {
            row.try_get::<Option<String>, _>(col).ok().flatten()
        } else {
            None
        }
    };
    let get_json = |col: &str| -> Option<serde_json::Value> {
        if cols.has(col) {
            row.try_get::<Option<serde_json::Value>, _>(col)
                .ok()
                .flatten()
        } else {
            None
        }
    };

    let receive_timestamp = if cols.has("receive_timestamp") {
        row.try_get::<Option<DateTime<Utc>>, _>("receive_timestamp")
            .ok()
            .flatten()
    } else {
        None
    };

    // Rows without a usable event time fall back to the receive time, then to
    // the extraction clock. Counted as a data defect, not fatal.
    let timestamp = if cols.has("timestamp") {
        row.try_get::<Option<DateTime<Utc>>, _>("timestamp")
            .ok()
            .flatten()
    } else {
        None
    };
    let timestamp = match timestamp.or(receive_timestamp) {
        Some(ts) => ts,
        None => {
            warn!(stream_id = %stream.stream_id, "Row without event time");
            Utc::now()
        }
    };

    let trace_sampled = if cols.has("trace_sampled") {
        row.try_get::<Option<bool>, _>("trace_sampled").ok().flatten()
    } else {
        None
    };

    let resource = get_json("resource");
    let (resource_type, resource_labels) = split_resource(resource.as_ref());

    Ok(RawLogRecord {
        log_id: Uuid::new_v4(),
        insert_id: get_text("insert_id"),
        timestamp,
        receive_timestamp,
        severity: Severity::parse(&get_text("severity").unwrap_or_default()),
        log_name: get_text("log_name"),
        source_dataset: stream.source_dataset.clone(),
        source_table: stream.source_table.clone(),
        stream_id: stream.stream_id.clone(),
        stream_direction: stream.direction,
        stream_flow: stream.flow,
        stream_coordinates: stream.coordinates.clone(),
        resource_type,
        resource_labels,
        text_payload: get_text("text_payload"),
        json_payload: get_json("json_payload"),
        proto_payload: get_json("proto_payload"),
        audit_payload: get_json("audit_payload"),
        http_request: get_json("http_request"),
        trace: get_text("trace"),
        span_id: get_text("span_id"),
        trace_sampled,
        operation: get_json("operation"),
        source_location: get_json("source_location"),
        labels: json_to_string_map(get_json("labels").as_ref()),
    })
}

/// Split a `{"type": ..., "labels": {...}}` resource object into its parts.
fn split_resource(
    resource: Option<&serde_json::Value>,
) -> (Option<String>, HashMap<String, String>) {
    let Some(resource) = resource else {
        return (None, HashMap::new());
    };
    let resource_type = resource
        .get("type")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let labels = json_to_string_map(resource.get("labels"));
    (resource_type, labels)
}

/// Flatten a JSON object into a string map; non-string scalars are rendered,
/// nested values are serialized.
pub(crate) fn json_to_string_map(value: Option<&serde_json::Value>) -> HashMap<String, String> {
    let Some(serde_json::Value::Object(map)) = value else {
        return HashMap::new();
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
    fn column_set_intersects_catalog() {
        let schema = vec![
            "timestamp".to_string(),
            "severity".to_string(),
            "text_payload".to_string(),
            "custom_col".to_string(),
        ];
        let cols = ColumnSet::from_schema(&schema);
        assert!(cols.has("timestamp"));
        assert!(cols.has("text_payload"));
        assert!(!cols.is_empty());
        assert_eq!(cols.select_list(), "timestamp, severity, text_payload");
    }

    #[test]
    fn column_set_empty_for_unknown_schema() {
        let cols = ColumnSet::from_schema(&["foo".to_string(), "bar".to_string()]);
        assert!(cols.is_empty());
    }

    #[test]
    fn resource_splits_into_type_and_labels() {
        let resource = serde_json::json!({
            "type": "cloud_run_revision",
            "labels": {"service_name": "api", "revision": 7}
        });
        let (rtype, labels) = split_resource(Some(&resource));
        assert_eq!(rtype.as_deref(), Some("cloud_run_revision"));
        assert_eq!(labels.get("service_name").unwrap(), "api");
        assert_eq!(labels.get("revision").unwrap(), "7");
    }

    #[test]
    fn string_map_ignores_non_objects() {
        assert!(json_to_string_map(Some(&serde_json::json!("scalar"))).is_empty());
        assert!(json_to_string_map(None).is_empty());
    }
}
