use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::pii::PiiRisk;
use crate::severity::Severity;

/// Schema version stamped on every canonical record. Readers tolerate older
/// minors.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Upper bounds on string fields in the canonical record.
pub const MAX_MESSAGE_CHARS: usize = 10_000;
pub const MAX_PAYLOAD_CHARS: usize = 10_000;
pub const MAX_STACK_CHARS: usize = 5_000;
pub const MAX_SUMMARY_CHARS: usize = 200;

// --- Stream classification ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamDirection {
    /// External data coming into the platform.
    Inbound,
    /// Data leaving to external systems.
    Outbound,
    /// Internal service logs.
    #[default]
    Internal,
}

impl StreamDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamDirection::Inbound => "INBOUND",
            StreamDirection::Outbound => "OUTBOUND",
            StreamDirection::Internal => "INTERNAL",
        }
    }

    pub fn parse(s: &str) -> StreamDirection {
        match s {
            "INBOUND" => StreamDirection::Inbound,
            "OUTBOUND" => StreamDirection::Outbound,
            _ => StreamDirection::Internal,
        }
    }
}

impl std::fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamFlow {
    /// Streaming / real-time ingestion.
    Realtime,
    #[default]
    Batch,
    /// Scheduled ETL jobs.
    Scheduled,
}

impl StreamFlow {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamFlow::Realtime => "REALTIME",
            StreamFlow::Batch => "BATCH",
            StreamFlow::Scheduled => "SCHEDULED",
        }
    }

    pub fn parse(s: &str) -> StreamFlow {
        match s {
            "REALTIME" => StreamFlow::Realtime,
            "SCHEDULED" => StreamFlow::Scheduled,
            _ => StreamFlow::Batch,
        }
    }
}

impl std::fmt::Display for StreamFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Organizational coordinates attached to a stream, carried by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCoordinates {
    pub region: String,
    pub zone: Option<String>,
    pub project: String,
    pub organization: String,
}

impl Default for StreamCoordinates {
    fn default() -> Self {
        Self {
            region: "us-central1".to_string(),
            zone: None,
            project: String::new(),
            organization: String::new(),
        }
    }
}

/// A logical log source: one warehouse table plus its classification and
/// sync state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStream {
    pub stream_id: String,
    pub stream_name: String,
    pub source_dataset: String,
    pub source_table: String,
    pub direction: StreamDirection,
    pub flow: StreamFlow,
    pub coordinates: StreamCoordinates,
    pub enabled: bool,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_offset: i64,
    pub total_records_synced: i64,
    /// Row count observed at discovery time, used to decide whether a stream
    /// still has unsynced data.
    pub row_count: Option<i64>,
}

impl LogStream {
    /// Build a stream from a discovered table, classifying direction and flow
    /// from the table name.
    pub fn from_table(dataset: &str, table: &str, project: &str, now: DateTime<Utc>) -> Self {
        let lowered = table.to_lowercase();

        let direction = if lowered.contains("request") {
            StreamDirection::Inbound
        } else if lowered.contains("sink_error") {
            StreamDirection::Outbound
        } else {
            // audit tables and everything else are internal platform logs
            StreamDirection::Internal
        };

        let flow = if lowered.contains("stdout") || lowered.contains("stderr") {
            StreamFlow::Realtime
        } else {
            StreamFlow::Batch
        };

        Self {
            stream_id: format!("{dataset}.{table}"),
            stream_name: table.replace("_googleapis_com_", ":").replace('_', "-"),
            source_dataset: dataset.to_string(),
            source_table: table.to_string(),
            direction,
            flow,
            coordinates: StreamCoordinates {
                project: project.to_string(),
                ..StreamCoordinates::default()
            },
            enabled: true,
            priority: 0,
            created_at: now,
            updated_at: None,
            last_sync_at: None,
            last_sync_offset: 0,
            total_records_synced: 0,
            row_count: None,
        }
    }

    /// Whether discovery saw more rows than we have synced so far.
    pub fn has_pending_rows(&self) -> bool {
        self.row_count
            .map(|n| self.last_sync_offset < n)
            .unwrap_or(false)
    }
}

// --- Raw extraction output ---

/// One row as pulled from a source table, before normalization. Optional
/// fields are `None` when the source schema lacks the column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLogRecord {
    pub log_id: Uuid,
    pub insert_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub receive_timestamp: Option<DateTime<Utc>>,
    pub severity: Severity,
    pub log_name: Option<String>,

    // Stream provenance
    pub source_dataset: String,
    pub source_table: String,
    pub stream_id: String,
    pub stream_direction: StreamDirection,
    pub stream_flow: StreamFlow,
    pub stream_coordinates: StreamCoordinates,

    pub resource_type: Option<String>,
    pub resource_labels: HashMap<String, String>,

    pub text_payload: Option<String>,
    pub json_payload: Option<Value>,
    pub proto_payload: Option<Value>,
    pub audit_payload: Option<Value>,

    pub http_request: Option<Value>,

    pub trace: Option<String>,
    pub span_id: Option<String>,
    pub trace_sampled: Option<bool>,

    pub operation: Option<Value>,
    pub source_location: Option<Value>,

    pub labels: HashMap<String, String>,
}

// --- Canonical record ---

/// The normalized, envelope-annotated record written to `master_logs`.
/// Field names match the master table columns one-to-one so a serialized
/// record can be loaded through `jsonb_populate_recordset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalLog {
    pub log_id: Uuid,
    pub insert_id: Option<String>,

    pub event_timestamp: DateTime<Utc>,
    pub receive_timestamp: Option<DateTime<Utc>>,
    /// Set by the loader at insert time; `None` until then.
    pub etl_timestamp: Option<DateTime<Utc>>,

    pub severity: Severity,
    pub severity_level: i32,
    pub log_type: String,

    pub source_dataset: String,
    pub source_table: String,
    pub source_log_name: Option<String>,
    pub stream_id: String,
    pub stream_direction: StreamDirection,
    pub stream_flow: StreamFlow,
    pub stream_coordinates: Value,

    pub resource_type: Option<String>,
    pub resource_project: Option<String>,
    pub resource_name: Option<String>,
    pub resource_location: Option<String>,
    pub resource_labels: Option<Value>,

    pub service_name: String,
    pub service_version: Option<String>,
    pub service_method: Option<String>,

    pub message: String,
    pub message_summary: Option<String>,
    pub message_category: Option<String>,
    pub text_payload: Option<String>,
    pub json_payload: Option<Value>,
    pub proto_payload: Option<Value>,
    pub audit_payload: Option<Value>,

    pub http_method: Option<String>,
    pub http_url: Option<String>,
    pub http_status: Option<i32>,
    pub http_latency_ms: Option<f64>,
    pub http_user_agent: Option<String>,
    pub http_remote_ip: Option<String>,
    pub http_request_size: Option<i64>,
    pub http_response_size: Option<i64>,
    pub http_full: Option<Value>,

    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub trace_sampled: Option<bool>,
    pub parent_span_id: Option<String>,

    pub operation_id: Option<String>,
    pub operation_producer: Option<String>,
    pub operation_first: Option<bool>,
    pub operation_last: Option<bool>,

    pub source_file: Option<String>,
    pub source_line: Option<i64>,
    pub source_function: Option<String>,

    pub labels: Option<Value>,

    pub principal_email: Option<String>,
    pub principal_type: Option<String>,
    pub caller_ip: Option<String>,
    pub caller_network: Option<String>,

    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub error_stack_trace: Option<String>,
    pub error_group_id: Option<String>,

    pub is_error: bool,
    pub is_audit: bool,
    pub is_request: bool,
    pub has_trace: bool,

    // Envelope
    pub schema_version: String,
    pub environment: Option<String>,
    pub correlation_request_id: Option<String>,
    pub correlation_session_id: Option<String>,
    pub correlation_conversation_id: Option<String>,
    pub privacy_pii_risk: PiiRisk,
    pub privacy_redaction_state: String,
    pub privacy_retention_class: String,

    // Load bookkeeping (set by the loader)
    pub etl_version: Option<String>,
    pub etl_batch_id: Option<Uuid>,

    // Partition / cluster keys
    pub log_date: NaiveDate,
    pub cluster_key: String,
}

impl CanonicalLog {
    /// `"<severity>:<service_name>"`, the clustering key of the master table.
    pub fn cluster_key_for(severity: Severity, service_name: &str) -> String {
        format!("{}:{}", severity.as_str(), service_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        "2025-06-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn from_table_classifies_request_tables_inbound() {
        let s = LogStream::from_table("org_logs", "requests_2025", "proj", ts());
        assert_eq!(s.stream_id, "org_logs.requests_2025");
        assert_eq!(s.direction, StreamDirection::Inbound);
        assert_eq!(s.flow, StreamFlow::Batch);
    }

    #[test]
    fn from_table_classifies_stderr_realtime() {
        let s = LogStream::from_table("logs", "run_googleapis_com_stderr", "proj", ts());
        assert_eq!(s.direction, StreamDirection::Internal);
        assert_eq!(s.flow, StreamFlow::Realtime);
        assert_eq!(s.stream_name, "run:stderr");
    }

    #[test]
    fn from_table_classifies_sink_errors_outbound() {
        let s = LogStream::from_table("logs", "sink_error_export", "proj", ts());
        assert_eq!(s.direction, StreamDirection::Outbound);
    }

    #[test]
    fn audit_tables_stay_internal() {
        let s = LogStream::from_table("logs", "cloudaudit_activity", "proj", ts());
        assert_eq!(s.direction, StreamDirection::Internal);
    }

    #[test]
    fn pending_rows_requires_known_row_count() {
        let mut s = LogStream::from_table("d", "t", "p", ts());
        assert!(!s.has_pending_rows());
        s.row_count = Some(100);
        assert!(s.has_pending_rows());
        s.last_sync_offset = 100;
        assert!(!s.has_pending_rows());
    }
}
