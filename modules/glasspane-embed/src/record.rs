//! The embedding-side view of a log row, its trace text, and point identity.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde_json::Value;
use uuid::Uuid;

use glasspane_common::truncate_marked;

/// Bound on the final embedding input.
pub const MAX_TRACE_TEXT_CHARS: usize = 8_000;

const MAX_MESSAGE_PART: usize = 4_000;
const MAX_JSON_PART: usize = 2_000;
const MAX_PROTO_PART: usize = 1_000;
const MAX_PAYLOAD_PREVIEW: usize = 500;
const MAX_LABELS: usize = 5;
const MAX_RESOURCE_LABELS: usize = 3;

/// A log row as fetched for embedding, from the master table or a raw source
/// table. Labels use ordered maps so the built text is stable across runs.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub log_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: String,
    pub service_name: String,
    pub resource_type: String,
    pub table_name: String,
    pub dataset: String,

    pub text_payload: Option<String>,
    pub json_payload: Option<Value>,
    pub proto_payload: Option<Value>,

    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub trace_sampled: Option<bool>,

    pub http_request: Option<Value>,
    pub labels: BTreeMap<String, String>,
    pub resource_labels: BTreeMap<String, String>,
    pub source_location: Option<Value>,
    pub operation: Option<Value>,
}

impl LogEntry {
    /// Build the single canonical trace text for this row: header, payloads,
    /// trace/HTTP/source context, a handful of labels, all bounded.
    pub fn full_trace_text(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        parts.push(format!(
            "[{}] [{}] [{}]",
            self.timestamp.to_rfc3339(),
            self.severity,
            self.service_name
        ));

        if let Some(text) = &self.text_payload {
            parts.push(format!("Message: {}", truncate_marked(text, MAX_MESSAGE_PART)));
        }

        if let Some(json) = &self.json_payload {
            let rendered = serde_json::to_string(json).unwrap_or_else(|_| json.to_string());
            parts.push(format!("JSON: {}", truncate_marked(&rendered, MAX_JSON_PART)));
        }

        if let Some(proto) = &self.proto_payload {
            let rendered = serde_json::to_string(proto).unwrap_or_else(|_| proto.to_string());
            parts.push(format!("Proto: {}", truncate_marked(&rendered, MAX_PROTO_PART)));
        }

        if let Some(trace) = &self.trace_id {
            parts.push(format!("Trace: {trace}"));
            if let Some(span) = &self.span_id {
                parts.push(format!("Span: {span}"));
            }
        }

        if let Some(http) = &self.http_request {
            let method = http.get("requestMethod").and_then(|v| v.as_str()).unwrap_or("");
            let url = http.get("requestUrl").and_then(|v| v.as_str()).unwrap_or("");
            let status = http
                .get("status")
                .map(|v| v.to_string())
                .unwrap_or_default();
            if !method.is_empty() && !url.is_empty() {
                parts.push(format!("HTTP: {method} {url} {status}"));
            }
        }

        if let Some(loc) = &self.source_location {
            let file = loc.get("file").and_then(|v| v.as_str()).unwrap_or("");
            if !file.is_empty() {
                let line = loc
                    .get("line")
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                parts.push(format!("Source: {file}:{line}"));
            }
        }

        if !self.labels.is_empty() {
            let rendered: Vec<String> = self
                .labels
                .iter()
                .take(MAX_LABELS)
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            parts.push(format!("Labels: {}", rendered.join(" ")));
        }

        parts.push(format!("Resource: {}", self.resource_type));
        if !self.resource_labels.is_empty() {
            let rendered: Vec<String> = self
                .resource_labels
                .iter()
                .take(MAX_RESOURCE_LABELS)
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            parts.push(format!("ResourceLabels: {}", rendered.join(" ")));
        }

        truncate_marked(&parts.join(" | "), MAX_TRACE_TEXT_CHARS)
    }

    /// Point payload carrying the facets the index filters on.
    pub fn to_point_payload(&self) -> Value {
        serde_json::json!({
            "log_id": self.log_id,
            "timestamp": {
                "iso": self.timestamp.to_rfc3339(),
                "year": self.timestamp.year(),
                "month": self.timestamp.month(),
                "day": self.timestamp.day(),
                "hour": self.timestamp.hour(),
            },
            "severity": self.severity,
            "service_name": self.service_name,
            "resource_type": self.resource_type,
            "table_name": self.table_name,
            "dataset": self.dataset,
            "trace_id": self.trace_id,
            "span_id": self.span_id,
            "labels": self.labels,
            "resource_labels": self.resource_labels,
            "text_payload": self.text_payload.as_ref().map(|t| {
                t.chars().take(MAX_PAYLOAD_PREVIEW).collect::<String>()
            }),
            "has_json": self.json_payload.is_some(),
            "has_http_request": self.http_request.is_some(),
            "source_file": self
                .source_location
                .as_ref()
                .and_then(|l| l.get("file"))
                .and_then(|v| v.as_str()),
        })
    }
}

/// Stable point identity: the same `(log_id, chunk_idx)` always maps to the
/// same id, making repeated upserts idempotent.
pub fn point_id(log_id: Uuid, chunk_idx: usize) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{log_id}:{chunk_idx}").as_bytes(),
    )
}

/// Split text into chunks of at most `max_chars`, on char boundaries.
/// Non-empty input always yields at least one chunk.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> LogEntry {
        LogEntry {
            log_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, b"test-log"),
            timestamp: "2025-06-01T10:20:30Z".parse().unwrap(),
            severity: "ERROR".to_string(),
            service_name: "checkout".to_string(),
            resource_type: "cloud_run_revision".to_string(),
            table_name: "stderr".to_string(),
            dataset: "org_logs".to_string(),
            text_payload: Some("payment declined".to_string()),
            json_payload: None,
            proto_payload: None,
            trace_id: Some("abc123".to_string()),
            span_id: Some("span7".to_string()),
            trace_sampled: Some(true),
            http_request: Some(serde_json::json!({
                "requestMethod": "POST",
                "requestUrl": "/charge",
                "status": 402
            })),
            labels: BTreeMap::from([
                ("env".to_string(), "prod".to_string()),
                ("team".to_string(), "payments".to_string()),
            ]),
            resource_labels: BTreeMap::from([("region".to_string(), "us-central1".to_string())]),
            source_location: Some(serde_json::json!({"file": "charge.rs", "line": 42})),
            operation: None,
        }
    }

    #[test]
    fn trace_text_has_all_sections_in_order() {
        let text = entry().full_trace_text();
        assert!(text.starts_with("[2025-06-01T10:20:30+00:00] [ERROR] [checkout]"));
        let sections = [
            "Message: payment declined",
            "Trace: abc123",
            "Span: span7",
            "HTTP: POST /charge 402",
            "Source: charge.rs:42",
            "Labels: env=prod team=payments",
            "Resource: cloud_run_revision",
            "ResourceLabels: region=us-central1",
        ];
        let mut last = 0;
        for section in sections {
            let pos = text.find(section).unwrap_or_else(|| panic!("missing {section}"));
            assert!(pos >= last, "section out of order: {section}");
            last = pos;
        }
    }

    #[test]
    fn trace_text_is_bounded() {
        let mut e = entry();
        e.text_payload = Some("x".repeat(20_000));
        e.json_payload = Some(serde_json::json!({"blob": "y".repeat(10_000)}));
        let text = e.full_trace_text();
        assert!(text.chars().count() <= MAX_TRACE_TEXT_CHARS + 20);
        assert!(text.contains("... [truncated]"));
    }

    #[test]
    fn trace_text_is_deterministic() {
        assert_eq!(entry().full_trace_text(), entry().full_trace_text());
    }

    #[test]
    fn point_ids_are_stable_and_distinct_per_chunk() {
        let log_id = Uuid::new_v4();
        assert_eq!(point_id(log_id, 0), point_id(log_id, 0));
        assert_ne!(point_id(log_id, 0), point_id(log_id, 1));
        assert_ne!(point_id(log_id, 0), point_id(Uuid::new_v4(), 0));
    }

    #[test]
    fn chunking_splits_on_char_boundaries() {
        let chunks = chunk_text("héllo wörld", 4);
        assert_eq!(chunks, vec!["héll", "o wö", "rld"]);
        assert!(chunk_text("", 4).is_empty());
        assert_eq!(chunk_text("abc", 100), vec!["abc"]);
    }

    #[test]
    fn payload_carries_filter_facets() {
        let payload = entry().to_point_payload();
        assert_eq!(payload["severity"], "ERROR");
        assert_eq!(payload["timestamp"]["year"], 2025);
        assert_eq!(payload["timestamp"]["hour"], 10);
        assert_eq!(payload["has_http_request"], true);
        assert_eq!(payload["has_json"], false);
        assert_eq!(payload["source_file"], "charge.rs");
    }
}
