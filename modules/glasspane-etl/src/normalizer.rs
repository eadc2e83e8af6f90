//! Normalization of raw source rows into the canonical log schema.
//!
//! `normalize` is deterministic: the same raw record always produces the same
//! canonical record. Load-time fields (`etl_timestamp`, batch bookkeeping)
//! stay `None` here and are stamped by the loader.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use glasspane_common::{
    classify_pii_risk, truncate_chars, CanonicalLog, RawLogRecord, Severity, MAX_MESSAGE_CHARS,
    MAX_PAYLOAD_CHARS, MAX_STACK_CHARS, MAX_SUMMARY_CHARS, SCHEMA_VERSION,
};

static ERROR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)error[:\s]+([^\n]+)",
        r"(?i)exception[:\s]+([^\n]+)",
        r"(?i)failed[:\s]+([^\n]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Normalize a batch, preserving order.
pub fn normalize_batch(records: &[RawLogRecord]) -> Vec<CanonicalLog> {
    records.iter().map(normalize).collect()
}

/// Map a raw record to the canonical schema. Pure: no wall-clock reads.
pub fn normalize(raw: &RawLogRecord) -> CanonicalLog {
    let mut severity = raw.severity;
    let table_lower = raw.source_table.to_lowercase();

    let log_type = determine_log_type(&table_lower);

    // Resource projection
    let labels = &raw.resource_labels;
    let resource_project = labels.get("project_id").cloned();
    let resource_location = labels
        .get("location")
        .or_else(|| labels.get("region"))
        .or_else(|| labels.get("zone"))
        .cloned();
    let resource_name = ["service_name", "function_name", "instance_id", "job_name", "cluster_name"]
        .iter()
        .find_map(|k| labels.get(*k))
        .cloned();
    let service_version = labels
        .get("revision_name")
        .or_else(|| labels.get("version_id"))
        .cloned();
    let mut service_name = resource_name
        .clone()
        .or_else(|| raw.resource_type.clone())
        .unwrap_or_else(|| "unknown".to_string());

    // Payload union
    let mut text_payload = raw.text_payload.clone();
    let mut error_message: Option<String> = None;
    let mut error_code: Option<String> = None;
    let mut service_method: Option<String> = None;
    let mut principal_email: Option<String> = None;
    let mut principal_type: Option<String> = None;
    let mut caller_ip: Option<String> = None;
    let mut caller_network: Option<String> = None;

    if let Some(json) = &raw.json_payload {
        if text_payload.is_none() {
            if let Some(message) = json.get("message") {
                text_payload = Some(json_scalar_to_string(message));
            }
        }
        if let Some(error) = json.get("error") {
            error_message = Some(json_scalar_to_string(error));
        }
        // Some emitters carry severity in a `level` field; it overrides.
        if let Some(level) = json.get("level").and_then(|v| v.as_str()) {
            let parsed = Severity::parse(level);
            if parsed != Severity::Default || level.eq_ignore_ascii_case("default") {
                severity = parsed;
            }
        }
    }

    if let Some(proto) = &raw.proto_payload {
        if let Some(method) = proto.get("methodName").and_then(|v| v.as_str()) {
            service_method = Some(method.to_string());
        }
        if let Some(service) = proto.get("serviceName").and_then(|v| v.as_str()) {
            service_name = service.to_string();
        }
        extract_status(proto, &mut error_code, &mut error_message);
    }

    if let Some(audit) = &raw.audit_payload {
        if let Some(method) = audit.get("methodName").and_then(|v| v.as_str()) {
            service_method = Some(method.to_string());
        }
        if let Some(service) = audit.get("serviceName").and_then(|v| v.as_str()) {
            service_name = service.to_string();
        }
        if let Some(meta) = audit.get("requestMetadata") {
            caller_ip = meta.get("callerIp").and_then(|v| v.as_str()).map(String::from);
            caller_network = meta
                .get("callerNetwork")
                .and_then(|v| v.as_str())
                .map(String::from);
        }
        if let Some(auth) = audit.get("authenticationInfo") {
            principal_email = auth
                .get("principalEmail")
                .and_then(|v| v.as_str())
                .map(String::from);
            principal_type = auth
                .get("principalSubject")
                .and_then(|v| v.as_str())
                .map(String::from);
        }
        extract_status(audit, &mut error_code, &mut error_message);
    }

    // HTTP facet
    let http = raw.http_request.as_ref();
    let http_method = http
        .and_then(|h| h.get("requestMethod"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let http_url = http
        .and_then(|h| h.get("requestUrl"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let http_status = http
        .and_then(|h| h.get("status"))
        .and_then(json_to_i64)
        .map(|n| n as i32);
    let http_latency_ms = http.and_then(|h| h.get("latency")).and_then(parse_latency_ms);
    let http_user_agent = http
        .and_then(|h| h.get("userAgent"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let http_remote_ip = http
        .and_then(|h| h.get("remoteIp"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let http_request_size = http.and_then(|h| h.get("requestSize")).and_then(json_to_i64);
    let http_response_size = http.and_then(|h| h.get("responseSize")).and_then(json_to_i64);

    // Trace facet: path-form traces keep only the trailing id.
    let trace_id = raw.trace.as_ref().map(|t| {
        t.rsplit('/').next().unwrap_or(t.as_str()).to_string()
    });

    // Operation facet
    let op = raw.operation.as_ref();
    let operation_id = op
        .and_then(|o| o.get("id"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let operation_producer = op
        .and_then(|o| o.get("producer"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let operation_first = op.and_then(|o| o.get("first")).and_then(|v| v.as_bool());
    let operation_last = op.and_then(|o| o.get("last")).and_then(|v| v.as_bool());

    // Source location facet
    let loc = raw.source_location.as_ref();
    let source_file = loc
        .and_then(|l| l.get("file"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let source_line = loc.and_then(|l| l.get("line")).and_then(json_to_i64);
    let source_function = loc
        .and_then(|l| l.get("function"))
        .and_then(|v| v.as_str())
        .map(String::from);

    // Error extraction from text
    let text = text_payload.clone().unwrap_or_default();
    if error_message.is_none() {
        for pattern in ERROR_PATTERNS.iter() {
            if let Some(captures) = pattern.captures(&text) {
                if let Some(m) = captures.get(1) {
                    error_message = Some(truncate_chars(m.as_str(), 500));
                    break;
                }
            }
        }
    }
    let error_stack_trace = if text.contains("Traceback")
        || text.lines().any(|l| l.trim_start().starts_with("at "))
    {
        Some(truncate_chars(&text, MAX_STACK_CHARS))
    } else {
        None
    };

    let severity_level = severity.level();

    // Unified message
    let message = build_message(
        severity,
        &log_type,
        text_payload.as_deref(),
        raw.json_payload.as_ref(),
        raw.audit_payload.as_ref(),
        &service_name,
        service_method.as_deref(),
        http_method.as_deref(),
        http_url.as_deref(),
        error_message.as_deref(),
    );

    // Flags
    let is_error = severity_level >= 500;
    let is_audit = table_lower.contains("audit");
    let is_request = table_lower.contains("request");
    let has_trace = trace_id.as_ref().is_some_and(|t| !t.is_empty());

    // Envelope
    let environment = derive_environment(raw, &service_name);
    let pii_text = pii_scan_text(&message, text_payload.as_deref(), raw.json_payload.as_ref());
    let privacy_pii_risk = classify_pii_risk(&pii_text);
    let privacy_retention_class = if is_audit { "audit" } else { "standard" }.to_string();

    let (correlation_request_id, correlation_session_id, correlation_conversation_id) =
        extract_correlation_ids(raw, operation_id.as_deref());

    // Message metadata
    let message_summary = if message.is_empty() {
        None
    } else {
        Some(truncate_chars(&message, MAX_SUMMARY_CHARS))
    };
    let message_category = categorize_message(is_audit, is_error, http_method.is_some(), &message);

    CanonicalLog {
        log_id: raw.log_id,
        insert_id: raw.insert_id.clone(),
        event_timestamp: raw.timestamp,
        receive_timestamp: raw.receive_timestamp,
        etl_timestamp: None,
        severity,
        severity_level,
        log_type,
        source_dataset: raw.source_dataset.clone(),
        source_table: raw.source_table.clone(),
        source_log_name: raw.log_name.clone(),
        stream_id: raw.stream_id.clone(),
        stream_direction: raw.stream_direction,
        stream_flow: raw.stream_flow,
        stream_coordinates: serde_json::to_value(&raw.stream_coordinates)
            .unwrap_or(Value::Null),
        resource_type: raw.resource_type.clone(),
        resource_project,
        resource_name,
        resource_location,
        resource_labels: if raw.resource_labels.is_empty() {
            None
        } else {
            serde_json::to_value(&raw.resource_labels).ok()
        },
        service_name: service_name.clone(),
        service_version,
        service_method,
        message,
        message_summary,
        message_category: Some(message_category),
        text_payload: text_payload.map(|t| truncate_chars(&t, MAX_PAYLOAD_CHARS)),
        json_payload: raw.json_payload.clone(),
        proto_payload: raw.proto_payload.clone(),
        audit_payload: raw.audit_payload.clone(),
        http_method,
        http_url,
        http_status,
        http_latency_ms,
        http_user_agent,
        http_remote_ip,
        http_request_size,
        http_response_size,
        http_full: raw.http_request.clone(),
        trace_id,
        span_id: raw.span_id.clone(),
        trace_sampled: raw.trace_sampled,
        parent_span_id: None,
        operation_id,
        operation_producer,
        operation_first,
        operation_last,
        source_file,
        source_line,
        source_function,
        labels: if raw.labels.is_empty() {
            None
        } else {
            serde_json::to_value(&raw.labels).ok()
        },
        principal_email,
        principal_type,
        caller_ip,
        caller_network,
        error_message,
        error_code,
        error_stack_trace,
        error_group_id: None,
        is_error,
        is_audit,
        is_request,
        has_trace,
        schema_version: SCHEMA_VERSION.to_string(),
        environment: Some(environment),
        correlation_request_id,
        correlation_session_id,
        correlation_conversation_id,
        privacy_pii_risk,
        privacy_redaction_state: "none".to_string(),
        privacy_retention_class,
        etl_version: None,
        etl_batch_id: None,
        log_date: raw.timestamp.date_naive(),
        cluster_key: CanonicalLog::cluster_key_for(severity, &service_name),
    }
}

fn determine_log_type(table_lower: &str) -> String {
    let t = table_lower;
    if t.contains("audit") {
        "audit"
    } else if t.contains("request") {
        "request"
    } else if t.contains("build") {
        "build"
    } else if t.contains("error") {
        "error"
    } else if t.contains("stderr") || t.contains("stdout") {
        "application"
    } else if t.contains("system") || t.contains("syslog") {
        "system"
    } else {
        "application"
    }
    .to_string()
}

fn extract_status(
    payload: &Value,
    error_code: &mut Option<String>,
    error_message: &mut Option<String>,
) {
    let Some(status) = payload.get("status").filter(|s| s.is_object()) else {
        return;
    };
    if let Some(code) = status.get("code") {
        *error_code = Some(json_scalar_to_string(code));
    }
    if let Some(message) = status.get("message").and_then(|v| v.as_str()) {
        *error_message = Some(message.to_string());
    }
}

/// Latency arrives either as `"0.123456s"` or as a bare millisecond number.
fn parse_latency_ms(latency: &Value) -> Option<f64> {
    match latency {
        Value::String(s) => s.trim_end_matches('s').parse::<f64>().ok().map(|v| v * 1000.0),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn json_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn json_scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_message(
    severity: Severity,
    log_type: &str,
    text_payload: Option<&str>,
    json_payload: Option<&Value>,
    audit_payload: Option<&Value>,
    service_name: &str,
    service_method: Option<&str>,
    http_method: Option<&str>,
    http_url: Option<&str>,
    error_message: Option<&str>,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(text) = text_payload {
        parts.push(text.to_string());
    } else if let Some(json) = json_payload {
        if let Some(message) = json.get("message") {
            parts.push(json_scalar_to_string(message));
        } else {
            let serialized = serde_json::to_string(json).unwrap_or_default();
            parts.push(truncate_chars(&serialized, 1000));
        }
    } else if audit_payload.is_some() {
        parts.push(format!(
            "Audit: {} {}",
            service_name,
            service_method.unwrap_or("")
        ));
    }

    if let (Some(method), Some(url)) = (http_method, http_url) {
        parts.push(format!("[HTTP {method} {url}]"));
    }

    if let Some(error) = error_message {
        if !parts.iter().any(|p| p.contains(error)) {
            parts.push(format!("Error: {error}"));
        }
    }

    let message = if parts.is_empty() {
        format!("[{severity}] {log_type}")
    } else {
        parts.join(" | ")
    };

    truncate_chars(&message, MAX_MESSAGE_CHARS)
}

fn derive_environment(raw: &RawLogRecord, service_name: &str) -> String {
    for key in ["env", "environment"] {
        if let Some(value) = raw.labels.get(key) {
            return value.clone();
        }
    }
    for key in ["env", "environment"] {
        if let Some(value) = raw.resource_labels.get(key) {
            return value.clone();
        }
    }

    let svc = service_name.to_lowercase();
    if svc.contains("-dev") || svc.contains("_dev") {
        "dev".to_string()
    } else if svc.contains("-staging") || svc.contains("_staging") {
        "staging".to_string()
    } else if svc.contains("-test") || svc.contains("_test") {
        "test".to_string()
    } else {
        "prod".to_string()
    }
}

fn pii_scan_text(message: &str, text_payload: Option<&str>, json_payload: Option<&Value>) -> String {
    let mut parts = vec![message.to_string()];
    if let Some(text) = text_payload {
        parts.push(text.to_string());
    }
    if let Some(json) = json_payload {
        parts.push(serde_json::to_string(json).unwrap_or_default());
    }
    parts.join(" ")
}

fn extract_correlation_ids(
    raw: &RawLogRecord,
    operation_id: Option<&str>,
) -> (Option<String>, Option<String>, Option<String>) {
    let label = |keys: &[&str]| -> Option<String> {
        keys.iter().find_map(|k| raw.labels.get(*k)).cloned()
    };
    let json_field = |keys: &[&str]| -> Option<String> {
        let payload = raw.json_payload.as_ref()?;
        keys.iter()
            .find_map(|k| payload.get(*k))
            .map(json_scalar_to_string)
    };

    let request_id = label(&["request_id", "requestId", "x-request-id"])
        .or_else(|| json_field(&["request_id", "requestId"]))
        .or_else(|| operation_id.map(String::from));

    let session_id = label(&["session_id", "sessionId"])
        .or_else(|| json_field(&["session_id", "sessionId"]));

    let conversation_id = label(&["conversation_id", "conversationId"])
        .or_else(|| json_field(&["conversation_id", "conversationId", "chat_id", "thread_id"]));

    (request_id, session_id, conversation_id)
}

fn categorize_message(is_audit: bool, is_error: bool, has_http: bool, message: &str) -> String {
    if is_audit {
        return "audit".to_string();
    }
    if is_error {
        return "error".to_string();
    }
    if has_http {
        return "request".to_string();
    }

    let lower = message.to_lowercase();
    if ["metric", "gauge", "counter", "histogram"]
        .iter()
        .any(|w| lower.contains(w))
    {
        return "metric".to_string();
    }
    if ["debug", "trace", "verbose"].iter().any(|w| lower.contains(w)) {
        return "debug".to_string();
    }
    if lower.contains("warn") {
        return "warning".to_string();
    }

    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use glasspane_common::{PiiRisk, StreamCoordinates, StreamDirection, StreamFlow};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn raw(table: &str) -> RawLogRecord {
        let ts: DateTime<Utc> = "2025-06-01T12:34:56Z".parse().unwrap();
        RawLogRecord {
            log_id: Uuid::new_v4(),
            insert_id: Some("ins-1".to_string()),
            timestamp: ts,
            receive_timestamp: None,
            severity: Severity::Info,
            log_name: None,
            source_dataset: "org_logs".to_string(),
            source_table: table.to_string(),
            stream_id: format!("org_logs.{table}"),
            stream_direction: StreamDirection::Internal,
            stream_flow: StreamFlow::Batch,
            stream_coordinates: StreamCoordinates::default(),
            resource_type: Some("cloud_run_revision".to_string()),
            resource_labels: HashMap::new(),
            text_payload: None,
            json_payload: None,
            proto_payload: None,
            audit_payload: None,
            http_request: None,
            trace: None,
            span_id: None,
            trace_sampled: None,
            operation: None,
            source_location: None,
            labels: HashMap::new(),
        }
    }

    #[test]
    fn severity_override_from_json_level() {
        let mut record = raw("stdout");
        record.json_payload = Some(serde_json::json!({
            "level": "ERROR",
            "message": "boom"
        }));

        let log = normalize(&record);
        assert_eq!(log.severity, Severity::Error);
        assert_eq!(log.severity_level, 500);
        assert!(log.is_error);
        assert!(log.message.contains("boom"));
    }

    #[test]
    fn http_latency_string_parses_to_ms() {
        let mut record = raw("requests");
        record.http_request = Some(serde_json::json!({
            "requestMethod": "GET",
            "requestUrl": "/healthz",
            "status": 200,
            "latency": "0.250s"
        }));

        let log = normalize(&record);
        assert_eq!(log.http_latency_ms, Some(250.0));
        assert_eq!(log.http_status, Some(200));
        assert!(log.is_request);
        assert_eq!(log.message_category.as_deref(), Some("request"));
    }

    #[test]
    fn numeric_latency_passes_through() {
        let mut record = raw("requests");
        record.http_request = Some(serde_json::json!({ "latency": 42.5 }));
        let log = normalize(&record);
        assert_eq!(log.http_latency_ms, Some(42.5));
    }

    #[test]
    fn trace_path_is_stripped_to_id() {
        let mut record = raw("stdout");
        record.trace = Some("projects/p/traces/abc123".to_string());
        record.span_id = Some("span9".to_string());

        let log = normalize(&record);
        assert_eq!(log.trace_id.as_deref(), Some("abc123"));
        assert!(log.has_trace);
    }

    #[test]
    fn bare_trace_is_kept() {
        let mut record = raw("stdout");
        record.trace = Some("abc123".to_string());
        assert_eq!(normalize(&record).trace_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn password_in_message_is_high_pii() {
        let mut record = raw("stdout");
        record.text_payload = Some("password: hunter2".to_string());
        let log = normalize(&record);
        assert_eq!(log.privacy_pii_risk, PiiRisk::High);
    }

    #[test]
    fn audit_payload_extracts_principal_and_retention() {
        let mut record = raw("cloudaudit_activity");
        record.audit_payload = Some(serde_json::json!({
            "methodName": "SetIamPolicy",
            "serviceName": "iam.googleapis.com",
            "requestMetadata": { "callerIp": "10.1.2.3", "callerNetwork": "default" },
            "authenticationInfo": { "principalEmail": "admin@example.com" },
            "status": { "code": 7, "message": "denied" }
        }));

        let log = normalize(&record);
        assert!(log.is_audit);
        assert_eq!(log.log_type, "audit");
        assert_eq!(log.privacy_retention_class, "audit");
        assert_eq!(log.service_name, "iam.googleapis.com");
        assert_eq!(log.service_method.as_deref(), Some("SetIamPolicy"));
        assert_eq!(log.principal_email.as_deref(), Some("admin@example.com"));
        assert_eq!(log.caller_ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(log.error_code.as_deref(), Some("7"));
        assert_eq!(log.error_message.as_deref(), Some("denied"));
        assert!(log.message.starts_with("Audit: iam.googleapis.com SetIamPolicy"));
        assert_eq!(log.message_category.as_deref(), Some("audit"));
    }

    #[test]
    fn error_message_extracted_from_text() {
        let mut record = raw("stdout");
        record.text_payload = Some("request failed: upstream timeout\nretrying".to_string());
        let log = normalize(&record);
        assert_eq!(log.error_message.as_deref(), Some("upstream timeout"));
    }

    #[test]
    fn stack_trace_captured_and_bounded() {
        let mut record = raw("stderr");
        let stack = format!("Traceback (most recent call last):\n{}", "x".repeat(9000));
        record.text_payload = Some(stack);
        let log = normalize(&record);
        let captured = log.error_stack_trace.unwrap();
        assert!(captured.chars().count() <= MAX_STACK_CHARS + 3);
    }

    #[test]
    fn environment_derived_from_service_suffix() {
        let mut record = raw("stdout");
        record
            .resource_labels
            .insert("service_name".to_string(), "checkout-staging".to_string());
        let log = normalize(&record);
        assert_eq!(log.environment.as_deref(), Some("staging"));
        assert_eq!(log.service_name, "checkout-staging");
    }

    #[test]
    fn environment_label_wins_over_suffix() {
        let mut record = raw("stdout");
        record.labels.insert("env".to_string(), "qa".to_string());
        record
            .resource_labels
            .insert("service_name".to_string(), "checkout-dev".to_string());
        assert_eq!(normalize(&record).environment.as_deref(), Some("qa"));
    }

    #[test]
    fn correlation_ids_pulled_from_labels_and_json() {
        let mut record = raw("stdout");
        record
            .labels
            .insert("request_id".to_string(), "req-7".to_string());
        record.json_payload = Some(serde_json::json!({
            "session_id": "sess-1",
            "thread_id": "thr-2"
        }));

        let log = normalize(&record);
        assert_eq!(log.correlation_request_id.as_deref(), Some("req-7"));
        assert_eq!(log.correlation_session_id.as_deref(), Some("sess-1"));
        assert_eq!(log.correlation_conversation_id.as_deref(), Some("thr-2"));
    }

    #[test]
    fn message_defaults_when_no_payload() {
        let record = raw("stdout");
        let log = normalize(&record);
        assert_eq!(log.message, "[INFO] application");
        assert_eq!(log.message_category.as_deref(), Some("info"));
    }

    #[test]
    fn long_message_bounded_and_summarized() {
        let mut record = raw("stdout");
        record.text_payload = Some("m".repeat(12_000));
        let log = normalize(&record);
        assert!(log.message.chars().count() <= MAX_MESSAGE_CHARS + 3);
        let summary = log.message_summary.unwrap();
        assert!(summary.chars().count() <= MAX_SUMMARY_CHARS + 3);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn normalize_is_deterministic() {
        let mut record = raw("requests");
        record.text_payload = Some("error: boom".to_string());
        record.http_request = Some(serde_json::json!({
            "requestMethod": "POST",
            "requestUrl": "/v1/items",
            "latency": "1.5s"
        }));

        let a = serde_json::to_string(&normalize(&record)).unwrap();
        let b = serde_json::to_string(&normalize(&record)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cluster_and_partition_keys() {
        let mut record = raw("stdout");
        record.severity = Severity::Warning;
        let log = normalize(&record);
        assert_eq!(log.log_date.to_string(), "2025-06-01");
        assert_eq!(log.cluster_key, "WARNING:cloud_run_revision");
    }
}
