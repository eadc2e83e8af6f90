//! Enrichment of normalized records: summaries and category refinement.
//!
//! Two implementations behind one trait. The heuristic transformer is the
//! default and is pure; the LLM-assisted transformer refines only the rows
//! the heuristics could not place, and degrades to the heuristic answer on
//! any model failure.

use async_trait::async_trait;
use tracing::{debug, warn};

use glasspane_common::{truncate_chars, CanonicalLog, MAX_SUMMARY_CHARS};
use ollama_client::OllamaClient;

/// The closed category set enrichment may assign.
pub const LOG_CATEGORIES: [&str; 12] = [
    "authentication",
    "authorization",
    "data_access",
    "deployment",
    "error",
    "performance",
    "security",
    "system",
    "application",
    "network",
    "configuration",
    "other",
];

/// Size of the sub-batches sent to the model.
const LLM_SUB_BATCH: usize = 10;

#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform_batch(&self, logs: Vec<CanonicalLog>) -> Vec<CanonicalLog>;
}

// --- Heuristic ---

pub struct HeuristicTransformer;

impl HeuristicTransformer {
    pub fn new() -> Self {
        Self
    }

    fn transform(&self, mut log: CanonicalLog) -> CanonicalLog {
        if !log.message.is_empty() {
            log.message_summary = Some(truncate_chars(&log.message, MAX_SUMMARY_CHARS));
        }
        if let Some(category) = quick_classify(&log) {
            log.message_category = Some(category.to_string());
        }
        log
    }
}

impl Default for HeuristicTransformer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transformer for HeuristicTransformer {
    async fn transform_batch(&self, logs: Vec<CanonicalLog>) -> Vec<CanonicalLog> {
        logs.into_iter().map(|log| self.transform(log)).collect()
    }
}

/// Heuristic classification into the closed category set. Returns `None`
/// when nothing matches, leaving the normalizer's coarse category in place.
fn quick_classify(log: &CanonicalLog) -> Option<&'static str> {
    let message = log.message.to_lowercase();
    let service = log.service_name.to_lowercase();

    if log.is_audit || log.log_type == "audit" {
        if ["login", "signin", "auth", "token"].iter().any(|kw| message.contains(kw)) {
            return Some("authentication");
        }
        if ["permission", "access", "denied", "forbidden"]
            .iter()
            .any(|kw| message.contains(kw))
        {
            return Some("authorization");
        }
        if ["read", "write", "delete", "create", "update"]
            .iter()
            .any(|kw| message.contains(kw))
        {
            return Some("data_access");
        }
        return Some("security");
    }

    if service.contains("build") || message.contains("deploy") || log.log_type == "build" {
        return Some("deployment");
    }

    if log.is_error || log.error_message.is_some() {
        return Some("error");
    }

    if log.is_request || log.http_method.is_some() {
        if log.http_status.is_some_and(|s| s >= 400) {
            return Some("error");
        }
        if log.http_latency_ms.is_some_and(|l| l > 1000.0) {
            return Some("performance");
        }
        return Some("network");
    }

    if ["security", "threat", "attack", "vulnerability"]
        .iter()
        .any(|kw| message.contains(kw))
    {
        return Some("security");
    }

    if ["config", "setting", "environment"].iter().any(|kw| message.contains(kw)) {
        return Some("configuration");
    }

    if log.log_type == "system" || service.contains("syslog") {
        return Some("system");
    }

    None
}

// --- LLM-assisted ---

pub struct LlmTransformer {
    client: OllamaClient,
    model: String,
    heuristic: HeuristicTransformer,
}

impl LlmTransformer {
    pub fn new(client: OllamaClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
            heuristic: HeuristicTransformer::new(),
        }
    }

    /// A category is weak when heuristics left the normalizer's catch-all in
    /// place.
    fn is_weak(category: Option<&str>) -> bool {
        matches!(category, None | Some("info") | Some("debug") | Some("other"))
    }

    fn build_prompt(entries: &[(usize, &CanonicalLog)]) -> String {
        let mut lines = Vec::with_capacity(entries.len());
        for (idx, log) in entries {
            lines.push(format!(
                "{idx}. [{}] {}: {}",
                log.severity,
                log.service_name,
                truncate_chars(&log.message, 200)
            ));
        }
        format!(
            "Classify each log into ONE category from: {}\n\
             Respond with one line per log, format: NUMBER. category\n\n{}\n\nClassifications:",
            LOG_CATEGORIES.join(", "),
            lines.join("\n")
        )
    }

    fn parse_response(response: &str, max_index: usize) -> Vec<(usize, String)> {
        let mut out = Vec::new();
        for line in response.lines() {
            let Some((idx_str, category)) = line.split_once(". ") else {
                continue;
            };
            let Ok(idx) = idx_str.trim().parse::<usize>() else {
                continue;
            };
            let category = category.trim().to_lowercase().replace(' ', "_");
            if idx < max_index && LOG_CATEGORIES.contains(&category.as_str()) {
                out.push((idx, category));
            }
        }
        out
    }
}

#[async_trait]
impl Transformer for LlmTransformer {
    async fn transform_batch(&self, logs: Vec<CanonicalLog>) -> Vec<CanonicalLog> {
        let mut logs = self.heuristic.transform_batch(logs).await;

        let weak: Vec<usize> = logs
            .iter()
            .enumerate()
            .filter(|(_, log)| Self::is_weak(log.message_category.as_deref()))
            .map(|(i, _)| i)
            .collect();

        if weak.is_empty() {
            return logs;
        }

        for chunk in weak.chunks(LLM_SUB_BATCH) {
            let entries: Vec<(usize, &CanonicalLog)> =
                chunk.iter().map(|&i| (i, &logs[i])).collect();
            let prompt = Self::build_prompt(&entries);

            match self.client.generate(&self.model, &prompt).await {
                Ok(response) => {
                    for (idx, category) in Self::parse_response(&response, logs.len()) {
                        debug!(idx, category, "Model refined category");
                        logs[idx].message_category = Some(category);
                    }
                }
                Err(e) => {
                    // Heuristic answers stand when the model is unavailable.
                    warn!(error = %e, "Category enrichment failed, keeping heuristics");
                }
            }
        }

        logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use glasspane_common::{PiiRisk, Severity, StreamDirection, StreamFlow};
    use uuid::Uuid;

    fn canonical(severity: Severity, message: &str) -> CanonicalLog {
        let now = Utc::now();
        CanonicalLog {
            log_id: Uuid::new_v4(),
            insert_id: None,
            event_timestamp: now,
            receive_timestamp: None,
            etl_timestamp: None,
            severity,
            severity_level: severity.level(),
            log_type: "application".to_string(),
            source_dataset: "d".to_string(),
            source_table: "t".to_string(),
            source_log_name: None,
            stream_id: "d.t".to_string(),
            stream_direction: StreamDirection::Internal,
            stream_flow: StreamFlow::Batch,
            stream_coordinates: serde_json::Value::Null,
            resource_type: None,
            resource_project: None,
            resource_name: None,
            resource_location: None,
            resource_labels: None,
            service_name: "svc".to_string(),
            service_version: None,
            service_method: None,
            message: message.to_string(),
            message_summary: None,
            message_category: Some("info".to_string()),
            text_payload: None,
            json_payload: None,
            proto_payload: None,
            audit_payload: None,
            http_method: None,
            http_url: None,
            http_status: None,
            http_latency_ms: None,
            http_user_agent: None,
            http_remote_ip: None,
            http_request_size: None,
            http_response_size: None,
            http_full: None,
            trace_id: None,
            span_id: None,
            trace_sampled: None,
            parent_span_id: None,
            operation_id: None,
            operation_producer: None,
            operation_first: None,
            operation_last: None,
            source_file: None,
            source_line: None,
            source_function: None,
            labels: None,
            principal_email: None,
            principal_type: None,
            caller_ip: None,
            caller_network: None,
            error_message: None,
            error_code: None,
            error_stack_trace: None,
            error_group_id: None,
            is_error: severity.level() >= 500,
            is_audit: false,
            is_request: false,
            has_trace: false,
            schema_version: "1.0.0".to_string(),
            environment: None,
            correlation_request_id: None,
            correlation_session_id: None,
            correlation_conversation_id: None,
            privacy_pii_risk: PiiRisk::None,
            privacy_redaction_state: "none".to_string(),
            privacy_retention_class: "standard".to_string(),
            etl_version: None,
            etl_batch_id: None,
            log_date: now.date_naive(),
            cluster_key: format!("{severity}:svc"),
        }
    }

    #[tokio::test]
    async fn heuristic_classifies_errors() {
        let logs = vec![canonical(Severity::Error, "kaboom")];
        let out = HeuristicTransformer::new().transform_batch(logs).await;
        assert_eq!(out[0].message_category.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn heuristic_classifies_slow_requests_as_performance() {
        let mut log = canonical(Severity::Info, "GET /");
        log.is_request = true;
        log.http_status = Some(200);
        log.http_latency_ms = Some(2500.0);
        let out = HeuristicTransformer::new().transform_batch(vec![log]).await;
        assert_eq!(out[0].message_category.as_deref(), Some("performance"));
    }

    #[tokio::test]
    async fn heuristic_leaves_plain_info_alone() {
        let logs = vec![canonical(Severity::Info, "started listener")];
        let out = HeuristicTransformer::new().transform_batch(logs).await;
        assert_eq!(out[0].message_category.as_deref(), Some("info"));
    }

    #[test]
    fn audit_logs_route_to_auth_categories() {
        let mut log = canonical(Severity::Notice, "user login via token");
        log.is_audit = true;
        assert_eq!(quick_classify(&log), Some("authentication"));

        let mut log = canonical(Severity::Notice, "permission denied on bucket");
        log.is_audit = true;
        assert_eq!(quick_classify(&log), Some("authorization"));
    }

    #[test]
    fn parse_response_filters_unknown_categories() {
        let response = "0. security\n1. nonsense\n2. data_access\nbad line\n9. error";
        let parsed = LlmTransformer::parse_response(response, 3);
        assert_eq!(parsed, vec![(0, "security".to_string()), (2, "data_access".to_string())]);
    }

    #[test]
    fn weak_categories_are_the_catch_alls() {
        assert!(LlmTransformer::is_weak(Some("info")));
        assert!(LlmTransformer::is_weak(Some("other")));
        assert!(LlmTransformer::is_weak(None));
        assert!(!LlmTransformer::is_weak(Some("security")));
    }

    #[test]
    fn prompt_numbers_entries_by_index() {
        let a = canonical(Severity::Info, "alpha");
        let b = canonical(Severity::Warning, "beta");
        let prompt = LlmTransformer::build_prompt(&[(0, &a), (3, &b)]);
        assert!(prompt.contains("0. [INFO] svc: alpha"));
        assert!(prompt.contains("3. [WARNING] svc: beta"));
    }
}
