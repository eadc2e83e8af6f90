//! In-memory mocks for the worker's trait boundaries: queue, checkpoint
//! store, metrics store, embedder, fetcher, and vector sink.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use glasspane_common::GlasspaneError;
use qdrant_http::Point;

use crate::checkpoint::{Checkpoint, CheckpointStore, GlobalCheckpoint};
use crate::embedder::TextEmbedder;
use crate::fetcher::RecordFetcher;
use crate::job::EmbeddingJob;
use crate::metrics::{BatchSizes, LatencyStats, MetricsStore, MAX_LATENCY_SAMPLES};
use crate::queue::{JobQueue, QueuePeek, QueueStats};
use crate::record::LogEntry;
use crate::writer::VectorSink;

type Result<T> = std::result::Result<T, GlasspaneError>;

/// Deterministic test entries: `log_id` is derived from `(table, index)` so
/// expectations can recompute point ids.
pub fn entries_for(table: &str, count: usize) -> Vec<LogEntry> {
    let (dataset, table_name) = table.split_once('.').unwrap_or(("unknown", table));
    (0..count)
        .map(|i| LogEntry {
            log_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{table}:{i}").as_bytes()),
            timestamp: "2025-06-01T00:00:00Z".parse().unwrap(),
            severity: "INFO".to_string(),
            service_name: "svc".to_string(),
            resource_type: "test".to_string(),
            table_name: table_name.to_string(),
            dataset: dataset.to_string(),
            text_payload: Some(format!("log line {i}")),
            json_payload: None,
            proto_payload: None,
            trace_id: None,
            span_id: None,
            trace_sampled: None,
            http_request: None,
            labels: Default::default(),
            resource_labels: Default::default(),
            source_location: None,
            operation: None,
        })
        .collect()
}

// --- InMemoryQueue ---

#[derive(Default)]
pub struct InMemoryQueue {
    priority: Mutex<VecDeque<EmbeddingJob>>,
    backlog: Mutex<VecDeque<EmbeddingJob>>,
    failed: Mutex<Vec<serde_json::Value>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, job: &EmbeddingJob) -> Result<()> {
        if job.priority {
            self.priority.lock().unwrap().push_back(job.clone());
        } else {
            self.backlog.lock().unwrap().push_back(job.clone());
        }
        Ok(())
    }

    async fn dequeue(&self, _timeout: Duration) -> Result<Option<EmbeddingJob>> {
        if let Some(job) = self.priority.lock().unwrap().pop_front() {
            return Ok(Some(job));
        }
        Ok(self.backlog.lock().unwrap().pop_front())
    }

    async fn mark_failed(&self, job: &EmbeddingJob, error: &str) -> Result<()> {
        let mut value = serde_json::to_value(job).unwrap();
        if let Some(map) = value.as_object_mut() {
            map.insert("error".into(), serde_json::json!(error));
            map.insert("failed_at".into(), serde_json::json!(Utc::now()));
        }
        self.failed.lock().unwrap().push(value);
        Ok(())
    }

    async fn retry_failed(&self, count: usize, to_priority: bool) -> Result<usize> {
        let mut moved = 0;
        for _ in 0..count {
            let Some(mut value) = ({
                let mut failed = self.failed.lock().unwrap();
                if failed.is_empty() { None } else { Some(failed.remove(0)) }
            }) else {
                break;
            };
            if let Some(map) = value.as_object_mut() {
                map.remove("error");
                map.remove("failed_at");
                let retries = map.get("retry_count").and_then(|v| v.as_u64()).unwrap_or(0);
                map.insert("retry_count".into(), serde_json::json!(retries + 1));
                map.insert("priority".into(), serde_json::json!(to_priority));
            }
            let job: EmbeddingJob =
                serde_json::from_value(value).map_err(|e| GlasspaneError::Queue(e.to_string()))?;
            self.enqueue(&job).await?;
            moved += 1;
        }
        Ok(moved)
    }

    async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            priority: self.priority.lock().unwrap().len() as i64,
            backlog: self.backlog.lock().unwrap().len() as i64,
            failed: self.failed.lock().unwrap().len() as i64,
        })
    }

    async fn peek(&self, count: usize) -> Result<QueuePeek> {
        let to_values = |jobs: &VecDeque<EmbeddingJob>| {
            jobs.iter()
                .take(count)
                .filter_map(|j| serde_json::to_value(j).ok())
                .collect()
        };
        Ok(QueuePeek {
            priority: to_values(&self.priority.lock().unwrap()),
            backlog: to_values(&self.backlog.lock().unwrap()),
            failed: self.failed.lock().unwrap().iter().take(count).cloned().collect(),
        })
    }

    async fn clear_all(&self) -> Result<QueueStats> {
        let stats = self.stats().await?;
        self.priority.lock().unwrap().clear();
        self.backlog.lock().unwrap().clear();
        self.failed.lock().unwrap().clear();
        Ok(stats)
    }
}

// --- InMemoryCheckpoints ---

#[derive(Default)]
pub struct InMemoryCheckpoints {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    global: Mutex<Option<GlobalCheckpoint>>,
}

impl InMemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpoints {
    async fn set(&self, table: &str, offset: i64, total: i64) -> Result<()> {
        self.checkpoints.lock().unwrap().insert(
            table.to_string(),
            Checkpoint {
                offset,
                total,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, table: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.lock().unwrap().get(table).cloned())
    }

    async fn all(&self) -> Result<HashMap<String, Checkpoint>> {
        Ok(self.checkpoints.lock().unwrap().clone())
    }

    async fn set_global(&self, tables_completed: i64, total_embedded: i64) -> Result<()> {
        *self.global.lock().unwrap() = Some(GlobalCheckpoint {
            tables_completed,
            total_embedded,
            updated_at: Some(Utc::now()),
        });
        Ok(())
    }

    async fn get_global(&self) -> Result<Option<GlobalCheckpoint>> {
        Ok(self.global.lock().unwrap().clone())
    }

    async fn delete(&self, table: &str) -> Result<()> {
        self.checkpoints.lock().unwrap().remove(table);
        Ok(())
    }

    async fn reset_all(&self) -> Result<usize> {
        let mut checkpoints = self.checkpoints.lock().unwrap();
        let mut count = checkpoints.len();
        checkpoints.clear();
        if self.global.lock().unwrap().take().is_some() {
            count += 1;
        }
        Ok(count)
    }
}

// --- InMemoryMetrics ---

#[derive(Default)]
pub struct InMemoryMetrics {
    latencies: Mutex<HashMap<String, Vec<f64>>>,
    errors: Mutex<HashMap<String, i64>>,
    batch_sizes: Mutex<Option<BatchSizes>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsStore for InMemoryMetrics {
    async fn record_latency(&self, service: &str, latency_ms: f64) -> Result<()> {
        let mut latencies = self.latencies.lock().unwrap();
        let samples = latencies.entry(service.to_string()).or_default();
        samples.insert(0, latency_ms);
        samples.truncate(MAX_LATENCY_SAMPLES);
        Ok(())
    }

    async fn latency_stats(&self, service: &str) -> Result<LatencyStats> {
        let latencies = self.latencies.lock().unwrap();
        Ok(LatencyStats::from_samples(
            latencies.get(service).map(|s| s.as_slice()).unwrap_or(&[]),
        ))
    }

    async fn increment_errors(&self, service: &str) -> Result<i64> {
        let mut errors = self.errors.lock().unwrap();
        let count = errors.entry(service.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn error_count(&self, service: &str) -> Result<i64> {
        Ok(*self.errors.lock().unwrap().get(service).unwrap_or(&0))
    }

    async fn reset_errors(&self, service: &str) -> Result<()> {
        self.errors.lock().unwrap().remove(service);
        Ok(())
    }

    async fn optimal_batch_sizes(&self) -> Result<BatchSizes> {
        Ok(self.batch_sizes.lock().unwrap().unwrap_or_default())
    }

    async fn set_optimal_batch_sizes(&self, sizes: BatchSizes) -> Result<()> {
        *self.batch_sizes.lock().unwrap() = Some(sizes);
        Ok(())
    }
}

// --- FixedEmbedder ---

/// Deterministic embedder: the vector is a simple function of the text bytes.
/// `always_failing` mode returns zero vectors, as the real wrapper does on
/// endpoint failure.
pub struct FixedEmbedder {
    dim: usize,
    failing: bool,
}

impl FixedEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim, failing: false }
    }

    pub fn always_failing(dim: usize) -> Self {
        Self { dim, failing: true }
    }
}

#[async_trait]
impl TextEmbedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Vec<f32> {
        if self.failing {
            return vec![0.0; self.dim];
        }
        let mut vector = vec![0.0f32; self.dim];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % self.dim] += byte as f32 / 255.0;
        }
        vector
    }

    fn vector_size(&self) -> usize {
        self.dim
    }
}

// --- StaticFetcher ---

/// Serves a fixed set of rows for one table, honoring offset and limit.
pub struct StaticFetcher {
    table: String,
    entries: Vec<LogEntry>,
}

impl StaticFetcher {
    pub fn new(table: &str, entries: Vec<LogEntry>) -> Self {
        Self {
            table: table.to_string(),
            entries,
        }
    }
}

#[async_trait]
impl RecordFetcher for StaticFetcher {
    async fn fetch(&self, table: &str, offset: i64, limit: i64) -> Result<Vec<LogEntry>> {
        if table != self.table {
            return Ok(Vec::new());
        }
        let start = (offset as usize).min(self.entries.len());
        let end = (start + limit as usize).min(self.entries.len());
        Ok(self.entries[start..end].to_vec())
    }
}

// --- Sinks ---

/// Records every upserted point.
#[derive(Default)]
pub struct RecordingSink {
    points: Mutex<Vec<Point>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<Point> {
        self.points.lock().unwrap().clone()
    }
}

#[async_trait]
impl VectorSink for RecordingSink {
    async fn upsert(&self, points: Vec<Point>) -> Result<usize> {
        let count = points.len();
        self.points.lock().unwrap().extend(points);
        Ok(count)
    }

    fn collection(&self) -> &str {
        "test_collection"
    }
}

/// Fails every upsert.
pub struct FailingSink;

#[async_trait]
impl VectorSink for FailingSink {
    async fn upsert(&self, _points: Vec<Point>) -> Result<usize> {
        Err(GlasspaneError::VectorStore("sink unavailable".to_string()))
    }

    fn collection(&self) -> &str {
        "test_collection"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_round_trip() {
        let queue = InMemoryQueue::new();
        let job = EmbeddingJob::create("d.t", 0, 10, false);
        queue.enqueue(&job).await.unwrap();
        let popped = queue.dequeue(Duration::from_secs(0)).await.unwrap().unwrap();
        assert_eq!(popped, job);
        assert!(queue.dequeue(Duration::from_secs(0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn priority_queue_drains_first() {
        let queue = InMemoryQueue::new();
        queue.enqueue(&EmbeddingJob::create("d.a", 0, 10, false)).await.unwrap();
        queue.enqueue(&EmbeddingJob::create("d.b", 0, 10, true)).await.unwrap();

        let first = queue.dequeue(Duration::from_secs(0)).await.unwrap().unwrap();
        assert_eq!(first.table, "d.b");
    }

    #[tokio::test]
    async fn failed_jobs_restore_with_retry_bump_and_no_error_fields() {
        let queue = InMemoryQueue::new();
        let job = EmbeddingJob::create("d.t", 5, 10, false);
        queue.mark_failed(&job, "boom").await.unwrap();

        let moved = queue.retry_failed(1, false).await.unwrap();
        assert_eq!(moved, 1);

        let restored = queue.dequeue(Duration::from_secs(0)).await.unwrap().unwrap();
        assert_eq!(restored.retry_count, job.retry_count + 1);
        assert_eq!(restored.table, job.table);
        assert_eq!(restored.offset, job.offset);
    }

    #[tokio::test]
    async fn retry_failed_can_promote_to_priority() {
        let queue = InMemoryQueue::new();
        queue
            .mark_failed(&EmbeddingJob::create("d.t", 0, 10, false), "boom")
            .await
            .unwrap();
        queue.retry_failed(5, true).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.priority, 1);
        assert_eq!(stats.backlog, 0);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn fixed_embedder_is_deterministic() {
        let embedder = FixedEmbedder::new(8);
        assert_eq!(embedder.embed("abc").await, embedder.embed("abc").await);
        assert_ne!(embedder.embed("abc").await, embedder.embed("abd").await);
    }
}
