//! The long-running embedding worker: drains the job queue, embeds pages of
//! logs, upserts them into the vector index, and advances checkpoints.
//!
//! Single-threaded and cooperative: one job in flight, with yield points
//! between sub-batches. Scale-out is more worker processes on the same
//! queue; stable point ids and post-upsert checkpointing keep duplicate work
//! harmless.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use qdrant_http::Point;

use glasspane_common::GlasspaneError;

use crate::checkpoint::{CheckpointStore, GlobalCheckpoint};
use crate::embedder::{embed_in_batches, is_zero_vector, TextEmbedder};
use crate::fetcher::RecordFetcher;
use crate::job::EmbeddingJob;
use crate::queue::{enqueue_next_batch, JobQueue, QueueStats};
use crate::record::{chunk_text, point_id, MAX_TRACE_TEXT_CHARS};
use crate::tuner::{BatchTuner, TunerStats};
use crate::writer::VectorSink;

type Result<T> = std::result::Result<T, GlasspaneError>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Blocking dequeue timeout; also bounds shutdown latency.
    pub dequeue_timeout: Duration,
    /// Attempts per job before it is dead-lettered.
    pub max_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            dequeue_timeout: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub jobs_processed: u64,
    pub logs_embedded: u64,
    pub queues: QueueStats,
    pub tuner: TunerStats,
    pub global: Option<GlobalCheckpoint>,
}

pub struct EmbeddingWorker {
    config: WorkerConfig,
    queue: Arc<dyn JobQueue>,
    checkpoints: Arc<dyn CheckpointStore>,
    fetcher: Arc<dyn RecordFetcher>,
    embedder: Arc<dyn TextEmbedder>,
    sink: Arc<dyn VectorSink>,
    tuner: Arc<BatchTuner>,
    running: Arc<AtomicBool>,
    jobs_processed: AtomicU64,
    logs_embedded: AtomicU64,
}

impl EmbeddingWorker {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn JobQueue>,
        checkpoints: Arc<dyn CheckpointStore>,
        fetcher: Arc<dyn RecordFetcher>,
        embedder: Arc<dyn TextEmbedder>,
        sink: Arc<dyn VectorSink>,
        tuner: Arc<BatchTuner>,
    ) -> Self {
        Self {
            config,
            queue,
            checkpoints,
            fetcher,
            embedder,
            sink,
            tuner,
            running: Arc::new(AtomicBool::new(false)),
            jobs_processed: AtomicU64::new(0),
            logs_embedded: AtomicU64::new(0),
        }
    }

    /// Flag checked before every dequeue; flip it to false from a signal
    /// handler for graceful shutdown after the current job.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Main loop: dequeue → process → repeat, until the running flag drops.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("Embedding worker started");

        while self.running.load(Ordering::SeqCst) {
            match self.queue.dequeue(self.config.dequeue_timeout).await {
                Ok(Some(job)) => self.handle_job(job).await,
                Ok(None) => tokio::time::sleep(self.config.poll_interval).await,
                Err(e) => {
                    error!(error = %e, "Queue error in worker loop");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }

        info!(
            jobs = self.jobs_processed.load(Ordering::Relaxed),
            logs = self.logs_embedded.load(Ordering::Relaxed),
            "Worker stopped"
        );
    }

    /// Run one job, routing failures into retry or the dead-letter queue.
    /// The worker itself never crashes on a bad job.
    pub async fn handle_job(&self, mut job: EmbeddingJob) {
        info!(
            job_id = %job.job_id,
            table = %job.table,
            offset = job.offset,
            "Processing job"
        );

        match self.process_job(&job).await {
            Ok(upserted) => {
                self.jobs_processed.fetch_add(1, Ordering::Relaxed);
                self.logs_embedded.fetch_add(upserted, Ordering::Relaxed);
                info!(job_id = %job.job_id, upserted, "Completed job");
            }
            Err(e) => {
                job.retry_count += 1;
                if job.retry_count < self.config.max_retries {
                    warn!(
                        job_id = %job.job_id,
                        retry = job.retry_count,
                        error = %e,
                        "Job failed, re-enqueueing"
                    );
                    if let Err(enqueue_err) = self.queue.enqueue(&job).await {
                        error!(error = %enqueue_err, "Could not re-enqueue failed job");
                    }
                } else {
                    error!(job_id = %job.job_id, error = %e, "Job exhausted retries");
                    if let Err(dl_err) = self.queue.mark_failed(&job, &e.to_string()).await {
                        error!(error = %dl_err, "Could not dead-letter job");
                    }
                }
            }
        }
    }

    /// One job: fetch a page, embed its chunks, upsert, advance checkpoints,
    /// and chain the next page while pages stay full.
    async fn process_job(&self, job: &EmbeddingJob) -> Result<u64> {
        let entries = self
            .fetcher
            .fetch(&job.table, job.offset, job.batch_size)
            .await?;

        if entries.is_empty() {
            info!(table = %job.table, offset = job.offset, "No rows at offset");
            return Ok(0);
        }
        let rows_fetched = entries.len() as i64;

        // One trace text per row, split into stable chunks.
        let mut chunk_refs: Vec<(usize, usize)> = Vec::new();
        let mut texts: Vec<String> = Vec::new();
        for (entry_idx, entry) in entries.iter().enumerate() {
            for (chunk_idx, chunk) in chunk_text(&entry.full_trace_text(), MAX_TRACE_TEXT_CHARS)
                .into_iter()
                .enumerate()
            {
                chunk_refs.push((entry_idx, chunk_idx));
                texts.push(chunk);
            }
        }

        let vectors = embed_in_batches(self.embedder.as_ref(), &self.tuner, &texts).await;

        // Zero vectors are placeholders for failed embeds; a later pass
        // overwrites them, so they never reach the index.
        let points: Vec<Point> = chunk_refs
            .iter()
            .zip(vectors)
            .filter(|(_, vector)| !is_zero_vector(vector))
            .map(|((entry_idx, chunk_idx), vector)| {
                let entry = &entries[*entry_idx];
                Point {
                    id: point_id(entry.log_id, *chunk_idx),
                    vector,
                    payload: entry.to_point_payload(),
                }
            })
            .collect();

        let mut upserted = 0u64;
        let mut index = 0;
        while index < points.len() {
            let size = self.tuner.upsert_batch_size().max(1);
            let end = (index + size).min(points.len());
            upserted += self.sink.upsert(points[index..end].to_vec()).await? as u64;
            index = end;
            tokio::task::yield_now().await;
        }

        // Checkpoint moves only after the page's upserts landed.
        let new_offset = job.offset + rows_fetched;
        let prior_total = self
            .checkpoints
            .get(&job.table)
            .await
            .ok()
            .flatten()
            .map(|c| c.total)
            .unwrap_or(0);
        self.checkpoints
            .set(&job.table, new_offset, prior_total)
            .await?;

        enqueue_next_batch(self.queue.as_ref(), job, rows_fetched).await?;

        let global = self
            .checkpoints
            .get_global()
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        self.checkpoints
            .set_global(global.tables_completed, global.total_embedded + upserted as i64)
            .await?;

        Ok(upserted)
    }

    pub async fn status(&self) -> WorkerStatus {
        WorkerStatus {
            running: self.running.load(Ordering::SeqCst),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            logs_embedded: self.logs_embedded.load(Ordering::Relaxed),
            queues: self.queue.stats().await.unwrap_or_default(),
            tuner: self.tuner.stats().await,
            global: self.checkpoints.get_global().await.ok().flatten(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::BatchSizes;
    use crate::record::point_id;
    use crate::testing::{
        entries_for, FailingSink, FixedEmbedder, InMemoryCheckpoints, InMemoryMetrics,
        InMemoryQueue, RecordingSink, StaticFetcher,
    };
    use crate::tuner::TunerConfig;

    fn worker_with(
        fetcher: StaticFetcher,
        sink: Arc<dyn VectorSink>,
    ) -> (EmbeddingWorker, Arc<InMemoryQueue>, Arc<InMemoryCheckpoints>) {
        let queue = Arc::new(InMemoryQueue::new());
        let checkpoints = Arc::new(InMemoryCheckpoints::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let tuner = Arc::new(BatchTuner::new(metrics, TunerConfig::default()));
        let worker = EmbeddingWorker::new(
            WorkerConfig::default(),
            queue.clone(),
            checkpoints.clone(),
            Arc::new(fetcher),
            Arc::new(FixedEmbedder::new(64)),
            sink,
            tuner,
        );
        (worker, queue, checkpoints)
    }

    #[tokio::test]
    async fn full_page_advances_checkpoint_and_chains_next_job() {
        let fetcher = StaticFetcher::new("d.t", entries_for("d.t", 4));
        let sink = Arc::new(RecordingSink::new());
        let (worker, queue, checkpoints) = worker_with(fetcher, sink.clone());

        let job = EmbeddingJob::create("d.t", 0, 4, true);
        worker.handle_job(job.clone()).await;

        // All four rows became points with stable ids derived from
        // (log_id, chunk_idx).
        let points = sink.points();
        assert_eq!(points.len(), 4);
        let expected: Vec<_> = entries_for("d.t", 4)
            .iter()
            .map(|e| point_id(e.log_id, 0))
            .collect();
        for point in &points {
            assert!(expected.contains(&point.id));
        }

        let checkpoint = checkpoints.get("d.t").await.unwrap().unwrap();
        assert_eq!(checkpoint.offset, 4);

        // Page was full, so the next page is queued with priority preserved.
        let next = queue.dequeue(Duration::from_secs(0)).await.unwrap().unwrap();
        assert_eq!(next.offset, 4);
        assert_eq!(next.batch_size, 4);
        assert!(next.priority);

        let global = checkpoints.get_global().await.unwrap().unwrap();
        assert_eq!(global.total_embedded, 4);

        let status = worker.status().await;
        assert_eq!(status.jobs_processed, 1);
        assert_eq!(status.logs_embedded, 4);
        // The chained job was already drained above.
        assert_eq!(status.queues.priority, 0);
    }

    #[tokio::test]
    async fn point_ids_are_stable_across_repeat_runs() {
        let entries = entries_for("d.t", 2);
        let expected: Vec<_> = entries.iter().map(|e| point_id(e.log_id, 0)).collect();

        let fetcher = StaticFetcher::new("d.t", entries);
        let sink = Arc::new(RecordingSink::new());
        let (worker, _, _) = worker_with(fetcher, sink.clone());

        worker.handle_job(EmbeddingJob::create("d.t", 0, 10, false)).await;
        worker.handle_job(EmbeddingJob::create("d.t", 0, 10, false)).await;

        let points = sink.points();
        assert_eq!(points.len(), 4);
        assert_eq!(points[0].id, expected[0]);
        assert_eq!(points[2].id, expected[0]);
        assert_eq!(points[3].id, expected[1]);
    }

    #[tokio::test]
    async fn short_page_does_not_chain() {
        let fetcher = StaticFetcher::new("d.t", entries_for("d.t", 2));
        let sink = Arc::new(RecordingSink::new());
        let (worker, queue, _) = worker_with(fetcher, sink);

        worker.handle_job(EmbeddingJob::create("d.t", 0, 10, false)).await;

        assert!(queue.dequeue(Duration::from_secs(0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_vectors_never_reach_the_sink() {
        let fetcher = StaticFetcher::new("d.t", entries_for("d.t", 3));
        let sink = Arc::new(RecordingSink::new());

        let queue = Arc::new(InMemoryQueue::new());
        let checkpoints = Arc::new(InMemoryCheckpoints::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let tuner = Arc::new(BatchTuner::new(metrics, TunerConfig::default()));
        // An embedder that fails every call produces only zero vectors.
        let worker = EmbeddingWorker::new(
            WorkerConfig::default(),
            queue,
            checkpoints.clone(),
            Arc::new(fetcher),
            Arc::new(FixedEmbedder::always_failing(64)),
            sink.clone(),
            tuner,
        );

        worker.handle_job(EmbeddingJob::create("d.t", 0, 10, false)).await;

        assert!(sink.points().is_empty());
        // The page still counts as processed: checkpoint advances so a later
        // pass can overwrite the gap.
        assert_eq!(checkpoints.get("d.t").await.unwrap().unwrap().offset, 3);
    }

    #[tokio::test]
    async fn failing_job_retries_then_dead_letters() {
        let fetcher = StaticFetcher::new("d.t", entries_for("d.t", 2));
        let sink = Arc::new(FailingSink);
        let (worker, queue, _) = worker_with(fetcher, sink);

        let job = EmbeddingJob::create("d.t", 0, 10, false);
        worker.handle_job(job).await;

        // First failure re-enqueues with retry_count 1.
        let retried = queue.dequeue(Duration::from_secs(0)).await.unwrap().unwrap();
        assert_eq!(retried.retry_count, 1);

        worker.handle_job(retried).await;
        let retried = queue.dequeue(Duration::from_secs(0)).await.unwrap().unwrap();
        assert_eq!(retried.retry_count, 2);

        // Third failure exhausts retries and dead-letters.
        worker.handle_job(retried).await;
        assert!(queue.dequeue(Duration::from_secs(0)).await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn batch_sizes_default_when_unpersisted() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let tuner = BatchTuner::new(metrics, TunerConfig::default());
        tuner.load_persisted().await;
        assert_eq!(tuner.embed_batch_size(), BatchSizes::default().embed);
        assert_eq!(tuner.upsert_batch_size(), BatchSizes::default().upsert);
    }
}
