pub mod checkpoint;
pub mod embedder;
pub mod fetcher;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod record;
pub mod tuner;
pub mod worker;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use checkpoint::{Checkpoint, CheckpointStore, GlobalCheckpoint, RedisCheckpointStore};
pub use embedder::{EmbedCache, OllamaEmbedder, TextEmbedder};
pub use fetcher::{FetchSource, RecordFetcher, WarehouseFetcher};
pub use job::EmbeddingJob;
pub use metrics::{BatchSizes, LatencyStats, MetricsStore, RedisMetricsStore};
pub use queue::{JobQueue, QueuePeek, QueueStats, RedisJobQueue};
pub use record::{chunk_text, point_id, LogEntry};
pub use tuner::{BatchTuner, TunerConfig, TunerStats};
pub use worker::{EmbeddingWorker, WorkerConfig, WorkerStatus};
pub use writer::{QdrantWriter, VectorSink, DEFAULT_COLLECTION};
