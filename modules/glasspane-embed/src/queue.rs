//! Priority / backlog / dead-letter queues over a Redis list broker.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::debug;

use glasspane_common::GlasspaneError;

use crate::job::EmbeddingJob;

pub const QUEUE_PRIORITY: &str = "q:embed:priority";
pub const QUEUE_BACKLOG: &str = "q:embed:backlog";
pub const QUEUE_FAILED: &str = "q:embed:failed";

type Result<T> = std::result::Result<T, GlasspaneError>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub priority: i64,
    pub backlog: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn total_pending(&self) -> i64 {
        self.priority + self.backlog
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueuePeek {
    pub priority: Vec<serde_json::Value>,
    pub backlog: Vec<serde_json::Value>,
    pub failed: Vec<serde_json::Value>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Push a job to the priority or backlog queue based on its flag.
    async fn enqueue(&self, job: &EmbeddingJob) -> Result<()>;

    /// Pop the next job: priority first (non-blocking), then backlog
    /// (blocking up to `timeout`).
    async fn dequeue(&self, timeout: Duration) -> Result<Option<EmbeddingJob>>;

    /// Move a job to the dead-letter queue, annotated with the failure.
    async fn mark_failed(&self, job: &EmbeddingJob, error: &str) -> Result<()>;

    /// Move up to `count` dead-lettered jobs back into a processing queue,
    /// bumping `retry_count` and clearing failure metadata. Returns how many
    /// were moved.
    async fn retry_failed(&self, count: usize, to_priority: bool) -> Result<usize>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Non-destructive look at the head of each queue.
    async fn peek(&self, count: usize) -> Result<QueuePeek>;

    /// Drop everything. Returns the per-queue counts that were cleared.
    async fn clear_all(&self) -> Result<QueueStats>;
}

#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
}

impl RedisJobQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn queue_err(e: impl std::fmt::Display) -> GlasspaneError {
        GlasspaneError::Queue(e.to_string())
    }

    async fn queue_len(&self, queue: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.llen(queue).await.map_err(Self::queue_err)
    }

    async fn peek_queue(&self, queue: &str, count: usize) -> Result<Vec<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn
            .lrange(queue, 0, count as isize - 1)
            .await
            .map_err(Self::queue_err)?;
        Ok(items
            .iter()
            .filter_map(|i| serde_json::from_str(i).ok())
            .collect())
    }

    async fn clear_queue(&self, queue: &str) -> Result<i64> {
        let len = self.queue_len(queue).await?;
        let mut conn = self.conn.clone();
        let _: () = conn.del(queue).await.map_err(Self::queue_err)?;
        Ok(len)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &EmbeddingJob) -> Result<()> {
        let queue = if job.priority { QUEUE_PRIORITY } else { QUEUE_BACKLOG };
        let payload = serde_json::to_string(job).map_err(Self::queue_err)?;

        let mut conn = self.conn.clone();
        let _: () = conn.rpush(queue, payload).await.map_err(Self::queue_err)?;

        debug!(job_id = %job.job_id, table = %job.table, offset = job.offset, queue, "Enqueued job");
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<EmbeddingJob>> {
        let mut conn = self.conn.clone();

        // Priority queue drains first, without blocking.
        let head: Option<String> = conn
            .lpop(QUEUE_PRIORITY, None)
            .await
            .map_err(Self::queue_err)?;
        if let Some(payload) = head {
            let job = serde_json::from_str(&payload).map_err(Self::queue_err)?;
            return Ok(Some(job));
        }

        let popped: Option<(String, String)> = conn
            .blpop(QUEUE_BACKLOG, timeout.as_secs_f64())
            .await
            .map_err(Self::queue_err)?;

        match popped {
            Some((_, payload)) => {
                let job = serde_json::from_str(&payload).map_err(Self::queue_err)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn mark_failed(&self, job: &EmbeddingJob, error: &str) -> Result<()> {
        let original_queue = if job.priority { QUEUE_PRIORITY } else { QUEUE_BACKLOG };

        let mut payload = serde_json::to_value(job).map_err(Self::queue_err)?;
        if let Some(map) = payload.as_object_mut() {
            map.insert("error".into(), serde_json::json!(error));
            map.insert("failed_at".into(), serde_json::json!(Utc::now()));
            map.insert("original_queue".into(), serde_json::json!(original_queue));
        }

        let mut conn = self.conn.clone();
        let _: () = conn
            .rpush(QUEUE_FAILED, payload.to_string())
            .await
            .map_err(Self::queue_err)?;

        debug!(job_id = %job.job_id, error, "Dead-lettered job");
        Ok(())
    }

    async fn retry_failed(&self, count: usize, to_priority: bool) -> Result<usize> {
        let target = if to_priority { QUEUE_PRIORITY } else { QUEUE_BACKLOG };
        let mut moved = 0;
        let mut conn = self.conn.clone();

        for _ in 0..count {
            let head: Option<String> = conn
                .lpop(QUEUE_FAILED, None)
                .await
                .map_err(Self::queue_err)?;
            let Some(payload) = head else { break };

            let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&payload) else {
                continue;
            };
            if let Some(map) = value.as_object_mut() {
                map.remove("error");
                map.remove("failed_at");
                map.remove("original_queue");
                let retries = map
                    .get("retry_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                map.insert("retry_count".into(), serde_json::json!(retries + 1));
                map.insert("priority".into(), serde_json::json!(to_priority));
            }

            let _: () = conn
                .rpush(target, value.to_string())
                .await
                .map_err(Self::queue_err)?;
            moved += 1;
        }

        Ok(moved)
    }

    async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            priority: self.queue_len(QUEUE_PRIORITY).await?,
            backlog: self.queue_len(QUEUE_BACKLOG).await?,
            failed: self.queue_len(QUEUE_FAILED).await?,
        })
    }

    async fn peek(&self, count: usize) -> Result<QueuePeek> {
        Ok(QueuePeek {
            priority: self.peek_queue(QUEUE_PRIORITY, count).await?,
            backlog: self.peek_queue(QUEUE_BACKLOG, count).await?,
            failed: self.peek_queue(QUEUE_FAILED, count).await?,
        })
    }

    async fn clear_all(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            priority: self.clear_queue(QUEUE_PRIORITY).await?,
            backlog: self.clear_queue(QUEUE_BACKLOG).await?,
            failed: self.clear_queue(QUEUE_FAILED).await?,
        })
    }
}

/// Enqueue the follow-up page for a completed job, but only when the page
/// was full. A short page means the table is drained.
pub async fn enqueue_next_batch(
    queue: &dyn JobQueue,
    completed: &EmbeddingJob,
    rows_processed: i64,
) -> Result<Option<EmbeddingJob>> {
    if rows_processed < completed.batch_size {
        return Ok(None);
    }
    let next = completed.next_page(rows_processed);
    queue.enqueue(&next).await?;
    Ok(Some(next))
}
