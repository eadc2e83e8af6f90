//! The unit of embedding work: one page of one stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Batch sizes are clamped into this range at creation.
pub const MIN_JOB_BATCH: i64 = 1;
pub const MAX_JOB_BATCH: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub job_id: Uuid,
    /// Stream id of the table to embed (`<dataset>.<table>`).
    pub table: String,
    pub offset: i64,
    pub batch_size: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub priority: bool,
}

impl EmbeddingJob {
    pub fn create(table: &str, offset: i64, batch_size: i64, priority: bool) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            table: table.to_string(),
            offset: offset.max(0),
            batch_size: batch_size.clamp(MIN_JOB_BATCH, MAX_JOB_BATCH),
            created_at: Utc::now(),
            retry_count: 0,
            priority,
        }
    }

    /// The follow-up job at the next page, keeping batch size and priority.
    pub fn next_page(&self, rows_processed: i64) -> Self {
        Self::create(
            &self.table,
            self.offset + rows_processed,
            self.batch_size,
            self.priority,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_is_clamped() {
        assert_eq!(EmbeddingJob::create("d.t", 0, 0, false).batch_size, 1);
        assert_eq!(EmbeddingJob::create("d.t", 0, 5000, false).batch_size, 1000);
        assert_eq!(EmbeddingJob::create("d.t", -5, 50, false).offset, 0);
    }

    #[test]
    fn next_page_advances_offset_and_keeps_priority() {
        let job = EmbeddingJob::create("d.t", 100, 50, true);
        let next = job.next_page(50);
        assert_eq!(next.table, "d.t");
        assert_eq!(next.offset, 150);
        assert_eq!(next.batch_size, 50);
        assert!(next.priority);
        assert_eq!(next.retry_count, 0);
    }

    #[test]
    fn job_round_trips_through_json() {
        let job = EmbeddingJob::create("d.t", 10, 25, false);
        let json = serde_json::to_string(&job).unwrap();
        let back: EmbeddingJob = serde_json::from_str(&json).unwrap();
        assert_eq!(job, back);
    }
}
