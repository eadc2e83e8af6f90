//! Vector index writer: collection management with dimension auto-switch,
//! and retried, metered upserts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use glasspane_common::GlasspaneError;
use qdrant_http::{Distance, FieldSchema, Point, QdrantClient};

use crate::tuner::BatchTuner;

/// Default collection name; the qwen3 suffix rule below is tied to it.
pub const DEFAULT_COLLECTION: &str = "logs_embedded";

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 2;

const KEYWORD_INDEXES: [&str; 5] = [
    "severity",
    "service_name",
    "resource_type",
    "dataset",
    "table_name",
];
const INTEGER_INDEXES: [&str; 4] = [
    "timestamp.year",
    "timestamp.month",
    "timestamp.day",
    "timestamp.hour",
];

type Result<T> = std::result::Result<T, GlasspaneError>;

#[async_trait]
pub trait VectorSink: Send + Sync {
    /// Upsert points idempotently. Returns how many points were written.
    async fn upsert(&self, points: Vec<Point>) -> Result<usize>;

    /// The collection actually being written (after any dimension switch).
    fn collection(&self) -> &str;
}

pub struct QdrantWriter {
    client: QdrantClient,
    collection: String,
    vector_size: u64,
    tuner: Arc<BatchTuner>,
}

impl QdrantWriter {
    /// Connect and make sure the target collection exists with the expected
    /// dimension. An existing collection with a different dimension is never
    /// altered; the writer targets a suffixed collection instead.
    pub async fn connect(
        client: QdrantClient,
        collection: &str,
        vector_size: u64,
        tuner: Arc<BatchTuner>,
    ) -> anyhow::Result<Self> {
        let mut target = collection.to_string();

        let names = client.list_collections().await?;
        let mut exists = names.contains(&target);

        if exists {
            match client.collection_info(&target).await {
                Ok(info) => {
                    if info.vector_size != vector_size {
                        let switched = dimension_suffixed(&target, vector_size);
                        warn!(
                            collection = %target,
                            existing_dim = info.vector_size,
                            wanted_dim = vector_size,
                            switched_to = %switched,
                            "Dimension mismatch, switching collection"
                        );
                        target = switched;
                        exists = names.contains(&target);
                    }
                }
                Err(e) => warn!(error = %e, "Could not inspect existing collection"),
            }
        }

        if !exists {
            client
                .create_collection(&target, vector_size, Distance::Cosine)
                .await?;

            for field in KEYWORD_INDEXES {
                if let Err(e) = client
                    .create_payload_index(&target, field, FieldSchema::Keyword)
                    .await
                {
                    warn!(field, error = %e, "Could not create payload index");
                }
            }
            for field in INTEGER_INDEXES {
                if let Err(e) = client
                    .create_payload_index(&target, field, FieldSchema::Integer)
                    .await
                {
                    warn!(field, error = %e, "Could not create payload index");
                }
            }

            info!(collection = %target, dim = vector_size, "Created collection with indexes");
        }

        Ok(Self {
            client,
            collection: target,
            vector_size,
            tuner,
        })
    }

    pub fn vector_size(&self) -> u64 {
        self.vector_size
    }
}

#[async_trait]
impl VectorSink for QdrantWriter {
    async fn upsert(&self, points: Vec<Point>) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }

        let count = points.len();
        let start = Instant::now();

        let mut attempt = 0;
        let outcome = loop {
            match self.client.upsert_points(&self.collection, &points).await {
                Ok(()) => break Ok(count),
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        break Err(GlasspaneError::VectorStore(e.to_string()));
                    }
                    let backoff = RETRY_DELAY_SECS * 2u64.pow(attempt - 1);
                    warn!(error = %e, backoff, "Upsert failed, retrying");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                }
            }
        };

        self.tuner
            .record_upsert_latency(start.elapsed().as_secs_f64() * 1000.0, outcome.is_ok())
            .await;

        if outcome.is_ok() {
            info!(collection = %self.collection, count, "Upserted points");
        }
        outcome
    }

    fn collection(&self) -> &str {
        &self.collection
    }
}

/// The collection name used when the preferred one exists with another
/// dimension.
fn dimension_suffixed(collection: &str, vector_size: u64) -> String {
    if collection == DEFAULT_COLLECTION && vector_size == 1024 {
        "logs_embedded_qwen3".to_string()
    } else {
        format!("{collection}_v{vector_size}")
    }
}
