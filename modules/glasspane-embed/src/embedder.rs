//! Embedding with metrics, caching, and zero-vector degradation.
//!
//! The wrapper never fails: a hard endpoint error yields a zero vector of the
//! expected dimension so the job can finish, and a later pass overwrites the
//! placeholder point. Every attempt records its wall-clock latency; cache
//! hits skip both the call and the sample.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use ollama_client::OllamaClient;

use crate::tuner::BatchTuner;

/// Cached embeddings expire after a day.
const CACHE_TTL_SECS: u64 = 86_400;
const CACHE_PREFIX: &str = "embed_cache:";

#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Embed one text. Infallible by contract: failures produce a zero
    /// vector of `vector_size()` length.
    async fn embed(&self, text: &str) -> Vec<f32>;

    /// The dimension every returned vector has. Fixed by the first
    /// successful response.
    fn vector_size(&self) -> usize;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbedderMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Redis-backed cache keyed by `sha256("<model>|<text>")`.
#[derive(Clone)]
pub struct EmbedCache {
    conn: ConnectionManager,
}

impl EmbedCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(model: &str, text: &str) -> String {
        let digest = Sha256::digest(format!("{model}|{text}").as_bytes());
        format!("{CACHE_PREFIX}{digest:x}")
    }

    async fn get(&self, model: &str, text: &str) -> Option<Vec<f32>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(Self::key(model, text)).await.ok().flatten();
        payload.and_then(|p| serde_json::from_str(&p).ok())
    }

    async fn set(&self, model: &str, text: &str, vector: &[f32]) {
        let Ok(payload) = serde_json::to_string(vector) else {
            return;
        };
        let mut conn = self.conn.clone();
        let result: Result<(), _> = conn
            .set_ex(Self::key(model, text), payload, CACHE_TTL_SECS)
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Embed cache write failed");
        }
    }
}

pub struct OllamaEmbedder {
    client: OllamaClient,
    tuner: Arc<BatchTuner>,
    cache: Option<EmbedCache>,
    vector_size: AtomicUsize,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl OllamaEmbedder {
    pub fn new(
        client: OllamaClient,
        tuner: Arc<BatchTuner>,
        cache: Option<EmbedCache>,
        expected_dim: usize,
    ) -> Self {
        Self {
            client,
            tuner,
            cache,
            vector_size: AtomicUsize::new(expected_dim),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    pub fn metrics(&self) -> EmbedderMetrics {
        EmbedderMetrics {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl TextEmbedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Vec<f32> {
        if let Some(cache) = &self.cache {
            if let Some(vector) = cache.get(self.client.embed_model(), text).await {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return vector;
            }
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let start = Instant::now();
        match self.client.embed(text).await {
            Ok(vector) => {
                self.tuner
                    .record_embed_latency(start.elapsed().as_secs_f64() * 1000.0, true)
                    .await;

                // The first successful response fixes the dimension.
                self.vector_size.store(vector.len(), Ordering::Relaxed);

                if let Some(cache) = &self.cache {
                    cache.set(self.client.embed_model(), text, &vector).await;
                }
                vector
            }
            Err(e) => {
                self.tuner
                    .record_embed_latency(start.elapsed().as_secs_f64() * 1000.0, false)
                    .await;
                warn!(error = %e, "Embedding failed, returning zero vector");
                vec![0.0; self.vector_size()]
            }
        }
    }

    fn vector_size(&self) -> usize {
        self.vector_size.load(Ordering::Relaxed)
    }
}

/// A vector is a placeholder when every component is zero.
pub fn is_zero_vector(vector: &[f32]) -> bool {
    vector.iter().all(|v| *v == 0.0)
}

/// Embed texts in tuner-sized sub-batches, yielding to the scheduler between
/// sub-batches so shutdown signals stay responsive.
pub async fn embed_in_batches(
    embedder: &dyn TextEmbedder,
    tuner: &BatchTuner,
    texts: &[String],
) -> Vec<Vec<f32>> {
    let mut vectors = Vec::with_capacity(texts.len());

    let mut index = 0;
    while index < texts.len() {
        let size = tuner.embed_batch_size().max(1);
        let end = (index + size).min(texts.len());

        for text in &texts[index..end] {
            vectors.push(embedder.embed(text).await);
        }
        debug!(embedded = end, total = texts.len(), "Embed sub-batch done");

        index = end;
        tokio::task::yield_now().await;
    }

    vectors
}
