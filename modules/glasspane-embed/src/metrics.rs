//! Rolling latency samples and windowed error counters per downstream
//! service, plus the persisted adaptive batch sizes.
//!
//! Percentiles are computed in-process over the recorded samples.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use glasspane_common::GlasspaneError;

/// Service label for the embedding endpoint.
pub const SERVICE_EMBED: &str = "ollama";
/// Service label for the vector index.
pub const SERVICE_UPSERT: &str = "qdrant";

/// Rolling window length per service.
pub const MAX_LATENCY_SAMPLES: usize = 100;
/// Error counters expire after this many seconds of quiet.
pub const ERROR_WINDOW_SECS: i64 = 300;

type Result<T> = std::result::Result<T, GlasspaneError>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub samples: usize,
}

impl LatencyStats {
    /// Compute stats from raw samples (most recent first).
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted: Vec<f64> = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let percentile = |p: f64| -> f64 {
            let rank = (p * (sorted.len() - 1) as f64).round() as usize;
            sorted[rank.min(sorted.len() - 1)]
        };

        Self {
            avg: sorted.iter().sum::<f64>() / sorted.len() as f64,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p50: percentile(0.50),
            p95: percentile(0.95),
            samples: sorted.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSizes {
    pub embed: usize,
    pub upsert: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self { embed: 10, upsert: 20 }
    }
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn record_latency(&self, service: &str, latency_ms: f64) -> Result<()>;
    async fn latency_stats(&self, service: &str) -> Result<LatencyStats>;
    async fn increment_errors(&self, service: &str) -> Result<i64>;
    async fn error_count(&self, service: &str) -> Result<i64>;
    async fn reset_errors(&self, service: &str) -> Result<()>;
    async fn optimal_batch_sizes(&self) -> Result<BatchSizes>;
    async fn set_optimal_batch_sizes(&self, sizes: BatchSizes) -> Result<()>;
}

#[derive(Clone)]
pub struct RedisMetricsStore {
    conn: ConnectionManager,
}

impl RedisMetricsStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn store_err(e: impl std::fmt::Display) -> GlasspaneError {
        GlasspaneError::Queue(e.to_string())
    }
}

#[async_trait]
impl MetricsStore for RedisMetricsStore {
    async fn record_latency(&self, service: &str, latency_ms: f64) -> Result<()> {
        let key = format!("metrics:{service}:latency");
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(&key, latency_ms).await.map_err(Self::store_err)?;
        let _: () = conn
            .ltrim(&key, 0, MAX_LATENCY_SAMPLES as isize - 1)
            .await
            .map_err(Self::store_err)?;
        Ok(())
    }

    async fn latency_stats(&self, service: &str) -> Result<LatencyStats> {
        let key = format!("metrics:{service}:latency");
        let mut conn = self.conn.clone();
        let raw: Vec<f64> = conn.lrange(&key, 0, -1).await.map_err(Self::store_err)?;
        Ok(LatencyStats::from_samples(&raw))
    }

    async fn increment_errors(&self, service: &str) -> Result<i64> {
        let key = format!("metrics:{service}:errors");
        let mut conn = self.conn.clone();
        let count: i64 = conn.incr(&key, 1).await.map_err(Self::store_err)?;
        let _: () = conn
            .expire(&key, ERROR_WINDOW_SECS)
            .await
            .map_err(Self::store_err)?;
        Ok(count)
    }

    async fn error_count(&self, service: &str) -> Result<i64> {
        let key = format!("metrics:{service}:errors");
        let mut conn = self.conn.clone();
        let count: Option<i64> = conn.get(&key).await.map_err(Self::store_err)?;
        Ok(count.unwrap_or(0))
    }

    async fn reset_errors(&self, service: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(format!("metrics:{service}:errors"))
            .await
            .map_err(Self::store_err)?;
        Ok(())
    }

    async fn optimal_batch_sizes(&self) -> Result<BatchSizes> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .get("metrics:batch:optimal")
            .await
            .map_err(Self::store_err)?;
        Ok(payload
            .and_then(|p| serde_json::from_str::<serde_json::Value>(&p).ok())
            .map(|v| BatchSizes {
                embed: v.get("embed").and_then(|n| n.as_u64()).unwrap_or(10) as usize,
                upsert: v.get("upsert").and_then(|n| n.as_u64()).unwrap_or(20) as usize,
            })
            .unwrap_or_default())
    }

    async fn set_optimal_batch_sizes(&self, sizes: BatchSizes) -> Result<()> {
        let payload = serde_json::json!({
            "embed": sizes.embed,
            "upsert": sizes.upsert,
            "updated_at": Utc::now(),
        });
        let mut conn = self.conn.clone();
        let _: () = conn
            .set("metrics:batch:optimal", payload.to_string())
            .await
            .map_err(Self::store_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_from_empty_samples_are_zero() {
        let stats = LatencyStats::from_samples(&[]);
        assert_eq!(stats.samples, 0);
        assert_eq!(stats.avg, 0.0);
    }

    #[test]
    fn stats_compute_percentiles_client_side() {
        let samples: Vec<f64> = (1..=100).map(|n| n as f64).collect();
        let stats = LatencyStats::from_samples(&samples);
        assert_eq!(stats.samples, 100);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 100.0);
        assert!((stats.avg - 50.5).abs() < 1e-9);
        assert!((stats.p50 - 51.0).abs() <= 1.0);
        assert!((stats.p95 - 95.0).abs() <= 1.0);
    }

    #[test]
    fn default_batch_sizes_match_tuner_defaults() {
        let sizes = BatchSizes::default();
        assert_eq!(sizes.embed, 10);
        assert_eq!(sizes.upsert, 20);
    }
}
