//! Adaptive batch size tuning from latency and error-rate feedback.
//!
//! The tuner is the only mutator of the persisted optimal batch sizes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::metrics::{BatchSizes, LatencyStats, MetricsStore, SERVICE_EMBED, SERVICE_UPSERT};

#[derive(Debug, Clone)]
pub struct TunerConfig {
    pub min_embed_batch: usize,
    pub max_embed_batch: usize,
    pub min_upsert_batch: usize,
    pub max_upsert_batch: usize,
    /// Target per-operation latency in milliseconds.
    pub target_latency_ms: f64,
    /// Latency above this forces an aggressive step down.
    pub max_latency_ms: f64,
    pub max_error_rate: f64,
    pub increase_factor: f64,
    pub decrease_factor: f64,
    pub min_samples: usize,
    pub tuning_interval_secs: u64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            min_embed_batch: 5,
            max_embed_batch: 50,
            min_upsert_batch: 10,
            max_upsert_batch: 100,
            target_latency_ms: 500.0,
            max_latency_ms: 2000.0,
            max_error_rate: 0.05,
            increase_factor: 1.2,
            decrease_factor: 0.7,
            min_samples: 10,
            tuning_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TunerStats {
    pub embed_batch_size: usize,
    pub upsert_batch_size: usize,
    pub embed: LatencyStats,
    pub upsert: LatencyStats,
    pub embed_errors: i64,
    pub upsert_errors: i64,
}

pub struct BatchTuner {
    config: TunerConfig,
    metrics: Arc<dyn MetricsStore>,
    embed_batch: AtomicUsize,
    upsert_batch: AtomicUsize,
    last_tuned: Mutex<Instant>,
}

impl BatchTuner {
    pub fn new(metrics: Arc<dyn MetricsStore>, config: TunerConfig) -> Self {
        Self {
            config,
            metrics,
            embed_batch: AtomicUsize::new(BatchSizes::default().embed),
            upsert_batch: AtomicUsize::new(BatchSizes::default().upsert),
            last_tuned: Mutex::new(Instant::now()),
        }
    }

    /// Restore persisted batch sizes, if any.
    pub async fn load_persisted(&self) {
        match self.metrics.optimal_batch_sizes().await {
            Ok(sizes) => {
                self.embed_batch.store(
                    sizes.embed.clamp(self.config.min_embed_batch, self.config.max_embed_batch),
                    Ordering::Relaxed,
                );
                self.upsert_batch.store(
                    sizes
                        .upsert
                        .clamp(self.config.min_upsert_batch, self.config.max_upsert_batch),
                    Ordering::Relaxed,
                );
                info!(
                    embed = self.embed_batch_size(),
                    upsert = self.upsert_batch_size(),
                    "Loaded persisted batch sizes"
                );
            }
            Err(e) => warn!(error = %e, "Could not load persisted batch sizes"),
        }
    }

    pub fn embed_batch_size(&self) -> usize {
        self.embed_batch.load(Ordering::Relaxed)
    }

    pub fn upsert_batch_size(&self) -> usize {
        self.upsert_batch.load(Ordering::Relaxed)
    }

    /// Record an embedding attempt. Every attempt counts toward latency;
    /// failures also bump the windowed error counter.
    pub async fn record_embed_latency(&self, latency_ms: f64, success: bool) {
        if let Err(e) = self.metrics.record_latency(SERVICE_EMBED, latency_ms).await {
            warn!(error = %e, "Could not record embed latency");
        }
        if !success {
            let _ = self.metrics.increment_errors(SERVICE_EMBED).await;
        }
        self.maybe_tune().await;
    }

    /// Record an upsert attempt.
    pub async fn record_upsert_latency(&self, latency_ms: f64, success: bool) {
        if let Err(e) = self.metrics.record_latency(SERVICE_UPSERT, latency_ms).await {
            warn!(error = %e, "Could not record upsert latency");
        }
        if !success {
            let _ = self.metrics.increment_errors(SERVICE_UPSERT).await;
        }
        self.maybe_tune().await;
    }

    async fn maybe_tune(&self) {
        {
            let mut last = match self.last_tuned.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if last.elapsed().as_secs() < self.config.tuning_interval_secs {
                return;
            }
            *last = Instant::now();
        }
        self.tune().await;
    }

    /// Re-evaluate both batch sizes against the rolling metrics and persist
    /// the result.
    pub async fn tune(&self) {
        if let Ok(stats) = self.metrics.latency_stats(SERVICE_EMBED).await {
            let errors = self.metrics.error_count(SERVICE_EMBED).await.unwrap_or(0);
            if stats.samples >= self.config.min_samples {
                let current = self.embed_batch_size();
                let next = calculate_optimal_size(
                    current,
                    stats.avg,
                    errors,
                    stats.samples,
                    self.config.min_embed_batch,
                    self.config.max_embed_batch,
                    &self.config,
                );
                if next != current {
                    info!(
                        from = current,
                        to = next,
                        avg_latency_ms = stats.avg,
                        errors,
                        "Adjusting embed batch size"
                    );
                    self.embed_batch.store(next, Ordering::Relaxed);
                }
            }
        }

        if let Ok(stats) = self.metrics.latency_stats(SERVICE_UPSERT).await {
            let errors = self.metrics.error_count(SERVICE_UPSERT).await.unwrap_or(0);
            if stats.samples >= self.config.min_samples {
                let current = self.upsert_batch_size();
                let next = calculate_optimal_size(
                    current,
                    stats.avg,
                    errors,
                    stats.samples,
                    self.config.min_upsert_batch,
                    self.config.max_upsert_batch,
                    &self.config,
                );
                if next != current {
                    info!(
                        from = current,
                        to = next,
                        avg_latency_ms = stats.avg,
                        errors,
                        "Adjusting upsert batch size"
                    );
                    self.upsert_batch.store(next, Ordering::Relaxed);
                }
            }
        }

        let sizes = BatchSizes {
            embed: self.embed_batch_size(),
            upsert: self.upsert_batch_size(),
        };
        if let Err(e) = self.metrics.set_optimal_batch_sizes(sizes).await {
            warn!(error = %e, "Could not persist batch sizes");
        }
    }

    pub async fn stats(&self) -> TunerStats {
        TunerStats {
            embed_batch_size: self.embed_batch_size(),
            upsert_batch_size: self.upsert_batch_size(),
            embed: self
                .metrics
                .latency_stats(SERVICE_EMBED)
                .await
                .unwrap_or_default(),
            upsert: self
                .metrics
                .latency_stats(SERVICE_UPSERT)
                .await
                .unwrap_or_default(),
            embed_errors: self.metrics.error_count(SERVICE_EMBED).await.unwrap_or(0),
            upsert_errors: self.metrics.error_count(SERVICE_UPSERT).await.unwrap_or(0),
        }
    }
}

/// The tuning rule:
/// - error rate above threshold, or latency above the hard ceiling → ×0.7
/// - latency above 1.5× target → ×0.9
/// - latency under target with errors under 1% → ×1.2
/// - otherwise hold; always clamped to `[min, max]`.
pub fn calculate_optimal_size(
    current: usize,
    avg_latency_ms: f64,
    error_count: i64,
    samples: usize,
    min: usize,
    max: usize,
    config: &TunerConfig,
) -> usize {
    let error_rate = error_count as f64 / samples.max(1) as f64;

    if error_rate > config.max_error_rate {
        let next = (current as f64 * config.decrease_factor).round() as usize;
        return next.clamp(min, max);
    }

    if avg_latency_ms > config.max_latency_ms {
        let next = (current as f64 * config.decrease_factor).round() as usize;
        return next.clamp(min, max);
    }

    if avg_latency_ms > config.target_latency_ms * 1.5 {
        let next = (current as f64 * 0.9).round() as usize;
        return next.clamp(min, max);
    }

    if avg_latency_ms < config.target_latency_ms && error_rate < 0.01 {
        let next = (current as f64 * config.increase_factor).round() as usize;
        return next.clamp(min, max);
    }

    current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TunerConfig {
        TunerConfig::default()
    }

    #[test]
    fn slow_endpoint_steps_down_aggressively() {
        // 10 samples averaging 2500ms at size 20 → 14
        let next = calculate_optimal_size(20, 2500.0, 0, 10, 5, 50, &config());
        assert_eq!(next, 14);
    }

    #[test]
    fn high_error_rate_steps_down() {
        let next = calculate_optimal_size(20, 100.0, 2, 10, 5, 50, &config());
        assert_eq!(next, 14);
    }

    #[test]
    fn moderately_slow_trims_ten_percent() {
        let next = calculate_optimal_size(20, 800.0, 0, 10, 5, 50, &config());
        assert_eq!(next, 18);
    }

    #[test]
    fn fast_and_clean_grows() {
        let next = calculate_optimal_size(20, 200.0, 0, 100, 5, 50, &config());
        assert_eq!(next, 24);
    }

    #[test]
    fn steady_state_holds() {
        // Latency between target and 1.5x target with a small error rate.
        let next = calculate_optimal_size(20, 600.0, 1, 50, 5, 50, &config());
        assert_eq!(next, 20);
    }

    #[test]
    fn never_escapes_bounds() {
        assert_eq!(calculate_optimal_size(5, 5000.0, 50, 50, 5, 50, &config()), 5);
        assert_eq!(calculate_optimal_size(50, 10.0, 0, 100, 5, 50, &config()), 50);
    }
}
