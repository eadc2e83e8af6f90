//! The ETL orchestrator: discover → extract → normalize → transform → load,
//! per stream, with checkpoint advancement and partial-failure tolerance.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use glasspane_common::LogStream;

use crate::extractor::Extractor;
use crate::jobs::JobStore;
use crate::loader::Loader;
use crate::normalizer::normalize_batch;
use crate::registry::StreamRegistry;
use crate::transformer::Transformer;

/// Called after each loaded page with `(stream_id, loaded, extracted)`.
pub type ProgressFn = Arc<dyn Fn(&str, u64, u64) + Send + Sync>;

#[derive(Debug, Clone, TypedBuilder)]
pub struct PipelineConfig {
    #[builder(default = 1000)]
    pub batch_size: i64,
    #[builder(default)]
    pub max_batches_per_stream: Option<u32>,
    #[builder(default)]
    pub hours_lookback: Option<i64>,
    #[builder(default = false)]
    pub enable_ai_enrichment: bool,
    #[builder(default = 500)]
    pub load_batch_size: usize,
    #[builder(default = 1)]
    pub parallel_streams: usize,
    #[builder(default = true)]
    pub continue_on_error: bool,
    #[builder(default)]
    pub cleanup_source_after_days: Option<i64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Running,
    Completed,
    /// Some stream produced errors but the run made progress elsewhere.
    Partial,
    /// The orchestrator itself could not run.
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Running => "RUNNING",
            PipelineStatus::Completed => "COMPLETED",
            PipelineStatus::Partial => "PARTIAL",
            PipelineStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamResult {
    pub stream_id: String,
    pub extracted: u64,
    pub normalized: u64,
    pub transformed: u64,
    pub loaded: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub pipeline_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: PipelineStatus,
    pub streams_processed: u32,
    pub total_extracted: u64,
    pub total_normalized: u64,
    pub total_transformed: u64,
    pub total_loaded: u64,
    pub errors: Vec<String>,
    pub stream_results: Vec<StreamResult>,
}

impl PipelineResult {
    fn new() -> Self {
        Self {
            pipeline_id: Uuid::new_v4(),
            started_at: Utc::now(),
            completed_at: None,
            status: PipelineStatus::Running,
            streams_processed: 0,
            total_extracted: 0,
            total_normalized: 0,
            total_transformed: 0,
            total_loaded: 0,
            errors: Vec::new(),
            stream_results: Vec::new(),
        }
    }

    fn absorb(&mut self, stream: StreamResult) {
        self.total_extracted += stream.extracted;
        self.total_normalized += stream.normalized;
        self.total_transformed += stream.transformed;
        self.total_loaded += stream.loaded;
        self.errors.extend(
            stream
                .errors
                .iter()
                .map(|e| format!("{}: {e}", stream.stream_id)),
        );
        self.streams_processed += 1;
        self.stream_results.push(stream);
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    /// Schemas scanned during discovery.
    datasets: Vec<String>,
    registry: StreamRegistry,
    extractor: Extractor,
    transformer: Arc<dyn Transformer>,
    loader: Loader,
    job_store: JobStore,
    pub on_progress: Option<ProgressFn>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        datasets: Vec<String>,
        registry: StreamRegistry,
        extractor: Extractor,
        transformer: Arc<dyn Transformer>,
        loader: Loader,
        job_store: JobStore,
    ) -> Self {
        Self {
            config,
            datasets,
            registry,
            extractor,
            transformer,
            loader,
            job_store,
            on_progress: None,
        }
    }

    /// Run the pipeline over the selected streams (all enabled streams when
    /// `streams` is `None`). Never panics; bootstrap failures surface as a
    /// FAILED result.
    pub async fn run(&self, streams: Option<&[String]>, discover: bool) -> PipelineResult {
        let mut result = PipelineResult::new();

        if let Err(e) = self.loader.ensure_tables().await {
            error!(error = %e, "Could not ensure master tables");
            result.status = PipelineStatus::Failed;
            result.errors.push(format!("bootstrap: {e}"));
            result.completed_at = Some(Utc::now());
            self.job_store.record_run(&result).await;
            return result;
        }

        if discover {
            match self.registry.discover(self.registry_datasets()).await {
                Ok(discovered) => {
                    info!(count = discovered.len(), "Discovered streams");
                    for stream in &discovered {
                        if let Err(e) = self.registry.register(stream).await {
                            warn!(stream_id = %stream.stream_id, error = %e, "Could not register stream");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Stream discovery failed");
                    result.errors.push(format!("discovery: {e}"));
                }
            }
        }

        let targets = match self.select_streams(streams).await {
            Ok(targets) => targets,
            Err(e) => {
                result.status = PipelineStatus::Failed;
                result.errors.push(format!("stream selection: {e}"));
                result.completed_at = Some(Utc::now());
                self.job_store.record_run(&result).await;
                return result;
            }
        };

        if targets.is_empty() {
            warn!("No streams to process");
            result.status = PipelineStatus::Completed;
            result.completed_at = Some(Utc::now());
            self.job_store.record_run(&result).await;
            return result;
        }

        info!(count = targets.len(), "Processing streams");

        if self.config.parallel_streams > 1 && self.config.continue_on_error {
            let stream_results: Vec<StreamResult> = stream::iter(targets.iter())
                .map(|s| self.process_stream(s))
                .buffer_unordered(self.config.parallel_streams)
                .collect()
                .await;
            for sr in stream_results {
                result.absorb(sr);
            }
        } else {
            for target in &targets {
                let sr = self.process_stream(target).await;
                let had_errors = !sr.errors.is_empty();
                result.absorb(sr);
                if had_errors && !self.config.continue_on_error {
                    break;
                }
            }
        }

        if let Some(days) = self.config.cleanup_source_after_days {
            self.cleanup_sources(&targets, days).await;
        }

        result.status = if result.errors.is_empty() {
            PipelineStatus::Completed
        } else {
            PipelineStatus::Partial
        };
        result.completed_at = Some(Utc::now());

        info!(
            status = %result.status,
            loaded = result.total_loaded,
            errors = result.errors.len(),
            "Pipeline complete"
        );

        self.job_store.record_run(&result).await;
        result
    }

    /// Incremental run restricted to the trailing window.
    pub async fn run_incremental(&self, hours: i64) -> PipelineResult {
        info!(hours, "Running incremental ETL");
        let pipeline = Pipeline {
            config: PipelineConfig {
                hours_lookback: Some(hours),
                ..self.config.clone()
            },
            datasets: self.datasets.clone(),
            registry: self.registry.clone(),
            extractor: self.extractor.clone(),
            transformer: self.transformer.clone(),
            loader: self.loader.clone(),
            job_store: self.job_store.clone(),
            on_progress: self.on_progress.clone(),
        };
        pipeline.run(None, true).await
    }

    /// Run a single stream without re-discovery.
    pub async fn run_single_stream(&self, stream_id: &str) -> PipelineResult {
        self.run(Some(&[stream_id.to_string()]), false).await
    }

    fn registry_datasets(&self) -> &[String] {
        self.datasets.as_slice()
    }

    async fn select_streams(&self, requested: Option<&[String]>) -> crate::error::Result<Vec<LogStream>> {
        match requested {
            Some(ids) => {
                let mut streams = Vec::new();
                for id in ids {
                    match self.registry.get_stream(id).await? {
                        Some(stream) => streams.push(stream),
                        None => warn!(stream_id = %id, "Unknown stream requested"),
                    }
                }
                Ok(streams)
            }
            None => self.registry.all_streams(true).await,
        }
    }

    async fn process_stream(&self, stream: &LogStream) -> StreamResult {
        let mut result = StreamResult {
            stream_id: stream.stream_id.clone(),
            ..StreamResult::default()
        };

        info!(stream_id = %stream.stream_id, offset = stream.last_sync_offset, "Processing stream");

        let start_offset = stream.last_sync_offset;
        let mut offset = start_offset;
        let mut batch_count = 0u32;

        loop {
            let page = match self
                .extractor
                .extract_page(stream, offset, self.config.batch_size, self.config.hours_lookback)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    result.errors.push(format!("extract at offset {offset}: {e}"));
                    break;
                }
            };

            if page.is_empty() {
                break;
            }
            let page_len = page.len() as u64;
            batch_count += 1;

            match self.process_page(stream, page).await {
                Ok((normalized, transformed, loaded)) => {
                    result.extracted += page_len;
                    result.normalized += normalized;
                    result.transformed += transformed;
                    result.loaded += loaded;
                    offset += page_len as i64;

                    // Checkpoint only moves after a successful page.
                    if let Err(e) = self
                        .registry
                        .update_sync(&stream.stream_id, offset, page_len as i64)
                        .await
                    {
                        warn!(stream_id = %stream.stream_id, error = %e, "Checkpoint update failed");
                    }

                    if let Some(on_progress) = &self.on_progress {
                        on_progress(&stream.stream_id, result.loaded, result.extracted);
                    }
                }
                Err(e) => {
                    result.errors.push(format!("batch {batch_count}: {e}"));
                    if !self.config.continue_on_error {
                        break;
                    }
                    // Skip past the failing page so iteration can proceed.
                    offset += page_len as i64;
                }
            }

            if self
                .config
                .max_batches_per_stream
                .is_some_and(|max| batch_count >= max)
            {
                break;
            }
            if page_len < self.config.batch_size as u64 {
                break;
            }
        }

        info!(
            stream_id = %stream.stream_id,
            extracted = result.extracted,
            loaded = result.loaded,
            errors = result.errors.len(),
            "Completed stream"
        );
        result
    }

    async fn process_page(
        &self,
        stream: &LogStream,
        page: Vec<glasspane_common::RawLogRecord>,
    ) -> crate::error::Result<(u64, u64, u64)> {
        let normalized = normalize_batch(&page);
        let normalized_count = normalized.len() as u64;

        let transformed = self.transformer.transform_batch(normalized).await;
        let transformed_count = transformed.len() as u64;

        let stats = self
            .loader
            .load_batch(&transformed, &stream.stream_id, self.config.load_batch_size)
            .await?;

        Ok((normalized_count, transformed_count, stats.loaded + stats.duplicates))
    }

    async fn cleanup_sources(&self, streams: &[LogStream], days: i64) {
        let cutoff = Utc::now() - Duration::days(days);
        info!(cutoff = %cutoff, "Checking source tables for cleanup (dry run)");

        for stream in streams {
            match self
                .loader
                .cleanup_source_table(&stream.source_dataset, &stream.source_table, cutoff, true)
                .await
            {
                Ok(count) => {
                    info!(stream_id = %stream.stream_id, count, "Rows eligible for cleanup")
                }
                Err(e) => warn!(stream_id = %stream.stream_id, error = %e, "Cleanup check failed"),
            }
        }
    }
}
