use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use glasspane_common::Config;
use glasspane_embed::{
    BatchTuner, EmbedCache, EmbeddingJob, EmbeddingWorker, FetchSource, JobQueue, OllamaEmbedder,
    QdrantWriter, RedisCheckpointStore, RedisJobQueue, RedisMetricsStore, TunerConfig,
    WarehouseFetcher, WorkerConfig,
};
use glasspane_etl::pipeline::PipelineStatus;
use glasspane_etl::{
    policy, Extractor, HeuristicTransformer, JobStore, LlmTransformer, Loader, Pipeline,
    PipelineConfig, StreamRegistry, Transformer,
};
use glasspane_embed::{CheckpointStore, VectorSink};
use ollama_client::OllamaClient;
use qdrant_http::QdrantClient;

#[derive(Parser)]
#[command(name = "glasspane", about = "Log normalization and embedding pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ETL pipeline (full, incremental, or single-stream).
    Run {
        /// Only process logs from the last N hours.
        #[arg(long)]
        hours: Option<i64>,
        /// Process a single stream id (`dataset.table`).
        #[arg(long)]
        stream: Option<String>,
        /// Refine weak categories through the local model.
        #[arg(long)]
        enable_ai: bool,
        /// Extraction page size.
        #[arg(long, default_value_t = 1000)]
        batch_size: i64,
        /// Streams processed concurrently.
        #[arg(long, default_value_t = 1)]
        parallel: usize,
    },
    /// Show recent pipeline runs, stream state, and the rolling summary.
    Status,
    /// Discover and register log streams without running the pipeline.
    Discover,
    /// Print the master schema DDL, or apply it with --apply.
    Schema {
        #[arg(long)]
        apply: bool,
    },
    /// Extract and normalize a small sample from one stream.
    Preview {
        #[arg(long)]
        stream: String,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Run a read-only query against the warehouse.
    Query { sql: String },
    /// Embedding worker operations.
    #[command(subcommand)]
    Worker(WorkerCommand),
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Start the embedding worker loop.
    Start {
        /// Read raw source tables instead of the master table.
        #[arg(long)]
        from_source: bool,
    },
    /// Enqueue embedding jobs.
    Enqueue {
        /// Enqueue every enabled stream at its checkpoint.
        #[arg(long)]
        all: bool,
        /// Enqueue a single stream id.
        #[arg(long)]
        table: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        #[arg(long, default_value_t = 50)]
        batch_size: i64,
        #[arg(long)]
        priority: bool,
    },
    /// Show checkpoints, global progress, and queue depths.
    Progress,
    /// Move dead-lettered jobs back into a processing queue.
    Retry {
        #[arg(long, default_value_t = 10)]
        count: usize,
        #[arg(long)]
        priority: bool,
    },
    /// Peek at queued jobs without removing them.
    Peek {
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
    /// Reset checkpoints (and optionally queues).
    Reset {
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        queues: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("glasspane=info")),
        )
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = Config::from_env();
    config.log_redacted();

    match cli.command {
        Command::Run {
            hours,
            stream,
            enable_ai,
            batch_size,
            parallel,
        } => run_pipeline(&config, hours, stream, enable_ai, batch_size, parallel).await,
        Command::Status => status(&config).await,
        Command::Discover => discover(&config).await,
        Command::Schema { apply } => schema(&config, apply).await,
        Command::Preview { stream, limit } => preview(&config, &stream, limit).await,
        Command::Query { sql } => query(&config, &sql).await,
        Command::Worker(command) => worker(&config, command).await,
    }
}

async fn pg_pool(config: &Config) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("connecting to warehouse")
}

async fn redis_conn(config: &Config) -> Result<ConnectionManager> {
    let client = redis::Client::open(config.redis_url.as_str()).context("opening redis url")?;
    ConnectionManager::new(client)
        .await
        .context("connecting to queue broker")
}

fn build_pipeline(config: &Config, pool: PgPool, pipeline_config: PipelineConfig) -> Pipeline {
    let transformer: Arc<dyn Transformer> = if pipeline_config.enable_ai_enrichment {
        Arc::new(LlmTransformer::new(
            OllamaClient::new(&config.ollama_url, &config.embed_model),
            &config.chat_model,
        ))
    } else {
        Arc::new(HeuristicTransformer::new())
    };

    Pipeline::new(
        pipeline_config,
        config.source_datasets.clone(),
        StreamRegistry::new(pool.clone(), &config.project, &config.master_dataset),
        Extractor::new(pool.clone()),
        transformer,
        Loader::new(pool.clone(), &config.master_dataset),
        JobStore::new(pool, &config.master_dataset),
    )
}

async fn run_pipeline(
    config: &Config,
    hours: Option<i64>,
    stream: Option<String>,
    enable_ai: bool,
    batch_size: i64,
    parallel: usize,
) -> Result<ExitCode> {
    let pool = pg_pool(config).await?;

    let pipeline_config = PipelineConfig::builder()
        .batch_size(batch_size)
        .enable_ai_enrichment(enable_ai)
        .parallel_streams(parallel)
        .build();
    let pipeline = build_pipeline(config, pool, pipeline_config);

    let result = match (stream, hours) {
        (Some(stream_id), _) => pipeline.run_single_stream(&stream_id).await,
        (None, Some(hours)) => pipeline.run_incremental(hours).await,
        (None, None) => pipeline.run(None, true).await,
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "status": result.status,
            "pipeline_id": result.pipeline_id,
            "streams_processed": result.streams_processed,
            "total_extracted": result.total_extracted,
            "total_loaded": result.total_loaded,
            "errors": result.errors.iter().take(10).collect::<Vec<_>>(),
        }))?
    );

    Ok(if result.status == PipelineStatus::Failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn status(config: &Config) -> Result<ExitCode> {
    let pool = pg_pool(config).await?;
    let job_store = JobStore::new(pool.clone(), &config.master_dataset);
    let registry = StreamRegistry::new(pool, &config.project, &config.master_dataset);

    let recent = job_store.recent_runs(10).await?;
    let summary = job_store.metrics_summary(24).await?;
    let alerts = job_store.unacknowledged_alerts(20).await?;
    let streams = registry.all_streams(false).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "summary": summary,
            "recent_runs": recent,
            "alerts": alerts,
            "streams": streams,
        }))?
    );
    Ok(ExitCode::SUCCESS)
}

async fn discover(config: &Config) -> Result<ExitCode> {
    let pool = pg_pool(config).await?;
    let loader = Loader::new(pool.clone(), &config.master_dataset);
    loader.ensure_tables().await?;

    let registry = StreamRegistry::new(pool, &config.project, &config.master_dataset);
    let discovered = registry.discover(&config.source_datasets).await?;
    for stream in &discovered {
        registry.register(stream).await?;
        println!(
            "{}  direction={} flow={} rows={}",
            stream.stream_id,
            stream.direction,
            stream.flow,
            stream.row_count.unwrap_or(0)
        );
    }
    info!(count = discovered.len(), "Discovery complete");
    Ok(ExitCode::SUCCESS)
}

async fn schema(config: &Config, apply: bool) -> Result<ExitCode> {
    if apply {
        let pool = pg_pool(config).await?;
        Loader::new(pool, &config.master_dataset).ensure_tables().await?;
        println!("schema applied");
    } else {
        println!("{}", glasspane_etl::loader::schema_sql(&config.master_dataset));
    }
    Ok(ExitCode::SUCCESS)
}

async fn preview(config: &Config, stream_id: &str, limit: i64) -> Result<ExitCode> {
    let pool = pg_pool(config).await?;
    let registry = StreamRegistry::new(pool.clone(), &config.project, &config.master_dataset);

    let stream = registry
        .get_stream(stream_id)
        .await?
        .with_context(|| format!("unknown stream {stream_id}"))?;

    let limit = policy::clamp_row_limit(limit, config.max_result_rows);
    let page = Extractor::new(pool)
        .extract_page(&stream, 0, limit, None)
        .await?;
    let normalized = glasspane_etl::normalize_batch(&page);

    println!("{}", serde_json::to_string_pretty(&normalized)?);
    Ok(ExitCode::SUCCESS)
}

async fn query(config: &Config, sql: &str) -> Result<ExitCode> {
    policy::enforce_readonly(sql)?;

    let pool = pg_pool(config).await?;
    let estimated = estimated_query_bytes(&pool, sql).await.unwrap_or(0);
    policy::enforce_byte_budget(estimated, config.max_query_bytes)?;

    let limit = config.max_result_rows;
    let wrapped = format!("SELECT row_to_json(q)::text FROM ({sql}) q LIMIT {limit}");
    let rows: Vec<String> = sqlx::query_scalar(&wrapped).fetch_all(&pool).await?;

    for row in rows {
        println!("{row}");
    }
    Ok(ExitCode::SUCCESS)
}

/// Rough scan estimate from the planner: total rows × average row width.
async fn estimated_query_bytes(pool: &PgPool, sql: &str) -> Result<u64> {
    let explain: serde_json::Value =
        sqlx::query_scalar(&format!("EXPLAIN (FORMAT JSON) {sql}"))
            .fetch_one(pool)
            .await?;
    let plan = &explain[0]["Plan"];
    let rows = plan["Plan Rows"].as_u64().unwrap_or(0);
    let width = plan["Plan Width"].as_u64().unwrap_or(0);
    Ok(rows * width)
}

async fn worker(config: &Config, command: WorkerCommand) -> Result<ExitCode> {
    let conn = redis_conn(config).await?;
    let queue = Arc::new(RedisJobQueue::new(conn.clone()));
    let checkpoints = Arc::new(RedisCheckpointStore::new(conn.clone()));

    match command {
        WorkerCommand::Start { from_source } => {
            worker_start(config, conn, queue, checkpoints, from_source).await
        }
        WorkerCommand::Enqueue {
            all,
            table,
            offset,
            batch_size,
            priority,
        } => worker_enqueue(config, queue, checkpoints, all, table, offset, batch_size, priority)
            .await,
        WorkerCommand::Progress => {
            let stats = queue.stats().await?;
            let checkpoints_map = checkpoints.all().await?;
            let global = checkpoints.get_global().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "queues": stats,
                    "checkpoints": checkpoints_map,
                    "global": global,
                }))?
            );
            Ok(ExitCode::SUCCESS)
        }
        WorkerCommand::Retry { count, priority } => {
            let moved = queue.retry_failed(count, priority).await?;
            println!("retried {moved} jobs");
            Ok(ExitCode::SUCCESS)
        }
        WorkerCommand::Peek { count } => {
            let peeked = queue.peek(count).await?;
            println!("{}", serde_json::to_string_pretty(&peeked)?);
            Ok(ExitCode::SUCCESS)
        }
        WorkerCommand::Reset { confirm, queues } => {
            if !confirm {
                eprintln!("refusing to reset without --confirm");
                return Ok(ExitCode::FAILURE);
            }
            let removed = checkpoints.reset_all().await?;
            println!("removed {removed} checkpoints");
            if queues {
                let cleared = queue.clear_all().await?;
                println!(
                    "cleared queues: priority={} backlog={} failed={}",
                    cleared.priority, cleared.backlog, cleared.failed
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn worker_start(
    config: &Config,
    conn: ConnectionManager,
    queue: Arc<RedisJobQueue>,
    checkpoints: Arc<RedisCheckpointStore>,
    from_source: bool,
) -> Result<ExitCode> {
    let pool = pg_pool(config).await?;

    let metrics = Arc::new(RedisMetricsStore::new(conn.clone()));
    let tuner = Arc::new(BatchTuner::new(metrics, TunerConfig::default()));
    tuner.load_persisted().await;

    let embedder = Arc::new(OllamaEmbedder::new(
        OllamaClient::new(&config.ollama_url, &config.embed_model),
        tuner.clone(),
        Some(EmbedCache::new(conn)),
        config.embed_dim,
    ));

    let writer = QdrantWriter::connect(
        QdrantClient::new(&config.qdrant_url, config.qdrant_api_key.as_deref()),
        &config.collection,
        config.embed_dim as u64,
        tuner.clone(),
    )
    .await
    .context("initializing vector index")?;
    info!(collection = writer.collection(), "Vector index ready");

    let source = if from_source {
        FetchSource::Source
    } else {
        FetchSource::Master
    };
    let fetcher = Arc::new(WarehouseFetcher::new(
        pool,
        &config.master_dataset,
        &config.project,
        source,
    ));

    let worker = EmbeddingWorker::new(
        WorkerConfig::default(),
        queue,
        checkpoints,
        fetcher,
        embedder,
        Arc::new(writer),
        tuner,
    );

    let running = worker.shutdown_handle();
    running.store(true, Ordering::SeqCst);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("Shutdown signal received, finishing current job");
        running.store(false, Ordering::SeqCst);
    });

    worker.run().await;
    Ok(ExitCode::SUCCESS)
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term =
            signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_enqueue(
    config: &Config,
    queue: Arc<RedisJobQueue>,
    checkpoints: Arc<RedisCheckpointStore>,
    all: bool,
    table: Option<String>,
    offset: i64,
    batch_size: i64,
    priority: bool,
) -> Result<ExitCode> {
    if all {
        let pool = pg_pool(config).await?;
        let registry = StreamRegistry::new(pool, &config.project, &config.master_dataset);
        let streams = registry.all_streams(true).await?;

        let mut enqueued = 0;
        for stream in streams {
            let start = checkpoints
                .get(&stream.stream_id)
                .await?
                .map(|c| c.offset)
                .unwrap_or(0);
            let job = EmbeddingJob::create(&stream.stream_id, start, batch_size, priority);
            queue.enqueue(&job).await?;
            enqueued += 1;
        }
        println!("enqueued {enqueued} streams");
        return Ok(ExitCode::SUCCESS);
    }

    let Some(table) = table else {
        warn!("nothing to enqueue: pass --all or --table");
        return Ok(ExitCode::FAILURE);
    };

    let job = EmbeddingJob::create(&table, offset, batch_size, priority);
    queue.enqueue(&job).await?;
    println!("enqueued {} at offset {}", job.table, job.offset);
    Ok(ExitCode::SUCCESS)
}
