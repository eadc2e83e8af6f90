use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Warehouse (Postgres)
    pub database_url: String,

    // Queue broker / checkpoint store
    pub redis_url: String,

    // Project tag stamped on stream coordinates
    pub project: String,

    // Schemas scanned during stream discovery
    pub source_datasets: Vec<String>,
    // Schema holding master_logs / log_streams / etl_jobs
    pub master_dataset: String,

    // Embedding endpoint
    pub ollama_url: String,
    pub embed_model: String,
    pub embed_dim: usize,
    pub chat_model: String,

    // Vector index
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub collection: String,

    // Ad-hoc query guardrails
    pub max_query_bytes: u64,
    pub max_result_rows: i64,
}

impl Config {
    /// Load the full configuration. Panics with a clear message if required
    /// vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            project: env::var("GLASSPANE_PROJECT").unwrap_or_else(|_| "glasspane".to_string()),
            source_datasets: env::var("SOURCE_DATASETS")
                .unwrap_or_else(|_| "central_logging_v1,org_logs".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            master_dataset: env::var("MASTER_DATASET")
                .unwrap_or_else(|_| "central_logging_v1".to_string()),
            ollama_url: env::var("OLLAMA_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
            embed_model: env::var("EMBED_MODEL")
                .unwrap_or_else(|_| "qwen3-embedding:0.6b".to_string()),
            embed_dim: env::var("EMBED_DIM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1024),
            chat_model: env::var("CHAT_MODEL").unwrap_or_else(|_| "qwen3:4b".to_string()),
            qdrant_url: env::var("QDRANT_URL")
                .unwrap_or_else(|_| "http://localhost:6333".to_string()),
            qdrant_api_key: env::var("QDRANT_API_KEY").ok(),
            collection: env::var("QDRANT_COLLECTION")
                .unwrap_or_else(|_| "logs_embedded".to_string()),
            max_query_bytes: env::var("MAX_QUERY_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50_000_000_000),
            max_result_rows: env::var("MAX_RESULT_ROWS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
        }
    }

    /// Log the non-secret parts of the configuration at startup.
    pub fn log_redacted(&self) {
        tracing::info!(
            project = %self.project,
            master_dataset = %self.master_dataset,
            source_datasets = ?self.source_datasets,
            ollama_url = %self.ollama_url,
            embed_model = %self.embed_model,
            embed_dim = self.embed_dim,
            qdrant_url = %self.qdrant_url,
            collection = %self.collection,
            "Loaded configuration"
        );
    }
}

fn required_env(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| panic!("{name} must be set"))
}
