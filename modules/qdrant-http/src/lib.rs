//! Thin client for the Qdrant REST API.
//!
//! Implements only what the indexing path needs: collection lookup and
//! creation, payload indexes, and point upserts. Search stays with the
//! consumers of the index.

use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distance {
    Cosine,
    Euclid,
    Dot,
}

/// Payload index field types used by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldSchema {
    Keyword,
    Integer,
}

#[derive(Debug, Clone, Serialize)]
pub struct Point {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub vector_size: u64,
    pub points_count: u64,
}

// --- Response envelopes ---

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct CollectionsResult {
    collections: Vec<CollectionDescription>,
}

#[derive(Debug, Deserialize)]
struct CollectionDescription {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CollectionInfoResult {
    config: CollectionConfig,
    #[serde(default)]
    points_count: u64,
}

#[derive(Debug, Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Debug, Deserialize)]
struct VectorParams {
    size: u64,
}

#[derive(Clone)]
pub struct QdrantClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl QdrantClient {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(|k| k.to_string()),
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            headers.insert("api-key", HeaderValue::from_str(key)?);
        }
        Ok(headers)
    }

    pub async fn list_collections(&self) -> Result<Vec<String>> {
        let url = format!("{}/collections", self.base_url);
        let response = self.http.get(&url).headers(self.headers()?).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Qdrant list collections error ({status}): {body}"));
        }

        let parsed: ApiResponse<CollectionsResult> = response.json().await?;
        Ok(parsed
            .result
            .collections
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    pub async fn collection_info(&self, name: &str) -> Result<CollectionInfo> {
        let url = format!("{}/collections/{name}", self.base_url);
        let response = self.http.get(&url).headers(self.headers()?).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Qdrant collection info error ({status}): {body}"));
        }

        let parsed: ApiResponse<CollectionInfoResult> = response.json().await?;
        Ok(CollectionInfo {
            vector_size: parsed.result.config.params.vectors.size,
            points_count: parsed.result.points_count,
        })
    }

    pub async fn create_collection(&self, name: &str, size: u64, distance: Distance) -> Result<()> {
        let url = format!("{}/collections/{name}", self.base_url);
        let body = serde_json::json!({
            "vectors": { "size": size, "distance": distance }
        });

        let response = self
            .http
            .put(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Qdrant create collection error ({status}): {body}"));
        }

        debug!(collection = name, size, "Created Qdrant collection");
        Ok(())
    }

    pub async fn create_payload_index(
        &self,
        collection: &str,
        field_name: &str,
        schema: FieldSchema,
    ) -> Result<()> {
        let url = format!("{}/collections/{collection}/index", self.base_url);
        let body = serde_json::json!({
            "field_name": field_name,
            "field_schema": schema,
        });

        let response = self
            .http
            .put(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Qdrant create index error for {field_name} ({status}): {body}"
            ));
        }

        Ok(())
    }

    /// Upsert points, blocking until the write is applied (`wait=true`).
    /// Upserts are idempotent by point id.
    pub async fn upsert_points(&self, collection: &str, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let url = format!("{}/collections/{collection}/points?wait=true", self.base_url);
        let body = serde_json::json!({ "points": points });

        let response = self
            .http
            .put(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Qdrant upsert error ({status}): {body}"));
        }

        debug!(collection, count = points.len(), "Upserted points");
        Ok(())
    }
}
