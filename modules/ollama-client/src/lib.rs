//! Minimal client for the Ollama HTTP API.
//!
//! Covers the two endpoints the pipeline needs: `/api/embed` for embedding
//! vectors and `/api/generate` for short enrichment completions. Server-side
//! (5xx) failures are retried with exponential backoff; everything else is
//! returned to the caller, which decides whether to degrade.

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 2;

/// Inputs longer than this are truncated before they reach the model.
pub const MAX_INPUT_CHARS: usize = 8_000;

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    embed_model: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, embed_model: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            embed_model: embed_model.to_string(),
        }
    }

    pub fn embed_model(&self) -> &str {
        &self.embed_model
    }

    /// Embed a single text. Returns the raw vector from the endpoint; the
    /// caller owns dimension bookkeeping.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let bounded = bound_input(text);
        let url = format!("{}/api/embed", self.base_url);
        let request = EmbedRequest {
            model: &self.embed_model,
            input: &bounded,
        };

        for attempt in 0..MAX_RETRIES {
            let response = self.http.post(&url).json(&request).send().await?;
            let status = response.status();

            if status.is_server_error() && attempt < MAX_RETRIES - 1 {
                let backoff = RETRY_DELAY_SECS * 2u64.pow(attempt);
                warn!(status = %status, backoff, "Ollama server error, retrying");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(anyhow!("Ollama embed error ({status}): {body}"));
            }

            let parsed: EmbedResponse = response.json().await?;
            let vector = parsed
                .embeddings
                .into_iter()
                .next()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| anyhow!("Ollama returned no embedding"))?;

            debug!(dim = vector.len(), "Embedded text");
            return Ok(vector);
        }

        Err(anyhow!("Ollama embed failed after {MAX_RETRIES} attempts"))
    }

    /// Embed several texts sequentially, preserving order. Fails on the
    /// first hard error.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// One-shot completion with temperature 0, used for log classification.
    pub async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model,
            prompt,
            stream: false,
            options: GenerateOptions { temperature: 0.0 },
        };

        let response = self.http.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Ollama generate error ({status}): {body}"));
        }

        let parsed: GenerateResponse = response.json().await?;
        Ok(parsed.response)
    }
}

fn bound_input(text: &str) -> String {
    if text.chars().count() <= MAX_INPUT_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_INPUT_CHARS).collect();
    format!("{cut}... [truncated]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_input_caps_long_text() {
        let long = "x".repeat(MAX_INPUT_CHARS + 100);
        let bounded = bound_input(&long);
        assert!(bounded.ends_with("... [truncated]"));
        assert!(bounded.chars().count() <= MAX_INPUT_CHARS + 20);
    }

    #[test]
    fn bound_input_passes_short_text() {
        assert_eq!(bound_input("hello"), "hello");
    }
}
