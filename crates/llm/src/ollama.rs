use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::{Embedder, Generator};

fn resolve_base_url(configured: &str) -> String {
    // The environment variable wins over the configured value at runtime.
    std::env::var("OLLAMA_BASE_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| configured.to_string())
        .trim_end_matches('/')
        .to_string()
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Embeddings through Ollama's `/api/embeddings` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimensions: usize,
}

impl OllamaEmbedder {
    pub fn new(model: &str, base_url: &str, dimensions: usize) -> Self {
        Self {
            client: http_client(Duration::from_secs(10)),
            endpoint: format!("{}/api/embeddings", resolve_base_url(base_url)),
            model: model.to_string(),
            dimensions,
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let payload = json!({ "model": self.model, "prompt": text });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("Ollama unavailable at {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Ollama embedding error ({status}): {body}");
        }

        let body: EmbeddingResponse = response.json().await?;
        if body.embedding.len() != self.dimensions {
            bail!(
                "model '{}' returned {} dimensions, expected {}",
                self.model,
                body.embedding.len(),
                self.dimensions
            );
        }
        Ok(body.embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Non-streaming text generation through Ollama's `/api/generate`.
#[derive(Debug, Clone)]
pub struct OllamaGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaGenerator {
    pub fn new(model: &str, base_url: &str) -> Self {
        Self {
            client: http_client(Duration::from_secs(120)),
            endpoint: format!("{}/api/generate", resolve_base_url(base_url)),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "num_predict": max_tokens,
                "temperature": temperature,
            }
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Ollama unavailable at {}; ensure model '{}' is installed",
                    self.endpoint, self.model
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Ollama error ({status}): {body}");
        }

        let body: GenerateResponse = response.json().await?;
        if body.response.trim().is_empty() {
            bail!("Ollama response missing text");
        }
        tracing::debug!(model = %self.model, chars = body.response.len(), "generation complete");
        Ok(body.response)
    }
}
