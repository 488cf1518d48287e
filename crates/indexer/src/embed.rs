//! Embedding service client.
//!
//! Speaks the Ollama-style batch API: `POST {endpoint}/api/embed` with
//! `{"model": ..., "input": [...]}`, answered by `{"embeddings": [[...]]}`.
//! Errors are split into transient unavailability (connection trouble,
//! timeouts, 408/429/5xx) and definitive rejection (other 4xx, malformed or
//! mismatched responses), which drives the retry loop upstream.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use quarry_core::{AppConfig, Error};

/// Produces embedding vectors for batches of text.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Identifier of the model producing the vectors.
    fn model_id(&self) -> &str;

    /// Width of the vectors this client produces.
    fn dimensions(&self) -> usize;

    /// Embed the given texts, one vector per text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error>;
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// HTTP client for an Ollama-compatible embedding endpoint.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    batch_size: usize,
}

impl HttpEmbeddingClient {
    pub fn new(config: &AppConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::EmbedUnavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: config.embed_endpoint.trim_end_matches('/').to_string(),
            model: config.embed_model.clone(),
            dimensions: config.embed_dimensions,
            batch_size: config.embed_batch_size.max(1),
        })
    }

    fn embed_url(&self) -> String {
        format!("{}/api/embed", self.endpoint)
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, Error> {
        let request = EmbedRequest { model: &self.model, input: texts.to_vec() };

        let response = self
            .http
            .post(self.embed_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::EmbedUnavailable(format!("embedding request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("embedding service returned {}: {}", status.as_u16(), body);
            return if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
            {
                Err(Error::EmbedUnavailable(message))
            } else {
                Err(Error::EmbedRejected(message))
            };
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::EmbedRejected(format!("malformed embedding response: {}", e)))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(Error::EmbedRejected(format!(
                "got {} embeddings for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }

        for (i, embedding) in parsed.embeddings.iter().enumerate() {
            if embedding.len() != self.dimensions {
                return Err(Error::EmbedRejected(format!(
                    "embedding {} has {} dimensions, expected {}",
                    i,
                    embedding.len(),
                    self.dimensions
                )));
            }
        }

        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        tracing::debug!("embedding {} texts with {}", texts.len(), self.model);

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let refs: Vec<&str> = batch.iter().map(|s| s.as_str()).collect();
            all.extend(self.embed_batch(&refs).await?);
        }
        Ok(all)
    }
}
