//! Ollama embedding client and vector byte codecs.
//!
//! One HTTP call per text against `POST /api/embeddings`; [`EmbeddingClient::embed_many`]
//! fans the calls out concurrently and awaits them jointly, preserving input
//! order. Failure is all-or-nothing: any failed request fails the whole
//! batch, so a document is never persisted with partial embeddings.
//!
//! Vector dimensionality is whatever the model returns; it is not validated
//! here. A mismatch against previously stored vectors surfaces as a
//! similarity-computation error at query time.

use anyhow::{bail, Result};
use futures_util::future::try_join_all;
use std::time::Duration;

use crate::config::OllamaConfig;

pub struct EmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl EmbeddingClient {
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.embed_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.embed_model.clone(),
        })
    }

    /// Embed a single text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": text,
        });

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "embedding request failed (is Ollama running at {}?): {}",
                    self.base_url,
                    e
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("embedding API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_embedding_response(&json)
    }

    /// Embed a batch of texts, one concurrent request per text.
    ///
    /// Output vector `i` corresponds to input text `i` regardless of
    /// completion order.
    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        tracing::info!(count = texts.len(), model = %self.model, "embedding batch");

        let vectors = try_join_all(texts.iter().enumerate().map(|(i, text)| async move {
            let vector = self.embed(text).await?;
            tracing::debug!(chunk = i, dims = vector.len(), "embedded chunk");
            Ok::<_, anyhow::Error>(vector)
        }))
        .await?;

        Ok(vectors)
    }
}

fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = json
        .get("embedding")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("invalid embedding response: missing embedding array"))?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Encode a float vector as raw bytes: 4 little-endian bytes per component,
/// no header. Decoded by [`blob_to_vec`] (length / 4 components).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a raw byte blob back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
