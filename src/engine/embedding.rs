// Hearth Agent Engine — Embedding Client
//
// Calls an Ollama or OpenAI-compatible embedding API to produce vector
// representations of text. Used by the tool index for selection and by the
// history-window picker. Vectors are provider-dependent fixed dimension;
// cosine similarity is computed locally.

use crate::atoms::error::EngineResult;
use crate::engine::config::EngineConfig;
use log::info;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Embedding client — calls Ollama or an OpenAI-compatible embedding API.
pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    model: String,
    provider: String,
}

impl EmbeddingClient {
    pub fn new(config: &EngineConfig) -> Self {
        EmbeddingClient {
            client: Client::new(),
            base_url: config.embedding_url.clone(),
            model: config.embedding_model.clone(),
            provider: config.embedding_provider.clone(),
        }
    }

    /// Provider tag written into the embedding cache for invalidation.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Model tag written into the embedding cache for invalidation.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the embedding vector for one text.
    /// Tries the Ollama API format first, falls back to OpenAI format.
    pub async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let mut vecs = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vecs.pop().ok_or_else(|| "Empty embedding response".into())
    }

    /// Embed a batch of texts in a single request. Returns one vector per
    /// input, in order.
    pub async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let ollama_result = self.embed_batch_ollama(texts).await;
        if let Ok(vecs) = ollama_result {
            return Ok(vecs);
        }
        let ollama_err = ollama_result.unwrap_err();

        // Fall back to OpenAI-compatible format: POST /v1/embeddings
        let openai_result = self.embed_batch_openai(texts).await;
        if let Ok(vecs) = openai_result {
            return Ok(vecs);
        }

        Err(format!(
            "Embedding failed. Ollama: {} | OpenAI: {}",
            ollama_err,
            openai_result.unwrap_err()
        )
        .into())
    }

    /// Ollama API: POST /api/embed { model, input: [...] } → { embeddings: [[f32…]] }
    async fn embed_batch_ollama(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| format!("Embedding service not reachable at {}: {}", self.base_url, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("Ollama embed {} — {}", status, text).into());
        }

        let v: Value = resp.json().await?;
        let embeddings = v["embeddings"]
            .as_array()
            .ok_or_else(|| "No 'embeddings' array in Ollama response".to_string())?;

        let vecs = parse_vectors(embeddings)?;
        if vecs.len() != texts.len() {
            return Err(format!(
                "Ollama returned {} embeddings for {} inputs",
                vecs.len(),
                texts.len()
            )
            .into());
        }
        Ok(vecs)
    }

    /// OpenAI-compatible format: POST /v1/embeddings { model, input: [...] }
    async fn embed_batch_openai(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("OpenAI embed {} — {}", status, text).into());
        }

        let v: Value = resp.json().await?;
        let data = v["data"]
            .as_array()
            .ok_or_else(|| "No 'data' array in OpenAI embedding response".to_string())?;

        let mut vecs = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item["embedding"]
                .as_array()
                .ok_or_else(|| "No 'embedding' array in OpenAI data item".to_string())?;
            vecs.push(parse_vector(embedding)?);
        }
        if vecs.len() != texts.len() {
            return Err(format!(
                "OpenAI returned {} embeddings for {} inputs",
                vecs.len(),
                texts.len()
            )
            .into());
        }
        Ok(vecs)
    }

    /// Cheap reachability probe, used by the scheduler's health sweep.
    /// Never errors — unreachable is a normal answer.
    pub async fn is_reachable(&self, timeout: Duration) -> bool {
        let url = format!("{}/api/tags", self.base_url.trim_end_matches('/'));
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Check that the service is reachable and the model produces vectors.
    /// Returns the vector dimension.
    pub async fn test_connection(&self) -> EngineResult<usize> {
        let vec = self.embed("test connection").await?;
        info!("[memory] Embedding connection OK ({} dims)", vec.len());
        Ok(vec.len())
    }
}

fn parse_vector(values: &[Value]) -> EngineResult<Vec<f32>> {
    let vec: Vec<f32> = values.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect();
    if vec.is_empty() {
        return Err("Empty embedding vector".into());
    }
    Ok(vec)
}

fn parse_vectors(rows: &[Value]) -> EngineResult<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let inner = row.as_array().ok_or_else(|| "Embedding row is not an array".to_string())?;
        out.push(parse_vector(inner)?);
    }
    Ok(out)
}
