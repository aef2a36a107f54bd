//! OpenAI-compatible HTTP clients for embeddings and query expansion.
//!
//! Works with OpenAI, OpenRouter, Ollama and any other provider that serves
//! `/v1/embeddings` and `/v1/chat/completions`.

use async_trait::async_trait;
use kbase_core::{KbaseError, KbaseResult};
use serde_json::Value;

use crate::config::{api_key_from_env, EmbeddingConfig, ExpansionConfig};
use crate::embedding::EmbeddingProvider;
use crate::expansion::LanguageModel;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

fn base_url(configured: Option<&String>) -> String {
    configured
        .map(|s| s.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

async fn post_json(
    http: &reqwest::Client,
    url: &str,
    api_key: &str,
    body: &Value,
) -> KbaseResult<Value> {
    let resp = http
        .post(url)
        .header("Authorization", format!("Bearer {api_key}"))
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| KbaseError::Http(e.to_string()))?;

    let status = resp.status();
    let resp_body: Value = resp
        .json()
        .await
        .map_err(|e| KbaseError::Http(e.to_string()))?;

    if !status.is_success() {
        return Err(KbaseError::Http(format!("API error {status}: {resp_body}")));
    }
    Ok(resp_body)
}

/// Embeddings from a remote `/v1/embeddings` endpoint.
pub struct HttpEmbedding {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl HttpEmbedding {
    /// Client for `{base_url}/v1/embeddings` returning `dimension`-sized vectors.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            dimension,
        }
    }

    /// Build from config, reading the API key from the configured variable.
    pub fn from_config(config: &EmbeddingConfig) -> KbaseResult<Self> {
        Ok(Self::new(
            base_url(config.api_base_url.as_ref()),
            api_key_from_env(&config.api_key_env)?,
            config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            config.dimension,
        ))
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedding {
    async fn embed(&self, text: &str) -> KbaseResult<Vec<f32>> {
        self.embed_batch(&[text])
            .await?
            .pop()
            .ok_or_else(|| KbaseError::Http("embedding response was empty".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> KbaseResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let resp = post_json(&self.http, &url, &self.api_key, &body).await?;
        parse_embeddings(&resp, texts.len(), self.dimension)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_version(&self) -> String {
        self.model.clone()
    }
}

/// Parse `{"data": [{"index": i, "embedding": [...]}, ...]}` in input order.
fn parse_embeddings(resp: &Value, expected: usize, dimension: usize) -> KbaseResult<Vec<Vec<f32>>> {
    let data = resp["data"]
        .as_array()
        .ok_or_else(|| KbaseError::Http(format!("missing 'data' in embedding response: {resp}")))?;

    let mut rows: Vec<(u64, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item["index"].as_u64().unwrap_or(pos as u64);
        let vector: Vec<f32> = item["embedding"]
            .as_array()
            .ok_or_else(|| KbaseError::Http("embedding item without vector".to_string()))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        if vector.len() != dimension {
            return Err(KbaseError::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }
        rows.push((index, vector));
    }

    if rows.len() != expected {
        return Err(KbaseError::Http(format!(
            "expected {expected} embeddings, got {}",
            rows.len()
        )));
    }
    rows.sort_by_key(|(index, _)| *index);
    Ok(rows.into_iter().map(|(_, v)| v).collect())
}

/// Chat completions used as a plain text-completion model.
pub struct HttpLanguageModel {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpLanguageModel {
    /// Client for `{base_url}/v1/chat/completions`.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Build from `[expansion]` settings, reading the API key from the environment.
    pub fn from_config(config: &ExpansionConfig) -> KbaseResult<Self> {
        Ok(Self::new(
            base_url(config.api_base_url.as_ref()),
            api_key_from_env(&config.api_key_env)?,
            config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
        ))
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn complete(&self, prompt: &str) -> KbaseResult<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 200,
            "temperature": 0.0,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let resp = post_json(&self.http, &url, &self.api_key, &body).await?;
        resp["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| KbaseError::Http(format!("missing completion content: {resp}")))
    }
}
