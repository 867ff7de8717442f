//! Real `EmbeddingClient`/`LlmClient` implementations backed by an
//! OpenAI-compatible HTTP API (OpenAI, OpenRouter, a local Ollama server in
//! compatibility mode, etc.). Configuration is read from the environment so
//! `main.rs` stays free of provider-specific argument parsing.

use std::time::Duration;

use async_trait::async_trait;
use ltam_core::collaborators::{CollaboratorError, EmbeddingClient, LlmClient};
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection details for an OpenAI-compatible provider, read once at
/// startup via [`HttpClientConfig::from_env`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub chat_model: String,
    pub embedding_model: String,
}

impl HttpClientConfig {
    /// Reads `LTAM_LLM_BASE_URL`, `LTAM_LLM_API_KEY`, `LTAM_LLM_CHAT_MODEL`,
    /// and `LTAM_LLM_EMBEDDING_MODEL`, falling back to OpenAI defaults.
    /// `LTAM_LLM_API_KEY` is required — a missing key almost always means
    /// the operator forgot to configure the service, not that none is
    /// needed, so this fails loudly rather than sending unauthenticated
    /// requests that will bounce at the provider.
    pub fn from_env() -> Result<Self, CollaboratorError> {
        let api_key = std::env::var("LTAM_LLM_API_KEY")
            .map_err(|_| CollaboratorError::Llm("LTAM_LLM_API_KEY is not set".to_string()))?;
        Ok(Self {
            base_url: std::env::var("LTAM_LLM_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            api_key,
            chat_model: std::env::var("LTAM_LLM_CHAT_MODEL").unwrap_or_else(|_| DEFAULT_CHAT_MODEL.to_string()),
            embedding_model: std::env::var("LTAM_LLM_EMBEDDING_MODEL").unwrap_or_else(|_| DEFAULT_EMBEDDING_MODEL.to_string()),
        })
    }
}

pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    config: HttpClientConfig,
}

impl HttpEmbeddingClient {
    pub fn new(config: HttpClientConfig) -> Self {
        Self {
            client: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().unwrap_or_default(),
            config,
        }
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
        let vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors.into_iter().next().ok_or_else(|| CollaboratorError::Embedding("empty response from embeddings endpoint".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.embedding_model,
                "input": texts,
            }))
            .send()
            .await
            .map_err(|e| CollaboratorError::Embedding(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Embedding(format!("embeddings endpoint returned {status}: {body}")));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| CollaboratorError::Embedding(e.to_string()))?;
        let data = body
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| CollaboratorError::Embedding("response missing `data` array".to_string()))?;

        data.iter()
            .map(|item| {
                item.get("embedding")
                    .and_then(|e| e.as_array())
                    .map(|values| values.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect::<Vec<f32>>())
                    .ok_or_else(|| CollaboratorError::Embedding("embedding item missing `embedding` array".to_string()))
            })
            .collect()
    }
}

pub struct HttpLlmClient {
    client: reqwest::Client,
    config: HttpClientConfig,
}

impl HttpLlmClient {
    pub fn new(config: HttpClientConfig) -> Self {
        Self {
            client: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().unwrap_or_default(),
            config,
        }
    }

    async fn chat_completion(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<String, CollaboratorError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.chat_model,
                "temperature": temperature,
                "max_tokens": max_tokens,
                "messages": [{"role": "user", "content": prompt}],
            }))
            .send()
            .await
            .map_err(|e| CollaboratorError::Llm(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Llm(format!("chat completions endpoint returned {status}: {body}")));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| CollaboratorError::Llm(e.to_string()))?;
        body.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(str::to_string)
            .ok_or_else(|| CollaboratorError::Llm("response missing choices[0].message.content".to_string()))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn call(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<String, CollaboratorError> {
        self.chat_completion(prompt, temperature, max_tokens).await
    }

    fn call_sync(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<String, CollaboratorError> {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(self.chat_completion(prompt, temperature, max_tokens)))
    }
}
