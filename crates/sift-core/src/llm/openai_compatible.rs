//! OpenAI-compatible client
//!
//! Works with any server that implements the OpenAI chat completions API (OpenAI
//! itself, vLLM, LocalAI, llama-server, gateways in front of other vendors).
//! The same client serves `/v1/embeddings` for the similarity retriever.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::parsing::parse_batch_response;
use super::prompt::{build_prompt, estimate_tokens, SYSTEM_PROMPT};
use super::{LlmBatchResponse, LlmClient};
use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::models::{Category, LlmModel, Transaction};
use crate::similarity::EmbeddingProvider;

const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

#[derive(Clone)]
pub struct OpenAICompatibleClient {
    http_client: Client,
    base_url: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
    embedding_model: String,
    embedding_dimensions: usize,
}

impl OpenAICompatibleClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            temperature: 0.1,
            max_tokens: 4000,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dimensions: 1536,
        }
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    pub fn with_embedding_model(mut self, model: &str, dimensions: usize) -> Self {
        self.embedding_model = model.to_string();
        self.embedding_dimensions = dimensions;
        self
    }

    /// Build from config. `llm.host` is required.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let host = config
            .host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| Error::Config("llm.host (or SIFT_LLM_HOST) is not set".to_string()))?;

        let http_client = Client::builder().timeout(config.timeout()).build()?;
        let mut client = Self::new(host);
        client.http_client = http_client;
        client.api_key = config.api_key.clone().filter(|k| !k.is_empty());
        client.temperature = config.temperature;
        client.max_tokens = config.max_tokens;
        if let Some(model) = &config.embedding_model {
            client.embedding_model = model.clone();
        }
        Ok(client)
    }

    pub fn host(&self) -> &str {
        &self.base_url
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http_client.post(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }

    async fn chat_completion(&self, model: &str, prompt: &str) -> Result<ChatCompletionResponse> {
        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            stream: false,
        };

        let response = self.post("/v1/chat/completions").json(&request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("API error {}: {}", status, body)));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl LlmClient for OpenAICompatibleClient {
    async fn categorize_batch(
        &self,
        transactions: &[Transaction],
        categories: &[Category],
        model: &LlmModel,
    ) -> Result<LlmBatchResponse> {
        let prompt = build_prompt(transactions, categories);
        let response = self.chat_completion(&model.name, &prompt).await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Llm("No choices in LLM response".into()))?;
        debug!(model = %model.name, chars = content.len(), "LLM batch response");

        let estimate = estimate_tokens(transactions, categories);
        let (input_tokens, output_tokens) = match response.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (estimate.input_tokens, estimate.output_tokens),
        };

        Ok(LlmBatchResponse {
            results: parse_batch_response(&content, categories)?,
            input_tokens,
            output_tokens,
            model: response.model.unwrap_or_else(|| model.name.clone()),
        })
    }

    async fn health_check(&self) -> bool {
        for path in ["/v1/models", "/health"] {
            let mut request = self.http_client.get(format!("{}{}", self.base_url, path));
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }
            if let Ok(resp) = request.send().await {
                if resp.status().is_success() {
                    return true;
                }
            }
        }
        false
    }

    fn name(&self) -> &str {
        "openai_compatible"
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAICompatibleClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: self.embedding_model.clone(),
            input: vec![text.to_string()],
        };
        let response = self.post("/v1/embeddings").json(&request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::EmbeddingFailed(format!("API error {}: {}", status, body)));
        }

        let response: EmbeddingResponse = response.json().await?;
        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::EmbeddingFailed("No embedding in response".into()))
    }

    fn dimensions(&self) -> usize {
        self.embedding_dimensions
    }

    fn name(&self) -> &str {
        "openai_compatible"
    }
}

/// OpenAI chat completion request
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// OpenAI chat completion response
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}
