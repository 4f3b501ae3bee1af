//! Batch LLM categorization
//!
//! # Architecture
//!
//! - `LlmClient` trait: one call categorizes a batch of transactions
//! - `LlmProvider` enum: concrete wrapper providing Clone + compile-time dispatch
//! - Clients: `OpenAICompatibleClient`, `MockLlmClient`
//! - `BatchClassifier`: splits work into sub-batches and runs each one through the
//!   rate limiter, the budget gate, the client and the audit trail
//!
//! # Configuration
//!
//! `[llm]` in the engine config, overridable by `SIFT_LLM_BACKEND`
//! (`openai_compatible` | `mock`), `SIFT_LLM_HOST`, `SIFT_LLM_MODEL` and
//! `SIFT_LLM_API_KEY`.

mod classifier;
mod mock;
mod openai_compatible;
pub mod parsing;
pub mod prompt;

pub use classifier::{plan_sub_batches, BatchClassifier, ClassifiedBatch};
pub use mock::{keyword_category, MockLlmClient};
pub use openai_compatible::OpenAICompatibleClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::models::{Category, CategoryId, LlmModel, ModelStrategy, TokenEstimate, Transaction, TransactionId};

/// One parsed entry of an LLM batch response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCategorization {
    pub transaction_id: TransactionId,
    /// None when the model's category did not resolve
    pub category_id: Option<CategoryId>,
    /// Always within [0, 1]
    pub confidence: f64,
    pub rationale: String,
    /// Set when the entry was malformed
    pub error: Option<String>,
    /// The model reported a confidence outside [0, 1]
    pub flagged: bool,
}

#[derive(Debug, Clone)]
pub struct LlmBatchResponse {
    pub results: Vec<LlmCategorization>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model: String,
}

impl LlmBatchResponse {
    pub fn tokens(&self) -> TokenEstimate {
        TokenEstimate {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }
}

/// Interface to a remote categorization model
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn categorize_batch(
        &self,
        transactions: &[Transaction],
        categories: &[Category],
        model: &LlmModel,
    ) -> Result<LlmBatchResponse>;

    /// Token estimate for pricing a call before it is made
    fn estimate_tokens(&self, transactions: &[Transaction], categories: &[Category]) -> TokenEstimate {
        prompt::estimate_tokens(transactions, categories)
    }

    async fn health_check(&self) -> bool;

    fn name(&self) -> &str;
}

/// Concrete LLM client enum
#[derive(Clone)]
pub enum LlmProvider {
    OpenAICompatible(OpenAICompatibleClient),
    Mock(MockLlmClient),
}

impl LlmProvider {
    /// Build the configured backend
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        match config.backend.to_lowercase().as_str() {
            "openai_compatible" | "openai" | "vllm" | "localai" => {
                OpenAICompatibleClient::from_config(config).map(LlmProvider::OpenAICompatible)
            }
            "mock" => Ok(LlmProvider::Mock(MockLlmClient::new())),
            other => Err(Error::Config(format!("Unknown LLM backend: {}", other))),
        }
    }

    pub fn mock() -> Self {
        LlmProvider::Mock(MockLlmClient::new())
    }
}

#[async_trait]
impl LlmClient for LlmProvider {
    async fn categorize_batch(
        &self,
        transactions: &[Transaction],
        categories: &[Category],
        model: &LlmModel,
    ) -> Result<LlmBatchResponse> {
        match self {
            LlmProvider::OpenAICompatible(c) => c.categorize_batch(transactions, categories, model).await,
            LlmProvider::Mock(c) => c.categorize_batch(transactions, categories, model).await,
        }
    }

    async fn health_check(&self) -> bool {
        match self {
            LlmProvider::OpenAICompatible(c) => LlmClient::health_check(c).await,
            LlmProvider::Mock(c) => c.health_check().await,
        }
    }

    fn name(&self) -> &str {
        match self {
            LlmProvider::OpenAICompatible(c) => LlmClient::name(c),
            LlmProvider::Mock(c) => c.name(),
        }
    }
}

fn accuracy_per_cost(model: &LlmModel) -> f64 {
    if model.cost_per_1k_tokens > 0.0 {
        model.accuracy / model.cost_per_1k_tokens
    } else {
        f64::INFINITY
    }
}

/// Pick a model from the catalogue
pub fn select_model(models: &[LlmModel], strategy: ModelStrategy) -> Result<LlmModel> {
    let chosen = match strategy {
        ModelStrategy::CostOptimized => models
            .iter()
            .min_by(|a, b| a.cost_per_1k_tokens.total_cmp(&b.cost_per_1k_tokens)),
        ModelStrategy::AccuracyOptimized => {
            models.iter().max_by(|a, b| a.accuracy.total_cmp(&b.accuracy))
        }
        ModelStrategy::Balanced => models.iter().find(|m| m.is_default).or_else(|| {
            models
                .iter()
                .max_by(|a, b| accuracy_per_cost(a).total_cmp(&accuracy_per_cost(b)))
        }),
    };

    chosen
        .cloned()
        .ok_or_else(|| Error::ModelNotAvailable("the model catalogue is empty".to_string()))
}
