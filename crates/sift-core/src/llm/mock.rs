//! Mock LLM client for testing
//!
//! Categorizes by merchant keyword, renders its answer as the JSON a real model
//! would send and runs it through the same parser. Offline and deterministic.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::parsing::parse_batch_response;
use super::prompt::estimate_tokens;
use super::{LlmBatchResponse, LlmClient};
use crate::error::{Error, Result};
use crate::models::{Category, LlmModel, Transaction, TransactionId};

/// Category name a well-known merchant maps to
pub fn keyword_category(text: &str) -> &'static str {
    match text.to_uppercase().as_str() {
        m if m.contains("STARBUCKS") || m.contains("CHIPOTLE") => "Food & Dining",
        m if m.contains("WHOLE FOODS") || m.contains("TRADER JOE") => "Groceries",
        m if m.contains("UBER") || m.contains("LYFT") || m.contains("SHELL") => "Transportation",
        m if m.contains("AMAZON") || m.contains("TARGET") => "Shopping",
        m if m.contains("NETFLIX") || m.contains("SPOTIFY") => "Entertainment",
        _ => "Other",
    }
}

#[derive(Clone)]
pub struct MockLlmClient {
    confidence: f64,
    omitted: HashSet<TransactionId>,
    failure: Option<String>,
    delay: Option<Duration>,
    fenced: bool,
    healthy: bool,
    calls: Arc<AtomicUsize>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            confidence: 0.9,
            omitted: HashSet::new(),
            failure: None,
            delay: None,
            fenced: false,
            healthy: true,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Leave a transaction out of every response
    pub fn omit_transaction(mut self, id: TransactionId) -> Self {
        self.omitted.insert(id);
        self
    }

    /// Fail every call with an LLM error
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self.healthy = false;
        self
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Confidence reported for every entry (not clamped here)
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Wrap responses in a markdown code fence
    pub fn fenced(mut self) -> Self {
        self.fenced = true;
        self
    }

    /// Number of categorize calls made so far (shared between clones)
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The raw text this mock would answer with
    pub fn render_response(&self, transactions: &[Transaction]) -> String {
        let entries: Vec<_> = transactions
            .iter()
            .filter(|tx| !self.omitted.contains(&tx.id))
            .map(|tx| {
                let text = format!(
                    "{} {}",
                    tx.merchant_name.as_deref().unwrap_or_default(),
                    tx.description.as_deref().unwrap_or_default()
                );
                let category = keyword_category(&text);
                json!({
                    "transaction_id": tx.id.to_string(),
                    "category_name": category,
                    "confidence": self.confidence,
                    "rationale": format!("merchant looks like {}", category),
                })
            })
            .collect();

        let body = serde_json::Value::Array(entries).to_string();
        if self.fenced {
            format!("```json\n{}\n```", body)
        } else {
            body
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn categorize_batch(
        &self,
        transactions: &[Transaction],
        categories: &[Category],
        model: &LlmModel,
    ) -> Result<LlmBatchResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(Error::Llm(message.clone()));
        }

        let raw = self.render_response(transactions);
        let tokens = estimate_tokens(transactions, categories);
        Ok(LlmBatchResponse {
            results: parse_batch_response(&raw, categories)?,
            input_tokens: tokens.input_tokens,
            output_tokens: tokens.output_tokens,
            model: model.name.clone(),
        })
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn tx(merchant: &str) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            organization_id: Uuid::nil(),
            account_name: None,
            amount: -10.0,
            merchant_name: Some(merchant.to_string()),
            description: None,
            date: NaiveDate::from_ymd_opt(2024, 2, 2).unwrap(),
            category_id: None,
            metadata: None,
        }
    }

    fn categories() -> Vec<Category> {
        ["Food & Dining", "Groceries", "Other"]
            .iter()
            .enumerate()
            .map(|(i, name)| Category {
                id: i as i64 + 1,
                organization_id: Uuid::nil(),
                name: name.to_string(),
                parent_id: None,
                color: None,
                icon: None,
            })
            .collect()
    }

    fn model() -> LlmModel {
        crate::config::LlmConfig::default().models[0].clone()
    }

    #[test]
    fn test_keyword_category() {
        assert_eq!(keyword_category("starbucks #12"), "Food & Dining");
        assert_eq!(keyword_category("WHOLE FOODS MARKET"), "Groceries");
        assert_eq!(keyword_category("ACME"), "Other");
    }

    #[tokio::test]
    async fn test_categorizes_and_counts_calls() {
        let client = MockLlmClient::new();
        let shared = client.clone();
        let txs = vec![tx("STARBUCKS"), tx("WHOLE FOODS"), tx("ACME")];
        let response = client.categorize_batch(&txs, &categories(), &model()).await.unwrap();

        let ids: Vec<_> = response.results.iter().map(|r| r.category_id).collect();
        assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);
        assert!(response.input_tokens > 0);
        assert_eq!(response.output_tokens, 300);
        assert_eq!(response.model, "gpt-4o-mini");
        assert_eq!(shared.calls(), 1);
    }

    #[tokio::test]
    async fn test_omitted_and_fenced() {
        let txs = vec![tx("STARBUCKS"), tx("UBER")];
        let client = MockLlmClient::new().omit_transaction(txs[1].id).fenced();
        assert!(client.render_response(&txs).starts_with("```json"));

        let response = client.categorize_batch(&txs, &categories(), &model()).await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].transaction_id, txs[0].id);
    }

    #[tokio::test]
    async fn test_failing_client() {
        let client = MockLlmClient::new().failing("model overloaded");
        assert!(!client.health_check().await);
        let err = client
            .categorize_batch(&[tx("STARBUCKS")], &categories(), &model())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Llm(_)));
        assert_eq!(client.calls(), 1);
    }
}
