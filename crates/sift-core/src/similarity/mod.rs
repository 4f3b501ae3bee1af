//! Similarity retrieval over previously categorized transactions
//!
//! A transaction is embedded and compared against the organization's embedding
//! index. The categories of the nearest neighbours vote, weighted by similarity.
//! Embedding or index failures are never fatal: the retriever reports "no result"
//! and the chain moves on.

mod embedding;

pub use embedding::{transaction_text, EmbeddingProvider, HashingEmbedder};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::config::SimilarityConfig;
use crate::engine::Strategy;
use crate::error::{Error, Result};
use crate::models::{
    CategorizationFeedback, CategorizationMethod, CategorizationResult, CategoryId,
    FeedbackType, OrganizationId, SimilarityMatch, Transaction,
};
use crate::repository::{EmbeddingIndex, TransactionRepository};

/// Cosine similarity of two vectors. Mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Category vote over neighbour matches: (category, confidence)
///
/// Confidence is the winner's share of the total similarity weight times the best
/// similarity among the winner's matches.
pub fn vote(matches: &[SimilarityMatch]) -> Option<(CategoryId, f64)> {
    let mut tallies: HashMap<CategoryId, (f64, f64)> = HashMap::new();
    let mut total = 0.0;
    for m in matches {
        let similarity = m.similarity.max(0.0);
        let tally = tallies.entry(m.category_id).or_insert((0.0, 0.0));
        tally.0 += similarity;
        tally.1 = tally.1.max(similarity);
        total += similarity;
    }
    if total <= 0.0 {
        return None;
    }

    let (category_id, (weight, top)) = tallies.into_iter().max_by(|a, b| {
        a.1 .0
            .total_cmp(&b.1 .0)
            .then(a.1 .1.total_cmp(&b.1 .1))
            .then(b.0.cmp(&a.0))
    })?;
    Some((category_id, (weight / total) * top))
}

pub struct SimilarityRetriever {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn EmbeddingIndex>,
    transactions: Arc<dyn TransactionRepository>,
    config: SimilarityConfig,
    /// Corrections seen since the last rebuild, per organization
    corrections: Mutex<HashMap<OrganizationId, usize>>,
}

impl SimilarityRetriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn EmbeddingIndex>,
        transactions: Arc<dyn TransactionRepository>,
        config: SimilarityConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            transactions,
            config,
            corrections: Mutex::new(HashMap::new()),
        }
    }

    pub fn embedder_name(&self) -> &str {
        self.embedder.name()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.embedder.embed(text)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: format!("{} embedding", self.embedder.name()),
                elapsed: timeout,
            }),
        }
    }

    pub async fn categorize(&self, transaction: &Transaction) -> Result<CategorizationResult> {
        let start = Instant::now();
        let method = CategorizationMethod::Similarity;
        if !self.config.enabled {
            return Ok(CategorizationResult::no_match(method, "similarity disabled"));
        }
        let text = transaction_text(transaction);
        if text.is_empty() {
            return Ok(CategorizationResult::no_match(method, "no text to embed"));
        }

        let embedding = match self.embed(&text).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(transaction_id = %transaction.id, error = %e, "Embedding failed");
                return Ok(CategorizationResult::no_match(
                    method,
                    format!("embedding failed: {}", e),
                ));
            }
        };

        let matches = match self
            .index
            .search(
                transaction.organization_id,
                &embedding,
                self.config.threshold,
                self.config.top_k + 1,
            )
            .await
        {
            Ok(matches) => matches,
            Err(e) => {
                warn!(transaction_id = %transaction.id, error = %e, "Similarity search failed");
                return Ok(CategorizationResult::no_match(
                    method,
                    format!("similarity index unavailable: {}", e),
                ));
            }
        };

        let mut matches: Vec<SimilarityMatch> = matches
            .into_iter()
            .filter(|m| m.transaction_id != transaction.id)
            .collect();
        matches.truncate(self.config.top_k);

        let Some((category_id, confidence)) = vote(&matches) else {
            return Ok(CategorizationResult::no_match(method, "no similar transactions")
                .with_elapsed(start.elapsed()));
        };
        debug!(
            transaction_id = %transaction.id,
            category_id,
            confidence,
            neighbours = matches.len(),
            "Similarity vote"
        );

        let agreeing = matches.iter().filter(|m| m.category_id == category_id).count();
        let mut result = CategorizationResult::new(
            category_id,
            confidence,
            method,
            format!("{} of {} similar transactions agree", agreeing, matches.len()),
        );
        result.similarity_matches = matches;
        Ok(result.with_elapsed(start.elapsed()))
    }

    /// Add (or refresh) a categorized transaction in the index.
    /// Returns false for uncategorized or textless transactions.
    pub async fn index_transaction(&self, transaction: &Transaction) -> Result<bool> {
        let Some(category_id) = transaction.category_id else {
            return Ok(false);
        };
        let text = transaction_text(transaction);
        if text.is_empty() {
            return Ok(false);
        }
        let embedding = self.embed(&text).await?;
        self.index
            .upsert_embedding(
                transaction.organization_id,
                transaction.id,
                category_id,
                &text,
                &embedding,
            )
            .await?;
        Ok(true)
    }

    /// Re-index a corrected transaction; rebuild the organization's index once enough
    /// corrections have accumulated. Returns true when a rebuild ran.
    pub async fn learn_from_feedback(&self, feedback: &CategorizationFeedback) -> Result<bool> {
        if let Some(transaction) = self.transactions.get_by_id(feedback.transaction_id).await? {
            self.index_transaction(&transaction).await?;
        }
        if feedback.feedback_type == FeedbackType::Confirmation {
            return Ok(false);
        }

        let due = {
            let mut corrections = self
                .corrections
                .lock()
                .map_err(|_| Error::InvalidData("correction counter poisoned".to_string()))?;
            let count = corrections.entry(feedback.organization_id).or_insert(0);
            *count += 1;
            if self.config.rebuild_after_corrections > 0 && *count >= self.config.rebuild_after_corrections {
                *count = 0;
                true
            } else {
                false
            }
        };

        if due {
            self.rebuild_index(feedback.organization_id).await?;
        }
        Ok(due)
    }

    /// Clear the organization's index and re-embed its recently categorized transactions
    pub async fn rebuild_index(&self, organization_id: OrganizationId) -> Result<usize> {
        let start = Instant::now();
        let since = Utc::now().date_naive() - ChronoDuration::days(self.config.rebuild_lookback_days);
        let transactions = self
            .transactions
            .get_recently_categorized(organization_id, since, self.config.rebuild_limit)
            .await?;

        self.index.clear_index(organization_id).await?;
        let mut indexed = 0;
        for transaction in &transactions {
            if self.index_transaction(transaction).await? {
                indexed += 1;
            }
        }
        info!(
            organization_id = %organization_id,
            indexed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Similarity index rebuilt"
        );
        Ok(indexed)
    }

    pub async fn index_size(&self, organization_id: OrganizationId) -> Result<usize> {
        self.index.index_size(organization_id).await
    }
}

#[async_trait]
impl Strategy for SimilarityRetriever {
    fn method(&self) -> CategorizationMethod {
        CategorizationMethod::Similarity
    }

    async fn try_categorize(&self, transaction: &Transaction) -> Result<CategorizationResult> {
        self.categorize(transaction).await
    }
}
