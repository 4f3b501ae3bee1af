//! Merchant pattern cache
//!
//! Maps (organization, normalized merchant) to a category. Lookups try an exact
//! match first, then rank fuzzy trigram candidates by
//! `0.7·similarity + 0.2·normalized_usage + 0.1·confidence`.
//!
//! Cache writes made on the lookup path go through a bounded background queue and
//! are dropped when it is full. Corrections and explicit learning write directly.

mod normalize;
mod trigram;

pub use normalize::normalize_merchant;
pub use trigram::{trigram_similarity, trigrams};

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::PatternConfig;
use crate::engine::Strategy;
use crate::error::Result;
use crate::models::{
    CategorizationMethod, CategorizationResult, CategoryId, OrganizationId, PatternCacheEntry,
    SimilarPattern, Transaction,
};
use crate::repository::PatternRepository;
use crate::worker::BackgroundQueue;

const SIMILARITY_WEIGHT: f64 = 0.7;
const USAGE_WEIGHT: f64 = 0.2;
const CONFIDENCE_WEIGHT: f64 = 0.1;

/// A deferred upsert
#[derive(Debug, Clone)]
struct PatternWrite {
    organization_id: OrganizationId,
    pattern: String,
    category_id: CategoryId,
    confidence: f64,
}

pub struct PatternCache {
    repo: Arc<dyn PatternRepository>,
    config: PatternConfig,
    /// Fuzzy hits above this confidence are written back
    write_threshold: f64,
    writes: BackgroundQueue<PatternWrite>,
}

impl PatternCache {
    /// Create the cache and spawn its write worker. Must be called inside a tokio runtime.
    pub fn new(repo: Arc<dyn PatternRepository>, config: PatternConfig, write_threshold: f64) -> Self {
        let worker_repo = Arc::clone(&repo);
        let writes = BackgroundQueue::spawn("pattern-writes", config.queue_capacity, move |w: PatternWrite| {
            let repo = Arc::clone(&worker_repo);
            async move {
                repo.upsert_pattern(w.organization_id, &w.pattern, w.category_id, w.confidence)
                    .await
                    .map(|_| ())
            }
        });

        Self {
            repo,
            config,
            write_threshold,
            writes,
        }
    }

    /// Composite ranking score for a fuzzy candidate
    pub fn composite_score(&self, candidate: &SimilarPattern) -> f64 {
        let usage = (candidate.entry.usage_count.max(0) as f64 / self.config.usage_normalization).min(1.0);
        SIMILARITY_WEIGHT * candidate.similarity
            + USAGE_WEIGHT * usage
            + CONFIDENCE_WEIGHT * candidate.entry.confidence
    }

    fn select_best(&self, candidates: Vec<SimilarPattern>) -> Option<SimilarPattern> {
        candidates
            .into_iter()
            .map(|c| (self.composite_score(&c), c))
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, c)| c)
    }

    /// Look up a transaction's merchant
    pub async fn categorize(&self, transaction: &Transaction) -> Result<CategorizationResult> {
        let start = Instant::now();
        let Some(merchant) = transaction.merchant_text() else {
            return Ok(CategorizationResult::no_match(
                CategorizationMethod::Pattern,
                "no merchant text",
            ));
        };
        let normalized = normalize_merchant(merchant);
        if normalized.is_empty() {
            return Ok(CategorizationResult::no_match(
                CategorizationMethod::Pattern,
                "merchant is empty after normalization",
            ));
        }
        let org = transaction.organization_id;

        if let Some(entry) = self.repo.find_pattern(org, &normalized).await? {
            debug!(
                organization_id = %org,
                pattern = %entry.merchant_pattern,
                category_id = entry.category_id,
                "Exact pattern hit"
            );
            // usage bump; upsert never changes the category and keeps the max confidence
            self.remember(org, &entry.merchant_pattern, entry.category_id, entry.confidence);
            return Ok(CategorizationResult::new(
                entry.category_id,
                entry.confidence,
                CategorizationMethod::Pattern,
                format!("exact pattern match: {}", entry.merchant_pattern),
            )
            .with_elapsed(start.elapsed()));
        }

        let candidates = self
            .repo
            .get_similar(org, &normalized, self.config.similarity_floor, self.config.top_k)
            .await?;
        let Some(best) = self.select_best(candidates) else {
            return Ok(CategorizationResult::no_match(
                CategorizationMethod::Pattern,
                "no similar patterns",
            )
            .with_elapsed(start.elapsed()));
        };

        let confidence = best.entry.confidence * best.similarity;
        debug!(
            organization_id = %org,
            merchant = %normalized,
            pattern = %best.entry.merchant_pattern,
            similarity = best.similarity,
            confidence,
            "Fuzzy pattern hit"
        );
        if confidence > self.write_threshold {
            self.remember(org, &normalized, best.entry.category_id, confidence);
        }

        Ok(CategorizationResult::new(
            best.entry.category_id,
            confidence,
            CategorizationMethod::Pattern,
            format!(
                "fuzzy pattern match: {} (similarity {:.2})",
                best.entry.merchant_pattern, best.similarity
            ),
        )
        .with_elapsed(start.elapsed()))
    }

    /// Queue an upsert. Dropped when the write queue is full.
    pub fn remember(
        &self,
        organization_id: OrganizationId,
        pattern: &str,
        category_id: CategoryId,
        confidence: f64,
    ) {
        let write = PatternWrite {
            organization_id,
            pattern: pattern.to_string(),
            category_id,
            confidence,
        };
        if !self.writes.try_submit(write) {
            warn!(
                organization_id = %organization_id,
                pattern,
                dropped = self.writes.dropped(),
                "Pattern write dropped"
            );
        }
    }

    /// Upsert a merchant under a category now (usage += 1, confidence = max)
    pub async fn learn(
        &self,
        organization_id: OrganizationId,
        merchant: &str,
        category_id: CategoryId,
        confidence: f64,
    ) -> Result<Option<PatternCacheEntry>> {
        let normalized = normalize_merchant(merchant);
        if normalized.is_empty() {
            return Ok(None);
        }
        let entry = self
            .repo
            .upsert_pattern(organization_id, &normalized, category_id, confidence)
            .await?;
        Ok(Some(entry))
    }

    /// Point a merchant at a user-chosen category, overwriting whatever was cached
    pub async fn correct(
        &self,
        organization_id: OrganizationId,
        merchant: &str,
        category_id: CategoryId,
    ) -> Result<Option<PatternCacheEntry>> {
        let normalized = normalize_merchant(merchant);
        if normalized.is_empty() {
            return Ok(None);
        }
        let entry = self
            .repo
            .replace_pattern(
                organization_id,
                &normalized,
                category_id,
                self.config.correction_confidence,
            )
            .await?;
        debug!(
            organization_id = %organization_id,
            pattern = %entry.merchant_pattern,
            category_id,
            "Pattern corrected"
        );
        Ok(Some(entry))
    }

    /// Ranked fuzzy candidates for a raw merchant string, best composite score first
    pub async fn similar_patterns(
        &self,
        organization_id: OrganizationId,
        merchant: &str,
    ) -> Result<Vec<(SimilarPattern, f64)>> {
        let normalized = normalize_merchant(merchant);
        let mut scored: Vec<(SimilarPattern, f64)> = self
            .repo
            .get_similar(organization_id, &normalized, self.config.similarity_floor, self.config.top_k)
            .await?
            .into_iter()
            .map(|c| {
                let score = self.composite_score(&c);
                (c, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(scored)
    }

    pub async fn list(&self, organization_id: OrganizationId) -> Result<Vec<PatternCacheEntry>> {
        self.repo.list_patterns(organization_id).await
    }

    /// The only way the cache shrinks
    pub async fn clear(&self, organization_id: OrganizationId) -> Result<usize> {
        self.flush().await;
        self.repo.clear_patterns(organization_id).await
    }

    /// Wait for queued writes to land
    pub async fn flush(&self) {
        self.writes.flush().await;
    }

    pub fn dropped_writes(&self) -> u64 {
        self.writes.dropped()
    }
}

#[async_trait]
impl Strategy for PatternCache {
    fn method(&self) -> CategorizationMethod {
        CategorizationMethod::Pattern
    }

    async fn try_categorize(&self, transaction: &Transaction) -> Result<CategorizationResult> {
        self.categorize(transaction).await
    }
}
