//! Repository interfaces consumed by the engine
//!
//! Every collaborator the engine talks to is a trait here; [`crate::db::Database`]
//! implements all of them on SQLite. All reads and writes are scoped by organization.

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{info, warn};

use crate::error::Result;
use crate::models::{
    BudgetAlert, BudgetSettings, CategorizationFeedback, CategorizationMetadata,
    CategorizationStats, Category, CategoryId, CostTracker, FeedbackStats, LlmBatch, NewFeedback,
    NewLlmBatch, NewRule, OrganizationId, PatternCacheEntry, Rule, SimilarPattern,
    SimilarityMatch, Transaction, TransactionId,
};

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn get_by_id(&self, id: TransactionId) -> Result<Option<Transaction>>;

    /// Returns found transactions in the order of `ids`; unknown ids are omitted
    async fn get_by_ids(&self, ids: &[TransactionId]) -> Result<Vec<Transaction>>;

    async fn get_by_date_range(
        &self,
        organization_id: OrganizationId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Transaction>>;

    async fn get_uncategorized(&self, organization_id: OrganizationId) -> Result<Vec<Transaction>>;

    async fn get_recently_categorized(
        &self,
        organization_id: OrganizationId,
        since: NaiveDate,
        limit: usize,
    ) -> Result<Vec<Transaction>>;

    /// Store a categorization. Unless `force` is set, a user-corrected
    /// transaction is left untouched and the call returns false.
    async fn update_categorization(
        &self,
        id: TransactionId,
        category_id: CategoryId,
        metadata: &CategorizationMetadata,
        force: bool,
    ) -> Result<bool>;

    async fn categorization_stats(
        &self,
        organization_id: OrganizationId,
    ) -> Result<CategorizationStats>;
}

#[async_trait]
pub trait CategoryRepository: Send + Sync {
    async fn list_categories(&self, organization_id: OrganizationId) -> Result<Vec<Category>>;
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn list_rules(&self, organization_id: OrganizationId) -> Result<Vec<Rule>>;

    async fn create_rule(&self, rule: &NewRule) -> Result<Rule>;

    async fn update_rule(&self, rule: &Rule) -> Result<()>;

    async fn delete_rule(&self, id: i64) -> Result<()>;

    /// Count a winning match
    async fn increment_usage(&self, id: i64) -> Result<()>;

    /// Fold user feedback into the rolling success rate
    async fn update_usage(&self, id: i64, success: bool) -> Result<()>;
}

#[async_trait]
pub trait PatternRepository: Send + Sync {
    async fn list_patterns(&self, organization_id: OrganizationId)
        -> Result<Vec<PatternCacheEntry>>;

    /// Exact, case-insensitive lookup of a normalized pattern
    async fn find_pattern(
        &self,
        organization_id: OrganizationId,
        pattern: &str,
    ) -> Result<Option<PatternCacheEntry>>;

    /// Patterns with trigram similarity >= `threshold`, best first
    async fn get_similar(
        &self,
        organization_id: OrganizationId,
        merchant: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarPattern>>;

    /// Insert, or bump usage and keep the higher confidence. Never changes the category.
    async fn upsert_pattern(
        &self,
        organization_id: OrganizationId,
        pattern: &str,
        category_id: CategoryId,
        confidence: f64,
    ) -> Result<PatternCacheEntry>;

    /// Insert, or overwrite category and confidence and bump usage
    async fn replace_pattern(
        &self,
        organization_id: OrganizationId,
        pattern: &str,
        category_id: CategoryId,
        confidence: f64,
    ) -> Result<PatternCacheEntry>;

    async fn clear_patterns(&self, organization_id: OrganizationId) -> Result<usize>;
}

#[async_trait]
pub trait FeedbackRepository: Send + Sync {
    async fn create_feedback(&self, feedback: &NewFeedback) -> Result<CategorizationFeedback>;

    async fn list_feedback(
        &self,
        organization_id: OrganizationId,
        limit: usize,
    ) -> Result<Vec<CategorizationFeedback>>;

    async fn list_feedback_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<CategorizationFeedback>>;

    async fn feedback_stats(&self, organization_id: OrganizationId) -> Result<FeedbackStats>;
}

#[async_trait]
pub trait CostRepository: Send + Sync {
    async fn get_cost_tracker(&self, organization_id: OrganizationId)
        -> Result<Option<CostTracker>>;

    async fn update_cost_tracker(&self, tracker: &CostTracker) -> Result<()>;

    async fn get_budget_settings(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Option<BudgetSettings>>;

    async fn update_budget_settings(&self, settings: &BudgetSettings) -> Result<()>;

    async fn record_cost_entry(
        &self,
        organization_id: OrganizationId,
        cost: f64,
        transaction_count: i64,
    ) -> Result<()>;

    async fn daily_spend(&self, organization_id: OrganizationId, day: NaiveDate) -> Result<f64>;

    /// Spend for the calendar month containing `day`
    async fn monthly_spend(&self, organization_id: OrganizationId, day: NaiveDate) -> Result<f64>;
}

#[async_trait]
pub trait LlmBatchRepository: Send + Sync {
    async fn create_batch(&self, batch: &NewLlmBatch) -> Result<i64>;

    async fn list_batches(
        &self,
        organization_id: OrganizationId,
        limit: usize,
    ) -> Result<Vec<LlmBatch>>;
}

/// Nearest-neighbour store of categorized transaction embeddings
#[async_trait]
pub trait EmbeddingIndex: Send + Sync {
    async fn upsert_embedding(
        &self,
        organization_id: OrganizationId,
        transaction_id: TransactionId,
        category_id: CategoryId,
        text: &str,
        embedding: &[f32],
    ) -> Result<()>;

    /// Matches with cosine similarity >= `threshold`, best first
    async fn search(
        &self,
        organization_id: OrganizationId,
        embedding: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarityMatch>>;

    async fn clear_index(&self, organization_id: OrganizationId) -> Result<usize>;

    async fn index_size(&self, organization_id: OrganizationId) -> Result<usize>;
}

/// External alerting collaborator
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_budget_alert(
        &self,
        organization_id: OrganizationId,
        alert: &BudgetAlert,
    ) -> Result<()>;
}

/// Alert sink that only writes to the log
#[derive(Debug, Clone, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send_budget_alert(
        &self,
        organization_id: OrganizationId,
        alert: &BudgetAlert,
    ) -> Result<()> {
        match alert.severity {
            crate::models::AlertSeverity::Info => info!(
                organization_id = %organization_id,
                period = %alert.period,
                percentage = alert.percentage,
                "{}",
                alert.message
            ),
            _ => warn!(
                organization_id = %organization_id,
                period = %alert.period,
                severity = %alert.severity,
                percentage = alert.percentage,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}
