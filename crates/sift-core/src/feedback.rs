//! Feedback learning loop
//!
//! `record` stores the feedback and pins the transaction to the user's category
//! right away. Teaching the pattern cache, the similarity index and the rule
//! statistics happens on a bounded background queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{
    CategorizationFeedback, CategorizationMetadata, CategorizationMethod, CategoryId,
    FeedbackType, NewFeedback, OrganizationId,
};
use crate::patterns::PatternCache;
use crate::repository::{FeedbackRepository, TransactionRepository};
use crate::rules::RuleMatcher;
use crate::similarity::SimilarityRetriever;
use crate::worker::BackgroundQueue;

/// Feedback rows considered by `analyze`
const ANALYSIS_WINDOW: usize = 1000;
const TOP_CORRECTIONS: usize = 10;

struct LearningJob {
    feedback: CategorizationFeedback,
    merchant: Option<String>,
    /// Rule that produced the category the user reviewed
    rule_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodAccuracy {
    pub feedback: i64,
    pub confirmations: i64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrectionCount {
    pub old_category_id: Option<CategoryId>,
    pub new_category_id: CategoryId,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackAnalysis {
    pub organization_id: OrganizationId,
    pub total: i64,
    pub correction_rate: f64,
    pub confirmation_rate: f64,
    pub rejection_rate: f64,
    pub avg_confidence_before: Option<f64>,
    pub method_accuracy: BTreeMap<String, MethodAccuracy>,
    pub common_corrections: Vec<CorrectionCount>,
}

pub struct FeedbackLearner {
    feedback: Arc<dyn FeedbackRepository>,
    transactions: Arc<dyn TransactionRepository>,
    patterns: Arc<PatternCache>,
    queue: BackgroundQueue<LearningJob>,
}

impl FeedbackLearner {
    /// Spawns the learning worker. Must be called inside a tokio runtime.
    pub fn new(
        feedback: Arc<dyn FeedbackRepository>,
        transactions: Arc<dyn TransactionRepository>,
        patterns: Arc<PatternCache>,
        similarity: Arc<SimilarityRetriever>,
        rules: Arc<RuleMatcher>,
        queue_capacity: usize,
    ) -> Self {
        let worker_patterns = Arc::clone(&patterns);
        let queue = BackgroundQueue::spawn("feedback-learning", queue_capacity, move |job: LearningJob| {
            let patterns = Arc::clone(&worker_patterns);
            let similarity = Arc::clone(&similarity);
            let rules = Arc::clone(&rules);
            async move { learn(&patterns, &similarity, &rules, job).await }
        });

        Self {
            feedback,
            transactions,
            patterns,
            queue,
        }
    }

    /// Store feedback, apply the user's category to the transaction and queue learning.
    /// Missing "before" fields are filled from the transaction.
    pub async fn record(&self, feedback: &NewFeedback) -> Result<CategorizationFeedback> {
        let transaction = self
            .transactions
            .get_by_id(feedback.transaction_id)
            .await?
            .filter(|tx| tx.organization_id == feedback.organization_id)
            .ok_or_else(|| Error::NotFound(format!("transaction {}", feedback.transaction_id)))?;

        let previous = transaction.metadata.as_ref();
        let mut filled = feedback.clone();
        if filled.old_category_id.is_none() {
            filled.old_category_id = transaction.category_id;
        }
        if filled.confidence_before.is_none() {
            filled.confidence_before = previous.and_then(|m| m.confidence_score);
        }
        if filled.method_used.is_none() {
            filled.method_used = previous.and_then(|m| m.method);
        }

        let stored = self.feedback.create_feedback(&filled).await?;

        let metadata = match stored.feedback_type {
            FeedbackType::Confirmation => CategorizationMetadata {
                user_corrected: true,
                needs_review: false,
                feedback_id: Some(stored.id),
                corrected_at: Some(chrono::Utc::now()),
                ..previous.cloned().unwrap_or_default()
            },
            FeedbackType::Correction | FeedbackType::Rejection => {
                CategorizationMetadata::user_correction(stored.id, previous)
            }
        };
        self.transactions
            .update_categorization(transaction.id, stored.new_category_id, &metadata, true)
            .await?;

        let rule_id = match stored.method_used {
            Some(CategorizationMethod::Rule) => previous
                .and_then(|m| m.rule_matches.first())
                .map(|m| m.rule_id),
            _ => None,
        };
        info!(
            organization_id = %stored.organization_id,
            transaction_id = %stored.transaction_id,
            feedback_type = %stored.feedback_type,
            new_category_id = stored.new_category_id,
            "Feedback recorded"
        );

        self.queue
            .submit(LearningJob {
                feedback: stored.clone(),
                merchant: transaction.merchant_text().map(str::to_string),
                rule_id,
            })
            .await?;
        Ok(stored)
    }

    /// Wait for queued learning, and the pattern writes it caused, to land
    pub async fn flush(&self) {
        self.queue.flush().await;
        self.patterns.flush().await;
    }

    pub async fn stats(&self, organization_id: OrganizationId) -> Result<crate::models::FeedbackStats> {
        self.feedback.feedback_stats(organization_id).await
    }

    /// Feedback rates, per-method accuracy and the most common corrections
    pub async fn analyze(&self, organization_id: OrganizationId) -> Result<FeedbackAnalysis> {
        let stats = self.feedback.feedback_stats(organization_id).await?;
        let recent = self.feedback.list_feedback(organization_id, ANALYSIS_WINDOW).await?;

        let rate = |n: i64| if stats.total > 0 { n as f64 / stats.total as f64 } else { 0.0 };

        let mut method_accuracy: BTreeMap<String, MethodAccuracy> = BTreeMap::new();
        let mut corrections: HashMap<(Option<CategoryId>, CategoryId), usize> = HashMap::new();
        for fb in &recent {
            if let Some(method) = fb.method_used {
                let entry = method_accuracy
                    .entry(method.as_str().to_string())
                    .or_insert(MethodAccuracy {
                        feedback: 0,
                        confirmations: 0,
                        accuracy: 0.0,
                    });
                entry.feedback += 1;
                if fb.feedback_type == FeedbackType::Confirmation {
                    entry.confirmations += 1;
                }
            }
            if fb.feedback_type == FeedbackType::Correction {
                *corrections.entry((fb.old_category_id, fb.new_category_id)).or_default() += 1;
            }
        }
        for entry in method_accuracy.values_mut() {
            entry.accuracy = entry.confirmations as f64 / entry.feedback as f64;
        }

        let mut common_corrections: Vec<CorrectionCount> = corrections
            .into_iter()
            .map(|((old_category_id, new_category_id), count)| CorrectionCount {
                old_category_id,
                new_category_id,
                count,
            })
            .collect();
        common_corrections.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(a.new_category_id.cmp(&b.new_category_id))
                .then(a.old_category_id.cmp(&b.old_category_id))
        });
        common_corrections.truncate(TOP_CORRECTIONS);

        Ok(FeedbackAnalysis {
            organization_id,
            total: stats.total,
            correction_rate: rate(stats.corrections),
            confirmation_rate: rate(stats.confirmations),
            rejection_rate: rate(stats.rejections),
            avg_confidence_before: stats.avg_confidence_before,
            method_accuracy,
            common_corrections,
        })
    }
}

async fn learn(
    patterns: &PatternCache,
    similarity: &SimilarityRetriever,
    rules: &RuleMatcher,
    job: LearningJob,
) -> Result<()> {
    let fb = &job.feedback;
    if let Some(merchant) = &job.merchant {
        patterns
            .correct(fb.organization_id, merchant, fb.new_category_id)
            .await?;
    }
    if let Some(rule_id) = job.rule_id {
        rules
            .record_outcome(rule_id, fb.feedback_type == FeedbackType::Confirmation)
            .await?;
    }
    let rebuilt = similarity.learn_from_feedback(fb).await?;
    debug!(
        organization_id = %fb.organization_id,
        transaction_id = %fb.transaction_id,
        rebuilt,
        "Learned from feedback"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PatternConfig, SimilarityConfig};
    use crate::db::Database;
    use crate::models::{NewRule, NewTransaction, RuleField, RuleMatch, RuleOperator, Transaction};
    use crate::similarity::HashingEmbedder;
    use chrono::Utc;
    use uuid::Uuid;

    struct Fixture {
        db: Database,
        learner: FeedbackLearner,
        patterns: Arc<PatternCache>,
        org: OrganizationId,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let patterns = Arc::new(PatternCache::new(Arc::new(db.clone()), PatternConfig::default(), 0.6));
        let similarity = Arc::new(SimilarityRetriever::new(
            Arc::new(HashingEmbedder::new(64)),
            Arc::new(db.clone()),
            Arc::new(db.clone()),
            SimilarityConfig::default(),
        ));
        let rules = Arc::new(RuleMatcher::new(Arc::new(db.clone()), Arc::new(db.clone())));
        let learner = FeedbackLearner::new(
            Arc::new(db.clone()),
            Arc::new(db.clone()),
            Arc::clone(&patterns),
            similarity,
            rules,
            16,
        );
        Fixture {
            db,
            learner,
            patterns,
            org: Uuid::new_v4(),
        }
    }

    fn categorized(f: &Fixture, merchant: &str, category: CategoryId, metadata: CategorizationMetadata) -> Transaction {
        let tx = f
            .db
            .insert_transaction(&NewTransaction {
                organization_id: f.org,
                account_name: None,
                amount: -42.0,
                merchant_name: Some(merchant.to_string()),
                description: None,
                date: Utc::now().date_naive(),
            })
            .unwrap();
        f.db.set_transaction_category(tx.id, category, &metadata).unwrap();
        f.db.get_transaction(tx.id).unwrap().unwrap()
    }

    fn llm_metadata(confidence: f64) -> CategorizationMetadata {
        CategorizationMetadata {
            confidence_score: Some(confidence),
            method: Some(CategorizationMethod::LlmBatch),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_correction_pins_category_and_teaches_patterns() {
        let f = fixture();
        let shopping = f.db.create_category(f.org, "Shopping", None).unwrap();
        let groceries = f.db.create_category(f.org, "Groceries", None).unwrap();
        let tx = categorized(&f, "WHOLE FOODS", shopping.id, llm_metadata(0.72));

        let stored = f
            .learner
            .record(&NewFeedback::new(f.org, tx.id, groceries.id, FeedbackType::Correction))
            .await
            .unwrap();
        // before-fields come from the transaction
        assert_eq!(stored.old_category_id, Some(shopping.id));
        assert_eq!(stored.confidence_before, Some(0.72));
        assert_eq!(stored.method_used, Some(CategorizationMethod::LlmBatch));

        let updated = f.db.get_transaction(tx.id).unwrap().unwrap();
        assert_eq!(updated.category_id, Some(groceries.id));
        assert!(updated.is_user_corrected());
        assert_eq!(updated.metadata.unwrap().feedback_id, Some(stored.id));

        f.learner.flush().await;
        let pattern = f.db.get_pattern(f.org, "WHOLE FOODS").unwrap().unwrap();
        assert_eq!(pattern.category_id, groceries.id);
        assert_eq!(pattern.confidence, 1.0);
        assert_eq!(f.db.count_embeddings(f.org).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_correction_overrides_existing_pattern() {
        let f = fixture();
        let shopping = f.db.create_category(f.org, "Shopping", None).unwrap();
        let groceries = f.db.create_category(f.org, "Groceries", None).unwrap();
        f.patterns.learn(f.org, "WHOLE FOODS", shopping.id, 0.9).await.unwrap();
        let tx = categorized(&f, "WHOLE FOODS", shopping.id, llm_metadata(0.9));

        f.learner
            .record(&NewFeedback::new(f.org, tx.id, groceries.id, FeedbackType::Correction))
            .await
            .unwrap();
        f.learner.flush().await;

        let pattern = f.db.get_pattern(f.org, "WHOLE FOODS").unwrap().unwrap();
        assert_eq!(pattern.category_id, groceries.id);
        assert_eq!(pattern.usage_count, 2);
    }

    #[tokio::test]
    async fn test_rule_feedback_updates_success_rate() {
        let f = fixture();
        let coffee = f.db.create_category(f.org, "Coffee", None).unwrap();
        let food = f.db.create_category(f.org, "Food & Dining", None).unwrap();
        let rule = f
            .db
            .insert_rule(&NewRule::new(f.org, coffee.id, RuleField::Merchant, RuleOperator::Contains, "STAR"))
            .unwrap();
        let metadata = CategorizationMetadata {
            confidence_score: Some(0.9),
            method: Some(CategorizationMethod::Rule),
            rule_matches: vec![RuleMatch {
                rule_id: rule.id,
                category_id: coffee.id,
                field: rule.field,
                operator: rule.operator,
                value: rule.value.clone(),
                confidence: 0.9,
                priority: 0,
            }],
            ..Default::default()
        };
        let tx = categorized(&f, "STAR DELI", coffee.id, metadata);

        f.learner
            .record(&NewFeedback::new(f.org, tx.id, food.id, FeedbackType::Correction))
            .await
            .unwrap();
        f.learner.flush().await;

        let rule = f.db.get_rule(rule.id).unwrap();
        assert!((rule.success_rate - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_confirmation_keeps_method() {
        let f = fixture();
        let groceries = f.db.create_category(f.org, "Groceries", None).unwrap();
        let tx = categorized(&f, "TRADER JOE'S", groceries.id, llm_metadata(0.65));

        f.learner
            .record(&NewFeedback::new(f.org, tx.id, groceries.id, FeedbackType::Confirmation))
            .await
            .unwrap();
        let metadata = f.db.get_transaction(tx.id).unwrap().unwrap().metadata.unwrap();
        assert!(metadata.user_corrected);
        assert_eq!(metadata.method, Some(CategorizationMethod::LlmBatch));
        assert_eq!(metadata.confidence_score, Some(0.65));
    }

    #[tokio::test]
    async fn test_unknown_or_foreign_transaction_is_not_found() {
        let f = fixture();
        let other = Uuid::new_v4();
        let cat = f.db.create_category(f.org, "Other", None).unwrap();
        let tx = categorized(&f, "ACME", cat.id, llm_metadata(0.5));

        let foreign = NewFeedback::new(other, tx.id, cat.id, FeedbackType::Correction);
        assert!(matches!(f.learner.record(&foreign).await, Err(Error::NotFound(_))));
        let missing = NewFeedback::new(f.org, Uuid::new_v4(), cat.id, FeedbackType::Correction);
        assert!(matches!(f.learner.record(&missing).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_analyze() {
        let f = fixture();
        let shopping = f.db.create_category(f.org, "Shopping", None).unwrap();
        let groceries = f.db.create_category(f.org, "Groceries", None).unwrap();

        for (merchant, feedback_type, new_category) in [
            ("WHOLE FOODS", FeedbackType::Correction, groceries.id),
            ("WHOLE FOODS #2", FeedbackType::Correction, groceries.id),
            ("TARGET", FeedbackType::Confirmation, shopping.id),
            ("AMAZON", FeedbackType::Confirmation, shopping.id),
        ] {
            let tx = categorized(&f, merchant, shopping.id, llm_metadata(0.8));
            f.learner
                .record(&NewFeedback::new(f.org, tx.id, new_category, feedback_type))
                .await
                .unwrap();
        }
        f.learner.flush().await;

        let analysis = f.learner.analyze(f.org).await.unwrap();
        assert_eq!(analysis.total, 4);
        assert!((analysis.correction_rate - 0.5).abs() < 1e-9);
        assert!((analysis.confirmation_rate - 0.5).abs() < 1e-9);
        assert_eq!(analysis.rejection_rate, 0.0);
        let llm = &analysis.method_accuracy["llm_batch"];
        assert_eq!(llm.feedback, 4);
        assert!((llm.accuracy - 0.5).abs() < 1e-9);
        assert_eq!(analysis.common_corrections.len(), 1);
        assert_eq!(analysis.common_corrections[0].count, 2);
        assert_eq!(analysis.common_corrections[0].old_category_id, Some(shopping.id));
    }
}
