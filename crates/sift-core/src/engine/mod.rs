//! Categorization orchestrator
//!
//! Each transaction runs through the deterministic stages in fixed order
//! (rule, pattern, similarity) and stops at the first result that clears the
//! acceptance threshold. Whatever is left is sent to the batch LLM classifier as
//! one group, and every LLM result is final: below the threshold it is persisted
//! but flagged for review.
//!
//! Already-categorized and user-corrected transactions are skipped unless the
//! caller forces recategorization.

mod strategy;

pub use strategy::Strategy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::budget::{CostGovernor, RateLimiter};
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::feedback::FeedbackLearner;
use crate::llm::{BatchClassifier, LlmClient, LlmProvider, OpenAICompatibleClient};
use crate::models::{
    clamp_confidence, BatchRequest, BatchSummary, CategorizationFeedback, CategorizationMetadata,
    CategorizationMethod, CategorizationResult, CategorizationStats, CategoryId, CostEstimate,
    NewFeedback, OrganizationId, OutcomeStatus, Transaction, TransactionId, TransactionOutcome,
    TransactionSelector,
};
use crate::patterns::{normalize_merchant, PatternCache};
use crate::repository::{
    AlertSink, CategoryRepository, CostRepository, EmbeddingIndex, FeedbackRepository,
    LlmBatchRepository, PatternRepository, RuleRepository, TransactionRepository,
};
use crate::rules::RuleMatcher;
use crate::similarity::{EmbeddingProvider, HashingEmbedder, SimilarityRetriever};

/// Cooperative cancellation signal, checked before each LLM sub-batch
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Collaborators the engine reads and writes through
#[derive(Clone)]
pub struct Repositories {
    pub transactions: Arc<dyn TransactionRepository>,
    pub categories: Arc<dyn CategoryRepository>,
    pub rules: Arc<dyn RuleRepository>,
    pub patterns: Arc<dyn PatternRepository>,
    pub feedback: Arc<dyn FeedbackRepository>,
    pub costs: Arc<dyn CostRepository>,
    pub batches: Arc<dyn LlmBatchRepository>,
    pub embeddings: Arc<dyn EmbeddingIndex>,
    pub alerts: Arc<dyn AlertSink>,
}

impl Repositories {
    /// Every repository backed by one SQLite database
    pub fn sqlite(db: &Database) -> Self {
        let db = Arc::new(db.clone());
        Self {
            transactions: db.clone(),
            categories: db.clone(),
            rules: db.clone(),
            patterns: db.clone(),
            feedback: db.clone(),
            costs: db.clone(),
            batches: db.clone(),
            embeddings: db.clone(),
            alerts: db,
        }
    }
}

/// Run the deterministic stages in order. Returns the first result that clears
/// `threshold`, or None when the transaction needs the LLM.
async fn run_chain(
    strategies: &[Arc<dyn Strategy>],
    transaction: &Transaction,
    threshold: f64,
) -> Result<Option<CategorizationResult>> {
    for strategy in strategies {
        let result = strategy.try_categorize(transaction).await?;
        debug!(
            transaction_id = %transaction.id,
            method = %result.method,
            category_id = ?result.category_id,
            confidence = result.confidence,
            "{}",
            result.explanation
        );
        if result.clears(threshold) {
            return Ok(Some(result));
        }
    }
    Ok(None)
}

fn should_skip(transaction: &Transaction, force: bool) -> bool {
    !force && (transaction.is_categorized() || transaction.is_user_corrected())
}

/// The stored categorization of a skipped transaction
fn existing_result(transaction: &Transaction) -> CategorizationResult {
    let metadata = transaction.metadata.as_ref();
    let (method, explanation) = if transaction.is_user_corrected() {
        (CategorizationMethod::Manual, "user-corrected category kept")
    } else {
        (
            metadata.and_then(|m| m.method).unwrap_or(CategorizationMethod::Manual),
            "already categorized",
        )
    };
    match transaction.category_id {
        Some(category_id) => CategorizationResult::new(
            category_id,
            metadata.and_then(|m| m.confidence_score).unwrap_or(1.0),
            method,
            explanation,
        ),
        None => CategorizationResult::no_match(method, explanation),
    }
}

fn failed(transaction_id: TransactionId, error: &Error) -> TransactionOutcome {
    TransactionOutcome::new(transaction_id, OutcomeStatus::Failed)
        .with_error(error.to_string(), error.is_retryable())
}

pub struct CategorizationEngine {
    config: EngineConfig,
    transactions: Arc<dyn TransactionRepository>,
    categories: Arc<dyn CategoryRepository>,
    strategies: Arc<[Arc<dyn Strategy>]>,
    rules: Arc<RuleMatcher>,
    patterns: Arc<PatternCache>,
    similarity: Arc<SimilarityRetriever>,
    governor: Arc<CostGovernor>,
    classifier: BatchClassifier,
    learner: FeedbackLearner,
}

impl CategorizationEngine {
    /// Wire the engine. Spawns the pattern and feedback workers, so it must be
    /// called inside a tokio runtime.
    pub fn new(
        config: EngineConfig,
        repos: Repositories,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let model = config.llm.active_model()?;

        let rules = Arc::new(RuleMatcher::new(repos.rules.clone(), repos.transactions.clone()));
        let patterns = Arc::new(PatternCache::new(
            repos.patterns.clone(),
            config.patterns.clone(),
            config.thresholds.pattern_write,
        ));
        let similarity = Arc::new(SimilarityRetriever::new(
            embedder,
            repos.embeddings.clone(),
            repos.transactions.clone(),
            config.similarity.clone(),
        ));
        let governor = Arc::new(CostGovernor::new(
            repos.costs.clone(),
            repos.alerts.clone(),
            config.budget.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let classifier = BatchClassifier::new(
            llm,
            Arc::clone(&governor),
            limiter,
            repos.batches.clone(),
            model,
            config.batch.max_size,
            config.llm.timeout(),
        );
        let learner = FeedbackLearner::new(
            repos.feedback.clone(),
            repos.transactions.clone(),
            Arc::clone(&patterns),
            Arc::clone(&similarity),
            Arc::clone(&rules),
            config.batch.learner_queue_capacity,
        );

        let strategies: Arc<[Arc<dyn Strategy>]> = Arc::new([
            Arc::clone(&rules) as Arc<dyn Strategy>,
            Arc::clone(&patterns) as Arc<dyn Strategy>,
            Arc::clone(&similarity) as Arc<dyn Strategy>,
        ]);

        Ok(Self {
            config,
            transactions: repos.transactions,
            categories: repos.categories,
            strategies,
            rules,
            patterns,
            similarity,
            governor,
            classifier,
            learner,
        })
    }

    /// Engine over a SQLite database with the configured LLM backend. Embeddings
    /// come from the LLM host when `llm.embedding_model` is set, otherwise from the
    /// local hashing embedder.
    pub fn from_config(db: &Database, config: EngineConfig) -> Result<Self> {
        let llm: Arc<dyn LlmClient> = Arc::new(LlmProvider::from_config(&config.llm)?);
        let embedder: Arc<dyn EmbeddingProvider> = match &config.llm.embedding_model {
            Some(model) => Arc::new(
                OpenAICompatibleClient::from_config(&config.llm)?
                    .with_embedding_model(model, config.similarity.dimensions),
            ),
            None => Arc::new(HashingEmbedder::new(config.similarity.dimensions)),
        };
        Self::new(config, Repositories::sqlite(db), llm, embedder)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleMatcher {
        &self.rules
    }

    pub fn patterns(&self) -> &PatternCache {
        &self.patterns
    }

    pub fn similarity(&self) -> &SimilarityRetriever {
        &self.similarity
    }

    pub fn governor(&self) -> &CostGovernor {
        &self.governor
    }

    pub fn classifier(&self) -> &BatchClassifier {
        &self.classifier
    }

    pub fn learner(&self) -> &FeedbackLearner {
        &self.learner
    }

    /// Persist a result and teach the caches. Returns the outcome status.
    ///
    /// Unless `force` is set the write yields to a correction recorded while the
    /// result was being computed, and the status is `Skipped`.
    async fn finalize(
        &self,
        transaction: &Transaction,
        result: &CategorizationResult,
        threshold: f64,
        force: bool,
    ) -> Result<OutcomeStatus> {
        let Some(category_id) = result.category_id else {
            return Ok(OutcomeStatus::Uncategorized);
        };
        let metadata = CategorizationMetadata::from_result(result, threshold);
        let written = self
            .transactions
            .update_categorization(transaction.id, category_id, &metadata, force)
            .await?;
        if !written {
            info!(transaction_id = %transaction.id, "Kept user correction made during categorization");
            return Ok(OutcomeStatus::Skipped);
        }

        if metadata.needs_review {
            debug!(transaction_id = %transaction.id, confidence = result.confidence, "Persisted for review");
            return Ok(OutcomeStatus::LowConfidence);
        }
        self.learn_from(transaction, result, category_id).await;
        Ok(OutcomeStatus::Categorized)
    }

    /// Remember a confident result in the pattern cache and the similarity index.
    /// Failures are logged only.
    async fn learn_from(&self, transaction: &Transaction, result: &CategorizationResult, category_id: CategoryId) {
        if result.method != CategorizationMethod::Pattern {
            if let Some(merchant) = transaction.merchant_text() {
                let pattern = normalize_merchant(merchant);
                if !pattern.is_empty() {
                    self.patterns
                        .remember(transaction.organization_id, &pattern, category_id, result.confidence);
                }
            }
        }

        let similarity = &self.config.similarity;
        if similarity.enabled && similarity.index_confident_results {
            let mut categorized = transaction.clone();
            categorized.category_id = Some(category_id);
            if let Err(e) = self.similarity.index_transaction(&categorized).await {
                warn!(transaction_id = %transaction.id, error = %e, "Failed to index transaction");
            }
        }
    }

    /// Finalize a result into an outcome. A result that lost to a user correction
    /// carries the stored categorization instead.
    async fn finalized_outcome(
        &self,
        transaction: &Transaction,
        result: CategorizationResult,
        threshold: f64,
        force: bool,
    ) -> Result<TransactionOutcome> {
        let status = self.finalize(transaction, &result, threshold, force).await?;
        if status != OutcomeStatus::Skipped {
            return Ok(TransactionOutcome::new(transaction.id, status).with_result(result));
        }
        let kept = match self.transactions.get_by_id(transaction.id).await? {
            Some(stored) => existing_result(&stored),
            None => result,
        };
        Ok(TransactionOutcome::new(transaction.id, OutcomeStatus::Skipped).with_result(kept))
    }

    /// Persist an LLM outcome that carries a category
    async fn settle(
        &self,
        transaction: &Transaction,
        outcome: TransactionOutcome,
        threshold: f64,
        force: bool,
    ) -> Result<TransactionOutcome> {
        if outcome.status != OutcomeStatus::Categorized {
            return Ok(outcome);
        }
        let Some(result) = outcome.result else {
            return Ok(TransactionOutcome::new(transaction.id, OutcomeStatus::Uncategorized));
        };
        self.finalized_outcome(transaction, result, threshold, force).await
    }

    /// Categorize one transaction right away. The LLM sees a batch of one.
    ///
    /// Budget and rate-limit refusals come back as a null-category result with
    /// `error` set; repository failures are returned as errors.
    pub async fn categorize_one(&self, transaction_id: TransactionId, force: bool) -> Result<CategorizationResult> {
        let outcome = self.categorize_one_outcome(transaction_id, force).await?;
        Ok(match outcome.result {
            Some(result) => result,
            None => CategorizationResult::failed(
                CategorizationMethod::LlmBatch,
                outcome.error.unwrap_or_else(|| outcome.status.to_string()),
            ),
        })
    }

    /// [`CategorizationEngine::categorize_one`] keeping the outcome status and
    /// whether a failure is worth retrying
    pub async fn categorize_one_outcome(
        &self,
        transaction_id: TransactionId,
        force: bool,
    ) -> Result<TransactionOutcome> {
        let started = Instant::now();
        let transaction = self
            .transactions
            .get_by_id(transaction_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("transaction {}", transaction_id)))?;

        if should_skip(&transaction, force) {
            debug!(transaction_id = %transaction_id, "Skipping categorized transaction");
            return Ok(TransactionOutcome::new(transaction_id, OutcomeStatus::Skipped)
                .with_result(existing_result(&transaction)));
        }
        let threshold = self.config.thresholds.acceptance;

        if let Some(result) = run_chain(&self.strategies, &transaction, threshold).await? {
            let result = result.with_elapsed(started.elapsed());
            return self.finalized_outcome(&transaction, result, threshold, force).await;
        }

        let categories = self.categories.list_categories(transaction.organization_id).await?;
        let batch = self
            .classifier
            .classify(
                transaction.organization_id,
                std::slice::from_ref(&transaction),
                &categories,
                None,
                &CancelFlag::new(),
            )
            .await;
        let Some(outcome) = batch.outcomes.into_iter().next() else {
            return Ok(TransactionOutcome::new(transaction_id, OutcomeStatus::Uncategorized)
                .with_result(CategorizationResult::no_match(CategorizationMethod::LlmBatch, "no LLM outcome")));
        };
        self.settle(&transaction, outcome, threshold, force).await
    }

    /// Resolve a request's selector, in selector order. Requested ids that do not
    /// exist in the organization come back as failed outcomes.
    async fn select(&self, request: &BatchRequest) -> Result<Vec<std::result::Result<Transaction, TransactionOutcome>>> {
        let organization_id = request.organization_id;
        let transactions = match &request.selector {
            TransactionSelector::Ids { ids } => {
                let mut found: HashMap<TransactionId, Transaction> = self
                    .transactions
                    .get_by_ids(ids)
                    .await?
                    .into_iter()
                    .filter(|tx| tx.organization_id == organization_id)
                    .map(|tx| (tx.id, tx))
                    .collect();
                return Ok(ids
                    .iter()
                    .map(|id| {
                        found.remove(id).ok_or_else(|| {
                            failed(*id, &Error::NotFound(format!("transaction {}", id)))
                        })
                    })
                    .collect());
            }
            TransactionSelector::DateRange { start, end } => {
                self.transactions
                    .get_by_date_range(organization_id, *start, *end)
                    .await?
            }
            TransactionSelector::AllUncategorized => {
                self.transactions.get_uncategorized(organization_id).await?
            }
        };
        Ok(transactions.into_iter().map(Ok).collect())
    }

    /// Deterministic stages for every candidate on a bounded worker pool.
    /// Results line up with `candidates`.
    async fn run_chains(
        &self,
        candidates: &[(usize, Transaction)],
        threshold: f64,
    ) -> Vec<Result<Option<CategorizationResult>>> {
        let permits = Arc::new(Semaphore::new(self.config.batch.max_concurrency.max(1)));
        let mut workers = JoinSet::new();
        for (position, (_, transaction)) in candidates.iter().enumerate() {
            let strategies = Arc::clone(&self.strategies);
            let permits = Arc::clone(&permits);
            let transaction = transaction.clone();
            workers.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let started = Instant::now();
                let result = run_chain(&strategies, &transaction, threshold)
                    .await
                    .map(|r| r.map(|r| r.with_elapsed(started.elapsed())));
                (position, result)
            });
        }

        let mut results: Vec<Option<Result<Option<CategorizationResult>>>> =
            (0..candidates.len()).map(|_| None).collect();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((position, result)) => results[position] = Some(result),
                Err(e) => warn!(error = %e, "Strategy worker failed"),
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::InvalidData("strategy worker failed".to_string()))))
            .collect()
    }

    pub async fn categorize_batch(&self, request: &BatchRequest) -> Result<BatchSummary> {
        self.categorize_batch_with_cancel(request, &CancelFlag::new()).await
    }

    /// Categorize a request's transactions. Outcomes come back in selector order,
    /// one per transaction; a bad transaction never fails the whole request.
    pub async fn categorize_batch_with_cancel(
        &self,
        request: &BatchRequest,
        cancel: &CancelFlag,
    ) -> Result<BatchSummary> {
        let started = Instant::now();
        let organization_id = request.organization_id;
        let threshold = clamp_confidence(
            request
                .confidence_threshold
                .unwrap_or(self.config.thresholds.acceptance),
        );

        let selected = self.select(request).await?;
        let mut outcomes: Vec<Option<TransactionOutcome>> = (0..selected.len()).map(|_| None).collect();
        let mut candidates = Vec::new();
        for (i, selected) in selected.into_iter().enumerate() {
            match selected {
                Err(outcome) => outcomes[i] = Some(outcome),
                Ok(tx) if should_skip(&tx, request.force_recategorize) => {
                    outcomes[i] = Some(
                        TransactionOutcome::new(tx.id, OutcomeStatus::Skipped).with_result(existing_result(&tx)),
                    );
                }
                Ok(tx) => candidates.push((i, tx)),
            }
        }

        let chains = self.run_chains(&candidates, threshold).await;
        let mut pending = Vec::new();
        for ((i, tx), chain) in candidates.into_iter().zip(chains) {
            match chain {
                Ok(Some(result)) => {
                    let force = request.force_recategorize;
                    outcomes[i] = Some(match self.finalized_outcome(&tx, result, threshold, force).await {
                        Ok(outcome) => outcome,
                        Err(e) => failed(tx.id, &e),
                    });
                }
                Ok(None) => pending.push((i, tx)),
                Err(e) => {
                    warn!(transaction_id = %tx.id, error = %e, "Deterministic stages failed");
                    outcomes[i] = Some(failed(tx.id, &e));
                }
            }
        }

        let (mut cost, mut llm_calls) = (0.0, 0);
        if !pending.is_empty() {
            match self.categories.list_categories(organization_id).await {
                Err(e) => {
                    for (i, tx) in &pending {
                        outcomes[*i] = Some(failed(tx.id, &e));
                    }
                }
                Ok(categories) => {
                    let transactions: Vec<Transaction> = pending.iter().map(|(_, tx)| tx.clone()).collect();
                    let batch = self
                        .classifier
                        .classify(organization_id, &transactions, &categories, request.max_cost, cancel)
                        .await;
                    cost = batch.cost;
                    llm_calls = batch.llm_calls;
                    for ((i, tx), outcome) in pending.iter().zip(batch.outcomes) {
                        let settled = self.settle(tx, outcome, threshold, request.force_recategorize);
                        outcomes[*i] = Some(match settled.await {
                            Ok(outcome) => outcome,
                            Err(e) => failed(tx.id, &e),
                        });
                    }
                }
            }
        }

        let summary = BatchSummary::from_outcomes(
            organization_id,
            outcomes.into_iter().flatten().collect(),
            cost,
            llm_calls,
        );
        info!(
            organization_id = %organization_id,
            total = summary.total,
            categorized = summary.categorized,
            low_confidence = summary.low_confidence,
            skipped = summary.skipped,
            skipped_by_budget = summary.skipped_by_budget,
            failed = summary.failed,
            cost = summary.cost,
            llm_calls = summary.llm_calls,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch categorization complete"
        );
        Ok(summary)
    }

    /// Upper-bound price of a request: every transaction that would not be skipped
    /// is priced as if it reached the LLM.
    pub async fn estimate_batch_cost(&self, request: &BatchRequest) -> Result<CostEstimate> {
        let candidates: Vec<Transaction> = self
            .select(request)
            .await?
            .into_iter()
            .filter_map(|s| s.ok())
            .filter(|tx| !should_skip(tx, request.force_recategorize))
            .collect();
        let categories = self.categories.list_categories(request.organization_id).await?;
        let (sub_batches, tokens, estimated_cost) = self.classifier.estimate(&candidates, &categories);

        Ok(CostEstimate {
            organization_id: request.organization_id,
            transaction_count: candidates.len(),
            sub_batches,
            input_tokens: tokens.input_tokens,
            output_tokens: tokens.output_tokens,
            estimated_cost,
            model: self.classifier.model().name.clone(),
        })
    }

    /// Store user feedback; learning from it happens in the background
    pub async fn record_feedback(&self, feedback: &NewFeedback) -> Result<CategorizationFeedback> {
        self.learner.record(feedback).await
    }

    pub async fn categorization_stats(&self, organization_id: OrganizationId) -> Result<CategorizationStats> {
        self.transactions.categorization_stats(organization_id).await
    }

    /// Wait for background learning and pattern writes to land
    pub async fn flush(&self) {
        self.learner.flush().await;
        self.patterns.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::models::{FeedbackType, NewRule, NewTransaction, RuleField, RuleOperator};
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    struct Fixture {
        db: Database,
        engine: CategorizationEngine,
        llm: MockLlmClient,
        org: OrganizationId,
    }

    fn fixture_with(llm: MockLlmClient) -> Fixture {
        fixture_with_config(llm, EngineConfig::default())
    }

    fn fixture_with_config(llm: MockLlmClient, config: EngineConfig) -> Fixture {
        let db = Database::in_memory().unwrap();
        let engine = CategorizationEngine::new(
            config,
            Repositories::sqlite(&db),
            Arc::new(llm.clone()),
            Arc::new(HashingEmbedder::new(64)),
        )
        .unwrap();
        let org = Uuid::new_v4();
        for name in ["Food & Dining", "Groceries", "Shopping", "Transportation", "Other"] {
            db.create_category(org, name, None).unwrap();
        }
        Fixture { db, engine, llm, org }
    }

    fn fixture() -> Fixture {
        fixture_with(MockLlmClient::new())
    }

    fn category(f: &Fixture, name: &str) -> CategoryId {
        f.db.get_category_by_name(f.org, name).unwrap().unwrap().id
    }

    fn insert(f: &Fixture, merchant: &str) -> Transaction {
        f.db.insert_transaction(&NewTransaction {
            organization_id: f.org,
            account_name: None,
            amount: -12.5,
            merchant_name: Some(merchant.to_string()),
            description: None,
            date: Utc::now().date_naive(),
        })
        .unwrap()
    }

    #[test]
    fn test_cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn test_rule_short_circuits_before_llm() {
        let f = fixture();
        let transport = category(&f, "Transportation");
        f.engine
            .rules()
            .create_rule(&NewRule::new(f.org, transport, RuleField::Merchant, RuleOperator::Contains, "uber"))
            .await
            .unwrap();
        let tx = insert(&f, "UBER TRIP 1234");

        let result = f.engine.categorize_one(tx.id, false).await.unwrap();
        assert_eq!(result.method, CategorizationMethod::Rule);
        assert_eq!(result.category_id, Some(transport));
        assert_eq!(f.llm.calls(), 0);

        let stored = f.db.get_transaction(tx.id).unwrap().unwrap();
        assert_eq!(stored.category_id, Some(transport));
        let metadata = stored.metadata.unwrap();
        assert_eq!(metadata.method, Some(CategorizationMethod::Rule));
        assert!(!metadata.needs_review);
        assert_eq!(metadata.rule_matches.len(), 1);
    }

    #[tokio::test]
    async fn test_llm_result_teaches_pattern_cache() {
        let f = fixture();
        let tx = insert(&f, "CHIPOTLE 0789");

        let result = f.engine.categorize_one(tx.id, false).await.unwrap();
        assert_eq!(result.method, CategorizationMethod::LlmBatch);
        assert_eq!(result.category_id, Some(category(&f, "Food & Dining")));
        assert_eq!(f.llm.calls(), 1);

        f.engine.flush().await;
        // the next one is answered from the cache
        let again = insert(&f, "CHIPOTLE 0789");
        let result = f.engine.categorize_one(again.id, false).await.unwrap();
        assert_eq!(result.method, CategorizationMethod::Pattern);
        assert_eq!(f.llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_llm_result_is_flagged() {
        let f = fixture_with(MockLlmClient::new().with_confidence(0.4));
        let tx = insert(&f, "TARGET T-1234");

        let summary = f
            .engine
            .categorize_batch(&BatchRequest::all_uncategorized(f.org))
            .await
            .unwrap();
        assert_eq!(summary.categorized, 1);
        assert_eq!(summary.low_confidence, 1);

        let stored = f.db.get_transaction(tx.id).unwrap().unwrap();
        assert_eq!(stored.category_id, Some(category(&f, "Shopping")));
        assert!(stored.metadata.unwrap().needs_review);

        f.engine.flush().await;
        assert!(f.engine.patterns().list(f.org).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_categorized_transactions_are_skipped_unless_forced() {
        let f = fixture();
        let tx = insert(&f, "STARBUCKS");
        f.engine.categorize_one(tx.id, false).await.unwrap();
        assert_eq!(f.llm.calls(), 1);

        let request = BatchRequest::for_ids(f.org, vec![tx.id]);
        let summary = f.engine.categorize_batch(&request).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(f.llm.calls(), 1);

        let forced = BatchRequest {
            force_recategorize: true,
            ..request
        };
        let summary = f.engine.categorize_batch(&forced).await.unwrap();
        assert_eq!(summary.categorized, 1);
    }

    #[tokio::test]
    async fn test_unknown_and_foreign_ids_fail_individually() {
        let f = fixture();
        let mine = insert(&f, "SHELL OIL 57444");
        let foreign = f
            .db
            .insert_transaction(&NewTransaction {
                organization_id: Uuid::new_v4(),
                account_name: None,
                amount: -1.0,
                merchant_name: Some("SHELL".to_string()),
                description: None,
                date: Utc::now().date_naive(),
            })
            .unwrap();

        let request = BatchRequest::for_ids(f.org, vec![Uuid::new_v4(), mine.id, foreign.id]);
        let summary = f.engine.categorize_batch(&request).await.unwrap();
        let statuses: Vec<_> = summary.outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![OutcomeStatus::Failed, OutcomeStatus::Categorized, OutcomeStatus::Failed]
        );
        assert_eq!(summary.outcomes[1].transaction_id, mine.id);
        assert!(f.db.get_transaction(foreign.id).unwrap().unwrap().category_id.is_none());
    }

    #[tokio::test]
    async fn test_estimate_prices_only_candidates() {
        let f = fixture();
        for merchant in ["STARBUCKS", "AMAZON", "LYFT"] {
            insert(&f, merchant);
        }
        let estimate = f
            .engine
            .estimate_batch_cost(&BatchRequest::all_uncategorized(f.org))
            .await
            .unwrap();
        assert_eq!(estimate.transaction_count, 3);
        assert_eq!(estimate.sub_batches, 1);
        assert_eq!(estimate.model, "gpt-4o-mini");
        assert!(estimate.estimated_cost > 0.0);
        assert_eq!(f.llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_stats_by_method() {
        let f = fixture();
        insert(&f, "STARBUCKS");
        insert(&f, "UNKNOWN VENDOR");
        f.engine
            .categorize_batch(&BatchRequest::all_uncategorized(f.org))
            .await
            .unwrap();

        let stats = f.engine.categorization_stats(f.org).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.categorized, 2);
        assert_eq!(stats.by_method.get("llm_batch"), Some(&2));
    }

    #[tokio::test]
    async fn test_correction_during_llm_call_is_not_overwritten() {
        let f = fixture_with(MockLlmClient::new().with_delay(Duration::from_millis(300)));
        let tx = insert(&f, "AMAZON MKTP US");
        let other = category(&f, "Other");

        let request = BatchRequest::all_uncategorized(f.org);
        let correct = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.engine
                .record_feedback(&NewFeedback::new(f.org, tx.id, other, FeedbackType::Correction))
                .await
                .unwrap();
        };
        let (summary, ()) = tokio::join!(f.engine.categorize_batch(&request), correct);
        let summary = summary.unwrap();

        assert_eq!(f.llm.calls(), 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.categorized, 0);
        let outcome = &summary.outcomes[0];
        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert_eq!(outcome.result.as_ref().unwrap().category_id, Some(other));

        let stored = f.db.get_transaction(tx.id).unwrap().unwrap();
        assert_eq!(stored.category_id, Some(other));
        assert!(stored.is_user_corrected());
    }

    #[tokio::test]
    async fn test_forced_write_replaces_correction() {
        let f = fixture();
        let tx = insert(&f, "TARGET T-0042");
        let other = category(&f, "Other");
        f.engine
            .record_feedback(&NewFeedback::new(f.org, tx.id, other, FeedbackType::Correction))
            .await
            .unwrap();

        let result = f.engine.categorize_one(tx.id, false).await.unwrap();
        assert_eq!(result.method, CategorizationMethod::Manual);
        assert_eq!(f.llm.calls(), 0);

        let result = f.engine.categorize_one(tx.id, true).await.unwrap();
        assert_ne!(result.method, CategorizationMethod::Manual);
        let stored = f.db.get_transaction(tx.id).unwrap().unwrap();
        assert_eq!(stored.category_id, result.category_id);
        assert!(!stored.is_user_corrected());
    }

    #[tokio::test]
    async fn test_concurrent_batches_share_the_request_limit() {
        let mut config = EngineConfig::default();
        config.rate_limit.max_requests_per_hour = 1;
        let f = fixture_with_config(MockLlmClient::new().with_delay(Duration::from_millis(200)), config);
        insert(&f, "NETFLIX.COM");

        let request = BatchRequest::all_uncategorized(f.org);
        let (first, second) = tokio::join!(
            f.engine.categorize_batch(&request),
            f.engine.categorize_batch(&request)
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(f.llm.calls(), 1);
        assert_eq!(first.llm_calls + second.llm_calls, 1);
        let mut statuses = vec![first.outcomes[0].status, second.outcomes[0].status];
        statuses.sort_by_key(|s| s.as_str());
        assert_eq!(statuses, vec![OutcomeStatus::Categorized, OutcomeStatus::RateLimited]);
    }
}
