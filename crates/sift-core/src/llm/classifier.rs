//! Sub-batch planning and the governed LLM call loop

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::{LlmCategorization, LlmClient};
use crate::budget::{BudgetReservation, CostGovernor, RateLimiter, RateSlot};
use crate::engine::CancelFlag;
use crate::error::Error;
use crate::models::{
    BudgetAlert, CategorizationMethod, CategorizationResult, Category, LlmModel, NewLlmBatch,
    OrganizationId, OutcomeStatus, TokenEstimate, Transaction, TransactionOutcome,
};
use crate::repository::LlmBatchRepository;

pub const MISSING_FROM_RESPONSE: &str = "Transaction not found in LLM response";

/// Split `total` items into `ceil(total / max_size)` contiguous ranges whose sizes
/// differ by at most one.
pub fn plan_sub_batches(total: usize, max_size: usize) -> Vec<Range<usize>> {
    if total == 0 {
        return Vec::new();
    }
    let max_size = max_size.max(1);
    let count = total.div_ceil(max_size);
    let base = total / count;
    let extra = total % count;

    let mut ranges = Vec::with_capacity(count);
    let mut start = 0;
    for i in 0..count {
        let len = base + usize::from(i < extra);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

/// What the classifier did with one request's LLM-bound transactions
#[derive(Debug, Default)]
pub struct ClassifiedBatch {
    /// One per input transaction, input order
    pub outcomes: Vec<TransactionOutcome>,
    /// Actual spend across completed sub-batches
    pub cost: f64,
    pub llm_calls: usize,
    pub alerts: Vec<BudgetAlert>,
}

pub struct BatchClassifier {
    client: Arc<dyn LlmClient>,
    governor: Arc<CostGovernor>,
    limiter: Arc<RateLimiter>,
    batches: Arc<dyn LlmBatchRepository>,
    model: LlmModel,
    max_batch_size: usize,
    timeout: Duration,
}

impl BatchClassifier {
    pub fn new(
        client: Arc<dyn LlmClient>,
        governor: Arc<CostGovernor>,
        limiter: Arc<RateLimiter>,
        batches: Arc<dyn LlmBatchRepository>,
        model: LlmModel,
        max_batch_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            governor,
            limiter,
            batches,
            model,
            max_batch_size: max_batch_size.max(1),
            timeout,
        }
    }

    pub fn model(&self) -> &LlmModel {
        &self.model
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    pub async fn health_check(&self) -> bool {
        self.client.health_check().await
    }

    /// Token and dollar estimate for classifying `transactions`, with prompt
    /// overhead counted once per planned sub-batch. Returns (sub-batches, tokens, cost).
    pub fn estimate(&self, transactions: &[Transaction], categories: &[Category]) -> (usize, TokenEstimate, f64) {
        let plan = plan_sub_batches(transactions.len(), self.max_batch_size);
        let tokens = plan
            .iter()
            .map(|range| self.client.estimate_tokens(&transactions[range.clone()], categories))
            .fold(TokenEstimate::default(), |acc, t| acc + t);
        (plan.len(), tokens, self.model.cost_for(tokens))
    }

    /// Classify `transactions` in sequential sub-batches.
    ///
    /// Every sub-batch passes the rate limiter, the request's `max_cost` cap and the
    /// budget gate before dispatch. A sub-batch that cannot run leaves its
    /// transactions uncategorized with a status saying why; completed sub-batches
    /// are kept. Each completed sub-batch holds its actual cost against the budget
    /// until the total is recorded once, after the last sub-batch.
    pub async fn classify(
        &self,
        organization_id: OrganizationId,
        transactions: &[Transaction],
        categories: &[Category],
        max_cost: Option<f64>,
        cancel: &CancelFlag,
    ) -> ClassifiedBatch {
        let mut batch = ClassifiedBatch::default();
        if transactions.is_empty() {
            return batch;
        }
        if categories.is_empty() {
            batch.outcomes = transactions
                .iter()
                .map(|tx| {
                    TransactionOutcome::new(tx.id, OutcomeStatus::Uncategorized)
                        .with_error("organization has no categories", false)
                })
                .collect();
            return batch;
        }

        let mut reservations: Vec<BudgetReservation> = Vec::new();
        let mut sent = 0i64;

        for range in plan_sub_batches(transactions.len(), self.max_batch_size) {
            let chunk = &transactions[range];

            if cancel.is_cancelled() {
                debug!(organization_id = %organization_id, remaining = chunk.len(), "Batch cancelled before sub-batch");
                batch.outcomes.extend(skip_all(chunk, OutcomeStatus::Cancelled, &Error::Cancelled));
                continue;
            }

            let estimated = self.model.cost_for(self.client.estimate_tokens(chunk, categories));

            let slot = match self.limiter.check_limit(organization_id, estimated) {
                Ok(slot) => slot,
                Err(e) => {
                    warn!(organization_id = %organization_id, error = %e, "LLM sub-batch rate limited");
                    batch.outcomes.extend(skip_all(chunk, OutcomeStatus::RateLimited, &e));
                    continue;
                }
            };

            if let Some(cap) = max_cost {
                if batch.cost + estimated > cap + 1e-9 {
                    debug!(organization_id = %organization_id, estimated, cap, "Request max_cost reached");
                    let e = Error::InvalidData(format!(
                        "request max_cost ${:.4} would be exceeded (spent ${:.4}, next ${:.4})",
                        cap, batch.cost, estimated
                    ));
                    batch.outcomes.extend(skip_all(chunk, OutcomeStatus::SkippedByBudget, &e));
                    continue;
                }
            }

            let mut reservation = match self.governor.check_budget(organization_id, estimated).await {
                Ok(reservation) => reservation,
                Err(e @ Error::InsufficientBudget { .. }) => {
                    warn!(organization_id = %organization_id, error = %e, "LLM sub-batch skipped by budget");
                    batch.outcomes.extend(skip_all(chunk, OutcomeStatus::SkippedByBudget, &e));
                    continue;
                }
                Err(e) => {
                    warn!(organization_id = %organization_id, error = %e, "Budget check failed");
                    batch.outcomes.extend(skip_all(chunk, OutcomeStatus::Failed, &e));
                    continue;
                }
            };

            let (outcomes, cost) = self.run_sub_batch(organization_id, chunk, categories, slot).await;
            reservation.settle(cost);
            reservations.push(reservation);
            batch.outcomes.extend(outcomes);
            batch.cost += cost;
            batch.llm_calls += 1;
            sent += chunk.len() as i64;
        }

        if batch.llm_calls > 0 {
            match self.governor.record_cost(organization_id, batch.cost, sent).await {
                Ok(alerts) => batch.alerts = alerts,
                Err(e) => error!(organization_id = %organization_id, cost = batch.cost, error = %e, "Failed to record LLM cost"),
            }
        }
        drop(reservations);

        info!(
            organization_id = %organization_id,
            transactions = transactions.len(),
            llm_calls = batch.llm_calls,
            cost = batch.cost,
            "LLM classification complete"
        );
        batch
    }

    /// One dispatched call, settling its rate-limit slot. Returns the outcomes and
    /// the actual cost.
    async fn run_sub_batch(
        &self,
        organization_id: OrganizationId,
        chunk: &[Transaction],
        categories: &[Category],
        slot: RateSlot<'_>,
    ) -> (Vec<TransactionOutcome>, f64) {
        let started = Instant::now();
        let call = self.client.categorize_batch(chunk, categories, &self.model);
        let response = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                slot.complete(0.0);
                warn!(organization_id = %organization_id, size = chunk.len(), error = %e, "LLM sub-batch failed");
                return (skip_all(chunk, OutcomeStatus::Failed, &e), 0.0);
            }
            Err(_) => {
                slot.complete(0.0);
                let e = Error::Timeout {
                    operation: "LLM request".to_string(),
                    elapsed: self.timeout,
                };
                warn!(organization_id = %organization_id, size = chunk.len(), error = %e, "LLM sub-batch timed out");
                return (skip_all(chunk, OutcomeStatus::Failed, &e), 0.0);
            }
        };
        let elapsed = started.elapsed();

        let cost = self.model.cost_for(response.tokens());
        slot.complete(cost);

        let mut by_id: HashMap<_, LlmCategorization> = HashMap::new();
        for entry in response.results {
            by_id.entry(entry.transaction_id).or_insert(entry);
        }
        let cost_share = cost / chunk.len() as f64;

        let mut resolved = 0usize;
        let mut confidence_sum = 0.0;
        let outcomes: Vec<_> = chunk
            .iter()
            .map(|tx| {
                let outcome = match by_id.remove(&tx.id) {
                    None => {
                        let result = CategorizationResult::failed(CategorizationMethod::LlmBatch, MISSING_FROM_RESPONSE);
                        TransactionOutcome::new(tx.id, OutcomeStatus::Failed).with_result(result)
                    }
                    Some(entry) => match entry.error {
                        Some(error) => {
                            let result = CategorizationResult::failed(CategorizationMethod::LlmBatch, error);
                            TransactionOutcome::new(tx.id, OutcomeStatus::Failed).with_result(result)
                        }
                        None => match entry.category_id {
                            Some(category_id) => {
                                resolved += 1;
                                confidence_sum += entry.confidence;
                                let mut explanation = entry.rationale;
                                if entry.flagged {
                                    explanation.push_str(" (reported confidence out of range, clamped)");
                                }
                                let result = CategorizationResult::new(
                                    category_id,
                                    entry.confidence,
                                    CategorizationMethod::LlmBatch,
                                    explanation,
                                );
                                TransactionOutcome::new(tx.id, OutcomeStatus::Categorized).with_result(result)
                            }
                            None => {
                                let result = CategorizationResult::no_match(CategorizationMethod::LlmBatch, entry.rationale);
                                TransactionOutcome::new(tx.id, OutcomeStatus::Uncategorized).with_result(result)
                            }
                        },
                    },
                };
                stamp(outcome, elapsed, cost_share)
            })
            .collect();

        let missing = outcomes.iter().filter(|o| o.status == OutcomeStatus::Failed).count();
        if missing > 0 {
            warn!(organization_id = %organization_id, missing, "LLM response dropped or mangled entries");
        }

        let audit = NewLlmBatch {
            organization_id,
            transaction_count: chunk.len() as i64,
            input_tokens: i64::from(response.input_tokens),
            output_tokens: i64::from(response.output_tokens),
            total_cost: cost,
            model: response.model,
            success_rate: resolved as f64 / chunk.len() as f64,
            avg_confidence: if resolved > 0 { confidence_sum / resolved as f64 } else { 0.0 },
            processing_time_ms: elapsed.as_millis() as i64,
        };
        if let Err(e) = self.batches.create_batch(&audit).await {
            warn!(organization_id = %organization_id, error = %e, "Failed to write LLM batch audit row");
        }

        debug!(
            organization_id = %organization_id,
            size = chunk.len(),
            resolved,
            cost,
            elapsed_ms = elapsed.as_millis() as u64,
            "LLM sub-batch complete"
        );
        (outcomes, cost)
    }
}

fn stamp(mut outcome: TransactionOutcome, elapsed: Duration, cost: f64) -> TransactionOutcome {
    if let Some(result) = outcome.result.as_mut() {
        result.processing_time_ms = elapsed.as_millis() as u64;
        result.cost_estimate = cost;
    }
    outcome
}

fn skip_all(chunk: &[Transaction], status: OutcomeStatus, error: &Error) -> Vec<TransactionOutcome> {
    let retryable = error.is_retryable();
    chunk
        .iter()
        .map(|tx| TransactionOutcome::new(tx.id, status).with_error(error.to_string(), retryable))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BudgetConfig, LlmConfig, RateLimitConfig};
    use crate::db::Database;
    use crate::llm::{LlmBatchResponse, MockLlmClient};
    use crate::models::{CategoryId, NewTransaction};
    use crate::error::Result;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct Fixture {
        db: Database,
        org: OrganizationId,
        categories: Vec<Category>,
        transactions: Vec<Transaction>,
        governor: Arc<CostGovernor>,
        limiter: Arc<RateLimiter>,
    }

    fn fixture(count: usize, merchant: &str) -> Fixture {
        let db = Database::in_memory().unwrap();
        let org = Uuid::new_v4();
        let categories = ["Food & Dining", "Groceries", "Shopping", "Other"]
            .iter()
            .map(|name| db.create_category(org, name, None).unwrap())
            .collect();
        let transactions = (0..count)
            .map(|i| {
                db.insert_transaction(&NewTransaction {
                    organization_id: org,
                    account_name: None,
                    amount: -5.0 - i as f64,
                    merchant_name: Some(format!("{} #{}", merchant, i)),
                    description: None,
                    date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                })
                .unwrap()
            })
            .collect();
        let governor = Arc::new(CostGovernor::new(
            Arc::new(db.clone()),
            Arc::new(db.clone()),
            BudgetConfig::default(),
        ));
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
        Fixture {
            db,
            org,
            categories,
            transactions,
            governor,
            limiter,
        }
    }

    fn classifier(f: &Fixture, client: Arc<dyn LlmClient>, max_size: usize) -> BatchClassifier {
        BatchClassifier::new(
            client,
            Arc::clone(&f.governor),
            Arc::clone(&f.limiter),
            Arc::new(f.db.clone()),
            LlmConfig::default().models[0].clone(),
            max_size,
            Duration::from_secs(5),
        )
    }

    fn category_id(f: &Fixture, name: &str) -> CategoryId {
        f.categories.iter().find(|c| c.name == name).unwrap().id
    }

    #[test]
    fn test_plan_sub_batches_is_balanced() {
        let sizes = |n, max| -> Vec<usize> { plan_sub_batches(n, max).into_iter().map(|r| r.len()).collect() };
        assert_eq!(sizes(0, 100), Vec::<usize>::new());
        assert_eq!(sizes(10, 100), vec![10]);
        assert_eq!(sizes(101, 100), vec![51, 50]);
        assert_eq!(sizes(250, 100), vec![84, 83, 83]);
        // ranges are contiguous and cover everything
        let plan = plan_sub_batches(7, 3);
        assert_eq!(plan, vec![0..3, 3..5, 5..7]);
    }

    #[test]
    fn test_plan_respects_min_size_when_max_is_wide_enough() {
        let (min, max) = (20, 100);
        for n in min..=1000 {
            for range in plan_sub_batches(n, max) {
                assert!(range.len() >= min && range.len() <= max, "n={n} len={}", range.len());
            }
        }
    }

    #[tokio::test]
    async fn test_classifies_in_input_order_and_audits() {
        let f = fixture(5, "STARBUCKS");
        let mock = MockLlmClient::new();
        let classifier = classifier(&f, Arc::new(mock.clone()), 2);

        let batch = classifier
            .classify(f.org, &f.transactions, &f.categories, None, &CancelFlag::new())
            .await;

        assert_eq!(mock.calls(), 3);
        assert_eq!(batch.llm_calls, 3);
        let ids: Vec<_> = batch.outcomes.iter().map(|o| o.transaction_id).collect();
        let expected: Vec<_> = f.transactions.iter().map(|t| t.id).collect();
        assert_eq!(ids, expected);

        let food = category_id(&f, "Food & Dining");
        for outcome in &batch.outcomes {
            assert_eq!(outcome.status, OutcomeStatus::Categorized);
            assert_eq!(outcome.result.as_ref().unwrap().category_id, Some(food));
        }
        assert!(batch.cost > 0.0);
        let (requests, windowed_cost) = f.limiter.usage(f.org);
        assert_eq!(requests, 3);
        assert!((windowed_cost - batch.cost).abs() < 1e-9);

        let audits = f.db.get_llm_batches(f.org, 10).unwrap();
        assert_eq!(audits.len(), 3);
        assert_eq!(audits.iter().map(|b| b.transaction_count).sum::<i64>(), 5);

        // recorded exactly once, for the whole request
        let tracker = f.governor.cost_tracker(f.org).await.unwrap();
        assert_eq!(tracker.transaction_count, 5);
        assert!((tracker.current_spend - batch.cost).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_missing_entry_is_failed_not_fatal() {
        let f = fixture(10, "WHOLE FOODS");
        let omitted = f.transactions[9].id;
        let mock = MockLlmClient::new().omit_transaction(omitted);
        let classifier = classifier(&f, Arc::new(mock), 100);

        let batch = classifier
            .classify(f.org, &f.transactions, &f.categories, None, &CancelFlag::new())
            .await;

        let categorized = batch.outcomes.iter().filter(|o| o.status == OutcomeStatus::Categorized).count();
        assert_eq!(categorized, 9);
        let last = &batch.outcomes[9];
        assert_eq!(last.status, OutcomeStatus::Failed);
        assert_eq!(last.error.as_deref(), Some(MISSING_FROM_RESPONSE));
        assert_eq!(last.result.as_ref().unwrap().category_id, None);
    }

    #[tokio::test]
    async fn test_exhausted_budget_skips_without_calling() {
        let f = fixture(10, "AMAZON");
        f.governor.update_budget(f.org, 0.001, 0.0).await.unwrap();
        f.governor.record_cost(f.org, 0.001, 1).await.unwrap();

        let mock = MockLlmClient::new();
        let classifier = classifier(&f, Arc::new(mock.clone()), 100);
        let batch = classifier
            .classify(f.org, &f.transactions, &f.categories, None, &CancelFlag::new())
            .await;

        assert_eq!(mock.calls(), 0);
        assert_eq!(batch.llm_calls, 0);
        assert!(batch.outcomes.iter().all(|o| o.status == OutcomeStatus::SkippedByBudget));
        assert!(batch.outcomes[0].error.as_deref().unwrap().contains("daily"));
        assert!(!batch.outcomes[0].retryable);
        // the refused sub-batch gave its rate-limit slot back
        assert_eq!(f.limiter.usage(f.org), (0, 0.0));
    }

    #[tokio::test]
    async fn test_max_cost_caps_the_request() {
        let f = fixture(4, "TARGET");
        let mock = MockLlmClient::new();
        let classifier = classifier(&f, Arc::new(mock.clone()), 2);
        let batch = classifier
            .classify(f.org, &f.transactions, &f.categories, Some(0.0), &CancelFlag::new())
            .await;
        assert_eq!(mock.calls(), 0);
        assert!(batch.outcomes.iter().all(|o| o.status == OutcomeStatus::SkippedByBudget));
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let f = fixture(3, "NETFLIX");
        let mock = MockLlmClient::new();
        let classifier = classifier(&f, Arc::new(mock.clone()), 100);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let batch = classifier.classify(f.org, &f.transactions, &f.categories, None, &cancel).await;
        assert_eq!(mock.calls(), 0);
        assert!(batch
            .outcomes
            .iter()
            .all(|o| o.status == OutcomeStatus::Cancelled && o.retryable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable_failure() {
        let f = fixture(2, "UBER");
        let mock = MockLlmClient::new().with_delay(Duration::from_secs(30));
        let classifier = classifier(&f, Arc::new(mock), 100);

        let batch = classifier
            .classify(f.org, &f.transactions, &f.categories, None, &CancelFlag::new())
            .await;
        for outcome in &batch.outcomes {
            assert_eq!(outcome.status, OutcomeStatus::Failed);
            assert!(outcome.retryable);
            assert!(outcome.error.as_deref().unwrap().contains("timed out"));
        }
        assert_eq!(batch.cost, 0.0);
    }

    /// Succeeds on the first call, fails on every later one
    struct FlakyClient {
        inner: MockLlmClient,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn categorize_batch(
            &self,
            transactions: &[Transaction],
            categories: &[Category],
            model: &LlmModel,
        ) -> Result<LlmBatchResponse> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(Error::Llm("upstream overloaded".to_string()));
            }
            self.inner.categorize_batch(transactions, categories, model).await
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_failed_sub_batch_keeps_completed_ones() {
        let f = fixture(4, "STARBUCKS");
        let client = FlakyClient {
            inner: MockLlmClient::new(),
            calls: AtomicUsize::new(0),
        };
        let classifier = classifier(&f, Arc::new(client), 2);
        let batch = classifier
            .classify(f.org, &f.transactions, &f.categories, None, &CancelFlag::new())
            .await;

        let statuses: Vec<_> = batch.outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![
                OutcomeStatus::Categorized,
                OutcomeStatus::Categorized,
                OutcomeStatus::Failed,
                OutcomeStatus::Failed,
            ]
        );
        assert!(batch.outcomes[2].error.as_deref().unwrap().contains("upstream overloaded"));
    }

    #[tokio::test]
    async fn test_estimate_counts_overhead_per_sub_batch() {
        let f = fixture(4, "STARBUCKS");
        let one = classifier(&f, Arc::new(MockLlmClient::new()), 100);
        let split = classifier(&f, Arc::new(MockLlmClient::new()), 2);

        let (batches, tokens, cost) = one.estimate(&f.transactions, &f.categories);
        let (split_batches, split_tokens, split_cost) = split.estimate(&f.transactions, &f.categories);
        assert_eq!((batches, split_batches), (1, 2));
        assert!(split_tokens.total() > tokens.total());
        assert!(split_cost > cost);
    }
}
