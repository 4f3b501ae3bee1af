//! Integration tests for sift-core
//!
//! These tests drive the whole engine (rules → patterns → similarity → LLM)
//! against a throwaway SQLite database and the mock LLM client.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sift_core::{
    db::Database,
    jobs::CategorizationJob,
    models::{
        BatchRequest, CategorizationMetadata, CategorizationMethod, CategorizationResult,
        CategoryId, FeedbackType, NewFeedback, NewRule, NewTransaction, OrganizationId,
        OutcomeStatus, RuleField, RuleOperator, Transaction,
    },
    CancelFlag, CategorizationEngine, EngineConfig, HashingEmbedder, MockLlmClient, Repositories,
};
use uuid::Uuid;

const CATEGORIES: [&str; 6] = [
    "Food & Dining",
    "Groceries",
    "Shopping",
    "Transportation",
    "Entertainment",
    "Other",
];

struct Harness {
    db: Database,
    engine: CategorizationEngine,
    llm: MockLlmClient,
    org: OrganizationId,
}

impl Harness {
    fn new() -> Self {
        Self::with(EngineConfig::default(), MockLlmClient::new())
    }

    fn with(config: EngineConfig, llm: MockLlmClient) -> Self {
        let db = Database::in_memory().expect("Failed to create in-memory database");
        let engine = CategorizationEngine::new(
            config,
            Repositories::sqlite(&db),
            Arc::new(llm.clone()),
            Arc::new(HashingEmbedder::new(128)),
        )
        .expect("Failed to build engine");
        let org = Uuid::new_v4();
        for name in CATEGORIES {
            db.create_category(org, name, None).unwrap();
        }
        Self { db, engine, llm, org }
    }

    fn use_client(&mut self, llm: MockLlmClient) {
        self.engine = CategorizationEngine::new(
            EngineConfig::default(),
            Repositories::sqlite(&self.db),
            Arc::new(llm.clone()),
            Arc::new(HashingEmbedder::new(128)),
        )
        .expect("Failed to build engine");
        self.llm = llm;
    }

    fn category(&self, name: &str) -> CategoryId {
        self.db.get_category_by_name(self.org, name).unwrap().unwrap().id
    }

    fn transaction(&self, merchant: &str, amount: f64) -> Transaction {
        self.db
            .insert_transaction(&NewTransaction {
                organization_id: self.org,
                account_name: Some("Checking".to_string()),
                amount,
                merchant_name: Some(merchant.to_string()),
                description: None,
                date: Utc::now().date_naive(),
            })
            .unwrap()
    }

    fn stored(&self, tx: &Transaction) -> Transaction {
        self.db.get_transaction(tx.id).unwrap().unwrap()
    }
}

// =============================================================================
// End-to-end scenarios
// =============================================================================

#[tokio::test]
async fn test_cached_pattern_short_circuits_llm() {
    let h = Harness::new();
    let dining = h.category("Food & Dining");
    h.db.merge_pattern(h.org, "STARBUCKS", dining, 0.95, false).unwrap();

    let tx = h.transaction("STARBUCKS #4521", -5.75);
    let result = h.engine.categorize_one(tx.id, false).await.unwrap();

    assert_eq!(result.method, CategorizationMethod::Pattern);
    assert_eq!(result.category_id, Some(dining));
    assert!((result.confidence - 0.95).abs() < 1e-9);
    assert_eq!(h.llm.calls(), 0);
    assert_eq!(h.stored(&tx).category_id, Some(dining));
}

#[tokio::test]
async fn test_exhausted_daily_budget_skips_whole_batch() {
    let h = Harness::new();
    h.engine.governor().update_budget(h.org, 1.0, 50.0).await.unwrap();
    h.engine.governor().record_cost(h.org, 1.0, 1).await.unwrap();

    let txs: Vec<_> = (0..10).map(|i| h.transaction(&format!("VENDOR {}", i), -10.0)).collect();
    let summary = h
        .engine
        .categorize_batch(&BatchRequest::all_uncategorized(h.org))
        .await
        .unwrap();

    assert_eq!(summary.total, 10);
    assert_eq!(summary.categorized, 0);
    assert_eq!(summary.skipped_by_budget, 10);
    assert_eq!(summary.llm_calls, 0);
    assert_eq!(h.llm.calls(), 0);
    for (tx, outcome) in txs.iter().zip(&summary.outcomes) {
        assert_eq!(outcome.transaction_id, tx.id);
        assert!(outcome.error.as_deref().unwrap().contains("daily"));
        assert!(h.stored(tx).category_id.is_none());
    }
}

#[tokio::test]
async fn test_entry_missing_from_llm_response_fails_alone() {
    let txs_merchants = [
        "STARBUCKS", "CHIPOTLE", "WHOLE FOODS", "TRADER JOE'S", "UBER TRIP", "LYFT RIDE",
        "SHELL OIL", "AMAZON MKTPLACE", "TARGET", "NETFLIX.COM",
    ];
    // the omitted id is only known after insertion, so the engine is rebuilt with it
    let mut h = Harness::new();
    let txs: Vec<_> = txs_merchants.iter().map(|m| h.transaction(m, -12.0)).collect();
    h.use_client(MockLlmClient::new().omit_transaction(txs[9].id));

    let summary = h
        .engine
        .categorize_batch(&BatchRequest::for_ids(h.org, txs.iter().map(|t| t.id).collect()))
        .await
        .unwrap();

    assert_eq!(summary.categorized, 9);
    assert_eq!(summary.failed, 1);
    assert_eq!(h.llm.calls(), 1);

    let missing = &summary.outcomes[9];
    assert_eq!(missing.transaction_id, txs[9].id);
    assert_eq!(missing.status, OutcomeStatus::Failed);
    let result = missing.result.as_ref().unwrap();
    assert_eq!(result.category_id, None);
    assert_eq!(result.error.as_deref(), Some("Transaction not found in LLM response"));
    assert!(h.stored(&txs[9]).category_id.is_none());

    assert_eq!(h.stored(&txs[2]).category_id, Some(h.category("Groceries")));
    assert_eq!(h.stored(&txs[7]).category_id, Some(h.category("Shopping")));
}

#[tokio::test]
async fn test_feedback_correction_reaches_fuzzy_pattern() {
    let mut config = EngineConfig::default();
    // A fuzzy hit reports stored confidence times trigram similarity. For
    // "WHOLE FOODS" against "WHOLE FOODS MARKET" that is about 0.63, which the
    // default 0.7 acceptance would pass on to the LLM.
    config.thresholds.acceptance = 0.6;
    let h = Harness::with(config, MockLlmClient::new());
    let shopping = h.category("Shopping");
    let groceries = h.category("Groceries");

    let first = h.transaction("WHOLE FOODS", -80.0);
    let llm_result = CategorizationResult::new(shopping, 0.8, CategorizationMethod::LlmBatch, "llm");
    h.db.set_transaction_category(first.id, shopping, &CategorizationMetadata::from_result(&llm_result, 0.6))
        .unwrap();

    h.engine
        .record_feedback(&NewFeedback::new(h.org, first.id, groceries, FeedbackType::Correction))
        .await
        .unwrap();
    h.engine.flush().await;

    let next = h.transaction("WHOLE FOODS MARKET #12", -45.0);
    let result = h.engine.categorize_one(next.id, false).await.unwrap();

    assert_eq!(result.method, CategorizationMethod::Pattern);
    assert_eq!(result.category_id, Some(groceries));
    assert!(result.confidence < 1.0);
    assert!(result.confidence >= 0.6);
    assert_eq!(h.llm.calls(), 0);
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn test_user_corrected_category_is_stable() {
    let h = Harness::new();
    let transport = h.category("Transportation");
    let other = h.category("Other");
    h.engine
        .rules()
        .create_rule(&NewRule::new(h.org, transport, RuleField::Merchant, RuleOperator::Contains, "shell"))
        .await
        .unwrap();

    let tx = h.transaction("SHELL OIL 57444", -40.0);
    h.engine
        .record_feedback(&NewFeedback::new(h.org, tx.id, other, FeedbackType::Correction))
        .await
        .unwrap();
    h.engine.flush().await;

    for _ in 0..2 {
        let result = h.engine.categorize_one(tx.id, false).await.unwrap();
        assert_eq!(result.category_id, Some(other));
        let stored = h.stored(&tx);
        assert_eq!(stored.category_id, Some(other));
        assert!(stored.is_user_corrected());
    }
    assert_eq!(h.llm.calls(), 0);

    let forced = h.engine.categorize_one(tx.id, true).await.unwrap();
    assert_eq!(forced.method, CategorizationMethod::Rule);
    assert_eq!(h.stored(&tx).category_id, Some(transport));
}

#[tokio::test]
async fn test_higher_priority_rule_wins() {
    let h = Harness::new();
    let shopping = h.category("Shopping");
    let dining = h.category("Food & Dining");
    let rules = h.engine.rules();

    // created first but lower priority
    rules
        .create_rule(
            &NewRule::new(h.org, shopping, RuleField::Merchant, RuleOperator::StartsWith, "star")
                .with_priority(1),
        )
        .await
        .unwrap();
    rules
        .create_rule(
            &NewRule::new(h.org, dining, RuleField::Merchant, RuleOperator::Contains, "bucks")
                .with_priority(10),
        )
        .await
        .unwrap();

    let tx = h.transaction("STARBUCKS STORE 0042", -4.5);
    let result = h.engine.categorize_one(tx.id, false).await.unwrap();
    assert_eq!(result.method, CategorizationMethod::Rule);
    assert_eq!(result.category_id, Some(dining));
    assert_eq!(result.rule_matches[0].priority, 10);
}

#[tokio::test]
async fn test_llm_confidence_is_clamped() {
    let h = Harness::with(EngineConfig::default(), MockLlmClient::new().with_confidence(1.7));
    let tx = h.transaction("CHIPOTLE 1123", -11.0);

    let result = h.engine.categorize_one(tx.id, false).await.unwrap();
    assert_eq!(result.method, CategorizationMethod::LlmBatch);
    assert_eq!(result.confidence, 1.0);
    assert!(result.explanation.contains("clamped"));
    let metadata = h.stored(&tx).metadata.unwrap();
    assert_eq!(metadata.confidence_score, Some(1.0));

    let h = Harness::with(EngineConfig::default(), MockLlmClient::new().with_confidence(-0.3));
    let tx = h.transaction("CHIPOTLE 1123", -11.0);
    let summary = h
        .engine
        .categorize_batch(&BatchRequest::for_ids(h.org, vec![tx.id]))
        .await
        .unwrap();
    assert_eq!(summary.low_confidence, 1);
    let metadata = h.stored(&tx).metadata.unwrap();
    assert_eq!(metadata.confidence_score, Some(0.0));
    assert!(metadata.needs_review);
}

#[tokio::test]
async fn test_pattern_learning_converges() {
    let h = Harness::new();
    let entertainment = h.category("Entertainment");

    let mut last_usage = 0;
    let mut last_confidence = 0.0;
    for confidence in [0.8, 0.6, 0.9, 0.7, 0.85] {
        let entry = h
            .engine
            .patterns()
            .learn(h.org, "NETFLIX.COM", entertainment, confidence)
            .await
            .unwrap()
            .unwrap();
        assert!(entry.usage_count > last_usage);
        assert!(entry.confidence >= last_confidence);
        assert_eq!(entry.category_id, entertainment);
        last_usage = entry.usage_count;
        last_confidence = entry.confidence;
    }
    assert_eq!(last_usage, 5);
    assert!((last_confidence - 0.9).abs() < 1e-9);
}

// =============================================================================
// Cancellation, timeouts and budget gating
// =============================================================================

#[tokio::test]
async fn test_cancelled_batch_is_retryable() {
    let h = Harness::new();
    let txs: Vec<_> = ["TARGET", "AMAZON", "LYFT"]
        .iter()
        .map(|m| h.transaction(m, -9.0))
        .collect();

    let cancel = CancelFlag::new();
    cancel.cancel();
    let job = CategorizationJob::Batch {
        request: BatchRequest::all_uncategorized(h.org),
    };
    let completion = h.engine.run_job(&job, &cancel).await.unwrap();

    assert_eq!(completion.total, 3);
    assert_eq!(completion.categorized, 0);
    assert_eq!(completion.retryable_failures, 3);
    assert_eq!(h.llm.calls(), 0);
    for tx in &txs {
        assert!(h.stored(tx).category_id.is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn test_llm_timeout_is_retryable_failure() {
    let mut config = EngineConfig::default();
    config.llm.timeout_secs = 1;
    let h = Harness::with(config, MockLlmClient::new().with_delay(Duration::from_secs(30)));
    let tx = h.transaction("UBER TRIP", -23.0);

    let summary = h
        .engine
        .categorize_batch(&BatchRequest::for_ids(h.org, vec![tx.id]))
        .await
        .unwrap();

    let outcome = &summary.outcomes[0];
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert!(outcome.retryable);
    assert!(outcome.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(summary.retryable(), 1);
    assert!(h.stored(&tx).category_id.is_none());
}

#[tokio::test]
async fn test_realtime_path_reports_budget_refusal() {
    let h = Harness::new();
    h.engine.governor().update_budget(h.org, 1.0, 50.0).await.unwrap();
    h.engine.governor().record_cost(h.org, 1.0, 1).await.unwrap();
    let tx = h.transaction("TARGET T-0912", -30.0);

    let result = h.engine.categorize_one(tx.id, false).await.unwrap();
    assert_eq!(result.category_id, None);
    assert!(result.error.as_deref().unwrap().contains("daily"));
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test]
async fn test_realtime_budget_refusal_is_not_retryable() {
    let h = Harness::new();
    h.engine.governor().update_budget(h.org, 1.0, 50.0).await.unwrap();
    h.engine.governor().record_cost(h.org, 1.0, 1).await.unwrap();
    let tx = h.transaction("TARGET T-0912", -30.0);

    let job = CategorizationJob::Realtime {
        transaction_id: tx.id,
        force: false,
    };
    let completion = h.engine.run_job(&job, &CancelFlag::new()).await.unwrap();
    assert_eq!(completion.total, 1);
    assert_eq!(completion.categorized, 0);
    assert_eq!(completion.retryable_failures, 0);

    let outcome = h.engine.categorize_one_outcome(tx.id, false).await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::SkippedByBudget);
    assert!(!outcome.retryable);
}

#[tokio::test]
async fn test_rate_limit_window_blocks_further_calls() {
    let mut config = EngineConfig::default();
    config.rate_limit.max_requests_per_hour = 1;
    let h = Harness::with(config, MockLlmClient::new());

    let first = h.transaction("AMAZON MKTPLACE", -15.0);
    let summary = h
        .engine
        .categorize_batch(&BatchRequest::for_ids(h.org, vec![first.id]))
        .await
        .unwrap();
    assert_eq!(summary.categorized, 1);

    let second = h.transaction("NETFLIX.COM", -15.49);
    let summary = h
        .engine
        .categorize_batch(&BatchRequest::for_ids(h.org, vec![second.id]))
        .await
        .unwrap();
    assert_eq!(summary.rate_limited, 1);
    assert!(summary.outcomes[0].retryable);
    assert_eq!(h.llm.calls(), 1);

    // the realtime path reports the same refusal as retryable
    let job = CategorizationJob::Realtime {
        transaction_id: second.id,
        force: false,
    };
    let completion = h.engine.run_job(&job, &CancelFlag::new()).await.unwrap();
    assert_eq!(completion.categorized, 0);
    assert_eq!(completion.retryable_failures, 1);
}

#[tokio::test]
async fn test_concurrent_batches_cannot_overspend() {
    let mut config = EngineConfig::default();
    // keep LLM results out of the caches so both batches reach the LLM stage
    config.thresholds.acceptance = 0.95;
    let h = Harness::with(config, MockLlmClient::new());

    let batch_a: Vec<_> = (0..3).map(|_| h.transaction("STARBUCKS", -5.0)).collect();
    let batch_b: Vec<_> = (0..3).map(|_| h.transaction("STARBUCKS", -5.0)).collect();

    let categories = h.db.get_categories(h.org).unwrap();
    let (_, _, one_batch) = h.engine.classifier().estimate(&batch_a, &categories);
    let daily = one_batch * 1.5;
    h.engine.governor().update_budget(h.org, daily, 0.0).await.unwrap();

    let request_a = BatchRequest::for_ids(h.org, batch_a.iter().map(|t| t.id).collect());
    let request_b = BatchRequest::for_ids(h.org, batch_b.iter().map(|t| t.id).collect());
    let (a, b) = tokio::join!(
        h.engine.categorize_batch(&request_a),
        h.engine.categorize_batch(&request_b)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let mut outcomes = [(a.categorized, a.skipped_by_budget), (b.categorized, b.skipped_by_budget)];
    outcomes.sort();
    assert_eq!(outcomes, [(0, 3), (3, 0)]);
    assert_eq!(h.llm.calls(), 1);

    let tracker = h.engine.governor().cost_tracker(h.org).await.unwrap();
    assert!(tracker.current_spend <= daily + 1e-12);
    assert_eq!(tracker.transaction_count, 3);
}

#[tokio::test]
async fn test_realtime_job_completion() {
    let h = Harness::new();
    let tx = h.transaction("TRADER JOE'S #552", -64.1);

    let job: CategorizationJob = serde_json::from_value(serde_json::json!({
        "type": "realtime",
        "transaction_id": tx.id,
    }))
    .unwrap();
    let completion = h.engine.run_job(&job, &CancelFlag::new()).await.unwrap();

    assert_eq!(completion.total, 1);
    assert_eq!(completion.categorized, 1);
    assert_eq!(completion.retryable_failures, 0);
    assert_eq!(h.stored(&tx).category_id, Some(h.category("Groceries")));
}
