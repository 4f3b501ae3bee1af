//! Categorization command implementations (single, batch, estimate, job)

use anyhow::{Context, Result};
use sift_core::db::Database;
use sift_core::models::{BatchRequest, BatchSummary, OrganizationId, OutcomeStatus};
use sift_core::{CancelFlag, CategorizationEngine, CategorizationJob, JobCompletion};

use super::{category_label, category_names, parse_date, parse_transaction_id};
use crate::cli::{BatchOptions, SelectorArgs};

/// Turn selector arguments into a batch request (default: all uncategorized)
pub fn build_request(org: OrganizationId, selector: &SelectorArgs) -> Result<BatchRequest> {
    if !selector.ids.is_empty() {
        if selector.from.is_some() || selector.to.is_some() {
            anyhow::bail!("Use either --ids or --from/--to, not both");
        }
        let ids = selector
            .ids
            .iter()
            .map(|id| parse_transaction_id(id))
            .collect::<Result<Vec<_>>>()?;
        return Ok(BatchRequest::for_ids(org, ids));
    }
    match (&selector.from, &selector.to) {
        (Some(from), Some(to)) => {
            let start = parse_date(from)?;
            let end = parse_date(to)?;
            if end < start {
                anyhow::bail!("--to ({}) is before --from ({})", end, start);
            }
            Ok(BatchRequest::date_range(org, start, end))
        }
        (None, None) => Ok(BatchRequest::all_uncategorized(org)),
        _ => anyhow::bail!("--from and --to must be given together"),
    }
}

pub async fn cmd_categorize(
    engine: &CategorizationEngine,
    db: &Database,
    id: &str,
    force: bool,
) -> Result<()> {
    let id = parse_transaction_id(id)?;
    let result = engine
        .categorize_one(id, force)
        .await
        .with_context(|| format!("Failed to categorize {}", id))?;

    let org = db
        .get_transaction(id)?
        .map(|tx| tx.organization_id)
        .with_context(|| format!("Transaction not found: {}", id))?;
    let names = category_names(db, org)?;

    println!();
    println!("🏷️  {}", id);
    println!("   ─────────────────────────────");
    if let Some(error) = &result.error {
        println!("   ❌ {}", error);
        return Ok(());
    }
    println!("   Category:   {}", category_label(&names, result.category_id));
    println!("   Confidence: {:.0}%", result.confidence * 100.0);
    println!("   Method:     {}", result.method);
    println!("   Reason:     {}", result.explanation);
    if result.cost_estimate > 0.0 {
        println!("   Cost:       ${:.6}", result.cost_estimate);
    }

    Ok(())
}

pub async fn cmd_batch(
    engine: &CategorizationEngine,
    org: OrganizationId,
    selector: &SelectorArgs,
    options: &BatchOptions,
    json: bool,
) -> Result<BatchSummary> {
    let mut request = build_request(org, selector)?;
    request.force_recategorize = options.force;
    request.max_cost = options.max_cost;
    request.confidence_threshold = options.threshold;

    // Ctrl-C stops at the next safe point; finished work is kept
    let cancel = CancelFlag::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let summary = engine.categorize_batch_with_cancel(&request, &cancel).await;
    watcher.abort();
    let summary = summary.context("Batch categorization failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(summary);
    }

    println!();
    println!("📊 Batch Results");
    println!("   ─────────────────────────────");
    println!("   Transactions:       {}", summary.total);
    println!("   ✅ Categorized:      {}", summary.categorized);
    println!("   ⚠️  Needs review:     {}", summary.low_confidence);
    println!("   ❔ Uncategorized:    {}", summary.uncategorized);
    println!("   ⏭️  Skipped:          {}", summary.skipped);
    if summary.skipped_by_budget > 0 {
        println!("   💸 Over budget:      {}", summary.skipped_by_budget);
    }
    if summary.rate_limited > 0 {
        println!("   🐢 Rate limited:     {}", summary.rate_limited);
    }
    if summary.cancelled > 0 {
        println!("   🛑 Cancelled:        {}", summary.cancelled);
    }
    if summary.failed > 0 {
        println!("   ❌ Failed:           {}", summary.failed);
    }
    println!("   LLM calls:          {}", summary.llm_calls);
    println!("   Cost:               ${:.6}", summary.cost);

    let failures: Vec<_> = summary
        .outcomes
        .iter()
        .filter(|o| o.status == OutcomeStatus::Failed)
        .collect();
    if !failures.is_empty() {
        println!();
        println!("   Failures:");
        for outcome in failures.iter().take(10) {
            println!(
                "     {} │ {}",
                outcome.transaction_id,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    if summary.retryable() > 0 {
        println!();
        println!("💡 {} transactions can be retried with 'sift batch'.", summary.retryable());
    }

    Ok(summary)
}

pub async fn cmd_estimate(
    engine: &CategorizationEngine,
    org: OrganizationId,
    selector: &SelectorArgs,
) -> Result<()> {
    let request = build_request(org, selector)?;
    let estimate = engine.estimate_batch_cost(&request).await?;

    println!();
    println!("💰 Cost Estimate");
    println!("   ─────────────────────────────");
    println!("   Transactions: {}", estimate.transaction_count);
    println!("   LLM calls:    {}", estimate.sub_batches);
    println!("   Tokens:       {} in / {} out", estimate.input_tokens, estimate.output_tokens);
    println!("   Model:        {}", estimate.model);
    println!("   Estimated:    ${:.6}", estimate.estimated_cost);
    println!();
    println!("   Deterministic strategies may categorize some of these for free.");

    Ok(())
}

pub async fn cmd_job(engine: &CategorizationEngine, payload: &str) -> Result<JobCompletion> {
    let job: CategorizationJob = serde_json::from_str(payload).context("Invalid job payload")?;
    let completion = engine.run_job(&job, &CancelFlag::new()).await?;
    println!("{}", serde_json::to_string(&completion)?);
    Ok(completion)
}
