//! Budget, stats and cost optimization command implementations

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use sift_core::budget::{optimization_strategies, Priority};
use sift_core::db::Database;
use sift_core::models::OrganizationId;
use sift_core::CategorizationEngine;

fn limit_label(limit: f64) -> String {
    if limit > 0.0 {
        format!("${:.2}", limit)
    } else {
        "unlimited".to_string()
    }
}

pub async fn cmd_budget_show(
    engine: &CategorizationEngine,
    db: &Database,
    org: OrganizationId,
) -> Result<()> {
    let governor = engine.governor();
    let settings = governor.settings(org).await?;
    let tracker = governor.cost_tracker(org).await?;

    println!();
    println!("💸 LLM Budget");
    println!("   ─────────────────────────────");
    if !settings.enabled {
        println!("   Budget enforcement: DISABLED");
    }
    println!(
        "   Today:      ${:.4} of {}",
        tracker.current_spend,
        limit_label(settings.daily_budget)
    );
    println!(
        "   This month: ${:.4} of {}",
        tracker.monthly_spend,
        limit_label(settings.monthly_budget)
    );
    println!("   Sent to LLM this month: {} transactions", tracker.transaction_count);
    if tracker.transaction_count > 0 {
        println!("   Avg cost/transaction:   ${:.6}", tracker.avg_cost_per_transaction);
    }

    let alerts = db.list_budget_alerts(org)?;
    if !alerts.is_empty() {
        println!();
        println!("   Recent alerts:");
        for alert in alerts.iter().take(5) {
            println!(
                "     {} │ {:<8} │ {}",
                alert.created_at.format("%Y-%m-%d %H:%M"),
                alert.severity,
                alert.message
            );
        }
    }

    Ok(())
}

pub async fn cmd_budget_set(
    engine: &CategorizationEngine,
    org: OrganizationId,
    daily: f64,
    monthly: f64,
) -> Result<()> {
    let settings = engine
        .governor()
        .update_budget(org, daily, monthly)
        .await
        .context("Failed to update budget")?;
    println!(
        "✅ Budget set: {} daily, {} monthly",
        limit_label(settings.daily_budget),
        limit_label(settings.monthly_budget)
    );
    Ok(())
}

pub async fn cmd_stats(
    engine: &CategorizationEngine,
    db: &Database,
    org: OrganizationId,
) -> Result<()> {
    let stats = engine.categorization_stats(org).await?;

    println!();
    println!("📊 Categorization Stats");
    println!("   ─────────────────────────────");
    println!("   Transactions:   {}", stats.total);
    println!("   Categorized:    {}", stats.categorized);
    println!("   Uncategorized:  {}", stats.uncategorized);
    println!("   Needs review:   {}", stats.needs_review);
    println!("   User corrected: {}", stats.user_corrected);
    if let Some(avg) = stats.avg_confidence {
        println!("   Avg confidence: {:.0}%", avg * 100.0);
    }

    if !stats.by_method.is_empty() {
        println!();
        println!("   By method:");
        for (method, count) in &stats.by_method {
            println!("     {:<12} {}", method, count);
        }
    }

    let today = Utc::now().date_naive();
    let month_start = today.with_day(1).unwrap_or(today);
    let (cost, calls) = db.llm_cost_summary(org, month_start, today)?;
    let indexed = engine.similarity().index_size(org).await?;

    println!();
    println!("   LLM calls this month: {} (${:.4})", calls, cost);
    println!("   Similarity index:     {} transactions", indexed);
    let dropped = engine.patterns().dropped_writes();
    if dropped > 0 {
        println!("   ⚠️  Dropped pattern writes: {}", dropped);
    }

    let batches = db.get_llm_batches(org, 5)?;
    if !batches.is_empty() {
        println!();
        println!("   Recent LLM batches:");
        for batch in &batches {
            println!(
                "     {} │ {:>3} txns │ {:>6} tokens │ ${:.6} │ {:.0}% resolved",
                batch.created_at.format("%Y-%m-%d %H:%M"),
                batch.transaction_count,
                batch.input_tokens + batch.output_tokens,
                batch.total_cost,
                batch.success_rate * 100.0
            );
        }
    }

    Ok(())
}

pub async fn cmd_optimize(engine: &CategorizationEngine, org: OrganizationId) -> Result<()> {
    let tracker = engine.governor().cost_tracker(org).await?;
    let strategies = optimization_strategies(&tracker);

    if strategies.is_empty() {
        println!("✅ LLM spend looks efficient. Nothing to suggest.");
        return Ok(());
    }

    println!();
    println!("💡 Cost Optimization");
    println!("   ─────────────────────────────");
    for strategy in &strategies {
        let marker = match strategy.priority {
            Priority::High => "🔴",
            Priority::Medium => "🟡",
            Priority::Low => "🟢",
        };
        println!(
            "   {} {} (saves ~${:.2}/month)",
            marker, strategy.name, strategy.potential_savings
        );
        println!("      {}", strategy.description);
        println!("      → {}", strategy.implementation);
    }

    Ok(())
}
