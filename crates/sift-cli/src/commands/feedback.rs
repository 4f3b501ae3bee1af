//! Feedback command implementations

use anyhow::{Context, Result};
use sift_core::db::Database;
use sift_core::models::{FeedbackType, NewFeedback, OrganizationId};
use sift_core::CategorizationEngine;

use super::{category_label, category_names, parse_transaction_id, resolve_category};

pub async fn cmd_feedback(
    engine: &CategorizationEngine,
    db: &Database,
    org: OrganizationId,
    transaction_id: &str,
    category: &str,
    kind: &str,
) -> Result<()> {
    let transaction_id = parse_transaction_id(transaction_id)?;
    let category_id = resolve_category(db, org, category)?;
    let feedback_type: FeedbackType = kind.parse().map_err(anyhow::Error::msg)?;

    let feedback = engine
        .record_feedback(&NewFeedback::new(org, transaction_id, category_id, feedback_type))
        .await
        .context("Failed to record feedback")?;

    let names = category_names(db, org)?;
    println!(
        "✅ Recorded {} (id: {}): {} → {}",
        feedback.feedback_type,
        feedback.id,
        category_label(&names, feedback.old_category_id),
        category_label(&names, Some(feedback.new_category_id))
    );

    Ok(())
}

pub async fn cmd_analyze(
    engine: &CategorizationEngine,
    db: &Database,
    org: OrganizationId,
) -> Result<()> {
    let analysis = engine.learner().analyze(org).await?;

    if analysis.total == 0 {
        println!("No feedback recorded yet. Correct a categorization with:");
        println!("  sift feedback <transaction-id> <category>");
        return Ok(());
    }

    let names = category_names(db, org)?;

    println!();
    println!("📈 Feedback Analysis");
    println!("   ─────────────────────────────");
    println!("   Feedback:      {}", analysis.total);
    println!("   Corrections:   {:.0}%", analysis.correction_rate * 100.0);
    println!("   Confirmations: {:.0}%", analysis.confirmation_rate * 100.0);
    println!("   Rejections:    {:.0}%", analysis.rejection_rate * 100.0);
    if let Some(avg) = analysis.avg_confidence_before {
        println!("   Avg confidence before review: {:.0}%", avg * 100.0);
    }

    if !analysis.method_accuracy.is_empty() {
        println!();
        println!("   Accuracy by method:");
        for (method, accuracy) in &analysis.method_accuracy {
            println!(
                "     {:<12} {:>5.0}% ({} reviewed)",
                method,
                accuracy.accuracy * 100.0,
                accuracy.feedback
            );
        }
    }

    if !analysis.common_corrections.is_empty() {
        println!();
        println!("   Common corrections:");
        for correction in &analysis.common_corrections {
            println!(
                "     {} → {} ({}×)",
                category_label(&names, correction.old_category_id),
                category_label(&names, Some(correction.new_category_id)),
                correction.count
            );
        }
    }

    Ok(())
}
