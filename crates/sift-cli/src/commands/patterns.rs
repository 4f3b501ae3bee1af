//! Pattern cache command implementations

use std::io::{self, Write};

use anyhow::Result;
use sift_core::db::Database;
use sift_core::models::OrganizationId;
use sift_core::patterns::normalize_merchant;
use sift_core::CategorizationEngine;

use super::{category_label, category_names, truncate};

pub async fn cmd_patterns_list(
    engine: &CategorizationEngine,
    db: &Database,
    org: OrganizationId,
    limit: usize,
) -> Result<()> {
    let patterns = engine.patterns().list(org).await?;

    if patterns.is_empty() {
        println!("Pattern cache is empty. Patterns are learned as transactions are categorized.");
        return Ok(());
    }

    let names = category_names(db, org)?;

    println!();
    println!("🧠 Merchant Patterns ({} total)", patterns.len());
    println!("   ─────────────────────────────────────────────────────────────");

    for entry in patterns.iter().take(limit) {
        println!(
            "   {:<30} │ {:<20} │ {:>4.0}% │ used {}×",
            truncate(&entry.merchant_pattern, 30),
            truncate(&category_label(&names, Some(entry.category_id)), 20),
            entry.confidence * 100.0,
            entry.usage_count
        );
    }

    Ok(())
}

pub async fn cmd_patterns_similar(
    engine: &CategorizationEngine,
    db: &Database,
    org: OrganizationId,
    merchant: &str,
) -> Result<()> {
    let similar = engine.patterns().similar_patterns(org, merchant).await?;

    println!();
    println!("🔎 Patterns similar to '{}' ({})", merchant, normalize_merchant(merchant));
    println!("   ─────────────────────────────────────────────────────────────");

    if similar.is_empty() {
        println!("   No similar patterns found.");
        return Ok(());
    }

    let names = category_names(db, org)?;
    for (candidate, score) in &similar {
        println!(
            "   {:<30} │ {:<20} │ similarity {:.2} │ score {:.2}",
            truncate(&candidate.entry.merchant_pattern, 30),
            truncate(&category_label(&names, Some(candidate.entry.category_id)), 20),
            candidate.similarity,
            score
        );
    }

    Ok(())
}

pub async fn cmd_patterns_clear(
    engine: &CategorizationEngine,
    org: OrganizationId,
    yes: bool,
) -> Result<()> {
    if !yes {
        print!("⚠️  This will forget every learned merchant pattern.\n\n");
        print!("Are you sure? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let removed = engine.patterns().clear(org).await?;
    println!("✅ Cleared {} patterns", removed);

    Ok(())
}
