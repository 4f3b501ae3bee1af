//! Transaction command implementations

use anyhow::{Context, Result};
use chrono::Utc;
use sift_core::db::Database;
use sift_core::models::{NewTransaction, OrganizationId, Transaction};

use super::{category_label, category_names, parse_date, truncate};

pub fn cmd_transactions_list(
    db: &Database,
    org: OrganizationId,
    uncategorized: bool,
    limit: usize,
) -> Result<()> {
    let transactions = db.list_transactions(org, uncategorized, limit)?;

    if transactions.is_empty() {
        println!("No transactions found. Record some with:");
        println!("  sift transactions add --amount -4.50 --merchant STARBUCKS");
        return Ok(());
    }

    let names = category_names(db, org)?;

    println!();
    println!("📝 Recent Transactions");
    println!("   ─────────────────────────────────────────────────────────────");

    for tx in transactions {
        let amount_str = if tx.amount < 0.0 {
            format!("\x1b[31m${:.2}\x1b[0m", tx.amount.abs()) // Red for expenses
        } else {
            format!("\x1b[32m+${:.2}\x1b[0m", tx.amount) // Green for income
        };
        let review = if tx.metadata.as_ref().is_some_and(|m| m.needs_review) {
            " ⚠️"
        } else {
            ""
        };

        println!(
            "   {} │ {:>10} │ {:<30} │ {}{}",
            tx.date,
            amount_str,
            truncate(tx.merchant_text().unwrap_or("-"), 30),
            category_label(&names, tx.category_id),
            review
        );
        println!("     {}", tx.id);
    }

    Ok(())
}

pub fn cmd_transactions_add(
    db: &Database,
    org: OrganizationId,
    amount: f64,
    merchant: Option<String>,
    description: Option<String>,
    account: Option<String>,
    date: Option<&str>,
) -> Result<Transaction> {
    if merchant.is_none() && description.is_none() {
        anyhow::bail!("A transaction needs a --merchant or a --description");
    }
    let date = match date {
        Some(d) => parse_date(d)?,
        None => Utc::now().date_naive(),
    };

    let tx = db
        .insert_transaction(&NewTransaction {
            organization_id: org,
            account_name: account,
            amount,
            merchant_name: merchant,
            description,
            date,
        })
        .context("Failed to record transaction")?;

    println!("✅ Recorded transaction {}", tx.id);
    Ok(tx)
}
