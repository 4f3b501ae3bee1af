//! CLI command implementations
//!
//! Commands are organized by domain:
//! - `core` - Shared utilities (open_db, open_engine) and init
//! - `categories` - Category commands (list, add)
//! - `transactions` - Transaction commands (list, add)
//! - `rules` - Rule management commands (list, add, delete, test)
//! - `categorize` - Categorization runs (single, batch, estimate, job)
//! - `feedback` - Feedback recording and analysis
//! - `patterns` - Pattern cache inspection
//! - `budget` - Budget, stats and cost optimization commands

pub mod budget;
pub mod categories;
pub mod categorize;
pub mod core;
pub mod feedback;
pub mod patterns;
pub mod rules;
pub mod transactions;

// Re-export command functions for main.rs
pub use budget::*;
pub use categories::*;
pub use categorize::*;
pub use self::core::*;
pub use feedback::*;
pub use patterns::*;
pub use rules::*;
pub use transactions::*;

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sift_core::db::Database;
use sift_core::models::{CategoryId, OrganizationId, TransactionId};
use uuid::Uuid;

/// Truncate a string to a maximum length, adding "..." if truncated
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

pub fn parse_transaction_id(id: &str) -> Result<TransactionId> {
    Uuid::parse_str(id.trim()).with_context(|| format!("Invalid transaction ID: {}", id))
}

pub fn parse_date(date: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .with_context(|| format!("Invalid date (expected YYYY-MM-DD): {}", date))
}

/// Category id -> name, for display
pub fn category_names(db: &Database, org: OrganizationId) -> Result<HashMap<CategoryId, String>> {
    Ok(db
        .get_categories(org)?
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect())
}

pub fn resolve_category(db: &Database, org: OrganizationId, name: &str) -> Result<CategoryId> {
    db.get_category_by_name(org, name)?
        .map(|c| c.id)
        .ok_or_else(|| anyhow::anyhow!("Category not found: {}. Run 'sift categories' to list them.", name))
}

fn category_label(names: &HashMap<CategoryId, String>, id: Option<CategoryId>) -> String {
    match id {
        Some(id) => names.get(&id).cloned().unwrap_or_else(|| format!("#{}", id)),
        None => "-".to_string(),
    }
}
