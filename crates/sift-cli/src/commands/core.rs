//! Core command implementations and shared utilities
//!
//! This module contains:
//! - `open_db` - Shared utility to open the database
//! - `load_config` / `open_engine` - Build the engine from config
//! - `cmd_init` - Initialize the database

use std::path::Path;

use anyhow::{Context, Result};
use sift_core::models::OrganizationId;
use sift_core::{CategorizationEngine, Database, EngineConfig};

/// Categories seeded by `sift init`
pub const DEFAULT_CATEGORIES: [&str; 10] = [
    "Food & Dining",
    "Groceries",
    "Transportation",
    "Shopping",
    "Entertainment",
    "Bills & Utilities",
    "Health",
    "Travel",
    "Income",
    "Other",
];

pub fn open_db(db_path: &Path) -> Result<Database> {
    let path_str = db_path
        .to_str()
        .with_context(|| format!("Database path is not valid UTF-8: {}", db_path.display()))?;
    Database::new(path_str).context("Failed to open database")
}

/// Engine config: the override file (or the data directory's engine.toml),
/// then SIFT_LLM_* environment overrides
pub fn load_config(config_path: Option<&Path>) -> Result<EngineConfig> {
    EngineConfig::load(config_path).context("Failed to load engine config")
}

pub fn open_engine(db: &Database, config_path: Option<&Path>) -> Result<CategorizationEngine> {
    let config = load_config(config_path)?;
    CategorizationEngine::from_config(db, config).context("Failed to start categorization engine")
}

pub fn cmd_init(db: &Database, org: OrganizationId) -> Result<()> {
    println!("🔧 Initializing database at {}...", db.path());

    let existing = db.get_categories(org)?.len();
    for name in DEFAULT_CATEGORIES {
        db.create_category(org, name, None)
            .with_context(|| format!("Failed to create category {}", name))?;
    }
    let seeded = db.get_categories(org)?.len() - existing;
    println!("   Seeded {} default categories", seeded);
    println!("   Organization: {}", org);

    println!("✅ Database initialized successfully!");
    println!();
    println!("Next steps:");
    println!("  1. Record transactions: sift transactions add --amount -4.50 --merchant STARBUCKS");
    println!("  2. Categorize them:     sift batch");

    Ok(())
}
