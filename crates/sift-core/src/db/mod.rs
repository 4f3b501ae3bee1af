//! SQLite implementation of the repository interfaces
//!
//! This module is organized by domain:
//! - `transactions` - Transactions and categorization write-back
//! - `categories` - Organization categories
//! - `rules` - Categorization rules and usage statistics
//! - `patterns` - Merchant pattern cache
//! - `feedback` - User feedback (append-only)
//! - `costs` - Cost trackers, budget settings, cost ledger and alerts
//! - `batches` - LLM batch audit trail
//! - `embeddings` - Transaction embedding index

use chrono::{DateTime, NaiveDate, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;

mod batches;
mod categories;
mod costs;
mod embeddings;
mod feedback;
mod patterns;
mod rules;
mod transactions;


pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Parse a SQLite datetime string into a DateTime<Utc>
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    // SQLite stores as "YYYY-MM-DD HH:MM:SS" format
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

/// Format a timestamp the way SQLite's CURRENT_TIMESTAMP does (plus millis)
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

pub(crate) fn uuid_column(value: String, idx: usize) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn date_column(value: String, idx: usize) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&value, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Database wrapper with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    /// Path to the database file
    db_path: String,
}

impl Database {
    /// Open (or create) a database file and run migrations
    pub fn new(path: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            Ok(())
        });
        let pool = Pool::builder().max_size(10).build(manager)?;

        let db = Self {
            pool,
            db_path: path.to_string(),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get the path to the database file
    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Create a throwaway database (for testing)
    ///
    /// Note: Uses a temporary file rather than `:memory:` because every pooled
    /// connection to `:memory:` would see its own empty database.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "sift_test_{}_{}.db",
            std::process::id(),
            id
        ));
        let path = path.to_string_lossy().to_string();

        // Remove any existing file
        let _ = std::fs::remove_file(&path);

        Self::new(&path)
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- WAL mode: readers don't block the single writer
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            -- Organization-scoped categories (tree via parent_id)
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                organization_id TEXT NOT NULL,
                name TEXT NOT NULL,
                parent_id INTEGER REFERENCES categories(id),
                color TEXT,
                icon TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(organization_id, name)
            );

            -- Transactions (owned by ingestion; engine writes category + metadata)
            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                account_name TEXT,
                amount REAL NOT NULL,
                merchant_name TEXT,
                description TEXT,
                date TEXT NOT NULL,
                category_id INTEGER REFERENCES categories(id),
                categorization_metadata TEXT,
                categorized_at DATETIME,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_org_date
                ON transactions(organization_id, date);
            CREATE INDEX IF NOT EXISTS idx_transactions_org_category
                ON transactions(organization_id, category_id);

            -- User-defined deterministic rules
            CREATE TABLE IF NOT EXISTS categorization_rules (
                id INTEGER PRIMARY KEY,
                organization_id TEXT NOT NULL,
                category_id INTEGER NOT NULL REFERENCES categories(id),
                field TEXT NOT NULL,
                operator TEXT NOT NULL,
                value TEXT NOT NULL,
                case_sensitive INTEGER NOT NULL DEFAULT 0,
                is_regex INTEGER NOT NULL DEFAULT 0,
                confidence REAL NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                usage_count INTEGER NOT NULL DEFAULT 0,
                success_rate REAL NOT NULL DEFAULT 1.0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                last_used_at DATETIME
            );
            CREATE INDEX IF NOT EXISTS idx_rules_org ON categorization_rules(organization_id);

            -- Merchant pattern cache (only shrinks via explicit clear)
            CREATE TABLE IF NOT EXISTS merchant_patterns (
                id INTEGER PRIMARY KEY,
                organization_id TEXT NOT NULL,
                merchant_pattern TEXT NOT NULL,
                category_id INTEGER NOT NULL,
                confidence REAL NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 1,
                last_used_at DATETIME NOT NULL,
                created_at DATETIME NOT NULL,
                UNIQUE(organization_id, merchant_pattern)
            );

            -- User feedback (append-only)
            CREATE TABLE IF NOT EXISTS categorization_feedback (
                id INTEGER PRIMARY KEY,
                transaction_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                old_category_id INTEGER,
                new_category_id INTEGER NOT NULL,
                feedback_type TEXT NOT NULL,
                confidence_before REAL,
                method_used TEXT,
                created_at DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_feedback_org ON categorization_feedback(organization_id);
            CREATE INDEX IF NOT EXISTS idx_feedback_tx ON categorization_feedback(transaction_id);

            -- Running spend per organization
            CREATE TABLE IF NOT EXISTS cost_trackers (
                organization_id TEXT PRIMARY KEY,
                daily_budget REAL NOT NULL,
                monthly_budget REAL NOT NULL,
                current_spend REAL NOT NULL DEFAULT 0,
                monthly_spend REAL NOT NULL DEFAULT 0,
                transaction_count INTEGER NOT NULL DEFAULT 0,
                avg_cost_per_transaction REAL NOT NULL DEFAULT 0,
                period_day TEXT NOT NULL,
                updated_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS budget_settings (
                organization_id TEXT PRIMARY KEY,
                daily_budget REAL NOT NULL,
                monthly_budget REAL NOT NULL,
                alert_thresholds TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at DATETIME NOT NULL
            );

            -- Cost ledger: one row per recorded batch
            CREATE TABLE IF NOT EXISTS cost_entries (
                id INTEGER PRIMARY KEY,
                organization_id TEXT NOT NULL,
                cost REAL NOT NULL,
                transaction_count INTEGER NOT NULL,
                day TEXT NOT NULL,
                created_at DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cost_entries_org_day ON cost_entries(organization_id, day);

            -- Delivered budget alerts
            CREATE TABLE IF NOT EXISTS budget_alerts (
                id INTEGER PRIMARY KEY,
                organization_id TEXT NOT NULL,
                period TEXT NOT NULL,
                threshold REAL NOT NULL,
                current_spend REAL NOT NULL,
                budget_limit REAL NOT NULL,
                percentage REAL NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at DATETIME NOT NULL
            );

            -- LLM call audit trail (append-only)
            CREATE TABLE IF NOT EXISTS llm_batches (
                id INTEGER PRIMARY KEY,
                organization_id TEXT NOT NULL,
                transaction_count INTEGER NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                total_cost REAL NOT NULL,
                model TEXT NOT NULL,
                success_rate REAL NOT NULL,
                avg_confidence REAL NOT NULL,
                processing_time_ms INTEGER NOT NULL,
                created_at DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_llm_batches_org ON llm_batches(organization_id, created_at);

            -- Embeddings of categorized transactions (little-endian f32 blobs)
            CREATE TABLE IF NOT EXISTS transaction_embeddings (
                transaction_id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                category_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                dimensions INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                updated_at DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_embeddings_org ON transaction_embeddings(organization_id);
            "#,
        )?;

        info!(path = %self.db_path, "Database migrations complete");
        Ok(())
    }
}
