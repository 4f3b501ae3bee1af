//! CLI argument definitions using clap
//!
//! This module contains all the clap structs and enums for parsing CLI arguments.
//! The actual command implementations are in the `commands` module.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

/// Sift - Categorize transactions with rules, learned patterns and an LLM
#[derive(Parser)]
#[command(name = "sift")]
#[command(about = "Transaction categorization engine", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Database path
    #[arg(long, default_value = "sift.db", global = true)]
    pub db: PathBuf,

    /// Engine config file (defaults to the data directory's engine.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Organization to operate on
    #[arg(long, default_value_t = Uuid::nil(), global = true)]
    pub org: Uuid,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database and seed default categories
    Init,

    /// Manage categories (list, add)
    Categories {
        #[command(subcommand)]
        action: Option<CategoriesAction>,
    },

    /// Manage transactions (list, add)
    Transactions {
        #[command(subcommand)]
        action: Option<TransactionsAction>,
    },

    /// Manage categorization rules (list, add, delete, test)
    Rules {
        #[command(subcommand)]
        action: Option<RulesAction>,
    },

    /// Categorize a single transaction
    Categorize {
        /// Transaction ID
        id: String,

        /// Recategorize even if already categorized or user-corrected
        #[arg(long)]
        force: bool,
    },

    /// Categorize a batch of transactions
    Batch {
        #[command(flatten)]
        selector: SelectorArgs,

        #[command(flatten)]
        options: BatchOptions,

        /// Print the full summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Estimate the LLM cost of a batch without running it
    Estimate {
        #[command(flatten)]
        selector: SelectorArgs,
    },

    /// Run a queued job payload (JSON)
    Job {
        /// Job payload, e.g. '{"type":"realtime","transaction_id":"..."}'
        payload: String,
    },

    /// Record feedback on a categorization
    Feedback {
        /// Transaction ID
        transaction_id: String,

        /// Category name the transaction should have
        category: String,

        /// Feedback type: correction, confirmation, rejection
        #[arg(long, default_value = "correction")]
        kind: String,
    },

    /// Inspect the merchant pattern cache
    Patterns {
        #[command(subcommand)]
        action: Option<PatternsAction>,
    },

    /// Show or change LLM budgets
    Budget {
        #[command(subcommand)]
        action: Option<BudgetAction>,
    },

    /// Show categorization coverage and LLM spend
    Stats,

    /// Analyze recorded feedback
    Analyze,

    /// Suggest ways to reduce LLM spend
    Optimize,
}

#[derive(Subcommand)]
pub enum CategoriesAction {
    /// List all categories
    List,

    /// Add a category
    Add {
        /// Category name
        name: String,

        /// Parent category name
        #[arg(long)]
        parent: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum TransactionsAction {
    /// List recent transactions
    List {
        /// Only show uncategorized transactions
        #[arg(long)]
        uncategorized: bool,

        /// Maximum number of transactions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Record a transaction
    Add {
        /// Signed amount (negative = money out)
        #[arg(long, allow_hyphen_values = true)]
        amount: f64,

        /// Merchant name
        #[arg(long)]
        merchant: Option<String>,

        /// Bank description
        #[arg(long)]
        description: Option<String>,

        /// Account name
        #[arg(long)]
        account: Option<String>,

        /// Date (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        date: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum RulesAction {
    /// List all rules in evaluation order
    List,

    /// Add a new rule
    Add {
        #[command(flatten)]
        rule: RuleArgs,
    },

    /// Delete a rule
    Delete {
        /// Rule ID to delete
        id: i64,
    },

    /// Dry-run a rule against recently categorized transactions
    Test {
        #[command(flatten)]
        rule: RuleArgs,

        /// Maximum number of transactions to scan
        #[arg(long, default_value = "500")]
        limit: usize,
    },
}

#[derive(Args, Clone)]
pub struct RuleArgs {
    /// Category to assign when the rule matches
    pub category: String,

    /// Field to inspect: description, merchant, account, amount
    pub field: String,

    /// Operator: contains, equals, starts_with, ends_with, greater_than, less_than
    pub operator: String,

    /// Value to compare against
    #[arg(allow_hyphen_values = true)]
    pub value: String,

    /// Rule priority (higher = checked first)
    #[arg(long, default_value = "0")]
    pub priority: i32,

    /// Confidence reported when the rule wins
    #[arg(long, default_value = "0.9")]
    pub confidence: f64,

    /// Match case exactly
    #[arg(long)]
    pub case_sensitive: bool,

    /// Treat the value as a regular expression
    #[arg(long)]
    pub regex: bool,
}

/// Which transactions a batch covers (default: all uncategorized)
#[derive(Args, Clone, Default)]
pub struct SelectorArgs {
    /// Transaction IDs (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub ids: Vec<String>,

    /// Start date (YYYY-MM-DD)
    #[arg(long, requires = "to")]
    pub from: Option<String>,

    /// End date (YYYY-MM-DD)
    #[arg(long, requires = "from")]
    pub to: Option<String>,
}

#[derive(Args, Clone, Default)]
pub struct BatchOptions {
    /// Recategorize transactions that already have a category
    #[arg(long)]
    pub force: bool,

    /// Cap on LLM spend for this batch (USD)
    #[arg(long)]
    pub max_cost: Option<f64>,

    /// Confidence threshold override
    #[arg(long)]
    pub threshold: Option<f64>,
}

#[derive(Subcommand)]
pub enum PatternsAction {
    /// List cached merchant patterns
    List {
        /// Maximum number of patterns to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show cached patterns similar to a merchant
    Similar {
        /// Merchant name
        merchant: String,
    },

    /// Clear the pattern cache
    Clear {
        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum BudgetAction {
    /// Show budgets, current spend and alerts
    Show,

    /// Set budgets (0 = unlimited)
    Set {
        /// Daily budget (USD)
        #[arg(long)]
        daily: f64,

        /// Monthly budget (USD)
        #[arg(long)]
        monthly: f64,
    },
}
