//! Sift CLI - Transaction categorization engine
//!
//! Usage:
//!   sift init                          Initialize database
//!   sift transactions add --amount -4.5 --merchant STARBUCKS
//!   sift batch                         Categorize all uncategorized transactions
//!   sift feedback <id> Groceries       Correct a categorization

mod cli;
mod commands;


use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    let db = commands::open_db(&cli.db)?;
    let org = cli.org;

    match cli.command {
        Commands::Init => commands::cmd_init(&db, org),
        Commands::Categories { action } => match action {
            None | Some(CategoriesAction::List) => commands::cmd_categories_list(&db, org),
            Some(CategoriesAction::Add { name, parent }) => {
                commands::cmd_categories_add(&db, org, &name, parent.as_deref())
            }
        },
        Commands::Transactions { action } => match action {
            None => commands::cmd_transactions_list(&db, org, false, 20),
            Some(TransactionsAction::List {
                uncategorized,
                limit,
            }) => commands::cmd_transactions_list(&db, org, uncategorized, limit),
            Some(TransactionsAction::Add {
                amount,
                merchant,
                description,
                account,
                date,
            }) => commands::cmd_transactions_add(
                &db,
                org,
                amount,
                merchant,
                description,
                account,
                date.as_deref(),
            )
            .map(|_| ()),
        },
        command => {
            let engine = commands::open_engine(&db, cli.config.as_deref())?;
            let result = run_engine_command(&engine, &db, org, command).await;
            // Drain background pattern and feedback writes before exiting
            engine.flush().await;
            result
        }
    }
}

async fn run_engine_command(
    engine: &sift_core::CategorizationEngine,
    db: &sift_core::Database,
    org: uuid::Uuid,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Rules { action } => match action {
            None | Some(RulesAction::List) => commands::cmd_rules_list(engine, db, org).await,
            Some(RulesAction::Add { rule }) => {
                commands::cmd_rules_add(engine, db, org, &rule).await.map(|_| ())
            }
            Some(RulesAction::Delete { id }) => commands::cmd_rules_delete(engine, id).await,
            Some(RulesAction::Test { rule, limit }) => {
                commands::cmd_rules_test(engine, db, org, &rule, limit).await
            }
        },
        Commands::Categorize { id, force } => {
            commands::cmd_categorize(engine, db, &id, force).await
        }
        Commands::Batch {
            selector,
            options,
            json,
        } => commands::cmd_batch(engine, org, &selector, &options, json)
            .await
            .map(|_| ()),
        Commands::Estimate { selector } => commands::cmd_estimate(engine, org, &selector).await,
        Commands::Job { payload } => commands::cmd_job(engine, &payload).await.map(|_| ()),
        Commands::Feedback {
            transaction_id,
            category,
            kind,
        } => commands::cmd_feedback(engine, db, org, &transaction_id, &category, &kind).await,
        Commands::Patterns { action } => match action {
            None => commands::cmd_patterns_list(engine, db, org, 50).await,
            Some(PatternsAction::List { limit }) => {
                commands::cmd_patterns_list(engine, db, org, limit).await
            }
            Some(PatternsAction::Similar { merchant }) => {
                commands::cmd_patterns_similar(engine, db, org, &merchant).await
            }
            Some(PatternsAction::Clear { yes }) => commands::cmd_patterns_clear(engine, org, yes).await,
        },
        Commands::Budget { action } => match action {
            None | Some(BudgetAction::Show) => commands::cmd_budget_show(engine, db, org).await,
            Some(BudgetAction::Set { daily, monthly }) => {
                commands::cmd_budget_set(engine, org, daily, monthly).await
            }
        },
        Commands::Stats => commands::cmd_stats(engine, db, org).await,
        Commands::Analyze => commands::cmd_analyze(engine, db, org).await,
        Commands::Optimize => commands::cmd_optimize(engine, org).await,
        Commands::Init | Commands::Categories { .. } | Commands::Transactions { .. } => {
            anyhow::bail!("command does not run through the engine")
        }
    }
}
