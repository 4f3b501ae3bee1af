//! Rule command implementations

use anyhow::{Context, Result};
use sift_core::db::Database;
use sift_core::models::{NewRule, OrganizationId, Rule, RuleField, RuleOperator};
use sift_core::CategorizationEngine;

use super::{category_label, category_names, resolve_category};
use crate::cli::RuleArgs;

/// Resolve a rule's category and parse its field/operator
pub fn build_rule(db: &Database, org: OrganizationId, args: &RuleArgs) -> Result<NewRule> {
    let category_id = resolve_category(db, org, &args.category)?;
    let field: RuleField = args.field.parse().map_err(anyhow::Error::msg)?;
    let operator: RuleOperator = args.operator.parse().map_err(anyhow::Error::msg)?;

    let mut rule = NewRule::new(org, category_id, field, operator, args.value.clone())
        .with_priority(args.priority)
        .with_confidence(args.confidence);
    if args.case_sensitive {
        rule = rule.case_sensitive();
    }
    if args.regex {
        rule = rule.regex();
    }
    Ok(rule)
}

pub async fn cmd_rules_list(
    engine: &CategorizationEngine,
    db: &Database,
    org: OrganizationId,
) -> Result<()> {
    let rules = engine.rules().list_rules(org).await?;

    if rules.is_empty() {
        println!("No rules defined. Add one with:");
        println!("  sift rules add Groceries merchant contains \"WHOLE FOODS\"");
        return Ok(());
    }

    let names = category_names(db, org)?;

    println!();
    println!("📋 Rules (evaluation order)");
    println!("   ─────────────────────────────────────────────────────────────");

    for rule in &rules {
        println!(
            "   {:>4} │ {:>3} │ {} → {} │ used {}× │ success {:.0}%",
            rule.id,
            rule.priority,
            describe(rule),
            category_label(&names, Some(rule.category_id)),
            rule.usage_count,
            rule.success_rate * 100.0
        );
    }

    Ok(())
}

fn describe(rule: &Rule) -> String {
    let mut flags = Vec::new();
    if rule.is_regex {
        flags.push("regex");
    }
    if rule.case_sensitive {
        flags.push("case");
    }
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join(","))
    };
    format!("{} {} \"{}\"{}", rule.field, rule.operator, rule.value, flags)
}

pub async fn cmd_rules_add(
    engine: &CategorizationEngine,
    db: &Database,
    org: OrganizationId,
    args: &RuleArgs,
) -> Result<Rule> {
    let rule = build_rule(db, org, args)?;
    let rule = engine
        .rules()
        .create_rule(&rule)
        .await
        .context("Failed to create rule")?;
    println!("✅ Created rule {}: {} → {}", rule.id, describe(&rule), args.category);
    Ok(rule)
}

pub async fn cmd_rules_delete(engine: &CategorizationEngine, id: i64) -> Result<()> {
    engine
        .rules()
        .delete_rule(id)
        .await
        .with_context(|| format!("Failed to delete rule {}", id))?;
    println!("✅ Deleted rule {}", id);
    Ok(())
}

pub async fn cmd_rules_test(
    engine: &CategorizationEngine,
    db: &Database,
    org: OrganizationId,
    args: &RuleArgs,
    limit: usize,
) -> Result<()> {
    let rule = build_rule(db, org, args)?;
    let report = engine.rules().test_rule(&rule, limit).await?;

    println!();
    println!("🧪 Rule Test: {} → {}", describe(&rule.draft()), args.category);
    println!("   ─────────────────────────────");
    println!("   Scanned:  {}", report.scanned);
    println!("   Matches:  {}", report.matches);
    println!("   Agreeing: {}", report.agreeing);
    match report.accuracy {
        Some(accuracy) => println!("   Accuracy: {:.0}%", accuracy * 100.0),
        None => println!("   Accuracy: n/a (no matches)"),
    }
    if !report.examples.is_empty() {
        println!();
        println!("   Example matches:");
        for id in &report.examples {
            println!("     {}", id);
        }
    }

    Ok(())
}
