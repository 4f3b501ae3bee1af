//! Deterministic user-defined rules
//!
//! Rules are evaluated in descending priority (oldest first on ties) and the first
//! satisfied rule wins. String fields support contains / equals / starts_with /
//! ends_with, or a regular expression when the rule's regex flag is set. Amount
//! supports greater_than / less_than / equals against the signed amount.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, warn};

use crate::engine::Strategy;
use crate::error::{Error, Result};
use crate::models::{
    CategorizationMethod, CategorizationResult, NewRule, OrganizationId, Rule, RuleField,
    RuleMatch, RuleOperator, Transaction, TransactionId,
};
use crate::repository::{RuleRepository, TransactionRepository};

/// Amounts closer than this compare equal
const AMOUNT_EPSILON: f64 = 0.005;
/// How far back `test_rule` looks
const TEST_LOOKBACK_DAYS: i64 = 365;
const TEST_EXAMPLES: usize = 5;

/// Dry-run report for a rule
#[derive(Debug, Clone, Serialize)]
pub struct RuleTestReport {
    pub scanned: usize,
    pub matches: usize,
    /// Matches already carrying the rule's category
    pub agreeing: usize,
    /// `agreeing / matches`, None without matches
    pub accuracy: Option<f64>,
    pub examples: Vec<TransactionId>,
}

fn field_text<'a>(transaction: &'a Transaction, field: RuleField) -> Option<&'a str> {
    match field {
        RuleField::Description => transaction.description.as_deref(),
        RuleField::Merchant => transaction.merchant_name.as_deref(),
        RuleField::Account => transaction.account_name.as_deref(),
        RuleField::Amount => None,
    }
}

fn build_regex(rule: &Rule) -> std::result::Result<Regex, regex::Error> {
    let pattern = match rule.operator {
        RuleOperator::Equals => format!("^(?:{})$", rule.value),
        RuleOperator::StartsWith => format!("^(?:{})", rule.value),
        RuleOperator::EndsWith => format!("(?:{})$", rule.value),
        _ => rule.value.clone(),
    };
    RegexBuilder::new(&pattern)
        .case_insensitive(!rule.case_sensitive)
        .build()
}

/// Whether `rule` is satisfied by `transaction`
pub fn rule_matches(rule: &Rule, transaction: &Transaction) -> Result<bool> {
    if rule.field == RuleField::Amount {
        let target: f64 = rule
            .value
            .trim()
            .parse()
            .map_err(|_| Error::InvalidRule(format!("'{}' is not a number", rule.value)))?;
        return Ok(match rule.operator {
            RuleOperator::GreaterThan => transaction.amount > target,
            RuleOperator::LessThan => transaction.amount < target,
            RuleOperator::Equals => (transaction.amount - target).abs() < AMOUNT_EPSILON,
            _ => false,
        });
    }

    let Some(text) = field_text(transaction, rule.field) else {
        return Ok(false);
    };

    if rule.is_regex {
        return Ok(build_regex(rule)?.is_match(text));
    }

    let (text, value) = if rule.case_sensitive {
        (text.to_string(), rule.value.clone())
    } else {
        (text.to_lowercase(), rule.value.to_lowercase())
    };
    Ok(match rule.operator {
        RuleOperator::Contains => text.contains(&value),
        RuleOperator::Equals => text == value,
        RuleOperator::StartsWith => text.starts_with(&value),
        RuleOperator::EndsWith => text.ends_with(&value),
        RuleOperator::GreaterThan | RuleOperator::LessThan => false,
    })
}

/// Reject rules that could never match or would fail at evaluation time
pub fn validate_rule(rule: &Rule) -> Result<()> {
    if rule.value.trim().is_empty() {
        return Err(Error::InvalidRule("value cannot be empty".to_string()));
    }
    if !(0.0..=1.0).contains(&rule.confidence) {
        return Err(Error::InvalidRule(format!(
            "confidence must be within [0, 1], got {}",
            rule.confidence
        )));
    }

    match rule.field {
        RuleField::Amount => {
            if !matches!(
                rule.operator,
                RuleOperator::GreaterThan | RuleOperator::LessThan | RuleOperator::Equals
            ) {
                return Err(Error::InvalidRule(format!(
                    "operator {} does not apply to amount",
                    rule.operator
                )));
            }
            if rule.value.trim().parse::<f64>().is_err() {
                return Err(Error::InvalidRule(format!("'{}' is not a number", rule.value)));
            }
        }
        field => {
            if rule.operator.is_numeric() {
                return Err(Error::InvalidRule(format!(
                    "operator {} only applies to amount, not {}",
                    rule.operator, field
                )));
            }
            if rule.is_regex {
                build_regex(rule)
                    .map_err(|e| Error::InvalidRule(format!("invalid regex: {}", e)))?;
            }
        }
    }
    Ok(())
}

pub struct RuleMatcher {
    rules: Arc<dyn RuleRepository>,
    transactions: Arc<dyn TransactionRepository>,
}

impl RuleMatcher {
    pub fn new(rules: Arc<dyn RuleRepository>, transactions: Arc<dyn TransactionRepository>) -> Self {
        Self {
            rules,
            transactions,
        }
    }

    /// Rules in evaluation order
    pub async fn list_rules(&self, organization_id: OrganizationId) -> Result<Vec<Rule>> {
        let mut rules = self.rules.list_rules(organization_id).await?;
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(rules)
    }

    pub async fn create_rule(&self, rule: &NewRule) -> Result<Rule> {
        validate_rule(&rule.draft())?;
        let created = self.rules.create_rule(rule).await?;
        debug!(organization_id = %created.organization_id, rule_id = created.id, "Rule created");
        Ok(created)
    }

    pub async fn update_rule(&self, rule: &Rule) -> Result<()> {
        validate_rule(rule)?;
        self.rules.update_rule(rule).await
    }

    pub async fn delete_rule(&self, id: i64) -> Result<()> {
        self.rules.delete_rule(id).await
    }

    /// Fold a feedback verdict into a rule's success rate
    pub async fn record_outcome(&self, rule_id: i64, success: bool) -> Result<()> {
        self.rules.update_usage(rule_id, success).await
    }

    /// First matching rule, if any, without side effects
    pub async fn find_match(&self, transaction: &Transaction) -> Result<Option<Rule>> {
        for rule in self.list_rules(transaction.organization_id).await? {
            match rule_matches(&rule, transaction) {
                Ok(true) => return Ok(Some(rule)),
                Ok(false) => {}
                Err(e) => warn!(rule_id = rule.id, error = %e, "Skipping unevaluable rule"),
            }
        }
        Ok(None)
    }

    /// Evaluate the organization's rules. Counts the winning rule's usage.
    pub async fn categorize(&self, transaction: &Transaction) -> Result<CategorizationResult> {
        let started = Instant::now();
        let Some(rule) = self.find_match(transaction).await? else {
            return Ok(CategorizationResult::no_match(CategorizationMethod::Rule, "no matching rules")
                .with_elapsed(started.elapsed()));
        };

        self.rules.increment_usage(rule.id).await?;
        debug!(
            transaction_id = %transaction.id,
            rule_id = rule.id,
            category_id = rule.category_id,
            "Rule matched"
        );

        let mut result = CategorizationResult::new(
            rule.category_id,
            rule.confidence,
            CategorizationMethod::Rule,
            format!("matched rule {}: {} {} \"{}\"", rule.id, rule.field, rule.operator, rule.value),
        );
        result.rule_matches.push(RuleMatch {
            rule_id: rule.id,
            category_id: rule.category_id,
            field: rule.field,
            operator: rule.operator,
            value: rule.value.clone(),
            confidence: rule.confidence,
            priority: rule.priority,
        });
        Ok(result.with_elapsed(started.elapsed()))
    }

    /// Dry-run a rule against recently categorized transactions
    pub async fn test_rule(&self, rule: &NewRule, limit: usize) -> Result<RuleTestReport> {
        let draft = rule.draft();
        validate_rule(&draft)?;

        let since = Utc::now().date_naive() - ChronoDuration::days(TEST_LOOKBACK_DAYS);
        let recent = self
            .transactions
            .get_recently_categorized(rule.organization_id, since, limit)
            .await?;

        let mut report = RuleTestReport {
            scanned: recent.len(),
            matches: 0,
            agreeing: 0,
            accuracy: None,
            examples: Vec::new(),
        };
        for tx in &recent {
            if !rule_matches(&draft, tx)? {
                continue;
            }
            report.matches += 1;
            if tx.category_id == Some(draft.category_id) {
                report.agreeing += 1;
            }
            if report.examples.len() < TEST_EXAMPLES {
                report.examples.push(tx.id);
            }
        }
        if report.matches > 0 {
            report.accuracy = Some(report.agreeing as f64 / report.matches as f64);
        }
        Ok(report)
    }
}

#[async_trait]
impl Strategy for RuleMatcher {
    fn method(&self) -> CategorizationMethod {
        CategorizationMethod::Rule
    }

    async fn try_categorize(&self, transaction: &Transaction) -> Result<CategorizationResult> {
        self.categorize(transaction).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{CategorizationMetadata, NewTransaction};
    use uuid::Uuid;

    fn setup() -> (Database, RuleMatcher, OrganizationId) {
        let db = Database::in_memory().unwrap();
        let matcher = RuleMatcher::new(Arc::new(db.clone()), Arc::new(db.clone()));
        (db, matcher, Uuid::new_v4())
    }

    fn insert(db: &Database, org: OrganizationId, merchant: &str, amount: f64) -> Transaction {
        db.insert_transaction(&NewTransaction {
            organization_id: org,
            account_name: Some("Checking".to_string()),
            amount,
            merchant_name: Some(merchant.to_string()),
            description: Some(format!("POS PURCHASE {}", merchant)),
            date: Utc::now().date_naive(),
        })
        .unwrap()
    }

    fn tx(merchant: &str, amount: f64) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            organization_id: Uuid::nil(),
            account_name: Some("Checking".to_string()),
            amount,
            merchant_name: Some(merchant.to_string()),
            description: None,
            date: Utc::now().date_naive(),
            category_id: None,
            metadata: None,
        }
    }

    fn rule(field: RuleField, operator: RuleOperator, value: &str) -> Rule {
        NewRule::new(Uuid::nil(), 1, field, operator, value).draft()
    }

    #[test]
    fn test_string_operators() {
        let t = tx("Starbucks Coffee", -4.5);
        assert!(rule_matches(&rule(RuleField::Merchant, RuleOperator::Contains, "STARBUCKS"), &t).unwrap());
        assert!(rule_matches(&rule(RuleField::Merchant, RuleOperator::StartsWith, "star"), &t).unwrap());
        assert!(rule_matches(&rule(RuleField::Merchant, RuleOperator::EndsWith, "coffee"), &t).unwrap());
        assert!(!rule_matches(&rule(RuleField::Merchant, RuleOperator::Equals, "starbucks"), &t).unwrap());
        // missing field never matches
        assert!(!rule_matches(&rule(RuleField::Description, RuleOperator::Contains, "x"), &t).unwrap());
    }

    #[test]
    fn test_case_sensitivity() {
        let t = tx("Starbucks", -4.5);
        let mut r = rule(RuleField::Merchant, RuleOperator::Equals, "STARBUCKS");
        assert!(rule_matches(&r, &t).unwrap());
        r.case_sensitive = true;
        assert!(!rule_matches(&r, &t).unwrap());
    }

    #[test]
    fn test_regex_rules() {
        let t = tx("NETFLIX.COM/BILL", -15.49);
        let mut r = rule(RuleField::Merchant, RuleOperator::Contains, r"netflix\.com");
        r.is_regex = true;
        assert!(rule_matches(&r, &t).unwrap());

        let mut anchored = rule(RuleField::Merchant, RuleOperator::StartsWith, "HULU|NETFLIX");
        anchored.is_regex = true;
        assert!(rule_matches(&anchored, &t).unwrap());
        anchored.operator = RuleOperator::Equals;
        assert!(!rule_matches(&anchored, &t).unwrap());
    }

    #[test]
    fn test_amount_rules() {
        let t = tx("RENT", -1500.0);
        assert!(rule_matches(&rule(RuleField::Amount, RuleOperator::LessThan, "-1000"), &t).unwrap());
        assert!(!rule_matches(&rule(RuleField::Amount, RuleOperator::GreaterThan, "0"), &t).unwrap());
        assert!(rule_matches(&rule(RuleField::Amount, RuleOperator::Equals, "-1500.00"), &t).unwrap());
    }

    #[test]
    fn test_validation() {
        let invalid = [
            rule(RuleField::Merchant, RuleOperator::Contains, "  "),
            rule(RuleField::Merchant, RuleOperator::GreaterThan, "10"),
            rule(RuleField::Amount, RuleOperator::Contains, "10"),
            rule(RuleField::Amount, RuleOperator::LessThan, "ten"),
            {
                let mut r = rule(RuleField::Description, RuleOperator::Contains, "(unclosed");
                r.is_regex = true;
                r
            },
            {
                let mut r = rule(RuleField::Merchant, RuleOperator::Contains, "ok");
                r.confidence = 1.5;
                r
            },
        ];
        for r in &invalid {
            assert!(matches!(validate_rule(r), Err(Error::InvalidRule(_))), "{r:?}");
        }
        validate_rule(&rule(RuleField::Amount, RuleOperator::GreaterThan, "100")).unwrap();
    }

    #[tokio::test]
    async fn test_priority_wins_and_usage_counts() {
        let (db, matcher, org) = setup();
        let coffee = db.create_category(org, "Coffee", None).unwrap();
        let food = db.create_category(org, "Food & Dining", None).unwrap();

        let low = matcher
            .create_rule(&NewRule::new(org, food.id, RuleField::Merchant, RuleOperator::Contains, "STARBUCKS").with_priority(1))
            .await
            .unwrap();
        let high = matcher
            .create_rule(
                &NewRule::new(org, coffee.id, RuleField::Merchant, RuleOperator::Contains, "starbucks")
                    .with_priority(10)
                    .with_confidence(0.95),
            )
            .await
            .unwrap();

        let t = insert(&db, org, "STARBUCKS #4521", -5.75);
        let result = matcher.categorize(&t).await.unwrap();
        assert_eq!(result.category_id, Some(coffee.id));
        assert_eq!(result.confidence, 0.95);
        assert_eq!(result.method, CategorizationMethod::Rule);
        assert_eq!(result.rule_matches[0].rule_id, high.id);

        assert_eq!(db.get_rule(high.id).unwrap().usage_count, 1);
        assert_eq!(db.get_rule(low.id).unwrap().usage_count, 0);
    }

    #[tokio::test]
    async fn test_no_match_result() {
        let (db, matcher, org) = setup();
        let t = insert(&db, org, "UNKNOWN VENDOR", -1.0);
        let result = matcher.categorize(&t).await.unwrap();
        assert_eq!(result.category_id, None);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.explanation, "no matching rules");
    }

    #[tokio::test]
    async fn test_rules_are_org_scoped() {
        let (db, matcher, org) = setup();
        let other = Uuid::new_v4();
        let cat = db.create_category(other, "Coffee", None).unwrap();
        matcher
            .create_rule(&NewRule::new(other, cat.id, RuleField::Merchant, RuleOperator::Contains, "STARBUCKS"))
            .await
            .unwrap();
        let t = insert(&db, org, "STARBUCKS", -3.0);
        assert!(matcher.categorize(&t).await.unwrap().category_id.is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_rule() {
        let (_db, matcher, org) = setup();
        let bad = NewRule::new(org, 1, RuleField::Amount, RuleOperator::StartsWith, "12");
        assert!(matches!(matcher.create_rule(&bad).await, Err(Error::InvalidRule(_))));
        assert!(matcher.list_rules(org).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_reports_accuracy() {
        let (db, matcher, org) = setup();
        let groceries = db.create_category(org, "Groceries", None).unwrap();
        let shopping = db.create_category(org, "Shopping", None).unwrap();

        for (merchant, category) in [
            ("WHOLE FOODS MARKET", groceries.id),
            ("WHOLE FOODS #12", groceries.id),
            ("WHOLE FOODS GIFT CARD", shopping.id),
            ("TARGET", shopping.id),
        ] {
            let t = insert(&db, org, merchant, -20.0);
            db.set_transaction_category(t.id, category, &CategorizationMetadata::default())
                .unwrap();
        }
        // uncategorized transactions are not scanned
        insert(&db, org, "WHOLE FOODS", -5.0);

        let rule = NewRule::new(org, groceries.id, RuleField::Merchant, RuleOperator::StartsWith, "whole foods");
        let report = matcher.test_rule(&rule, 100).await.unwrap();
        assert_eq!(report.scanned, 4);
        assert_eq!(report.matches, 3);
        assert_eq!(report.agreeing, 2);
        assert!((report.accuracy.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.examples.len(), 3);
    }
}
