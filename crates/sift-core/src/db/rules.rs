//! Categorization rule operations

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Row};

use super::{format_datetime, parse_datetime, uuid_column, Database};
use crate::error::{Error, Result};
use crate::models::{NewRule, OrganizationId, Rule, RuleField, RuleOperator};
use crate::repository::RuleRepository;

/// Weight of the newest feedback in a rule's rolling success rate
pub const SUCCESS_RATE_ALPHA: f64 = 0.1;

const RULE_COLUMNS: &str = "id, organization_id, category_id, field, operator, value, \
                            case_sensitive, is_regex, confidence, priority, usage_count, \
                            success_rate, created_at, last_used_at";

fn row_to_rule(row: &Row) -> rusqlite::Result<Rule> {
    let field: String = row.get(3)?;
    let operator: String = row.get(4)?;
    let created_at: String = row.get(12)?;
    let last_used_at: Option<String> = row.get(13)?;

    Ok(Rule {
        id: row.get(0)?,
        organization_id: uuid_column(row.get(1)?, 1)?,
        category_id: row.get(2)?,
        field: field.parse().unwrap_or(RuleField::Description),
        operator: operator.parse().unwrap_or(RuleOperator::Contains),
        value: row.get(5)?,
        case_sensitive: row.get(6)?,
        is_regex: row.get(7)?,
        confidence: row.get(8)?,
        priority: row.get(9)?,
        usage_count: row.get(10)?,
        success_rate: row.get(11)?,
        created_at: parse_datetime(&created_at),
        last_used_at: last_used_at.map(|s| parse_datetime(&s)),
    })
}

impl Database {
    /// Rules for an organization in evaluation order (priority desc, then oldest first)
    pub fn get_rules(&self, organization_id: OrganizationId) -> Result<Vec<Rule>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM categorization_rules WHERE organization_id = ? ORDER BY priority DESC, id ASC",
            RULE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rules = stmt
            .query_map(params![organization_id.to_string()], row_to_rule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }

    pub fn get_rule(&self, id: i64) -> Result<Rule> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM categorization_rules WHERE id = ?", RULE_COLUMNS);
        conn.query_row(&sql, params![id], row_to_rule)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("rule {}", id)),
                other => other.into(),
            })
    }

    pub fn insert_rule(&self, rule: &NewRule) -> Result<Rule> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO categorization_rules (
                organization_id, category_id, field, operator, value,
                case_sensitive, is_regex, confidence, priority, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                rule.organization_id.to_string(),
                rule.category_id,
                rule.field.as_str(),
                rule.operator.as_str(),
                rule.value,
                rule.case_sensitive,
                rule.is_regex,
                rule.confidence,
                rule.priority,
                format_datetime(&Utc::now()),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_rule(id)
    }

    pub fn save_rule(&self, rule: &Rule) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE categorization_rules
            SET category_id = ?, field = ?, operator = ?, value = ?, case_sensitive = ?,
                is_regex = ?, confidence = ?, priority = ?
            WHERE id = ? AND organization_id = ?
            "#,
            params![
                rule.category_id,
                rule.field.as_str(),
                rule.operator.as_str(),
                rule.value,
                rule.case_sensitive,
                rule.is_regex,
                rule.confidence,
                rule.priority,
                rule.id,
                rule.organization_id.to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("rule {}", rule.id)));
        }
        Ok(())
    }

    pub fn remove_rule(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM categorization_rules WHERE id = ?", params![id])?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("rule {}", id)));
        }
        Ok(())
    }

    pub fn bump_rule_usage(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE categorization_rules SET usage_count = usage_count + 1, last_used_at = ? WHERE id = ?",
            params![format_datetime(&Utc::now()), id],
        )?;
        Ok(())
    }

    pub fn record_rule_outcome(&self, id: i64, success: bool) -> Result<()> {
        let conn = self.conn()?;
        let observed = if success { 1.0 } else { 0.0 };
        conn.execute(
            "UPDATE categorization_rules SET success_rate = success_rate * (1.0 - ?1) + ?1 * ?2 WHERE id = ?3",
            params![SUCCESS_RATE_ALPHA, observed, id],
        )?;
        Ok(())
    }
}

#[async_trait]
impl RuleRepository for Database {
    async fn list_rules(&self, organization_id: OrganizationId) -> Result<Vec<Rule>> {
        self.get_rules(organization_id)
    }

    async fn create_rule(&self, rule: &NewRule) -> Result<Rule> {
        self.insert_rule(rule)
    }

    async fn update_rule(&self, rule: &Rule) -> Result<()> {
        self.save_rule(rule)
    }

    async fn delete_rule(&self, id: i64) -> Result<()> {
        self.remove_rule(id)
    }

    async fn increment_usage(&self, id: i64) -> Result<()> {
        self.bump_rule_usage(id)
    }

    async fn update_usage(&self, id: i64, success: bool) -> Result<()> {
        self.record_rule_outcome(id, success)
    }
}
