//! Cost tracker, budget settings, cost ledger and alert operations

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{date_column, format_datetime, parse_datetime, uuid_column, Database};
use crate::error::Result;
use crate::models::{
    AlertSeverity, BudgetAlert, BudgetPeriod, BudgetSettings, CostTracker, OrganizationId,
};
use crate::repository::{AlertSink, CostRepository};

fn row_to_tracker(row: &Row) -> rusqlite::Result<CostTracker> {
    let updated_at: String = row.get(8)?;
    Ok(CostTracker {
        organization_id: uuid_column(row.get(0)?, 0)?,
        daily_budget: row.get(1)?,
        monthly_budget: row.get(2)?,
        current_spend: row.get(3)?,
        monthly_spend: row.get(4)?,
        transaction_count: row.get(5)?,
        avg_cost_per_transaction: row.get(6)?,
        period_day: date_column(row.get(7)?, 7)?,
        updated_at: parse_datetime(&updated_at),
    })
}

fn row_to_alert(row: &Row) -> rusqlite::Result<BudgetAlert> {
    let period: String = row.get(1)?;
    let severity: String = row.get(6)?;
    let created_at: String = row.get(8)?;
    Ok(BudgetAlert {
        organization_id: uuid_column(row.get(0)?, 0)?,
        period: period.parse().unwrap_or(BudgetPeriod::Daily),
        threshold: row.get(2)?,
        current_spend: row.get(3)?,
        budget_limit: row.get(4)?,
        percentage: row.get(5)?,
        severity: severity.parse().unwrap_or(AlertSeverity::Info),
        message: row.get(7)?,
        created_at: parse_datetime(&created_at),
    })
}

impl Database {
    pub fn get_tracker(&self, organization_id: OrganizationId) -> Result<Option<CostTracker>> {
        let conn = self.conn()?;
        let tracker = conn
            .query_row(
                r#"
                SELECT organization_id, daily_budget, monthly_budget, current_spend, monthly_spend,
                       transaction_count, avg_cost_per_transaction, period_day, updated_at
                FROM cost_trackers WHERE organization_id = ?
                "#,
                params![organization_id.to_string()],
                row_to_tracker,
            )
            .optional()?;
        Ok(tracker)
    }

    pub fn save_tracker(&self, tracker: &CostTracker) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO cost_trackers (
                organization_id, daily_budget, monthly_budget, current_spend, monthly_spend,
                transaction_count, avg_cost_per_transaction, period_day, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(organization_id) DO UPDATE SET
                daily_budget = excluded.daily_budget,
                monthly_budget = excluded.monthly_budget,
                current_spend = excluded.current_spend,
                monthly_spend = excluded.monthly_spend,
                transaction_count = excluded.transaction_count,
                avg_cost_per_transaction = excluded.avg_cost_per_transaction,
                period_day = excluded.period_day,
                updated_at = excluded.updated_at
            "#,
            params![
                tracker.organization_id.to_string(),
                tracker.daily_budget,
                tracker.monthly_budget,
                tracker.current_spend,
                tracker.monthly_spend,
                tracker.transaction_count,
                tracker.avg_cost_per_transaction,
                tracker.period_day.to_string(),
                format_datetime(&tracker.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_budget(&self, organization_id: OrganizationId) -> Result<Option<BudgetSettings>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT daily_budget, monthly_budget, alert_thresholds, enabled FROM budget_settings WHERE organization_id = ?",
                params![organization_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((daily_budget, monthly_budget, thresholds, enabled)) => {
                Ok(Some(BudgetSettings {
                    organization_id,
                    daily_budget,
                    monthly_budget,
                    alert_thresholds: serde_json::from_str(&thresholds)?,
                    enabled,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn save_budget(&self, settings: &BudgetSettings) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO budget_settings (organization_id, daily_budget, monthly_budget, alert_thresholds, enabled, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(organization_id) DO UPDATE SET
                daily_budget = excluded.daily_budget,
                monthly_budget = excluded.monthly_budget,
                alert_thresholds = excluded.alert_thresholds,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            "#,
            params![
                settings.organization_id.to_string(),
                settings.daily_budget,
                settings.monthly_budget,
                serde_json::to_string(&settings.alert_thresholds)?,
                settings.enabled,
                format_datetime(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn insert_cost_entry(
        &self,
        organization_id: OrganizationId,
        cost: f64,
        transaction_count: i64,
    ) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO cost_entries (organization_id, cost, transaction_count, day, created_at) VALUES (?, ?, ?, ?, ?)",
            params![
                organization_id.to_string(),
                cost,
                transaction_count,
                now.date_naive().to_string(),
                format_datetime(&now),
            ],
        )?;
        Ok(())
    }

    /// Ledger spend for days in [start, end]
    pub fn spend_between(
        &self,
        organization_id: OrganizationId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<f64> {
        let conn = self.conn()?;
        let spend: f64 = conn.query_row(
            "SELECT COALESCE(SUM(cost), 0.0) FROM cost_entries WHERE organization_id = ? AND day >= ? AND day <= ?",
            params![organization_id.to_string(), start.to_string(), end.to_string()],
            |row| row.get(0),
        )?;
        Ok(spend)
    }

    pub fn insert_budget_alert(&self, alert: &BudgetAlert) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO budget_alerts (
                organization_id, period, threshold, current_spend, budget_limit,
                percentage, severity, message, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                alert.organization_id.to_string(),
                alert.period.as_str(),
                alert.threshold,
                alert.current_spend,
                alert.budget_limit,
                alert.percentage,
                alert.severity.as_str(),
                alert.message,
                format_datetime(&alert.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Stored budget alerts, oldest first
    pub fn list_budget_alerts(&self, organization_id: OrganizationId) -> Result<Vec<BudgetAlert>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT organization_id, period, threshold, current_spend, budget_limit,
                   percentage, severity, message, created_at
            FROM budget_alerts WHERE organization_id = ? ORDER BY id
            "#,
        )?;
        let alerts = stmt
            .query_map(params![organization_id.to_string()], row_to_alert)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(alerts)
    }
}

#[async_trait]
impl CostRepository for Database {
    async fn get_cost_tracker(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Option<CostTracker>> {
        self.get_tracker(organization_id)
    }

    async fn update_cost_tracker(&self, tracker: &CostTracker) -> Result<()> {
        self.save_tracker(tracker)
    }

    async fn get_budget_settings(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Option<BudgetSettings>> {
        self.get_budget(organization_id)
    }

    async fn update_budget_settings(&self, settings: &BudgetSettings) -> Result<()> {
        self.save_budget(settings)
    }

    async fn record_cost_entry(
        &self,
        organization_id: OrganizationId,
        cost: f64,
        transaction_count: i64,
    ) -> Result<()> {
        self.insert_cost_entry(organization_id, cost, transaction_count)
    }

    async fn daily_spend(&self, organization_id: OrganizationId, day: NaiveDate) -> Result<f64> {
        self.spend_between(organization_id, day, day)
    }

    async fn monthly_spend(&self, organization_id: OrganizationId, day: NaiveDate) -> Result<f64> {
        let start = day.with_day(1).unwrap_or(day);
        self.spend_between(organization_id, start, day)
    }
}

#[async_trait]
impl AlertSink for Database {
    async fn send_budget_alert(
        &self,
        _organization_id: OrganizationId,
        alert: &BudgetAlert,
    ) -> Result<()> {
        self.insert_budget_alert(alert)?;
        Ok(())
    }
}
