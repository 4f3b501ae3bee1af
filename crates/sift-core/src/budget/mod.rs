//! LLM cost governance
//!
//! `CostGovernor::check_budget` gates every LLM sub-batch and `record_cost` books
//! the actual spend once per completed batch. Both are serialized per organization.
//! A successful check returns a [`BudgetReservation`]: until it is dropped, its
//! amount counts against the budget for every other check, so two concurrent
//! batches cannot both pass a check only one of them can afford.

mod optimizer;
mod rate_limit;

pub use optimizer::{optimization_strategies, OptimizationStrategy, Priority};
pub use rate_limit::{RateLimiter, RateSlot};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::BudgetConfig;
use crate::error::{Error, Result};
use crate::models::{
    AlertSeverity, BudgetAlert, BudgetPeriod, BudgetSettings, CostTracker, OrganizationId,
};
use crate::repository::{AlertSink, CostRepository};

/// Float slack for budget comparisons
const EPSILON: f64 = 1e-9;

type Reservations = Arc<Mutex<HashMap<OrganizationId, f64>>>;

/// Estimated spend held against an organization's budget
#[derive(Debug)]
pub struct BudgetReservation {
    organization_id: OrganizationId,
    amount: f64,
    reservations: Reservations,
}

impl BudgetReservation {
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Hold `actual_cost` instead of the estimate once the call has finished
    pub fn settle(&mut self, actual_cost: f64) {
        let actual = actual_cost.max(0.0);
        let mut reservations = self.reservations.lock().unwrap_or_else(|e| e.into_inner());
        *reservations.entry(self.organization_id).or_insert(0.0) += actual - self.amount;
        self.amount = actual;
    }
}

impl Drop for BudgetReservation {
    fn drop(&mut self) {
        let mut reservations = self.reservations.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(reserved) = reservations.get_mut(&self.organization_id) {
            *reserved -= self.amount;
            if *reserved <= EPSILON {
                reservations.remove(&self.organization_id);
            }
        }
    }
}

pub struct CostGovernor {
    repo: Arc<dyn CostRepository>,
    alerts: Arc<dyn AlertSink>,
    defaults: BudgetConfig,
    locks: Mutex<HashMap<OrganizationId, Arc<tokio::sync::Mutex<()>>>>,
    reservations: Reservations,
}

impl CostGovernor {
    pub fn new(repo: Arc<dyn CostRepository>, alerts: Arc<dyn AlertSink>, defaults: BudgetConfig) -> Self {
        Self {
            repo,
            alerts,
            defaults,
            locks: Mutex::new(HashMap::new()),
            reservations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn org_lock(&self, organization_id: OrganizationId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(organization_id).or_default())
    }

    fn reserved(&self, organization_id: OrganizationId) -> f64 {
        let reservations = self.reservations.lock().unwrap_or_else(|e| e.into_inner());
        reservations.get(&organization_id).copied().unwrap_or(0.0)
    }

    fn reserve(&self, organization_id: OrganizationId, amount: f64) -> BudgetReservation {
        let mut reservations = self.reservations.lock().unwrap_or_else(|e| e.into_inner());
        *reservations.entry(organization_id).or_insert(0.0) += amount;
        BudgetReservation {
            organization_id,
            amount,
            reservations: Arc::clone(&self.reservations),
        }
    }

    /// Stored settings, or the configured defaults
    pub async fn settings(&self, organization_id: OrganizationId) -> Result<BudgetSettings> {
        Ok(self
            .repo
            .get_budget_settings(organization_id)
            .await?
            .unwrap_or_else(|| BudgetSettings {
                organization_id,
                daily_budget: self.defaults.daily,
                monthly_budget: self.defaults.monthly,
                alert_thresholds: self.defaults.alert_thresholds.clone(),
                enabled: self.defaults.enabled,
            }))
    }

    /// Current tracker with budgets from `settings`, rolled over to today.
    /// Organizations without one start from the cost ledger.
    async fn load_tracker(&self, settings: &BudgetSettings) -> Result<CostTracker> {
        let organization_id = settings.organization_id;
        let today = Utc::now().date_naive();
        let mut tracker = match self.repo.get_cost_tracker(organization_id).await? {
            Some(mut tracker) => {
                if tracker.roll_over(today) {
                    debug!(organization_id = %organization_id, "Cost tracker rolled over");
                }
                tracker
            }
            None => {
                let mut tracker = CostTracker::new(
                    organization_id,
                    settings.daily_budget,
                    settings.monthly_budget,
                    today,
                );
                tracker.current_spend = self.repo.daily_spend(organization_id, today).await?;
                tracker.monthly_spend = self.repo.monthly_spend(organization_id, today).await?;
                tracker
            }
        };
        tracker.daily_budget = settings.daily_budget;
        tracker.monthly_budget = settings.monthly_budget;
        Ok(tracker)
    }

    /// Gate an LLM call costing about `estimated_cost`.
    ///
    /// Fails with `InsufficientBudget` naming the first period (daily, then monthly)
    /// whose spend plus outstanding reservations plus the estimate would pass its
    /// limit. A limit of zero is unlimited.
    pub async fn check_budget(
        &self,
        organization_id: OrganizationId,
        estimated_cost: f64,
    ) -> Result<BudgetReservation> {
        let lock = self.org_lock(organization_id);
        let _guard = lock.lock().await;

        let estimated = estimated_cost.max(0.0);
        let settings = self.settings(organization_id).await?;
        if !settings.enabled {
            return Ok(self.reserve(organization_id, estimated));
        }

        let tracker = self.load_tracker(&settings).await?;
        let reserved = self.reserved(organization_id);
        for (period, spent) in [
            (BudgetPeriod::Daily, tracker.current_spend),
            (BudgetPeriod::Monthly, tracker.monthly_spend),
        ] {
            let limit = settings.limit(period);
            let current = spent + reserved;
            if limit > 0.0 && current + estimated > limit + EPSILON {
                debug!(
                    organization_id = %organization_id,
                    period = %period,
                    current,
                    estimated,
                    limit,
                    "Budget check failed"
                );
                return Err(Error::InsufficientBudget {
                    period,
                    current,
                    estimated,
                    limit,
                });
            }
        }

        Ok(self.reserve(organization_id, estimated))
    }

    /// Book the actual cost of a completed batch and fire threshold alerts.
    /// Returns the alerts that fired.
    pub async fn record_cost(
        &self,
        organization_id: OrganizationId,
        actual_cost: f64,
        transaction_count: i64,
    ) -> Result<Vec<BudgetAlert>> {
        let lock = self.org_lock(organization_id);
        let _guard = lock.lock().await;

        let settings = self.settings(organization_id).await?;
        let mut tracker = self.load_tracker(&settings).await?;
        let before = (tracker.current_spend, tracker.monthly_spend);

        self.repo
            .record_cost_entry(organization_id, actual_cost, transaction_count)
            .await?;
        tracker.record(actual_cost, transaction_count);
        self.repo.update_cost_tracker(&tracker).await?;

        info!(
            organization_id = %organization_id,
            cost = actual_cost,
            transactions = transaction_count,
            daily_spend = tracker.current_spend,
            monthly_spend = tracker.monthly_spend,
            "Recorded LLM cost"
        );

        if !settings.enabled {
            return Ok(Vec::new());
        }
        let alerts = crossed_alerts(
            &settings,
            before,
            (tracker.current_spend, tracker.monthly_spend),
        );
        for alert in &alerts {
            if let Err(e) = self.alerts.send_budget_alert(organization_id, alert).await {
                warn!(organization_id = %organization_id, error = %e, "Failed to deliver budget alert");
            }
        }
        Ok(alerts)
    }

    /// Change an organization's budgets
    pub async fn update_budget(
        &self,
        organization_id: OrganizationId,
        daily_budget: f64,
        monthly_budget: f64,
    ) -> Result<BudgetSettings> {
        if daily_budget < 0.0 || monthly_budget < 0.0 {
            return Err(Error::InvalidData("budgets cannot be negative".to_string()));
        }
        let lock = self.org_lock(organization_id);
        let _guard = lock.lock().await;

        let mut settings = self.settings(organization_id).await?;
        settings.daily_budget = daily_budget;
        settings.monthly_budget = monthly_budget;
        self.repo.update_budget_settings(&settings).await?;

        if self.repo.get_cost_tracker(organization_id).await?.is_some() {
            let tracker = self.load_tracker(&settings).await?;
            self.repo.update_cost_tracker(&tracker).await?;
        }
        info!(organization_id = %organization_id, daily_budget, monthly_budget, "Budget updated");
        Ok(settings)
    }

    /// Current spend for an organization
    pub async fn cost_tracker(&self, organization_id: OrganizationId) -> Result<CostTracker> {
        let settings = self.settings(organization_id).await?;
        self.load_tracker(&settings).await
    }
}

/// Alerts for every threshold crossed between `before` and `after`
/// ((daily, monthly) spend), ascending within each period, daily first.
pub fn crossed_alerts(
    settings: &BudgetSettings,
    before: (f64, f64),
    after: (f64, f64),
) -> Vec<BudgetAlert> {
    let mut thresholds = settings.alert_thresholds.clone();
    thresholds.sort_by(f64::total_cmp);

    let mut alerts = Vec::new();
    for (period, spent_before, spent_after) in [
        (BudgetPeriod::Daily, before.0, after.0),
        (BudgetPeriod::Monthly, before.1, after.1),
    ] {
        let limit = settings.limit(period);
        if limit <= 0.0 {
            continue;
        }
        let (was, now) = (spent_before / limit, spent_after / limit);
        for &threshold in &thresholds {
            if was < threshold && now + EPSILON >= threshold {
                let severity = AlertSeverity::from_percentage(now);
                alerts.push(BudgetAlert {
                    organization_id: settings.organization_id,
                    period,
                    threshold,
                    current_spend: spent_after,
                    budget_limit: limit,
                    percentage: now,
                    severity,
                    message: format!(
                        "{} LLM spend is at {:.0}% of the ${:.2} budget (crossed {:.0}%)",
                        period,
                        now * 100.0,
                        limit,
                        threshold * 100.0
                    ),
                    created_at: Utc::now(),
                });
            }
        }
    }
    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::repository::LogAlertSink;
    use uuid::Uuid;

    fn governor(db: &Database) -> CostGovernor {
        CostGovernor::new(Arc::new(db.clone()), Arc::new(db.clone()), BudgetConfig::default())
    }

    fn settings(daily: f64, monthly: f64) -> BudgetSettings {
        BudgetSettings {
            organization_id: Uuid::nil(),
            daily_budget: daily,
            monthly_budget: monthly,
            alert_thresholds: vec![0.95, 0.5, 0.8],
            enabled: true,
        }
    }

    #[test]
    fn test_crossed_alerts_ascending_daily_first() {
        let alerts = crossed_alerts(&settings(1.0, 10.0), (0.4, 4.0), (0.96, 5.0));
        let fired: Vec<_> = alerts.iter().map(|a| (a.period, a.threshold)).collect();
        assert_eq!(
            fired,
            vec![
                (BudgetPeriod::Daily, 0.5),
                (BudgetPeriod::Daily, 0.8),
                (BudgetPeriod::Daily, 0.95),
                (BudgetPeriod::Monthly, 0.5),
            ]
        );
        assert!(alerts[..3].iter().all(|a| a.severity == AlertSeverity::Critical));
        assert_eq!(alerts[3].severity, AlertSeverity::Info);
    }

    #[test]
    fn test_no_alert_without_crossing() {
        assert!(crossed_alerts(&settings(1.0, 0.0), (0.6, 0.6), (0.7, 0.7)).is_empty());
    }

    #[tokio::test]
    async fn test_check_budget_names_the_period() {
        let db = Database::in_memory().unwrap();
        let governor = governor(&db);
        let org = Uuid::new_v4();
        governor.update_budget(org, 1.0, 100.0).await.unwrap();
        governor.record_cost(org, 0.9, 10).await.unwrap();

        governor.check_budget(org, 0.1).await.unwrap();
        match governor.check_budget(org, 0.2).await.unwrap_err() {
            Error::InsufficientBudget { period, limit, .. } => {
                assert_eq!(period, BudgetPeriod::Daily);
                assert_eq!(limit, 1.0);
            }
            other => panic!("unexpected {other:?}"),
        }

        governor.update_budget(org, 0.0, 0.5).await.unwrap();
        match governor.check_budget(org, 0.01).await.unwrap_err() {
            Error::InsufficientBudget { period, .. } => assert_eq!(period, BudgetPeriod::Monthly),
            other => panic!("unexpected {other:?}"),
        }

        // zero means unlimited
        governor.update_budget(org, 0.0, 0.0).await.unwrap();
        governor.check_budget(org, 1000.0).await.unwrap();
    }

    #[tokio::test]
    async fn test_reservations_gate_concurrent_checks() {
        let db = Database::in_memory().unwrap();
        let governor = governor(&db);
        let org = Uuid::new_v4();
        governor.update_budget(org, 1.0, 0.0).await.unwrap();

        let first = governor.check_budget(org, 0.6).await.unwrap();
        assert_eq!(first.amount(), 0.6);
        assert!(governor.check_budget(org, 0.6).await.is_err());

        drop(first);
        let second = governor.check_budget(org, 0.6).await.unwrap();
        drop(second);
        assert_eq!(governor.reserved(org), 0.0);
    }

    #[tokio::test]
    async fn test_settled_reservation_holds_actual_cost() {
        let db = Database::in_memory().unwrap();
        let governor = governor(&db);
        let org = Uuid::new_v4();
        governor.update_budget(org, 1.0, 0.0).await.unwrap();

        let mut first = governor.check_budget(org, 0.2).await.unwrap();
        // the call cost more than estimated
        first.settle(0.7);
        assert_eq!(first.amount(), 0.7);
        assert!((governor.reserved(org) - 0.7).abs() < 1e-9);
        assert!(governor.check_budget(org, 0.4).await.is_err());
        assert!(governor.check_budget(org, 0.3).await.is_ok());

        drop(first);
        assert!(governor.reserved(org) < 1e-9);
    }

    #[tokio::test]
    async fn test_record_cost_updates_tracker_and_stores_alerts() {
        let db = Database::in_memory().unwrap();
        let governor = governor(&db);
        let org = Uuid::new_v4();
        governor.update_budget(org, 1.0, 100.0).await.unwrap();

        let alerts = governor.record_cost(org, 0.85, 40).await.unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[1].severity, AlertSeverity::Warning);
        assert_eq!(db.list_budget_alerts(org).unwrap().len(), 2);

        // crossing no new threshold fires nothing
        assert!(governor.record_cost(org, 0.01, 1).await.unwrap().is_empty());

        let tracker = governor.cost_tracker(org).await.unwrap();
        assert!((tracker.current_spend - 0.86).abs() < 1e-9);
        assert_eq!(tracker.transaction_count, 41);
        assert!((tracker.avg_cost_per_transaction - 0.86 / 41.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_defaults_apply_without_settings() {
        let db = Database::in_memory().unwrap();
        let governor = CostGovernor::new(
            Arc::new(db.clone()),
            Arc::new(LogAlertSink),
            BudgetConfig {
                daily: 0.5,
                ..BudgetConfig::default()
            },
        );
        let org = Uuid::new_v4();
        let settings = governor.settings(org).await.unwrap();
        assert_eq!(settings.daily_budget, 0.5);
        assert!(governor.check_budget(org, 0.6).await.is_err());
    }

    #[tokio::test]
    async fn test_disabled_budget_never_blocks() {
        let db = Database::in_memory().unwrap();
        let governor = CostGovernor::new(
            Arc::new(db.clone()),
            Arc::new(LogAlertSink),
            BudgetConfig {
                enabled: false,
                daily: 0.01,
                ..BudgetConfig::default()
            },
        );
        let org = Uuid::new_v4();
        governor.check_budget(org, 5.0).await.unwrap();
        assert!(governor.record_cost(org, 5.0, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_negative_budget_rejected() {
        let db = Database::in_memory().unwrap();
        let governor = governor(&db);
        assert!(matches!(
            governor.update_budget(Uuid::new_v4(), -1.0, 10.0).await,
            Err(Error::InvalidData(_))
        ));
    }
}
