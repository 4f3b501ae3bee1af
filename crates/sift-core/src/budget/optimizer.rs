//! Cost reduction recommendations

use serde::{Deserialize, Serialize};

use crate::models::CostTracker;

/// Average cost per transaction above which rule coverage is worth improving
const HIGH_AVG_COST: f64 = 0.002;
/// Monthly volume above which batch sizing matters
const HIGH_VOLUME: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationStrategy {
    pub name: String,
    pub description: String,
    /// Estimated monthly savings in USD
    pub potential_savings: f64,
    pub priority: Priority,
    pub implementation: String,
}

fn strategy(
    name: &str,
    description: &str,
    savings_share: f64,
    monthly_spend: f64,
    priority: Priority,
    implementation: &str,
) -> OptimizationStrategy {
    OptimizationStrategy {
        name: name.to_string(),
        description: description.to_string(),
        potential_savings: monthly_spend * savings_share,
        priority,
        implementation: implementation.to_string(),
    }
}

/// Recommendations for an organization's current month of spend
pub fn optimization_strategies(tracker: &CostTracker) -> Vec<OptimizationStrategy> {
    let monthly = tracker.monthly_spend;
    let mut strategies = Vec::new();

    if tracker.avg_cost_per_transaction > HIGH_AVG_COST {
        strategies.push(strategy(
            "Improve Rule Coverage",
            "Many transactions reach the LLM; rules for recurring merchants would catch them first",
            0.30,
            monthly,
            Priority::High,
            "Review frequent LLM-categorized merchants and add rules for them",
        ));
    }

    strategies.push(strategy(
        "Enhanced Pattern Learning",
        "Confirm or correct categorizations so the pattern cache answers more merchants",
        0.20,
        monthly,
        Priority::Medium,
        "Record feedback on low-confidence results",
    ));

    if tracker.transaction_count > HIGH_VOLUME {
        strategies.push(strategy(
            "Optimize Batch Sizes",
            "Larger sub-batches spread the prompt overhead over more transactions",
            0.15,
            monthly,
            Priority::Medium,
            "Raise batch.max_size toward the model's context limit",
        ));
    }

    strategies.push(strategy(
        "Model Selection Optimization",
        "A cheaper model may keep accuracy acceptable for routine merchants",
        0.25,
        monthly,
        Priority::High,
        "Set llm.model_strategy = \"cost_optimized\"",
    ));

    strategies
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_low_volume_cheap_org() {
        let mut tracker = CostTracker::new(Uuid::new_v4(), 5.0, 50.0, Utc::now().date_naive());
        tracker.record(0.10, 100);
        let names: Vec<_> = optimization_strategies(&tracker)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["Enhanced Pattern Learning", "Model Selection Optimization"]);
    }

    #[test]
    fn test_expensive_high_volume_org() {
        let mut tracker = CostTracker::new(Uuid::new_v4(), 5.0, 50.0, Utc::now().date_naive());
        tracker.record(10.0, 2000);
        let strategies = optimization_strategies(&tracker);
        assert_eq!(strategies.len(), 4);
        assert_eq!(strategies[0].name, "Improve Rule Coverage");
        assert_eq!(strategies[0].priority, Priority::High);
        assert!((strategies[0].potential_savings - 3.0).abs() < 1e-9);
        assert!(strategies.iter().any(|s| s.name == "Optimize Batch Sizes"));
    }
}
