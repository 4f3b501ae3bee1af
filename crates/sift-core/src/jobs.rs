//! Job payloads handed to the engine by an external queue
//!
//! The queue owns scheduling and retries; a job here is just "categorize this"
//! and its completion is the count the queue reports back.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{CancelFlag, CategorizationEngine};
use crate::error::Result;
use crate::models::{BatchRequest, OutcomeStatus, TransactionId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CategorizationJob {
    /// A transaction that was just recorded
    Realtime {
        transaction_id: TransactionId,
        #[serde(default)]
        force: bool,
    },
    /// Bulk or backfill work
    Batch {
        #[serde(flatten)]
        request: BatchRequest,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobCompletion {
    pub total: usize,
    pub categorized: usize,
    pub cost: f64,
    /// Transactions the queue may resubmit
    pub retryable_failures: usize,
}

impl CategorizationEngine {
    pub async fn run_job(&self, job: &CategorizationJob, cancel: &CancelFlag) -> Result<JobCompletion> {
        let completion = match job {
            CategorizationJob::Realtime { transaction_id, force } => {
                let outcome = self.categorize_one_outcome(*transaction_id, *force).await?;
                JobCompletion {
                    total: 1,
                    categorized: usize::from(persisted(outcome.status)),
                    cost: outcome.result.as_ref().map_or(0.0, |r| r.cost_estimate),
                    retryable_failures: usize::from(outcome.retryable),
                }
            }
            CategorizationJob::Batch { request } => {
                let summary = self.categorize_batch_with_cancel(request, cancel).await?;
                let categorized = summary.outcomes.iter().filter(|o| persisted(o.status)).count();
                JobCompletion {
                    total: summary.total,
                    categorized,
                    cost: summary.cost,
                    retryable_failures: summary.retryable(),
                }
            }
        };
        info!(
            total = completion.total,
            categorized = completion.categorized,
            cost = completion.cost,
            retryable_failures = completion.retryable_failures,
            "Job complete"
        );
        Ok(completion)
    }
}

fn persisted(status: OutcomeStatus) -> bool {
    matches!(status, OutcomeStatus::Categorized | OutcomeStatus::LowConfidence)
}
