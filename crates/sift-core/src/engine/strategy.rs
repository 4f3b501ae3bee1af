//! The shared capability of every deterministic categorization stage

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{CategorizationMethod, CategorizationResult, Transaction};

/// One stage of the categorization chain.
///
/// A stage that finds nothing returns a null-category result rather than an error;
/// errors are reserved for repository failures.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn method(&self) -> CategorizationMethod;

    async fn try_categorize(&self, transaction: &Transaction) -> Result<CategorizationResult>;
}
