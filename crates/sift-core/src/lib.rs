//! Sift Core Library
//!
//! Transaction categorization engine:
//! - Rule matcher, pattern cache and similarity retriever (deterministic stages)
//! - Batch LLM classifier with sub-batch planning
//! - Cost governor: budgets, reservations, alerts and rate limiting
//! - Feedback learning and analysis
//! - SQLite implementation of every repository interface

pub mod budget;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod jobs;
pub mod llm;
pub mod models;
pub mod patterns;
pub mod repository;
pub mod rules;
pub mod similarity;
pub mod worker;

/// Test utilities including a mock OpenAI-compatible server
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use budget::{BudgetReservation, CostGovernor, RateLimiter};
pub use config::EngineConfig;
pub use db::Database;
pub use engine::{CancelFlag, CategorizationEngine, Repositories, Strategy};
pub use error::{Error, Result};
pub use feedback::{FeedbackAnalysis, FeedbackLearner};
pub use jobs::{CategorizationJob, JobCompletion};
pub use llm::{BatchClassifier, LlmClient, LlmProvider, MockLlmClient, OpenAICompatibleClient};
pub use patterns::PatternCache;
pub use rules::{RuleMatcher, RuleTestReport};
pub use similarity::{EmbeddingProvider, HashingEmbedder, SimilarityRetriever};
