//! Engine configuration
//!
//! Config is loaded with a two-layer resolution:
//! 1. Check for an override file (explicit path, or ~/.local/share/sift/config/engine.toml)
//! 2. Fall back to embedded defaults (compiled into binary)
//!
//! Environment variables then override the LLM connection settings:
//! `SIFT_LLM_BACKEND`, `SIFT_LLM_HOST`, `SIFT_LLM_MODEL`, `SIFT_LLM_API_KEY`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::llm::select_model;
use crate::models::{LlmModel, ModelStrategy};

/// Embedded default config (compiled into binary)
const DEFAULT_CONFIG: &str = include_str!("../../../config/engine.toml");

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub thresholds: ThresholdConfig,
    pub patterns: PatternConfig,
    pub similarity: SimilarityConfig,
    pub batch: BatchConfig,
    pub budget: BudgetConfig,
    pub rate_limit: RateLimitConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub acceptance: f64,
    pub pattern_write: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            acceptance: 0.7,
            pattern_write: 0.6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub similarity_floor: f64,
    pub top_k: usize,
    pub usage_normalization: f64,
    pub queue_capacity: usize,
    pub correction_confidence: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            similarity_floor: 0.3,
            top_k: 5,
            usage_normalization: 100.0,
            queue_capacity: 256,
            correction_confidence: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub enabled: bool,
    pub threshold: f64,
    pub top_k: usize,
    pub dimensions: usize,
    pub timeout_secs: u64,
    pub rebuild_after_corrections: usize,
    pub rebuild_lookback_days: i64,
    pub rebuild_limit: usize,
    pub index_confident_results: bool,
}

impl SimilarityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.75,
            top_k: 5,
            dimensions: 256,
            timeout_secs: 5,
            rebuild_after_corrections: 10,
            rebuild_lookback_days: 365,
            rebuild_limit: 5000,
            index_confident_results: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_size: usize,
    pub min_size: usize,
    pub max_concurrency: usize,
    pub learner_queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            min_size: 20,
            max_concurrency: 3,
            learner_queue_capacity: 64,
        }
    }
}

/// Defaults for organizations without their own budget settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub enabled: bool,
    pub daily: f64,
    pub monthly: f64,
    pub alert_thresholds: Vec<f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily: 5.0,
            monthly: 50.0,
            alert_thresholds: vec![0.5, 0.8, 0.95],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 0 means unlimited
    pub max_requests_per_hour: u32,
    /// 0 means unlimited
    pub max_cost_per_hour: f64,
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_hour: 100,
            max_cost_per_hour: 10.0,
            window_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// "openai_compatible" or "mock"
    pub backend: String,
    pub host: Option<String>,
    pub api_key: Option<String>,
    /// Explicit model name; empty means pick by `model_strategy`
    pub model: String,
    pub model_strategy: ModelStrategy,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub embedding_model: Option<String>,
    pub models: Vec<LlmModel>,
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The catalogue entry the classifier should price and call
    pub fn active_model(&self) -> Result<LlmModel> {
        if self.model.trim().is_empty() {
            return select_model(&self.models, self.model_strategy);
        }
        self.models
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(self.model.trim()))
            .cloned()
            .ok_or_else(|| {
                Error::ModelNotAvailable(format!(
                    "{} is not in the model catalogue",
                    self.model.trim()
                ))
            })
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: "openai_compatible".to_string(),
            host: None,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            model_strategy: ModelStrategy::Balanced,
            temperature: 0.1,
            max_tokens: 4000,
            timeout_secs: 60,
            embedding_model: None,
            models: vec![
                LlmModel {
                    name: "gpt-4o-mini".to_string(),
                    provider: "openai".to_string(),
                    cost_per_1k_tokens: 0.00015,
                    max_tokens: 128_000,
                    accuracy: 0.92,
                    is_default: true,
                },
                LlmModel {
                    name: "claude-3-haiku".to_string(),
                    provider: "anthropic".to_string(),
                    cost_per_1k_tokens: 0.00025,
                    max_tokens: 200_000,
                    accuracy: 0.90,
                    is_default: false,
                },
            ],
        }
    }
}

/// Default config override path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("sift").join("config").join("engine.toml"))
}

impl EngineConfig {
    /// Load config (override first, then embedded default), then apply env overrides
    pub fn load(override_path: Option<&Path>) -> Result<Self> {
        let override_path = override_path
            .map(Path::to_path_buf)
            .or_else(default_config_path);

        let content = match override_path {
            Some(path) if path.exists() => fs::read_to_string(&path).map_err(|e| {
                Error::Config(format!("Failed to read {}: {}", path.display(), e))
            })?,
            _ => DEFAULT_CONFIG.to_string(),
        };

        let mut config = Self::from_toml(&content)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply LLM connection overrides from an environment lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(backend) = lookup("SIFT_LLM_BACKEND") {
            self.llm.backend = backend;
        }
        if let Some(host) = lookup("SIFT_LLM_HOST") {
            self.llm.host = Some(host);
        }
        if let Some(model) = lookup("SIFT_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(key) = lookup("SIFT_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, value: f64| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(Error::Config(format!("{} must be within [0, 1], got {}", name, value)))
            }
        };
        unit("thresholds.acceptance", self.thresholds.acceptance)?;
        unit("thresholds.pattern_write", self.thresholds.pattern_write)?;
        unit("patterns.similarity_floor", self.patterns.similarity_floor)?;
        unit("patterns.correction_confidence", self.patterns.correction_confidence)?;
        unit("similarity.threshold", self.similarity.threshold)?;
        for t in &self.budget.alert_thresholds {
            unit("budget.alert_thresholds", *t)?;
        }

        if self.batch.max_size == 0 {
            return Err(Error::Config("batch.max_size must be at least 1".to_string()));
        }
        if self.batch.min_size > self.batch.max_size {
            return Err(Error::Config(format!(
                "batch.min_size ({}) exceeds batch.max_size ({})",
                self.batch.min_size, self.batch.max_size
            )));
        }
        if self.budget.daily < 0.0 || self.budget.monthly < 0.0 {
            return Err(Error::Config("budgets cannot be negative".to_string()));
        }
        if self.patterns.usage_normalization <= 0.0 {
            return Err(Error::Config(
                "patterns.usage_normalization must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
