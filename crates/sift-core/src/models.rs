//! Domain models for Sift

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type OrganizationId = Uuid;
pub type TransactionId = Uuid;
pub type CategoryId = i64;

/// Clamp a confidence score into [0, 1]. NaN becomes 0.
pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

// =============================================================================
// Transactions and categories
// =============================================================================

/// A financial event owned by ingestion; the engine only writes back category + metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub organization_id: OrganizationId,
    pub account_name: Option<String>,
    /// Signed amount (negative = money out)
    pub amount: f64,
    pub merchant_name: Option<String>,
    pub description: Option<String>,
    pub date: NaiveDate,
    pub category_id: Option<CategoryId>,
    pub metadata: Option<CategorizationMetadata>,
}

impl Transaction {
    /// Merchant name, falling back to the description when the bank gave none
    pub fn merchant_text(&self) -> Option<&str> {
        non_empty(self.merchant_name.as_deref()).or_else(|| non_empty(self.description.as_deref()))
    }

    pub fn is_categorized(&self) -> bool {
        self.category_id.is_some()
    }

    pub fn is_user_corrected(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.user_corrected)
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// New transaction for insertion
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub organization_id: OrganizationId,
    pub account_name: Option<String>,
    pub amount: f64,
    pub merchant_name: Option<String>,
    pub description: Option<String>,
    pub date: NaiveDate,
}

/// Organization-scoped spending category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub parent_id: Option<CategoryId>,
    pub color: Option<String>,
    pub icon: Option<String>,
}

// =============================================================================
// Categorization results
// =============================================================================

/// Which strategy produced a categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategorizationMethod {
    Rule,
    Pattern,
    Similarity,
    LlmBatch,
    Manual,
}

impl CategorizationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Pattern => "pattern",
            Self::Similarity => "similarity",
            Self::LlmBatch => "llm_batch",
            Self::Manual => "manual",
        }
    }
}

impl std::str::FromStr for CategorizationMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rule" | "rule_based" => Ok(Self::Rule),
            "pattern" | "pattern_matching" => Ok(Self::Pattern),
            "similarity" | "rag_similarity" => Ok(Self::Similarity),
            "llm_batch" | "llm-batch" | "llm" => Ok(Self::LlmBatch),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Unknown categorization method: {}", s)),
        }
    }
}

impl std::fmt::Display for CategorizationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output of any strategy. Never persisted directly, only folded into metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizationResult {
    pub category_id: Option<CategoryId>,
    pub confidence: f64,
    pub method: CategorizationMethod,
    pub processing_time_ms: u64,
    pub cost_estimate: f64,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_matches: Vec<RuleMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub similarity_matches: Vec<SimilarityMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CategorizationResult {
    pub fn new(
        category_id: CategoryId,
        confidence: f64,
        method: CategorizationMethod,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            category_id: Some(category_id),
            confidence: clamp_confidence(confidence),
            method,
            processing_time_ms: 0,
            cost_estimate: 0.0,
            explanation: explanation.into(),
            rule_matches: Vec::new(),
            similarity_matches: Vec::new(),
            error: None,
        }
    }

    /// Terminal-negative result: the strategy found nothing
    pub fn no_match(method: CategorizationMethod, explanation: impl Into<String>) -> Self {
        Self {
            category_id: None,
            confidence: 0.0,
            method,
            processing_time_ms: 0,
            cost_estimate: 0.0,
            explanation: explanation.into(),
            rule_matches: Vec::new(),
            similarity_matches: Vec::new(),
            error: None,
        }
    }

    pub fn failed(method: CategorizationMethod, error: impl Into<String>) -> Self {
        let error = error.into();
        let mut result = Self::no_match(method, error.clone());
        result.error = Some(error);
        result
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.processing_time_ms = elapsed.as_millis() as u64;
        self
    }

    /// Whether this result terminates the strategy chain
    pub fn clears(&self, threshold: f64) -> bool {
        self.category_id.is_some() && self.confidence >= threshold
    }
}

/// A rule that matched during evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: i64,
    pub category_id: CategoryId,
    pub field: RuleField,
    pub operator: RuleOperator,
    pub value: String,
    pub confidence: f64,
    pub priority: i32,
}

/// A historical transaction found by the similarity retriever
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub transaction_id: TransactionId,
    pub category_id: CategoryId,
    pub similarity: f64,
    pub text: String,
}

/// Persisted alongside a transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategorizationMetadata {
    pub confidence_score: Option<f64>,
    pub method: Option<CategorizationMethod>,
    /// Once set, automatic re-categorization needs an explicit force flag
    pub user_corrected: bool,
    /// Low-confidence LLM result kept for user review
    pub needs_review: bool,
    pub similarity_matches: Vec<SimilarityMatch>,
    pub rule_matches: Vec<RuleMatch>,
    pub processing_time_ms: Option<u64>,
    pub cost_estimate: Option<f64>,
    pub explanation: Option<String>,
    pub feedback_id: Option<i64>,
    pub corrected_at: Option<DateTime<Utc>>,
}

impl CategorizationMetadata {
    pub fn from_result(result: &CategorizationResult, threshold: f64) -> Self {
        Self {
            confidence_score: Some(clamp_confidence(result.confidence)),
            method: Some(result.method),
            user_corrected: false,
            needs_review: result.confidence < threshold,
            similarity_matches: result.similarity_matches.clone(),
            rule_matches: result.rule_matches.clone(),
            processing_time_ms: Some(result.processing_time_ms),
            cost_estimate: Some(result.cost_estimate),
            explanation: Some(result.explanation.clone()),
            feedback_id: None,
            corrected_at: None,
        }
    }

    /// Metadata for a category the user set by hand
    pub fn user_correction(feedback_id: i64, previous: Option<&CategorizationMetadata>) -> Self {
        Self {
            confidence_score: Some(1.0),
            method: Some(CategorizationMethod::Manual),
            user_corrected: true,
            needs_review: false,
            similarity_matches: Vec::new(),
            rule_matches: previous.map(|m| m.rule_matches.clone()).unwrap_or_default(),
            processing_time_ms: None,
            cost_estimate: None,
            explanation: Some("set by user".to_string()),
            feedback_id: Some(feedback_id),
            corrected_at: Some(Utc::now()),
        }
    }
}

// =============================================================================
// Rules
// =============================================================================

/// Transaction field a rule inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleField {
    Description,
    Merchant,
    Account,
    Amount,
}

impl RuleField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Description => "description",
            Self::Merchant => "merchant",
            Self::Account => "account",
            Self::Amount => "amount",
        }
    }
}

impl std::str::FromStr for RuleField {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "description" => Ok(Self::Description),
            "merchant" | "merchant_name" => Ok(Self::Merchant),
            "account" | "account_name" => Ok(Self::Account),
            "amount" => Ok(Self::Amount),
            _ => Err(format!("Unknown rule field: {}", s)),
        }
    }
}

impl std::fmt::Display for RuleField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Contains,
    Equals,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
}

impl RuleOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::Equals => "equals",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
        }
    }

    /// Operators that only make sense on the amount field
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::GreaterThan | Self::LessThan)
    }
}

impl std::str::FromStr for RuleOperator {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "contains" => Ok(Self::Contains),
            "equals" | "eq" => Ok(Self::Equals),
            "starts_with" | "startswith" => Ok(Self::StartsWith),
            "ends_with" | "endswith" => Ok(Self::EndsWith),
            "greater_than" | "gt" => Ok(Self::GreaterThan),
            "less_than" | "lt" => Ok(Self::LessThan),
            _ => Err(format!("Unknown rule operator: {}", s)),
        }
    }
}

impl std::fmt::Display for RuleOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A user-defined deterministic categorization rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub organization_id: OrganizationId,
    pub category_id: CategoryId,
    pub field: RuleField,
    pub operator: RuleOperator,
    pub value: String,
    pub case_sensitive: bool,
    pub is_regex: bool,
    /// Confidence reported when this rule wins
    pub confidence: f64,
    /// Higher priority rules are evaluated first
    pub priority: i32,
    pub usage_count: i64,
    /// Rolling share of confirmed matches
    pub success_rate: f64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// New rule for creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub organization_id: OrganizationId,
    pub category_id: CategoryId,
    pub field: RuleField,
    pub operator: RuleOperator,
    pub value: String,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub is_regex: bool,
    pub confidence: f64,
    #[serde(default)]
    pub priority: i32,
}

impl NewRule {
    pub fn new(
        organization_id: OrganizationId,
        category_id: CategoryId,
        field: RuleField,
        operator: RuleOperator,
        value: impl Into<String>,
    ) -> Self {
        Self {
            organization_id,
            category_id,
            field,
            operator,
            value: value.into(),
            case_sensitive: false,
            is_regex: false,
            confidence: 0.9,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    pub fn regex(mut self) -> Self {
        self.is_regex = true;
        self
    }

    /// Unsaved rule, for dry runs
    pub fn draft(&self) -> Rule {
        Rule {
            id: 0,
            organization_id: self.organization_id,
            category_id: self.category_id,
            field: self.field,
            operator: self.operator,
            value: self.value.clone(),
            case_sensitive: self.case_sensitive,
            is_regex: self.is_regex,
            confidence: self.confidence,
            priority: self.priority,
            usage_count: 0,
            success_rate: 1.0,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }
}

// =============================================================================
// Pattern cache
// =============================================================================

/// (organization, normalized merchant) -> category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternCacheEntry {
    pub id: i64,
    pub organization_id: OrganizationId,
    pub merchant_pattern: String,
    pub category_id: CategoryId,
    pub confidence: f64,
    pub usage_count: i64,
    pub last_used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A cache entry scored against a lookup
#[derive(Debug, Clone)]
pub struct SimilarPattern {
    pub entry: PatternCacheEntry,
    pub similarity: f64,
}

// =============================================================================
// Cost tracking
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Daily,
    Monthly,
}

impl BudgetPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }
}

impl std::str::FromStr for BudgetPeriod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "monthly" => Ok(Self::Monthly),
            _ => Err(format!("Unknown budget period: {}", s)),
        }
    }
}

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-organization running LLM spend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostTracker {
    pub organization_id: OrganizationId,
    pub daily_budget: f64,
    pub monthly_budget: f64,
    /// Spend for `period_day`
    pub current_spend: f64,
    /// Spend for the month containing `period_day`
    pub monthly_spend: f64,
    /// Transactions sent to the LLM this month
    pub transaction_count: i64,
    pub avg_cost_per_transaction: f64,
    pub period_day: NaiveDate,
    pub updated_at: DateTime<Utc>,
}

impl CostTracker {
    pub fn new(
        organization_id: OrganizationId,
        daily_budget: f64,
        monthly_budget: f64,
        today: NaiveDate,
    ) -> Self {
        Self {
            organization_id,
            daily_budget,
            monthly_budget,
            current_spend: 0.0,
            monthly_spend: 0.0,
            transaction_count: 0,
            avg_cost_per_transaction: 0.0,
            period_day: today,
            updated_at: Utc::now(),
        }
    }

    /// Reset period totals when `today` is past the tracked day/month.
    /// Returns true when anything was reset.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if today == self.period_day {
            return false;
        }
        if today.year() != self.period_day.year() || today.month() != self.period_day.month() {
            self.monthly_spend = 0.0;
            self.transaction_count = 0;
            self.avg_cost_per_transaction = 0.0;
        }
        self.current_spend = 0.0;
        self.period_day = today;
        true
    }

    /// Add a completed batch and refresh the average
    pub fn record(&mut self, cost: f64, transaction_count: i64) {
        self.current_spend += cost;
        self.monthly_spend += cost;
        self.transaction_count += transaction_count;
        if self.transaction_count > 0 {
            self.avg_cost_per_transaction = self.monthly_spend / self.transaction_count as f64;
        }
        self.updated_at = Utc::now();
    }
}

/// Per-organization budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSettings {
    pub organization_id: OrganizationId,
    /// 0 means unlimited
    pub daily_budget: f64,
    /// 0 means unlimited
    pub monthly_budget: f64,
    pub alert_thresholds: Vec<f64>,
    pub enabled: bool,
}

impl BudgetSettings {
    pub fn limit(&self, period: BudgetPeriod) -> f64 {
        match period {
            BudgetPeriod::Daily => self.daily_budget,
            BudgetPeriod::Monthly => self.monthly_budget,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage >= 0.95 {
            Self::Critical
        } else if percentage >= 0.8 {
            Self::Warning
        } else {
            Self::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::str::FromStr for AlertSeverity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Unknown alert severity: {}", s)),
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Emitted when spend crosses a threshold fraction of a budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub organization_id: OrganizationId,
    pub period: BudgetPeriod,
    pub threshold: f64,
    pub current_spend: f64,
    pub budget_limit: f64,
    pub percentage: f64,
    pub severity: AlertSeverity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Audit record of one completed LLM call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmBatch {
    pub id: i64,
    pub organization_id: OrganizationId,
    pub transaction_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost: f64,
    pub model: String,
    /// Share of transactions that came back with a resolved category
    pub success_rate: f64,
    pub avg_confidence: f64,
    pub processing_time_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLlmBatch {
    pub organization_id: OrganizationId,
    pub transaction_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost: f64,
    pub model: String,
    pub success_rate: f64,
    pub avg_confidence: f64,
    pub processing_time_ms: i64,
}

// =============================================================================
// LLM models
// =============================================================================

/// An LLM the classifier may use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmModel {
    pub name: String,
    pub provider: String,
    /// USD per 1000 tokens (input and output priced alike)
    pub cost_per_1k_tokens: f64,
    pub max_tokens: u32,
    /// Measured categorization accuracy in [0, 1]
    pub accuracy: f64,
    #[serde(default)]
    pub is_default: bool,
}

impl LlmModel {
    pub fn cost_for(&self, tokens: TokenEstimate) -> f64 {
        tokens.total() as f64 / 1000.0 * self.cost_per_1k_tokens
    }
}

/// Input/output token counts, estimated or reported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEstimate {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenEstimate {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::Add for TokenEstimate {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
        }
    }
}

/// How to pick a model from the catalogue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStrategy {
    CostOptimized,
    AccuracyOptimized,
    #[default]
    Balanced,
}

impl std::str::FromStr for ModelStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cost_optimized" | "cost" => Ok(Self::CostOptimized),
            "accuracy_optimized" | "accuracy" => Ok(Self::AccuracyOptimized),
            "balanced" => Ok(Self::Balanced),
            _ => Err(format!("Unknown model strategy: {}", s)),
        }
    }
}

// =============================================================================
// Feedback
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackType {
    Correction,
    Confirmation,
    Rejection,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Correction => "correction",
            Self::Confirmation => "confirmation",
            Self::Rejection => "rejection",
        }
    }
}

impl std::str::FromStr for FeedbackType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "correction" => Ok(Self::Correction),
            "confirmation" | "confirm" => Ok(Self::Confirmation),
            "rejection" | "reject" => Ok(Self::Rejection),
            _ => Err(format!("Unknown feedback type: {}", s)),
        }
    }
}

impl std::fmt::Display for FeedbackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A user's verdict on an automatic categorization. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorizationFeedback {
    pub id: i64,
    pub transaction_id: TransactionId,
    pub organization_id: OrganizationId,
    pub old_category_id: Option<CategoryId>,
    pub new_category_id: CategoryId,
    pub feedback_type: FeedbackType,
    pub confidence_before: Option<f64>,
    pub method_used: Option<CategorizationMethod>,
    pub created_at: DateTime<Utc>,
}

/// Feedback as submitted. Missing "before" fields are filled from the transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFeedback {
    pub transaction_id: TransactionId,
    pub organization_id: OrganizationId,
    pub old_category_id: Option<CategoryId>,
    pub new_category_id: CategoryId,
    pub feedback_type: FeedbackType,
    pub confidence_before: Option<f64>,
    pub method_used: Option<CategorizationMethod>,
}

impl NewFeedback {
    pub fn new(
        organization_id: OrganizationId,
        transaction_id: TransactionId,
        new_category_id: CategoryId,
        feedback_type: FeedbackType,
    ) -> Self {
        Self {
            transaction_id,
            organization_id,
            old_category_id: None,
            new_category_id,
            feedback_type,
            confidence_before: None,
            method_used: None,
        }
    }
}

/// Aggregate feedback counts for an organization
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub total: i64,
    pub corrections: i64,
    pub confirmations: i64,
    pub rejections: i64,
    pub avg_confidence_before: Option<f64>,
}

// =============================================================================
// Requests and summaries
// =============================================================================

/// Which transactions a batch request covers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionSelector {
    Ids { ids: Vec<TransactionId> },
    DateRange { start: NaiveDate, end: NaiveDate },
    AllUncategorized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub organization_id: OrganizationId,
    pub selector: TransactionSelector,
    #[serde(default)]
    pub force_recategorize: bool,
    /// Cap on LLM spend for this request
    #[serde(default)]
    pub max_cost: Option<f64>,
    /// Overrides the configured acceptance threshold
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
}

impl BatchRequest {
    pub fn all_uncategorized(organization_id: OrganizationId) -> Self {
        Self::new(organization_id, TransactionSelector::AllUncategorized)
    }

    pub fn for_ids(organization_id: OrganizationId, ids: Vec<TransactionId>) -> Self {
        Self::new(organization_id, TransactionSelector::Ids { ids })
    }

    pub fn date_range(organization_id: OrganizationId, start: NaiveDate, end: NaiveDate) -> Self {
        Self::new(organization_id, TransactionSelector::DateRange { start, end })
    }

    fn new(organization_id: OrganizationId, selector: TransactionSelector) -> Self {
        Self {
            organization_id,
            selector,
            force_recategorize: false,
            max_cost: None,
            confidence_threshold: None,
        }
    }
}

/// What happened to one transaction in a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Persisted with a confident category
    Categorized,
    /// Persisted but flagged for review
    LowConfidence,
    /// No strategy produced a category
    Uncategorized,
    /// Already categorized or user-corrected, and not forced
    Skipped,
    SkippedByBudget,
    RateLimited,
    Cancelled,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Categorized => "categorized",
            Self::LowConfidence => "low_confidence",
            Self::Uncategorized => "uncategorized",
            Self::Skipped => "skipped",
            Self::SkippedByBudget => "skipped_by_budget",
            Self::RateLimited => "rate_limited",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionOutcome {
    pub transaction_id: TransactionId,
    pub status: OutcomeStatus,
    pub result: Option<CategorizationResult>,
    pub error: Option<String>,
    pub retryable: bool,
}

impl TransactionOutcome {
    pub fn new(transaction_id: TransactionId, status: OutcomeStatus) -> Self {
        Self {
            transaction_id,
            status,
            result: None,
            error: None,
            retryable: false,
        }
    }

    pub fn with_result(mut self, result: CategorizationResult) -> Self {
        if self.error.is_none() {
            self.error = result.error.clone();
        }
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>, retryable: bool) -> Self {
        self.error = Some(error.into());
        self.retryable = retryable;
        self
    }
}

/// Result of `categorize_batch`, outcomes in input order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub organization_id: OrganizationId,
    pub total: usize,
    /// Persisted with a category (includes low confidence)
    pub categorized: usize,
    pub low_confidence: usize,
    pub uncategorized: usize,
    pub skipped: usize,
    pub skipped_by_budget: usize,
    pub rate_limited: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub cost: f64,
    pub llm_calls: usize,
    pub outcomes: Vec<TransactionOutcome>,
}

impl BatchSummary {
    pub fn from_outcomes(
        organization_id: OrganizationId,
        outcomes: Vec<TransactionOutcome>,
        cost: f64,
        llm_calls: usize,
    ) -> Self {
        let count = |status: OutcomeStatus| outcomes.iter().filter(|o| o.status == status).count();
        let low_confidence = count(OutcomeStatus::LowConfidence);
        Self {
            organization_id,
            total: outcomes.len(),
            categorized: count(OutcomeStatus::Categorized) + low_confidence,
            low_confidence,
            uncategorized: count(OutcomeStatus::Uncategorized),
            skipped: count(OutcomeStatus::Skipped),
            skipped_by_budget: count(OutcomeStatus::SkippedByBudget),
            rate_limited: count(OutcomeStatus::RateLimited),
            cancelled: count(OutcomeStatus::Cancelled),
            failed: count(OutcomeStatus::Failed),
            cost,
            llm_calls,
            outcomes,
        }
    }

    /// Transactions the job layer may resubmit unchanged
    pub fn retryable(&self) -> usize {
        self.outcomes.iter().filter(|o| o.retryable).count()
    }
}

/// Result of `estimate_batch_cost`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEstimate {
    pub organization_id: OrganizationId,
    pub transaction_count: usize,
    pub sub_batches: usize,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub estimated_cost: f64,
    pub model: String,
}

/// Categorization coverage for an organization
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategorizationStats {
    pub total: i64,
    pub categorized: i64,
    pub uncategorized: i64,
    pub user_corrected: i64,
    pub needs_review: i64,
    pub avg_confidence: Option<f64>,
    pub by_method: BTreeMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_confidence() {
        assert_eq!(clamp_confidence(1.7), 1.0);
        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
    }

    #[test]
    fn test_result_constructor_clamps() {
        let result = CategorizationResult::new(3, 4.0, CategorizationMethod::LlmBatch, "x");
        assert_eq!(result.confidence, 1.0);
        assert!(result.clears(0.7));
        assert!(!CategorizationResult::no_match(CategorizationMethod::Rule, "no matching rules")
            .clears(0.0));
    }

    #[test]
    fn test_method_round_trip_and_legacy_names() {
        for method in [
            CategorizationMethod::Rule,
            CategorizationMethod::Pattern,
            CategorizationMethod::Similarity,
            CategorizationMethod::LlmBatch,
            CategorizationMethod::Manual,
        ] {
            assert_eq!(method.as_str().parse::<CategorizationMethod>(), Ok(method));
        }
        assert_eq!("llm-batch".parse(), Ok(CategorizationMethod::LlmBatch));
        assert_eq!("rule_based".parse(), Ok(CategorizationMethod::Rule));
        assert!("telepathy".parse::<CategorizationMethod>().is_err());
    }

    #[test]
    fn test_merchant_text_falls_back_to_description() {
        let mut tx = Transaction {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            account_name: None,
            amount: -4.0,
            merchant_name: Some("   ".to_string()),
            description: Some("SQ *BLUE BOTTLE".to_string()),
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            category_id: None,
            metadata: None,
        };
        assert_eq!(tx.merchant_text(), Some("SQ *BLUE BOTTLE"));
        tx.merchant_name = Some("Blue Bottle".to_string());
        assert_eq!(tx.merchant_text(), Some("Blue Bottle"));
    }

    #[test]
    fn test_cost_tracker_rollover() {
        let org = Uuid::new_v4();
        let day = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let mut tracker = CostTracker::new(org, 5.0, 50.0, day);
        tracker.record(2.0, 100);
        assert!((tracker.avg_cost_per_transaction - 0.02).abs() < 1e-12);

        assert!(!tracker.roll_over(day));
        assert_eq!(tracker.current_spend, 2.0);

        // next day in a new month resets both periods
        tracker.roll_over(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(tracker.current_spend, 0.0);
        assert_eq!(tracker.monthly_spend, 0.0);
        assert_eq!(tracker.transaction_count, 0);

        tracker.record(1.0, 10);
        tracker.roll_over(NaiveDate::from_ymd_opt(2024, 2, 2).unwrap());
        assert_eq!(tracker.current_spend, 0.0);
        assert_eq!(tracker.monthly_spend, 1.0);
    }

    #[test]
    fn test_alert_severity_from_percentage() {
        assert_eq!(AlertSeverity::from_percentage(0.5), AlertSeverity::Info);
        assert_eq!(AlertSeverity::from_percentage(0.8), AlertSeverity::Warning);
        assert_eq!(AlertSeverity::from_percentage(0.97), AlertSeverity::Critical);
    }

    #[test]
    fn test_batch_summary_counts() {
        let id = Uuid::new_v4;
        let outcomes = vec![
            TransactionOutcome::new(id(), OutcomeStatus::Categorized),
            TransactionOutcome::new(id(), OutcomeStatus::LowConfidence),
            TransactionOutcome::new(id(), OutcomeStatus::SkippedByBudget),
            TransactionOutcome::new(id(), OutcomeStatus::Failed).with_error("timeout", true),
        ];
        let summary = BatchSummary::from_outcomes(Uuid::new_v4(), outcomes, 0.01, 1);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.categorized, 2);
        assert_eq!(summary.low_confidence, 1);
        assert_eq!(summary.skipped_by_budget, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.retryable(), 1);
    }

    #[test]
    fn test_selector_serde_shape() {
        let request = BatchRequest::for_ids(Uuid::nil(), vec![Uuid::nil()]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["selector"]["kind"], "ids");

        let parsed: BatchRequest = serde_json::from_str(
            r#"{"organization_id":"00000000-0000-0000-0000-000000000000","selector":{"kind":"all_uncategorized"}}"#,
        )
        .unwrap();
        assert!(matches!(parsed.selector, TransactionSelector::AllUncategorized));
        assert!(!parsed.force_recategorize);
    }
}
