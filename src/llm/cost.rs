//! Cost tracking and budget management
//!
//! Token usage turns into append-only [`CostRecord`]s priced from the
//! configuration snapshot; budgets gate requests before the provider call.
//! Monetary arithmetic is `Decimal` end to end, 12 fractional digits with
//! banker's rounding on final USD emission. Budget reads are non-transactional:
//! two racing requests may jointly overshoot by at most one request's
//! estimate, which is accepted.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Months, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::config::ModelPricing;
use crate::llm::{metrics, LLMError, LLMResult, ProviderKind, Usage};

/// Fractional digits carried on stored USD amounts.
const USD_SCALE: u32 = 12;

/// What kind of work a record bills.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Completion,
    /// A streaming completion cancelled mid-flight; partial usage.
    CompletionPartial,
    Embedding,
    FineTune,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Completion => write!(f, "completion"),
            OperationType::CompletionPartial => write!(f, "completion_partial"),
            OperationType::Embedding => write!(f, "embedding"),
            OperationType::FineTune => write!(f, "fine_tune"),
        }
    }
}

/// One append-only spend record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: Uuid,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub provider: ProviderKind,
    pub model_id: String,
    pub operation: OperationType,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub cost_usd: Decimal,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Budget window cadence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResetPeriod {
    Daily,
    Weekly,
    Monthly,
}

/// A spending limit for a user, optionally scoped to one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub id: Uuid,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub amount_usd: Decimal,
    pub window_start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_period: Option<ResetPeriod>,
    /// Warn when in-window spend crosses this percentage.
    pub alert_threshold_pct: u32,
    /// When false the budget alerts but never rejects.
    pub enforce: bool,
}

impl Budget {
    /// The window containing `now`, rolling the configured period forward
    /// lazily. Deterministic from clock time, so missed resets apply
    /// idempotently on the next read.
    pub fn current_window(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if let Some(end) = self.window_end {
            if now >= end {
                return None;
            }
            return Some((self.window_start, end));
        }

        let Some(period) = self.reset_period else {
            return Some((self.window_start, DateTime::<Utc>::MAX_UTC));
        };
        if now < self.window_start {
            return None;
        }

        let (start, end) = match period {
            ResetPeriod::Daily => {
                let days = (now - self.window_start).num_days();
                let start = self.window_start + ChronoDuration::days(days);
                (start, start + ChronoDuration::days(1))
            }
            ResetPeriod::Weekly => {
                let weeks = (now - self.window_start).num_weeks();
                let start = self.window_start + ChronoDuration::weeks(weeks);
                (start, start + ChronoDuration::weeks(1))
            }
            ResetPeriod::Monthly => {
                let elapsed_months = (now.year() - self.window_start.year()) * 12
                    + (now.month() as i32 - self.window_start.month() as i32);
                let mut months = elapsed_months.max(0) as u32;
                let mut start = self.window_start + Months::new(months);
                if start > now {
                    months = months.saturating_sub(1);
                    start = self.window_start + Months::new(months);
                }
                (start, self.window_start + Months::new(months + 1))
            }
        };
        Some((start, end))
    }
}

/// Record query filter.
#[derive(Debug, Clone, Default)]
pub struct CostFilter {
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub provider: Option<ProviderKind>,
    pub model_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl CostFilter {
    fn matches(&self, record: &CostRecord) -> bool {
        if let Some(user) = &self.user_id {
            if &record.user_id != user {
                return false;
            }
        }
        if let Some(project) = &self.project_id {
            if record.project_id.as_ref() != Some(project) {
                return false;
            }
        }
        if let Some(provider) = &self.provider {
            if &record.provider != provider {
                return false;
            }
        }
        if let Some(model) = &self.model_id {
            if &record.model_id != model {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp >= until {
                return false;
            }
        }
        true
    }
}

/// Grouping axis for spend summaries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SummaryGroup {
    Provider,
    Model,
    Operation,
    Project,
    Day,
    Month,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostSummaryRow {
    pub group: String,
    pub total_usd: Decimal,
    pub total_tokens: u64,
    pub requests: u64,
}

/// Persistence contract the ledger consumes. The gateway never opens a
/// database; durable implementations live behind this trait.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn create_cost_record(&self, record: CostRecord) -> LLMResult<()>;
    async fn get_cost_records(&self, filter: &CostFilter) -> LLMResult<Vec<CostRecord>>;
    async fn get_cost_summary(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        group_by: SummaryGroup,
    ) -> LLMResult<Vec<CostSummaryRow>>;

    async fn create_budget(&self, budget: Budget) -> LLMResult<()>;
    async fn update_budget(&self, budget: Budget) -> LLMResult<()>;
    async fn delete_budget(&self, id: Uuid) -> LLMResult<()>;
    async fn budgets_for(&self, user_id: &str, project_id: Option<&str>)
        -> LLMResult<Vec<Budget>>;
}

/// Ephemeral repository for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryLedger {
    records: RwLock<Vec<CostRecord>>,
    budgets: RwLock<HashMap<Uuid, Budget>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedger {
    async fn create_cost_record(&self, record: CostRecord) -> LLMResult<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn get_cost_records(&self, filter: &CostFilter) -> LLMResult<Vec<CostRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn get_cost_summary(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        group_by: SummaryGroup,
    ) -> LLMResult<Vec<CostSummaryRow>> {
        let records = self.records.read().await;
        let mut rows: HashMap<String, CostSummaryRow> = HashMap::new();
        for record in records.iter() {
            if record.user_id != user_id
                || record.timestamp < since
                || record.timestamp >= until
            {
                continue;
            }
            let group = match group_by {
                SummaryGroup::Provider => record.provider.to_string(),
                SummaryGroup::Model => record.model_id.clone(),
                SummaryGroup::Operation => record.operation.to_string(),
                SummaryGroup::Project => record
                    .project_id
                    .clone()
                    .unwrap_or_else(|| "(none)".to_string()),
                SummaryGroup::Day => record.timestamp.format("%Y-%m-%d").to_string(),
                SummaryGroup::Month => record.timestamp.format("%Y-%m").to_string(),
            };
            let row = rows.entry(group.clone()).or_insert(CostSummaryRow {
                group,
                total_usd: Decimal::ZERO,
                total_tokens: 0,
                requests: 0,
            });
            row.total_usd += record.cost_usd;
            row.total_tokens += record.total_tokens as u64;
            row.requests += 1;
        }
        let mut rows: Vec<_> = rows.into_values().collect();
        rows.sort_by(|a, b| a.group.cmp(&b.group));
        Ok(rows)
    }

    async fn create_budget(&self, budget: Budget) -> LLMResult<()> {
        self.budgets.write().await.insert(budget.id, budget);
        Ok(())
    }

    async fn update_budget(&self, budget: Budget) -> LLMResult<()> {
        let mut budgets = self.budgets.write().await;
        if !budgets.contains_key(&budget.id) {
            return Err(LLMError::Internal(format!("unknown budget {}", budget.id)));
        }
        budgets.insert(budget.id, budget);
        Ok(())
    }

    async fn delete_budget(&self, id: Uuid) -> LLMResult<()> {
        self.budgets.write().await.remove(&id);
        Ok(())
    }

    async fn budgets_for(
        &self,
        user_id: &str,
        project_id: Option<&str>,
    ) -> LLMResult<Vec<Budget>> {
        Ok(self
            .budgets
            .read()
            .await
            .values()
            .filter(|b| {
                b.user_id == user_id
                    && match &b.project_id {
                        // Project-scoped budgets apply only to that project;
                        // unscoped budgets apply to everything the user does.
                        Some(scope) => project_id == Some(scope.as_str()),
                        None => true,
                    }
            })
            .cloned()
            .collect())
    }
}

/// `tokens × price`, carried at full precision then banker's-rounded.
pub fn completion_cost(usage: &Usage, pricing: &ModelPricing) -> Decimal {
    let cost = Decimal::from(usage.prompt_tokens) * pricing.input_per_token
        + Decimal::from(usage.completion_tokens) * pricing.output_per_token;
    cost.round_dp_with_strategy(USD_SCALE, RoundingStrategy::MidpointNearestEven)
}

pub fn fine_tune_cost(training_tokens: u64, rate_per_token: Decimal) -> Decimal {
    (Decimal::from(training_tokens) * rate_per_token)
        .round_dp_with_strategy(USD_SCALE, RoundingStrategy::MidpointNearestEven)
}

/// The ledger facade the pipeline talks to.
#[derive(Clone)]
pub struct CostTracker {
    repo: Arc<dyn LedgerRepository>,
}

/// Everything needed to write one record.
pub struct TrackArgs<'a> {
    pub user_id: &'a str,
    pub project_id: Option<&'a str>,
    pub request_id: &'a str,
    pub provider: ProviderKind,
    pub model_id: &'a str,
    pub operation: OperationType,
    pub usage: Usage,
    pub pricing: &'a ModelPricing,
    pub tags: Vec<String>,
}

impl CostTracker {
    pub fn new(repo: Arc<dyn LedgerRepository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> Arc<dyn LedgerRepository> {
        self.repo.clone()
    }

    /// Write one record; also feeds the spend metrics.
    pub async fn track(&self, args: TrackArgs<'_>) -> LLMResult<CostRecord> {
        let cost_usd = match args.operation {
            OperationType::FineTune => fine_tune_cost(
                args.usage.total_tokens as u64,
                args.pricing.fine_tune_per_token.unwrap_or(Decimal::ZERO),
            ),
            _ => completion_cost(&args.usage, args.pricing),
        };

        let record = CostRecord {
            id: Uuid::new_v4(),
            user_id: args.user_id.to_string(),
            project_id: args.project_id.map(String::from),
            request_id: args.request_id.to_string(),
            timestamp: Utc::now(),
            provider: args.provider.clone(),
            model_id: args.model_id.to_string(),
            operation: args.operation,
            input_tokens: args.usage.prompt_tokens,
            output_tokens: args.usage.completion_tokens,
            total_tokens: args.usage.prompt_tokens + args.usage.completion_tokens,
            cost_usd,
            tags: args.tags,
        };

        let milli_usd = (cost_usd * Decimal::from(1_000))
            .to_u64()
            .unwrap_or_default();
        metrics::COST_USD_MILLIS
            .with_label_values(&[&args.provider.to_string(), &args.operation.to_string()])
            .inc_by(milli_usd);

        self.repo.create_cost_record(record.clone()).await?;
        Ok(record)
    }

    /// In-window spend against one budget.
    async fn window_spend(&self, budget: &Budget, now: DateTime<Utc>) -> LLMResult<Decimal> {
        let Some((start, end)) = budget.current_window(now) else {
            return Ok(Decimal::ZERO);
        };
        let filter = CostFilter {
            user_id: Some(budget.user_id.clone()),
            project_id: budget.project_id.clone(),
            since: Some(start),
            until: Some(end),
            ..CostFilter::default()
        };
        let records = self.repo.get_cost_records(&filter).await?;
        Ok(records.iter().map(|r| r.cost_usd).sum())
    }

    /// Would `estimated_cost` keep every applicable enforced budget within
    /// its limit? Best-effort under concurrency; alerting budgets warn but
    /// never reject.
    pub async fn is_within_budget(
        &self,
        user_id: &str,
        project_id: Option<&str>,
        estimated_cost: Decimal,
    ) -> LLMResult<bool> {
        let now = Utc::now();
        for budget in self.repo.budgets_for(user_id, project_id).await? {
            if budget.current_window(now).is_none() {
                continue;
            }
            let spend = self.window_spend(&budget, now).await?;
            let projected = spend + estimated_cost;

            let threshold =
                budget.amount_usd * Decimal::from(budget.alert_threshold_pct) / Decimal::from(100);
            if projected >= threshold && threshold > Decimal::ZERO {
                warn!(
                    "budget {} for user {} at {projected} of {} USD",
                    budget.id, user_id, budget.amount_usd
                );
            }

            if budget.enforce && projected > budget.amount_usd {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pricing() -> ModelPricing {
        ModelPricing {
            input_per_token: Decimal::new(1, 5),  // 0.00001
            output_per_token: Decimal::new(3, 5), // 0.00003
            fine_tune_per_token: Some(Decimal::new(8, 6)),
        }
    }

    fn budget(amount: Decimal, enforce: bool) -> Budget {
        Budget {
            id: Uuid::new_v4(),
            user_id: "alice".into(),
            project_id: None,
            amount_usd: amount,
            window_start: Utc::now() - ChronoDuration::hours(1),
            window_end: None,
            reset_period: Some(ResetPeriod::Daily),
            alert_threshold_pct: 80,
            enforce,
        }
    }

    fn track_args<'a>(usage: Usage, pricing: &'a ModelPricing) -> TrackArgs<'a> {
        TrackArgs {
            user_id: "alice",
            project_id: None,
            request_id: "req-1",
            provider: ProviderKind::OpenAI,
            model_id: "openai.gpt-4",
            operation: OperationType::Completion,
            usage,
            pricing,
            tags: vec![],
        }
    }

    #[test]
    fn cost_is_tokens_times_price() {
        let usage = Usage::new(1_000, 500);
        let cost = completion_cost(&usage, &pricing());
        // 1000 * 0.00001 + 500 * 0.00003 = 0.01 + 0.015
        assert_eq!(cost, Decimal::new(25, 3));
    }

    #[test]
    fn rounding_is_bankers() {
        let p = ModelPricing {
            // Forces a half-way digit at the 12th decimal place.
            input_per_token: "0.0000000000005".parse().unwrap(),
            output_per_token: Decimal::ZERO,
            fine_tune_per_token: None,
        };
        let cost = completion_cost(&Usage::new(3, 0), &p);
        // 0.0000000000015 rounds to even: 0.000000000002.
        assert_eq!(cost, "0.000000000002".parse::<Decimal>().unwrap());
    }

    #[tokio::test]
    async fn tracked_records_preserve_token_identity() {
        let tracker = CostTracker::new(Arc::new(InMemoryLedger::new()));
        let p = pricing();
        let record = tracker.track(track_args(Usage::new(120, 30), &p)).await.unwrap();

        assert_eq!(record.total_tokens, record.input_tokens + record.output_tokens);
        assert!(record.cost_usd >= Decimal::ZERO);
        assert_eq!(record.operation, OperationType::Completion);
    }

    #[tokio::test]
    async fn enforced_budget_rejects_over_limit() {
        let repo = Arc::new(InMemoryLedger::new());
        let tracker = CostTracker::new(repo.clone());
        repo.create_budget(budget(Decimal::new(100, 2), true)) // $1.00
            .await
            .unwrap();

        // Spend $0.99.
        let p = ModelPricing {
            input_per_token: Decimal::new(99, 2), // $0.99 per token
            output_per_token: Decimal::ZERO,
            fine_tune_per_token: None,
        };
        tracker.track(track_args(Usage::new(1, 0), &p)).await.unwrap();

        // A $0.05 estimate would cross $1.00.
        assert!(!tracker
            .is_within_budget("alice", None, Decimal::new(5, 2))
            .await
            .unwrap());
        // A half-cent estimate still fits.
        assert!(tracker
            .is_within_budget("alice", None, Decimal::new(5, 3))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn advisory_budget_never_rejects() {
        let repo = Arc::new(InMemoryLedger::new());
        let tracker = CostTracker::new(repo.clone());
        repo.create_budget(budget(Decimal::new(1, 2), false)) // $0.01, advisory
            .await
            .unwrap();

        assert!(tracker
            .is_within_budget("alice", None, Decimal::new(500, 0))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn budgets_scope_by_project() {
        let repo = Arc::new(InMemoryLedger::new());
        let mut scoped = budget(Decimal::ONE, true);
        scoped.project_id = Some("proj-a".into());
        repo.create_budget(scoped).await.unwrap();

        let found = repo.budgets_for("alice", Some("proj-a")).await.unwrap();
        assert_eq!(found.len(), 1);
        let other = repo.budgets_for("alice", Some("proj-b")).await.unwrap();
        assert!(other.is_empty());
        let none = repo.budgets_for("alice", None).await.unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn daily_window_rolls_forward_lazily() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let b = Budget {
            window_start: start,
            ..budget(Decimal::ONE, true)
        };

        // Ten days later the window is day ten, regardless of missed resets.
        let now = Utc.with_ymd_and_hms(2026, 1, 11, 6, 0, 0).unwrap();
        let (ws, we) = b.current_window(now).unwrap();
        assert_eq!(ws, Utc.with_ymd_and_hms(2026, 1, 11, 0, 0, 0).unwrap());
        assert_eq!(we, Utc.with_ymd_and_hms(2026, 1, 12, 0, 0, 0).unwrap());

        // Idempotent: asking again yields the same window.
        assert_eq!(b.current_window(now).unwrap(), (ws, we));
    }

    #[test]
    fn monthly_window_handles_month_arithmetic() {
        let start = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
        let b = Budget {
            window_start: start,
            reset_period: Some(ResetPeriod::Monthly),
            ..budget(Decimal::ONE, true)
        };

        let now = Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap();
        let (ws, we) = b.current_window(now).unwrap();
        assert!(ws <= now && now < we);
    }

    #[test]
    fn explicit_end_date_expires_the_budget() {
        let mut b = budget(Decimal::ONE, true);
        b.window_end = Some(Utc::now() - ChronoDuration::hours(1));
        b.reset_period = None;
        assert!(b.current_window(Utc::now()).is_none());
    }

    #[tokio::test]
    async fn summary_groups_by_axis() {
        let repo = Arc::new(InMemoryLedger::new());
        let tracker = CostTracker::new(repo.clone());
        let p = pricing();

        tracker.track(track_args(Usage::new(100, 10), &p)).await.unwrap();
        let mut second = track_args(Usage::new(50, 5), &p);
        second.provider = ProviderKind::Anthropic;
        second.model_id = "anthropic.claude-3-sonnet";
        tracker.track(second).await.unwrap();

        let rows = repo
            .get_cost_summary(
                "alice",
                Utc::now() - ChronoDuration::hours(1),
                Utc::now() + ChronoDuration::hours(1),
                SummaryGroup::Provider,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.group == "openai" && r.requests == 1));
        assert!(rows.iter().any(|r| r.group == "anthropic"));
    }
}
