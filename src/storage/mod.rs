//! Durable system of record: accounts, API keys, model costs, usage logs.
//!
//! Backends implement the [`Store`] trait; the in-memory backend serves
//! tests and single-process development, the Postgres backend production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::StoreConfig;
use crate::health::{HealthCheckResult, HealthChecker};
use crate::providers::Usage;

pub mod memory;
pub mod postgres;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Budget window semantics. Only `Total` is honored; the other values are
/// accepted and stored for forward compatibility.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDuration {
    #[default]
    Total,
    Monthly,
    Daily,
}

impl BudgetDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetDuration::Total => "total",
            BudgetDuration::Monthly => "monthly",
            BudgetDuration::Daily => "daily",
        }
    }

    pub fn parse(value: &str) -> StorageResult<Self> {
        match value {
            "total" => Ok(BudgetDuration::Total),
            "monthly" => Ok(BudgetDuration::Monthly),
            "daily" => Ok(BudgetDuration::Daily),
            other => Err(StorageError::InvalidData(format!(
                "unknown budget duration: {other}"
            ))),
        }
    }
}

/// Budget-owning entity. `spent_usd` is only ever mutated through
/// [`Store::increment_spent`] (admin resets go through `upsert_account`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub user_id: String,
    pub account_name: Option<String>,
    pub budget_usd: Decimal,
    pub spent_usd: Decimal,
    pub budget_duration: BudgetDuration,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccountRecord {
    /// True once the account may no longer spend. A zero budget is treated
    /// as "no allowance configured" and always reads as over budget.
    pub fn is_over_budget(&self) -> bool {
        self.spent_usd >= self.budget_usd
    }

    pub fn remaining_budget_usd(&self) -> Decimal {
        (self.budget_usd - self.spent_usd).max(Decimal::ZERO)
    }
}

/// Bearer credential bound to one account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub api_key: String,
    pub user_id: String,
    pub key_name: String,
    pub is_active: bool,
    /// `None` means no restriction.
    pub allowed_models: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    pub fn is_model_allowed(&self, model_name: &str) -> bool {
        match &self.allowed_models {
            None => true,
            Some(models) => models.iter().any(|m| m == model_name),
        }
    }
}

/// Per-model pricing row. Rates are USD per million tokens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelCostRecord {
    pub model_name: String,
    pub provider: String,
    pub input_cost_per_million_tokens_usd: Decimal,
    pub output_cost_per_million_tokens_usd: Decimal,
    pub cache_read_cost_per_million_tokens_usd: Decimal,
    pub cache_write_cost_per_million_tokens_usd: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit row, one per completed upstream call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageLogRecord {
    pub user_id: String,
    pub api_key: String,
    pub model_name: String,
    pub request_endpoint: String,
    pub ip_address: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub total_tokens: u64,
    pub is_cache_hit: bool,
    pub cost_usd: Decimal,
    /// Set when the call completed but no pricing row existed (or the
    /// stream ended without a usage trailer); such calls are not debited.
    pub pricing_missing: bool,
    pub request_payload: serde_json::Value,
    pub response_payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl UsageLogRecord {
    /// Derive the token columns from an adapter-reported usage value.
    pub fn with_usage(mut self, usage: &Usage) -> Self {
        self.input_tokens = usage.input_tokens;
        self.output_tokens = usage.output_tokens;
        self.cache_read_tokens = usage.cache_read_tokens;
        self.cache_write_tokens = usage.cache_write_tokens;
        self.total_tokens = usage.total();
        self.is_cache_hit = usage.is_cache_hit();
        self
    }
}

/// Typed store operations over the persisted collections.
///
/// `increment_spent` is the only mutation path for `spent_usd` and must be
/// a single atomic read-modify-write in every backend; read-then-write is
/// forbidden.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_api_key(&self, api_key: &str) -> StorageResult<Option<ApiKeyRecord>>;

    async fn get_account(&self, user_id: &str) -> StorageResult<Option<AccountRecord>>;

    async fn get_model_cost(&self, model_name: &str) -> StorageResult<Option<ModelCostRecord>>;

    /// Atomically add `delta_usd` to the account's `spent_usd` and return
    /// the post-increment row. The delta may be zero but never negative.
    async fn increment_spent(
        &self,
        user_id: &str,
        delta_usd: Decimal,
    ) -> StorageResult<AccountRecord>;

    async fn append_usage_log(&self, log: &UsageLogRecord) -> StorageResult<()>;

    async fn upsert_account(&self, account: &AccountRecord) -> StorageResult<()>;

    async fn upsert_api_key(&self, key: &ApiKeyRecord) -> StorageResult<()>;

    async fn upsert_model_cost(&self, cost: &ModelCostRecord) -> StorageResult<()>;

    async fn list_model_costs(&self) -> StorageResult<Vec<ModelCostRecord>>;

    /// Most recent usage logs for an account, newest first.
    async fn get_usage_logs(&self, user_id: &str, limit: u32)
    -> StorageResult<Vec<UsageLogRecord>>;

    async fn health_check(&self) -> StorageResult<()>;

    async fn migrate(&self) -> StorageResult<()>;
}

/// Create the store backend selected by configuration.
pub async fn connect(config: &StoreConfig) -> StorageResult<Arc<dyn Store>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(memory::MemoryStore::new())),
        "postgres" => {
            let store = postgres::PostgresStore::connect(&config.uri, &config.db_name).await?;
            Ok(Arc::new(store))
        }
        other => Err(StorageError::InvalidData(format!(
            "unknown store backend: {other}"
        ))),
    }
}

/// Health checker adapter for the store.
pub struct StoreHealthChecker {
    store: Arc<dyn Store>,
}

impl StoreHealthChecker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthChecker for StoreHealthChecker {
    fn name(&self) -> &str {
        "store"
    }

    async fn check(&self) -> HealthCheckResult {
        match self.store.health_check().await {
            Ok(()) => HealthCheckResult::healthy(),
            Err(e) => HealthCheckResult::unhealthy(format!("store health check failed: {e}")),
        }
    }
}
