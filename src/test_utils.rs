//! Shared fixtures and builders for the test suites.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::bus::memory::MemoryBus;
use crate::cache::AuthCache;
use crate::config::Config;
use crate::ledger::{Ledger, SettleRequest};
use crate::pricing::Pricing;
use crate::providers::{Usage, mock::MockProviderAdapter};
use crate::server::Server;
use crate::storage::memory::MemoryStore;
use crate::storage::{
    AccountRecord, ApiKeyRecord, BudgetDuration, ModelCostRecord, StorageError, StorageResult,
    Store, UsageLogRecord,
};

pub const TEST_ADMIN_KEY: &str = "admin-secret";

pub fn account(user_id: &str, budget_usd: Decimal, spent_usd: Decimal) -> AccountRecord {
    let now = Utc::now();
    AccountRecord {
        user_id: user_id.to_string(),
        account_name: None,
        budget_usd,
        spent_usd,
        budget_duration: BudgetDuration::Total,
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

pub fn api_key(api_key: &str, user_id: &str) -> ApiKeyRecord {
    let now = Utc::now();
    ApiKeyRecord {
        api_key: api_key.to_string(),
        user_id: user_id.to_string(),
        key_name: format!("{user_id} key"),
        is_active: true,
        allowed_models: None,
        created_at: now,
        updated_at: now,
    }
}

/// Pricing row with whole-dollar per-million rates, enough for the
/// scenarios exercised in tests.
pub fn model_cost(
    model_name: &str,
    input: i64,
    output: i64,
    cache_read: i64,
    cache_write: i64,
) -> ModelCostRecord {
    ModelCostRecord {
        model_name: model_name.to_string(),
        provider: "openai".to_string(),
        input_cost_per_million_tokens_usd: Decimal::from(input),
        output_cost_per_million_tokens_usd: Decimal::from(output),
        cache_read_cost_per_million_tokens_usd: Decimal::from(cache_read),
        cache_write_cost_per_million_tokens_usd: Decimal::from(cache_write),
        updated_at: Utc::now(),
    }
}

pub fn usage_log_template(user_id: &str, api_key: &str, model_name: &str) -> UsageLogRecord {
    UsageLogRecord {
        user_id: user_id.to_string(),
        api_key: api_key.to_string(),
        model_name: model_name.to_string(),
        request_endpoint: "/v1/chat/completions".to_string(),
        ip_address: None,
        input_tokens: 0,
        output_tokens: 0,
        cache_read_tokens: 0,
        cache_write_tokens: 0,
        total_tokens: 0,
        is_cache_hit: false,
        cost_usd: Decimal::ZERO,
        pricing_missing: false,
        request_payload: serde_json::Value::Null,
        response_payload: serde_json::Value::Null,
        timestamp: Utc::now(),
    }
}

/// Ledger wired over memory backends, for unit-level settlement tests.
pub struct TestLedger {
    pub store: Arc<MemoryStore>,
    pub bus: MemoryBus,
    pub cache: Arc<AuthCache>,
    pub ledger: Ledger,
}

impl TestLedger {
    pub fn new() -> Self {
        let config = Config::default();
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new();
        let cache = Arc::new(AuthCache::new(store.clone(), &config.cache));
        let ledger = Ledger::new(
            store.clone(),
            Pricing::new(cache.clone()),
            cache.clone(),
            Arc::new(bus.clone()),
        );
        Self {
            store,
            bus,
            cache,
            ledger,
        }
    }

    pub fn settle_request(
        &self,
        user_id: &str,
        api_key: &str,
        model_name: &str,
        usage: Option<Usage>,
    ) -> SettleRequest {
        SettleRequest {
            user_id: user_id.to_string(),
            api_key: api_key.to_string(),
            model_name: model_name.to_string(),
            request_endpoint: "/v1/chat/completions".to_string(),
            ip_address: None,
            usage,
            request_payload: serde_json::json!({"model": model_name}),
            response_payload: serde_json::Value::Null,
        }
    }
}

impl Default for TestLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Full gateway instance over memory backends with recording adapters.
pub struct TestServer {
    pub server: Server,
    pub store: Arc<MemoryStore>,
    pub bus: MemoryBus,
    pub openai: Arc<MockProviderAdapter>,
    pub anthropic: Arc<MockProviderAdapter>,
}

impl TestServer {
    pub fn app(&self) -> axum::Router {
        self.server.create_app()
    }

    pub async fn seed_account(&self, record: &AccountRecord) {
        self.store.upsert_account(record).await.unwrap();
    }

    pub async fn seed_api_key(&self, record: &ApiKeyRecord) {
        self.store.upsert_api_key(record).await.unwrap();
    }

    pub async fn seed_model_cost(&self, record: &ModelCostRecord) {
        self.store.upsert_model_cost(record).await.unwrap();
    }

    /// Block until background stream settlements have finished.
    pub async fn wait_for_settlements(&self) {
        assert!(
            self.server
                .pipeline
                .settlements()
                .wait_idle(std::time::Duration::from_secs(5))
                .await,
            "settlement tasks did not finish in time"
        );
    }
}

pub struct TestServerBuilder {
    config: Config,
    store: Option<Arc<dyn Store>>,
}

impl TestServerBuilder {
    pub fn new() -> Self {
        let mut config = Config::default();
        config.admin.api_key = TEST_ADMIN_KEY.to_string();
        Self {
            config,
            store: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Swap in a wrapped store (e.g. one that injects failures) while
    /// keeping the memory store underneath for assertions.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn build(self) -> TestServer {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn Store> = self.store.unwrap_or_else(|| memory.clone());
        let bus = MemoryBus::new();
        let source = bus.subscribe();
        let openai = Arc::new(MockProviderAdapter::new());
        let anthropic = Arc::new(MockProviderAdapter::new());

        let server = Server::from_parts(
            self.config,
            store,
            Arc::new(bus.clone()),
            Box::new(source),
            openai.clone(),
            anthropic.clone(),
        )
        .await;

        TestServer {
            server,
            store: memory,
            bus,
            openai,
            anthropic,
        }
    }
}

impl Default for TestServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Store wrapper that fails every usage-log append, for dead-letter tests.
pub struct FailingLogStore {
    inner: Arc<MemoryStore>,
}

impl FailingLogStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Store for FailingLogStore {
    async fn get_api_key(&self, api_key: &str) -> StorageResult<Option<ApiKeyRecord>> {
        self.inner.get_api_key(api_key).await
    }

    async fn get_account(&self, user_id: &str) -> StorageResult<Option<AccountRecord>> {
        self.inner.get_account(user_id).await
    }

    async fn get_model_cost(&self, model_name: &str) -> StorageResult<Option<ModelCostRecord>> {
        self.inner.get_model_cost(model_name).await
    }

    async fn increment_spent(
        &self,
        user_id: &str,
        delta_usd: Decimal,
    ) -> StorageResult<AccountRecord> {
        self.inner.increment_spent(user_id, delta_usd).await
    }

    async fn append_usage_log(&self, _log: &UsageLogRecord) -> StorageResult<()> {
        Err(StorageError::Database("injected log failure".to_string()))
    }

    async fn upsert_account(&self, record: &AccountRecord) -> StorageResult<()> {
        self.inner.upsert_account(record).await
    }

    async fn upsert_api_key(&self, record: &ApiKeyRecord) -> StorageResult<()> {
        self.inner.upsert_api_key(record).await
    }

    async fn upsert_model_cost(&self, record: &ModelCostRecord) -> StorageResult<()> {
        self.inner.upsert_model_cost(record).await
    }

    async fn list_model_costs(&self) -> StorageResult<Vec<ModelCostRecord>> {
        self.inner.list_model_costs().await
    }

    async fn get_usage_logs(
        &self,
        user_id: &str,
        limit: u32,
    ) -> StorageResult<Vec<UsageLogRecord>> {
        self.inner.get_usage_logs(user_id, limit).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.inner.health_check().await
    }

    async fn migrate(&self) -> StorageResult<()> {
        self.inner.migrate().await
    }
}
