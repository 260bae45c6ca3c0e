use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{Pool, Postgres, Row, migrate::MigrateDatabase, postgres::PgPoolOptions, postgres::PgRow};

use super::{
    AccountRecord, ApiKeyRecord, BudgetDuration, ModelCostRecord, StorageError, StorageResult,
    Store, UsageLogRecord,
};

/// Idempotent schema for the four collections and their lookup indexes.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    user_id TEXT PRIMARY KEY,
    account_name TEXT,
    budget_usd NUMERIC(20,10) NOT NULL DEFAULT 0,
    spent_usd NUMERIC(20,10) NOT NULL DEFAULT 0,
    budget_duration TEXT NOT NULL DEFAULT 'total',
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS apikeys (
    api_key TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    key_name TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    allowed_models JSONB,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS apikeys_user_id_idx ON apikeys (user_id);

CREATE TABLE IF NOT EXISTS modelcosts (
    model_name TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    input_cost_per_million_tokens_usd NUMERIC(20,10) NOT NULL,
    output_cost_per_million_tokens_usd NUMERIC(20,10) NOT NULL,
    cache_read_cost_per_million_tokens_usd NUMERIC(20,10) NOT NULL DEFAULT 0,
    cache_write_cost_per_million_tokens_usd NUMERIC(20,10) NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS usagelogs (
    id BIGSERIAL PRIMARY KEY,
    user_id TEXT NOT NULL,
    api_key TEXT NOT NULL,
    model_name TEXT NOT NULL,
    request_endpoint TEXT NOT NULL,
    ip_address TEXT,
    input_tokens BIGINT NOT NULL,
    output_tokens BIGINT NOT NULL,
    cache_read_tokens BIGINT NOT NULL,
    cache_write_tokens BIGINT NOT NULL,
    total_tokens BIGINT NOT NULL,
    is_cache_hit BOOLEAN NOT NULL,
    cost_usd NUMERIC(20,10) NOT NULL,
    pricing_missing BOOLEAN NOT NULL DEFAULT FALSE,
    request_payload JSONB NOT NULL,
    response_payload JSONB NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS usagelogs_user_time_idx ON usagelogs (user_id, timestamp);
"#;

/// Postgres store backend.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    pub async fn connect(uri: &str, db_name: &str) -> StorageResult<Self> {
        let url = format!("{}/{}", uri.trim_end_matches('/'), db_name);

        if !Postgres::database_exists(&url).await.unwrap_or(false) {
            Postgres::create_database(&url)
                .await
                .map_err(|e| StorageError::Connection(format!("failed to create database: {e}")))?;
        }

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&url)
            .await
            .map_err(|e| StorageError::Connection(format!("failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    fn map_account(row: &PgRow) -> StorageResult<AccountRecord> {
        Ok(AccountRecord {
            user_id: row.get("user_id"),
            account_name: row.get("account_name"),
            budget_usd: row.get("budget_usd"),
            spent_usd: row.get("spent_usd"),
            budget_duration: BudgetDuration::parse(row.get::<&str, _>("budget_duration"))?,
            is_active: row.get("is_active"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn map_api_key(row: &PgRow) -> StorageResult<ApiKeyRecord> {
        let allowed_models = row
            .get::<Option<serde_json::Value>, _>("allowed_models")
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StorageError::InvalidData(format!("bad allowed_models: {e}")))?;

        Ok(ApiKeyRecord {
            api_key: row.get("api_key"),
            user_id: row.get("user_id"),
            key_name: row.get("key_name"),
            is_active: row.get("is_active"),
            allowed_models,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn map_model_cost(row: &PgRow) -> ModelCostRecord {
        ModelCostRecord {
            model_name: row.get("model_name"),
            provider: row.get("provider"),
            input_cost_per_million_tokens_usd: row.get("input_cost_per_million_tokens_usd"),
            output_cost_per_million_tokens_usd: row.get("output_cost_per_million_tokens_usd"),
            cache_read_cost_per_million_tokens_usd: row
                .get("cache_read_cost_per_million_tokens_usd"),
            cache_write_cost_per_million_tokens_usd: row
                .get("cache_write_cost_per_million_tokens_usd"),
            updated_at: row.get("updated_at"),
        }
    }

    fn map_usage_log(row: &PgRow) -> UsageLogRecord {
        UsageLogRecord {
            user_id: row.get("user_id"),
            api_key: row.get("api_key"),
            model_name: row.get("model_name"),
            request_endpoint: row.get("request_endpoint"),
            ip_address: row.get("ip_address"),
            input_tokens: row.get::<i64, _>("input_tokens") as u64,
            output_tokens: row.get::<i64, _>("output_tokens") as u64,
            cache_read_tokens: row.get::<i64, _>("cache_read_tokens") as u64,
            cache_write_tokens: row.get::<i64, _>("cache_write_tokens") as u64,
            total_tokens: row.get::<i64, _>("total_tokens") as u64,
            is_cache_hit: row.get("is_cache_hit"),
            cost_usd: row.get("cost_usd"),
            pricing_missing: row.get("pricing_missing"),
            request_payload: row.get("request_payload"),
            response_payload: row.get("response_payload"),
            timestamp: row.get("timestamp"),
        }
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_api_key(&self, api_key: &str) -> StorageResult<Option<ApiKeyRecord>> {
        let row = sqlx::query("SELECT * FROM apikeys WHERE api_key = $1")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        row.as_ref().map(Self::map_api_key).transpose()
    }

    async fn get_account(&self, user_id: &str) -> StorageResult<Option<AccountRecord>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        row.as_ref().map(Self::map_account).transpose()
    }

    async fn get_model_cost(&self, model_name: &str) -> StorageResult<Option<ModelCostRecord>> {
        let row = sqlx::query("SELECT * FROM modelcosts WHERE model_name = $1")
            .bind(model_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(row.as_ref().map(Self::map_model_cost))
    }

    async fn increment_spent(
        &self,
        user_id: &str,
        delta_usd: Decimal,
    ) -> StorageResult<AccountRecord> {
        if delta_usd < Decimal::ZERO {
            return Err(StorageError::InvalidData(
                "spend increment must be non-negative".to_string(),
            ));
        }

        // Single-statement atomic increment; never read-then-write.
        let row = sqlx::query(
            "UPDATE accounts SET spent_usd = spent_usd + $2, updated_at = NOW() \
             WHERE user_id = $1 RETURNING *",
        )
        .bind(user_id)
        .bind(delta_usd)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        match row {
            Some(row) => Self::map_account(&row),
            None => Err(StorageError::NotFound),
        }
    }

    async fn append_usage_log(&self, log: &UsageLogRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO usagelogs (user_id, api_key, model_name, request_endpoint, ip_address, \
             input_tokens, output_tokens, cache_read_tokens, cache_write_tokens, total_tokens, \
             is_cache_hit, cost_usd, pricing_missing, request_payload, response_payload, timestamp) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(&log.user_id)
        .bind(&log.api_key)
        .bind(&log.model_name)
        .bind(&log.request_endpoint)
        .bind(&log.ip_address)
        .bind(log.input_tokens as i64)
        .bind(log.output_tokens as i64)
        .bind(log.cache_read_tokens as i64)
        .bind(log.cache_write_tokens as i64)
        .bind(log.total_tokens as i64)
        .bind(log.is_cache_hit)
        .bind(log.cost_usd)
        .bind(log.pricing_missing)
        .bind(&log.request_payload)
        .bind(&log.response_payload)
        .bind(log.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    async fn upsert_account(&self, account: &AccountRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO accounts (user_id, account_name, budget_usd, spent_usd, budget_duration, \
             is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (user_id) DO UPDATE SET \
                 account_name = EXCLUDED.account_name, \
                 budget_usd = EXCLUDED.budget_usd, \
                 spent_usd = EXCLUDED.spent_usd, \
                 budget_duration = EXCLUDED.budget_duration, \
                 is_active = EXCLUDED.is_active, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(&account.user_id)
        .bind(&account.account_name)
        .bind(account.budget_usd)
        .bind(account.spent_usd)
        .bind(account.budget_duration.as_str())
        .bind(account.is_active)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    async fn upsert_api_key(&self, key: &ApiKeyRecord) -> StorageResult<()> {
        let allowed_models = key
            .allowed_models
            .as_ref()
            .map(|models| serde_json::json!(models));

        sqlx::query(
            "INSERT INTO apikeys (api_key, user_id, key_name, is_active, allowed_models, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (api_key) DO UPDATE SET \
                 user_id = EXCLUDED.user_id, \
                 key_name = EXCLUDED.key_name, \
                 is_active = EXCLUDED.is_active, \
                 allowed_models = EXCLUDED.allowed_models, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(&key.api_key)
        .bind(&key.user_id)
        .bind(&key.key_name)
        .bind(key.is_active)
        .bind(allowed_models)
        .bind(key.created_at)
        .bind(key.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    async fn upsert_model_cost(&self, cost: &ModelCostRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO modelcosts (model_name, provider, input_cost_per_million_tokens_usd, \
             output_cost_per_million_tokens_usd, cache_read_cost_per_million_tokens_usd, \
             cache_write_cost_per_million_tokens_usd, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (model_name) DO UPDATE SET \
                 provider = EXCLUDED.provider, \
                 input_cost_per_million_tokens_usd = EXCLUDED.input_cost_per_million_tokens_usd, \
                 output_cost_per_million_tokens_usd = EXCLUDED.output_cost_per_million_tokens_usd, \
                 cache_read_cost_per_million_tokens_usd = EXCLUDED.cache_read_cost_per_million_tokens_usd, \
                 cache_write_cost_per_million_tokens_usd = EXCLUDED.cache_write_cost_per_million_tokens_usd, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(&cost.model_name)
        .bind(&cost.provider)
        .bind(cost.input_cost_per_million_tokens_usd)
        .bind(cost.output_cost_per_million_tokens_usd)
        .bind(cost.cache_read_cost_per_million_tokens_usd)
        .bind(cost.cache_write_cost_per_million_tokens_usd)
        .bind(cost.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    async fn list_model_costs(&self) -> StorageResult<Vec<ModelCostRecord>> {
        let rows = sqlx::query("SELECT * FROM modelcosts ORDER BY model_name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::map_model_cost).collect())
    }

    async fn get_usage_logs(
        &self,
        user_id: &str,
        limit: u32,
    ) -> StorageResult<Vec<UsageLogRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM usagelogs WHERE user_id = $1 ORDER BY timestamp DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::map_usage_log).collect())
    }

    async fn health_check(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn migrate(&self) -> StorageResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Database(format!("migration failed: {e}")))?;
        tracing::info!("store schema is up to date");
        Ok(())
    }
}
