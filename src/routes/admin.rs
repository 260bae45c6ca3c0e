//! Admin surface: account, key, and pricing mutations.
//!
//! Every successful mutation publishes the matching invalidation event
//! after the store write commits, which is what bounds admin-induced cache
//! staleness to the bus propagation delay.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post, put},
};
use chrono::Utc;
use rand::{Rng, distr::Alphanumeric};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::bus::InvalidationEvent;
use crate::error::AppError;
use crate::server::Server;
use crate::storage::{
    AccountRecord, ApiKeyRecord, BudgetDuration, ModelCostRecord, UsageLogRecord,
};

const GENERATED_KEY_PREFIX: &str = "sk-gw-";
const GENERATED_KEY_LENGTH: usize = 32;

pub fn admin_routes() -> Router<Server> {
    Router::new()
        .route("/accounts", put(upsert_account))
        .route("/accounts/{user_id}", get(get_account))
        .route("/accounts/{user_id}/reset", post(reset_spent))
        .route("/keys", put(upsert_api_key))
        .route("/model-costs", put(upsert_model_cost))
        .route("/model-costs", get(list_model_costs))
        .route("/usage/{user_id}", get(get_usage))
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct UpsertAccountRequest {
    user_id: String,
    account_name: Option<String>,
    budget_usd: Decimal,
    #[serde(default)]
    budget_duration: BudgetDuration,
    #[serde(default = "default_true")]
    is_active: bool,
}

async fn upsert_account(
    State(server): State<Server>,
    Json(request): Json<UpsertAccountRequest>,
) -> Result<Json<AccountRecord>, AppError> {
    if request.budget_usd < Decimal::ZERO {
        return Err(AppError::InvalidRequest(
            "budget_usd must be non-negative".to_string(),
        ));
    }

    let now = Utc::now();
    let existing = server.store.get_account(&request.user_id).await?;
    let account = AccountRecord {
        user_id: request.user_id.clone(),
        account_name: request.account_name,
        budget_usd: request.budget_usd,
        spent_usd: existing
            .as_ref()
            .map(|account| account.spent_usd)
            .unwrap_or(Decimal::ZERO),
        budget_duration: request.budget_duration,
        is_active: request.is_active,
        created_at: existing
            .as_ref()
            .map(|account| account.created_at)
            .unwrap_or(now),
        updated_at: now,
    };

    server.store.upsert_account(&account).await?;
    publish(&server, InvalidationEvent::account(account.user_id.as_str())).await;

    Ok(Json(account))
}

async fn get_account(
    State(server): State<Server>,
    Path(user_id): Path<String>,
) -> Result<Json<AccountRecord>, AppError> {
    let account = server
        .store
        .get_account(&user_id)
        .await?
        .ok_or_else(|| AppError::InvalidRequest(format!("no such account: {user_id}")))?;
    Ok(Json(account))
}

/// Admin reset: the one sanctioned path that lowers `spent_usd`.
async fn reset_spent(
    State(server): State<Server>,
    Path(user_id): Path<String>,
) -> Result<Json<AccountRecord>, AppError> {
    let mut account = server
        .store
        .get_account(&user_id)
        .await?
        .ok_or_else(|| AppError::InvalidRequest(format!("no such account: {user_id}")))?;

    account.spent_usd = Decimal::ZERO;
    account.updated_at = Utc::now();
    server.store.upsert_account(&account).await?;
    publish(&server, InvalidationEvent::account(user_id.as_str())).await;

    Ok(Json(account))
}

#[derive(Debug, Deserialize)]
struct UpsertApiKeyRequest {
    /// Omitted on create; a fresh key is generated.
    api_key: Option<String>,
    user_id: String,
    key_name: String,
    #[serde(default = "default_true")]
    is_active: bool,
    allowed_models: Option<Vec<String>>,
}

async fn upsert_api_key(
    State(server): State<Server>,
    Json(request): Json<UpsertApiKeyRequest>,
) -> Result<Json<ApiKeyRecord>, AppError> {
    let api_key = request.api_key.unwrap_or_else(generate_api_key);
    let now = Utc::now();
    let existing = server.store.get_api_key(&api_key).await?;

    let record = ApiKeyRecord {
        api_key: api_key.clone(),
        user_id: request.user_id,
        key_name: request.key_name,
        is_active: request.is_active,
        allowed_models: request.allowed_models,
        created_at: existing.as_ref().map(|key| key.created_at).unwrap_or(now),
        updated_at: now,
    };

    server.store.upsert_api_key(&record).await?;
    publish(&server, InvalidationEvent::api_key(api_key.as_str())).await;

    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct UpsertModelCostRequest {
    model_name: String,
    provider: String,
    input_cost_per_million_tokens_usd: Decimal,
    output_cost_per_million_tokens_usd: Decimal,
    #[serde(default)]
    cache_read_cost_per_million_tokens_usd: Decimal,
    #[serde(default)]
    cache_write_cost_per_million_tokens_usd: Decimal,
}

async fn upsert_model_cost(
    State(server): State<Server>,
    Json(request): Json<UpsertModelCostRequest>,
) -> Result<Json<ModelCostRecord>, AppError> {
    let rates = [
        request.input_cost_per_million_tokens_usd,
        request.output_cost_per_million_tokens_usd,
        request.cache_read_cost_per_million_tokens_usd,
        request.cache_write_cost_per_million_tokens_usd,
    ];
    if rates.iter().any(|rate| *rate < Decimal::ZERO) {
        return Err(AppError::InvalidRequest(
            "cost rates must be non-negative".to_string(),
        ));
    }

    let record = ModelCostRecord {
        model_name: request.model_name.clone(),
        provider: request.provider,
        input_cost_per_million_tokens_usd: request.input_cost_per_million_tokens_usd,
        output_cost_per_million_tokens_usd: request.output_cost_per_million_tokens_usd,
        cache_read_cost_per_million_tokens_usd: request.cache_read_cost_per_million_tokens_usd,
        cache_write_cost_per_million_tokens_usd: request.cache_write_cost_per_million_tokens_usd,
        updated_at: Utc::now(),
    };

    server.store.upsert_model_cost(&record).await?;
    publish(
        &server,
        InvalidationEvent::model_cost(record.model_name.as_str()),
    )
    .await;

    Ok(Json(record))
}

async fn list_model_costs(
    State(server): State<Server>,
) -> Result<Json<Vec<ModelCostRecord>>, AppError> {
    Ok(Json(server.store.list_model_costs().await?))
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    limit: Option<u32>,
}

async fn get_usage(
    State(server): State<Server>,
    Path(user_id): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Vec<UsageLogRecord>>, AppError> {
    let limit = query.limit.unwrap_or(50).min(1000);
    Ok(Json(server.store.get_usage_logs(&user_id, limit).await?))
}

/// Publish an invalidation for a committed write. A publish failure leaves
/// peers stale until their TTL, which the staleness bound already covers.
async fn publish(server: &Server, event: InvalidationEvent) {
    if let Err(e) = server.bus.publish(event.clone()).await {
        tracing::error!(error = %e, kind = ?event.kind, key = %event.key,
            "failed to publish invalidation event");
    }
    // The local instance evicts directly rather than waiting for the bus.
    server.cache.apply(&event);
}

fn generate_api_key() -> String {
    let random_part: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_KEY_LENGTH)
        .map(char::from)
        .collect();
    format!("{GENERATED_KEY_PREFIX}{random_part}")
}
