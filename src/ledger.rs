//! Budget predicate and post-flight settlement.
//!
//! Settlement is best-effort-atomic: the spend increment always runs
//! before the audit append, so a failure in between can lose an audit row
//! but can never under-debit. Lost rows go to the dead-letter log.

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;

use crate::bus::{EventSink, InvalidationEvent};
use crate::cache::AuthCache;
use crate::error::AppError;
use crate::pricing::{Pricing, PricingError};
use crate::providers::Usage;
use crate::storage::{AccountRecord, StorageResult, Store, UsageLogRecord};

pub struct Ledger {
    store: Arc<dyn Store>,
    pricing: Pricing,
    cache: Arc<AuthCache>,
    bus: Arc<dyn EventSink>,
}

/// Everything settlement needs, captured before the upstream call returns.
#[derive(Clone, Debug)]
pub struct SettleRequest {
    pub user_id: String,
    pub api_key: String,
    pub model_name: String,
    pub request_endpoint: String,
    pub ip_address: Option<String>,
    /// `None` when the stream ended without a usage trailer.
    pub usage: Option<Usage>,
    pub request_payload: Value,
    pub response_payload: Value,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SettleOutcome {
    pub cost_usd: Decimal,
    pub pricing_missing: bool,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn Store>,
        pricing: Pricing,
        cache: Arc<AuthCache>,
        bus: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            pricing,
            cache,
            bus,
        }
    }

    /// Pure comparison on the resolver's snapshot; never a store read.
    /// A zero budget always fails: `spent_usd` is non-negative, so an
    /// account with no positive allowance is over budget from the start.
    pub fn precheck(account: &AccountRecord) -> Result<(), AppError> {
        if account.is_over_budget() {
            return Err(AppError::BudgetExceeded(format!(
                "budget exceeded: spent ${} of ${}",
                account.spent_usd, account.budget_usd
            )));
        }
        Ok(())
    }

    /// Price, debit, then append the audit row. Called exactly once per
    /// completed upstream call.
    pub async fn settle(&self, request: SettleRequest) -> StorageResult<SettleOutcome> {
        let (usage, usage_available) = match request.usage {
            Some(usage) => (usage, true),
            None => (Usage::default(), false),
        };

        let (cost_usd, pricing_missing) = if !usage_available {
            tracing::error!(
                user_id = %request.user_id,
                model = %request.model_name,
                "call completed without reported usage; logging without debit"
            );
            (Decimal::ZERO, true)
        } else {
            match self.pricing.cost_for(&request.model_name, &usage).await {
                Ok(cost) => (cost, false),
                Err(PricingError::Unpriced(model)) => {
                    tracing::error!(
                        user_id = %request.user_id,
                        %model,
                        "no pricing row for model; usage logged without debit"
                    );
                    (Decimal::ZERO, true)
                }
                Err(PricingError::Storage(e)) => return Err(e),
            }
        };

        if cost_usd > Decimal::ZERO {
            let updated = self
                .store
                .increment_spent(&request.user_id, cost_usd)
                .await?;

            // Refresh this instance's snapshot and tell peers to drop
            // theirs, so the budget gate sees the new spending promptly.
            self.cache.put_account(&updated);
            if let Err(e) = self
                .bus
                .publish(InvalidationEvent::account(request.user_id.as_str()))
                .await
            {
                tracing::warn!(
                    error = %e,
                    user_id = %request.user_id,
                    "failed to publish account invalidation after debit"
                );
            }

            tracing::info!(
                user_id = %request.user_id,
                model = %request.model_name,
                cost_usd = %cost_usd,
                total_tokens = usage.total(),
                "account debited"
            );
        }

        let log = UsageLogRecord {
            user_id: request.user_id,
            api_key: request.api_key,
            model_name: request.model_name,
            request_endpoint: request.request_endpoint,
            ip_address: request.ip_address,
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
            total_tokens: 0,
            is_cache_hit: false,
            cost_usd,
            pricing_missing,
            request_payload: request.request_payload,
            response_payload: request.response_payload,
            timestamp: Utc::now(),
        }
        .with_usage(&usage);

        if let Err(e) = self.store.append_usage_log(&log).await {
            let payload = serde_json::to_string(&log)
                .unwrap_or_else(|_| format!("user_id={} cost={}", log.user_id, log.cost_usd));
            tracing::error!(
                target: "dead_letter",
                error = %e,
                %payload,
                "usage log append failed after debit"
            );
        }

        Ok(SettleOutcome {
            cost_usd,
            pricing_missing,
        })
    }
}
