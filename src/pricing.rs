//! Per-call cost computation from the pricing catalog.

use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;

use crate::cache::AuthCache;
use crate::providers::Usage;
use crate::storage::{ModelCostRecord, StorageError};

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("no pricing for model: {0}")]
    Unpriced(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Looks up model rates through the auth cache and prices a usage value.
pub struct Pricing {
    cache: Arc<AuthCache>,
}

impl Pricing {
    pub fn new(cache: Arc<AuthCache>) -> Self {
        Self { cache }
    }

    pub async fn cost_for(&self, model_name: &str, usage: &Usage) -> Result<Decimal, PricingError> {
        let cost = self
            .cache
            .get_model_cost(model_name)
            .await?
            .ok_or_else(|| PricingError::Unpriced(model_name.to_string()))?;
        Ok(compute_cost(&cost, usage))
    }
}

/// Decimal throughout; rates are USD per million tokens, so the result is
/// exact to well below a microdollar.
pub fn compute_cost(cost: &ModelCostRecord, usage: &Usage) -> Decimal {
    let per_million = Decimal::from(1_000_000u64);
    Decimal::from(usage.input_tokens) * cost.input_cost_per_million_tokens_usd / per_million
        + Decimal::from(usage.output_tokens) * cost.output_cost_per_million_tokens_usd / per_million
        + Decimal::from(usage.cache_read_tokens) * cost.cache_read_cost_per_million_tokens_usd
            / per_million
        + Decimal::from(usage.cache_write_tokens) * cost.cache_write_cost_per_million_tokens_usd
            / per_million
}
