use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{
    AccountRecord, ApiKeyRecord, ModelCostRecord, StorageError, StorageResult, Store,
    UsageLogRecord,
};

/// In-memory store backend. Debits take the accounts write lock for the
/// full read-modify-write, which gives the same serialization as the
/// database's atomic increment.
#[derive(Default)]
pub struct MemoryStore {
    accounts: RwLock<HashMap<String, AccountRecord>>,
    api_keys: RwLock<HashMap<String, ApiKeyRecord>>,
    model_costs: RwLock<HashMap<String, ModelCostRecord>>,
    usage_logs: RwLock<Vec<UsageLogRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All usage logs in append order, for assertions.
    pub async fn usage_logs(&self) -> Vec<UsageLogRecord> {
        self.usage_logs.read().await.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_api_key(&self, api_key: &str) -> StorageResult<Option<ApiKeyRecord>> {
        Ok(self.api_keys.read().await.get(api_key).cloned())
    }

    async fn get_account(&self, user_id: &str) -> StorageResult<Option<AccountRecord>> {
        Ok(self.accounts.read().await.get(user_id).cloned())
    }

    async fn get_model_cost(&self, model_name: &str) -> StorageResult<Option<ModelCostRecord>> {
        Ok(self.model_costs.read().await.get(model_name).cloned())
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

        let mut accounts = self.accounts.write().await;
        let account = accounts.get_mut(user_id).ok_or(StorageError::NotFound)?;
        account.spent_usd += delta_usd;
        account.updated_at = Utc::now();
        Ok(account.clone())
    }

    async fn append_usage_log(&self, log: &UsageLogRecord) -> StorageResult<()> {
        self.usage_logs.write().await.push(log.clone());
        Ok(())
    }

    async fn upsert_account(&self, account: &AccountRecord) -> StorageResult<()> {
        self.accounts
            .write()
            .await
            .insert(account.user_id.clone(), account.clone());
        Ok(())
    }

    async fn upsert_api_key(&self, key: &ApiKeyRecord) -> StorageResult<()> {
        self.api_keys
            .write()
            .await
            .insert(key.api_key.clone(), key.clone());
        Ok(())
    }

    async fn upsert_model_cost(&self, cost: &ModelCostRecord) -> StorageResult<()> {
        self.model_costs
            .write()
            .await
            .insert(cost.model_name.clone(), cost.clone());
        Ok(())
    }

    async fn list_model_costs(&self) -> StorageResult<Vec<ModelCostRecord>> {
        let mut costs: Vec<_> = self.model_costs.read().await.values().cloned().collect();
        costs.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        Ok(costs)
    }

    async fn get_usage_logs(
        &self,
        user_id: &str,
        limit: u32,
    ) -> StorageResult<Vec<UsageLogRecord>> {
        let logs = self.usage_logs.read().await;
        Ok(logs
            .iter()
            .rev()
            .filter(|log| log.user_id == user_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn migrate(&self) -> StorageResult<()> {
        Ok(())
    }
}
