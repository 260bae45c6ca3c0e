//! Per-instance auth cache: three time-bounded namespaces (API keys,
//! accounts, model costs) filled from the store and evicted by
//! invalidation events. Entries are capacity-bounded with LRU eviction;
//! concurrent misses for one key coalesce into a single store read.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::bus::{EventSource, InvalidationEvent, InvalidationKind};
use crate::config::CacheConfig;
use crate::storage::{AccountRecord, ApiKeyRecord, ModelCostRecord, StorageResult, Store};

struct Entry<T> {
    value: T,
    expires_at: Instant,
    last_used: u64,
}

struct Shard<T> {
    entries: HashMap<String, Entry<T>>,
    tick: u64,
}

/// One cache namespace: bounded, time-expiring map with LRU eviction and
/// per-key single-flight loads.
pub struct TtlCache<T> {
    shard: Mutex<Shard<T>>,
    flights: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    ttl: Duration,
    capacity: usize,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            shard: Mutex::new(Shard {
                entries: HashMap::new(),
                tick: 0,
            }),
            flights: AsyncMutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let mut shard = self.shard.lock().unwrap();
        shard.tick += 1;
        let tick = shard.tick;

        let expired = match shard.entries.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.last_used = tick;
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            shard.entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: &str, value: T) {
        let mut shard = self.shard.lock().unwrap();
        shard.tick += 1;
        let tick = shard.tick;

        if !shard.entries.contains_key(key) && shard.entries.len() >= self.capacity {
            let now = Instant::now();
            shard.entries.retain(|_, entry| entry.expires_at > now);
            if shard.entries.len() >= self.capacity {
                let lru = shard
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(key, _)| key.clone());
                if let Some(lru) = lru {
                    shard.entries.remove(&lru);
                }
            }
        }

        shard.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
                last_used: tick,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.shard.lock().unwrap().entries.remove(key);
    }

    pub fn clear(&self) {
        self.shard.lock().unwrap().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.shard.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache-aside read with per-key single-flight: while one task loads a
    /// key, other tasks asking for the same key wait and then re-check the
    /// cache instead of issuing their own store read. Negative results are
    /// not cached.
    pub async fn get_or_load<F, Fut>(&self, key: &str, load: F) -> StorageResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<Option<T>>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(Some(value));
        }

        let gate = {
            let mut flights = self.flights.lock().await;
            flights.entry(key.to_string()).or_default().clone()
        };
        let _guard = gate.lock().await;

        // A concurrent flight may have filled the entry while we waited.
        if let Some(value) = self.get(key) {
            return Ok(Some(value));
        }

        let result = load().await;
        if let Ok(Some(value)) = &result {
            self.insert(key, value.clone());
        }

        drop(_guard);
        let mut flights = self.flights.lock().await;
        if let Some(stored) = flights.get(key) {
            // The map holds one reference and `gate` holds another; anything
            // beyond that is a waiter that still needs the entry.
            if Arc::strong_count(stored) <= 2 {
                flights.remove(key);
            }
        }

        result
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub api_keys: usize,
    pub accounts: usize,
    pub model_costs: usize,
}

/// The three auth namespaces plus the store they fill from.
pub struct AuthCache {
    store: Arc<dyn Store>,
    api_keys: TtlCache<ApiKeyRecord>,
    accounts: TtlCache<AccountRecord>,
    model_costs: TtlCache<ModelCostRecord>,
}

impl AuthCache {
    pub fn new(store: Arc<dyn Store>, config: &CacheConfig) -> Self {
        let ttl = Duration::from_secs(config.ttl_seconds);
        Self {
            store,
            api_keys: TtlCache::new(ttl, config.max_entries),
            accounts: TtlCache::new(ttl, config.max_entries),
            model_costs: TtlCache::new(ttl, config.max_entries),
        }
    }

    pub async fn get_api_key(&self, api_key: &str) -> StorageResult<Option<ApiKeyRecord>> {
        let store = self.store.clone();
        let key = api_key.to_string();
        self.api_keys
            .get_or_load(api_key, move || async move { store.get_api_key(&key).await })
            .await
    }

    pub async fn get_account(&self, user_id: &str) -> StorageResult<Option<AccountRecord>> {
        let store = self.store.clone();
        let key = user_id.to_string();
        self.accounts
            .get_or_load(user_id, move || async move { store.get_account(&key).await })
            .await
    }

    pub async fn get_model_cost(&self, model_name: &str) -> StorageResult<Option<ModelCostRecord>> {
        let store = self.store.clone();
        let key = model_name.to_string();
        self.model_costs
            .get_or_load(model_name, move || async move {
                store.get_model_cost(&key).await
            })
            .await
    }

    /// Write-through refresh with the authoritative post-debit row, so the
    /// local budget gate sees new spending without waiting for the bus.
    pub fn put_account(&self, account: &AccountRecord) {
        self.accounts.insert(&account.user_id, account.clone());
    }

    pub fn invalidate(&self, kind: InvalidationKind, key: &str) {
        match kind {
            InvalidationKind::Account => self.accounts.remove(key),
            InvalidationKind::ApiKey => self.api_keys.remove(key),
            InvalidationKind::ModelCost => self.model_costs.remove(key),
        }
    }

    pub fn apply(&self, event: &InvalidationEvent) {
        self.invalidate(event.kind, &event.key);
    }

    pub fn invalidate_all(&self) {
        self.api_keys.clear();
        self.accounts.clear();
        self.model_costs.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            api_keys: self.api_keys.len(),
            accounts: self.accounts.len(),
            model_costs: self.model_costs.len(),
        }
    }
}

/// Drain an event source into the cache until the source closes.
pub fn spawn_invalidation_listener(
    cache: Arc<AuthCache>,
    mut source: Box<dyn EventSource>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = source.recv().await {
            tracing::debug!(kind = ?event.kind, key = %event.key, "applying invalidation event");
            cache.apply(&event);
        }
        tracing::warn!("invalidation event source closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::test_utils::{account, api_key};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache_config() -> CacheConfig {
        CacheConfig {
            ttl_seconds: 3600,
            max_entries: 10_000,
        }
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_millis(20), 16);
        cache.insert("k", "v".to_string());
        assert_eq!(cache.get("k"), Some("v".to_string()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_prefers_cold_entries() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert("a", 1);
        cache.insert("b", 2);

        // Touch "a" so "b" becomes the least recently used entry.
        assert_eq!(cache.get("a"), Some(1));

        cache.insert("c", 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_loads() {
        let cache: Arc<TtlCache<String>> = Arc::new(TtlCache::new(Duration::from_secs(60), 16));
        let loads = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let loads = loads.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_load("k", move || async move {
                            loads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok(Some("v".to_string()))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some("v".to_string()));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_lookups_are_not_cached() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60), 16);
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = cache
                .get_or_load("missing", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await
                .unwrap();
            assert_eq!(result, None);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_cache_fills_from_store() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_api_key(&api_key("sk-A", "u1")).await.unwrap();

        let cache = AuthCache::new(store.clone(), &cache_config());
        let loaded = cache.get_api_key("sk-A").await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "u1");
        assert_eq!(cache.stats().api_keys, 1);

        // A store-side delete is invisible until eviction.
        let mut deactivated = api_key("sk-A", "u1");
        deactivated.is_active = false;
        store.upsert_api_key(&deactivated).await.unwrap();
        assert!(cache.get_api_key("sk-A").await.unwrap().unwrap().is_active);

        cache.apply(&InvalidationEvent::api_key("sk-A"));
        assert!(!cache.get_api_key("sk-A").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_duplicate_invalidation_is_harmless() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_account(&account("u1", Decimal::from(10), Decimal::ZERO))
            .await
            .unwrap();

        let cache = AuthCache::new(store, &cache_config());
        cache.get_account("u1").await.unwrap().unwrap();

        let event = InvalidationEvent::account("u1");
        cache.apply(&event);
        cache.apply(&event);
        assert_eq!(cache.stats().accounts, 0);
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_account(&account("u1", Decimal::from(10), Decimal::ZERO))
            .await
            .unwrap();
        store.upsert_api_key(&api_key("sk-A", "u1")).await.unwrap();

        let cache = AuthCache::new(store, &cache_config());
        cache.get_account("u1").await.unwrap();
        cache.get_api_key("sk-A").await.unwrap();

        cache.invalidate_all();
        let stats = cache.stats();
        assert_eq!(stats.accounts + stats.api_keys + stats.model_costs, 0);
    }
}
