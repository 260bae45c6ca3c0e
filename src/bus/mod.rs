//! Cluster-wide pub/sub of cache-invalidation events.
//!
//! Admin writers publish through an [`EventSink`] after their store write
//! commits; each instance's auth cache drains an [`EventSource`]. Delivery
//! is at-least-once and unordered; eviction is idempotent, so duplicates
//! and reordering are harmless. Lost events are bounded by the cache TTL.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::BusConfig;
use crate::health::{HealthCheckResult, HealthChecker};

pub mod memory;
pub mod redis;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("publish error: {0}")]
    Publish(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Which cache namespace an event evicts from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationKind {
    Account,
    ApiKey,
    ModelCost,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    #[serde(rename = "type")]
    pub kind: InvalidationKind,
    pub key: String,
}

impl InvalidationEvent {
    pub fn account(user_id: impl Into<String>) -> Self {
        Self {
            kind: InvalidationKind::Account,
            key: user_id.into(),
        }
    }

    pub fn api_key(api_key: impl Into<String>) -> Self {
        Self {
            kind: InvalidationKind::ApiKey,
            key: api_key.into(),
        }
    }

    pub fn model_cost(model_name: impl Into<String>) -> Self {
        Self {
            kind: InvalidationKind::ModelCost,
            key: model_name.into(),
        }
    }
}

/// Decode a wire message leniently: an unknown `type` is logged and dropped
/// rather than failing the listener.
pub fn decode_event(payload: &[u8]) -> Option<InvalidationEvent> {
    match serde_json::from_slice::<InvalidationEvent>(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(
                error = %e,
                payload = %String::from_utf8_lossy(payload),
                "ignoring malformed invalidation event"
            );
            None
        }
    }
}

/// Publisher half, called by admin writers after the store commit.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: InvalidationEvent) -> BusResult<()>;

    async fn health_check(&self) -> BusResult<()>;

    fn backend(&self) -> &str;
}

/// Subscriber half; one per instance, drained by the cache listener task.
/// `recv` returning `None` means the source is permanently closed.
#[async_trait]
pub trait EventSource: Send {
    async fn recv(&mut self) -> Option<InvalidationEvent>;
}

/// Create the bus backend selected by configuration, returning the shared
/// sink and this instance's subscription.
pub async fn connect(config: &BusConfig) -> BusResult<(Arc<dyn EventSink>, Box<dyn EventSource>)> {
    match config.backend.as_str() {
        "memory" => {
            let bus = memory::MemoryBus::new();
            let source = bus.subscribe();
            Ok((Arc::new(bus), Box::new(source)))
        }
        "redis" => {
            let sink = redis::RedisBus::connect(&config.url).await?;
            let source = redis::RedisSource::spawn(&config.url);
            Ok((Arc::new(sink), Box::new(source)))
        }
        other => Err(BusError::InvalidData(format!(
            "unknown bus backend: {other}"
        ))),
    }
}

/// Health checker adapter for the bus.
pub struct BusHealthChecker {
    sink: Arc<dyn EventSink>,
}

impl BusHealthChecker {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl HealthChecker for BusHealthChecker {
    fn name(&self) -> &str {
        "bus"
    }

    async fn check(&self) -> HealthCheckResult {
        match self.sink.health_check().await {
            Ok(()) => HealthCheckResult::healthy(),
            Err(e) => HealthCheckResult::unhealthy(format!("bus health check failed: {e}")),
        }
    }
}
