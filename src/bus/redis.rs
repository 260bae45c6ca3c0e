use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{BusError, BusResult, EventSink, EventSource, InvalidationEvent, decode_event};

/// Redis channel carrying invalidation events, shared with the admin surface.
pub const INVALIDATION_CHANNEL: &str = "cache_invalidation";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const SOURCE_BUFFER: usize = 1024;

/// Publisher over a managed Redis connection.
pub struct RedisBus {
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = Client::open(url)
            .map_err(|e| BusError::Connection(format!("redis client error: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BusError::Connection(format!("redis connection error: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl EventSink for RedisBus {
    async fn publish(&self, event: InvalidationEvent) -> BusResult<()> {
        let payload =
            serde_json::to_string(&event).map_err(|e| BusError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(INVALIDATION_CHANNEL, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn health_check(&self) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(())
    }

    fn backend(&self) -> &str {
        "redis"
    }
}

/// Subscription that survives Redis restarts: on a dropped connection it
/// reconnects with bounded backoff and resubscribes. No backfill is
/// attempted; staleness during the gap is bounded by the cache TTL.
pub struct RedisSource {
    rx: mpsc::Receiver<InvalidationEvent>,
    task: JoinHandle<()>,
}

impl RedisSource {
    pub fn spawn(url: &str) -> Self {
        let (tx, rx) = mpsc::channel(SOURCE_BUFFER);
        let url = url.to_string();
        let task = tokio::spawn(async move {
            subscription_loop(&url, tx).await;
        });
        Self { rx, task }
    }
}

#[async_trait]
impl EventSource for RedisSource {
    async fn recv(&mut self) -> Option<InvalidationEvent> {
        self.rx.recv().await
    }
}

impl Drop for RedisSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn subscription_loop(url: &str, tx: mpsc::Sender<InvalidationEvent>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match listen_once(url, &tx).await {
            Ok(()) => {
                // The forwarding channel closed: the instance is shutting down.
                return;
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retry_in_secs = backoff.as_secs(),
                    "invalidation subscription lost; reconnecting"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Subscribe and forward events until the connection or the channel dies.
/// `Ok` means the receiver side is gone; `Err` means the connection broke.
async fn listen_once(url: &str, tx: &mpsc::Sender<InvalidationEvent>) -> BusResult<()> {
    let client =
        Client::open(url).map_err(|e| BusError::Connection(format!("redis client error: {e}")))?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| BusError::Connection(format!("redis pubsub error: {e}")))?;
    pubsub
        .subscribe(INVALIDATION_CHANNEL)
        .await
        .map_err(|e| BusError::Connection(format!("redis subscribe error: {e}")))?;

    tracing::info!(channel = INVALIDATION_CHANNEL, "invalidation subscription established");

    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        if let Some(event) = decode_event(message.get_payload_bytes()) {
            if tx.send(event).await.is_err() {
                return Ok(());
            }
        }
    }

    Err(BusError::Connection(
        "redis pubsub stream ended".to_string(),
    ))
}
