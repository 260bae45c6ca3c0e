use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{BusResult, EventSink, EventSource, InvalidationEvent};

const CHANNEL_CAPACITY: usize = 1024;

/// In-process bus backed by a broadcast channel. Every subscription sees
/// every published event, so tests can model several gateway instances
/// sharing one bus.
#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<InvalidationEvent>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> MemorySource {
        MemorySource {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for MemoryBus {
    async fn publish(&self, event: InvalidationEvent) -> BusResult<()> {
        // A send error only means there are no subscribers right now, which
        // matches pub/sub semantics: the event is simply not delivered.
        let _ = self.tx.send(event);
        Ok(())
    }

    async fn health_check(&self) -> BusResult<()> {
        Ok(())
    }

    fn backend(&self) -> &str {
        "memory"
    }
}

pub struct MemorySource {
    rx: broadcast::Receiver<InvalidationEvent>,
}

#[async_trait]
impl EventSource for MemorySource {
    async fn recv(&mut self) -> Option<InvalidationEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "invalidation subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
