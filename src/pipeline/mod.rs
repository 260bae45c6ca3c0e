//! Request lifecycle engine: dispatch to the provider adapter and
//! guarantee exactly-once settlement per completed call.
//!
//! Per-request state machine: authenticated and budget-checked callers
//! arrive here, the body is dispatched by endpoint dialect, and settlement
//! runs synchronously for unary calls or in a tracked background task for
//! streams (the client connection closes as soon as the last chunk is
//! forwarded).

use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::AppError;
use crate::ledger::{Ledger, SettleRequest};
use crate::providers::{Dialect, ForwardRequest, ProviderAdapter, ProviderKind, ProviderReply};

/// Registry of in-flight background settlements. Graceful shutdown and the
/// test suite use it as the internal observer: once `wait_idle` returns,
/// every settlement for acknowledged requests has completed.
#[derive(Clone, Default)]
pub struct SettlementTracker {
    tasks: Arc<RwLock<HashMap<u64, JoinHandle<()>>>>,
    counter: Arc<AtomicU64>,
}

impl SettlementTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(task);
        self.tasks.write().await.insert(id, handle);
    }

    pub async fn active_tasks(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Wait for all registered settlements to finish. Returns false if the
    /// timeout elapsed with work still outstanding.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut tasks = self.tasks.write().await;
                let ids: Vec<u64> = tasks.keys().copied().collect();
                ids.into_iter().filter_map(|id| tasks.remove(&id)).collect()
            };
            if drained.is_empty() {
                return true;
            }
            for handle in drained {
                match tokio::time::timeout_at(deadline, handle).await {
                    Ok(_) => {}
                    Err(_) => return false,
                }
            }
        }
    }

    pub async fn abort_all(&self) {
        for (_, handle) in self.tasks.write().await.drain() {
            handle.abort();
        }
    }
}

pub struct RequestPipeline {
    ledger: Arc<Ledger>,
    openai: Arc<dyn ProviderAdapter>,
    anthropic: Arc<dyn ProviderAdapter>,
    settlements: SettlementTracker,
    upstream_timeout: Duration,
}

impl RequestPipeline {
    pub fn new(
        ledger: Arc<Ledger>,
        openai: Arc<dyn ProviderAdapter>,
        anthropic: Arc<dyn ProviderAdapter>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            openai,
            anthropic,
            settlements: SettlementTracker::new(),
            upstream_timeout,
        }
    }

    pub fn settlements(&self) -> &SettlementTracker {
        &self.settlements
    }

    /// Drive one inbound call end to end. Any error returned here happened
    /// before upstream dispatch; after dispatch the upstream outcome is
    /// always relayed and ledger failures go to the dead-letter log.
    pub async fn handle(
        &self,
        dialect: Dialect,
        principal: Principal,
        body: Bytes,
        client_ip: Option<String>,
        request_id: Uuid,
    ) -> Result<Response, AppError> {
        let payload: Value = serde_json::from_slice(&body)
            .map_err(|e| AppError::InvalidRequest(format!("invalid JSON body: {e}")))?;
        let model = payload
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::InvalidRequest("missing model field".to_string()))?
            .to_string();

        if !principal.api_key.is_model_allowed(&model) {
            return Err(AppError::ModelForbidden(model));
        }

        let stream = payload
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let adapter = match dialect.provider() {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
        };

        tracing::debug!(
            %request_id,
            user_id = %principal.account.user_id,
            %model,
            stream,
            endpoint = dialect.path(),
            "dispatching upstream"
        );

        let reply = adapter
            .forward(ForwardRequest {
                dialect,
                body,
                stream,
                timeout: self.upstream_timeout,
            })
            .await?;

        let settle_base = SettleRequest {
            user_id: principal.account.user_id.clone(),
            api_key: principal.api_key.api_key.clone(),
            model_name: model,
            request_endpoint: dialect.path().to_string(),
            ip_address: client_ip,
            usage: None,
            request_payload: payload,
            response_payload: Value::Null,
        };

        match reply {
            ProviderReply::Unary {
                status,
                body,
                usage,
            } => {
                if status.is_success() {
                    let mut settle = settle_base;
                    settle.usage = usage;
                    settle.response_payload = serde_json::from_slice(&body)
                        .unwrap_or_else(|_| json!({"opaque": true}));
                    if let Err(e) = self.ledger.settle(settle).await {
                        tracing::error!(
                            target: "dead_letter",
                            %request_id,
                            error = %e,
                            "settlement failed after successful upstream call"
                        );
                    }
                } else {
                    tracing::debug!(%request_id, %status, "upstream error passed through");
                }

                Response::builder()
                    .status(status)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .map_err(|e| AppError::Internal(e.to_string()))
            }
            ProviderReply::Stream {
                status,
                chunks,
                usage_rx,
            } => {
                let ledger = self.ledger.clone();
                self.settlements
                    .spawn(async move {
                        let Ok(end) = usage_rx.await else {
                            return;
                        };
                        if end.usage.is_none() && !end.completed {
                            // Client disconnected (or upstream broke) before
                            // any usage was reported: nothing to account.
                            tracing::debug!(%request_id, "stream cancelled before usage; no settlement");
                            return;
                        }

                        let mut settle = settle_base;
                        settle.usage = end.usage;
                        settle.response_payload = json!({
                            "streamed": true,
                            "completed": end.completed,
                            "usage": end.usage,
                        });
                        if let Err(e) = ledger.settle(settle).await {
                            tracing::error!(
                                target: "dead_letter",
                                %request_id,
                                error = %e,
                                "stream settlement failed"
                            );
                        }
                    })
                    .await;

                Response::builder()
                    .status(status)
                    .header(header::CONTENT_TYPE, "text/event-stream")
                    .header(header::CACHE_CONTROL, "no-cache")
                    .body(Body::from_stream(chunks))
                    .map_err(|e| AppError::Internal(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracker_waits_for_tasks() {
        let tracker = SettlementTracker::new();
        let flag = Arc::new(AtomicU64::new(0));

        let flag_clone = flag.clone();
        tracker
            .spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag_clone.store(1, Ordering::SeqCst);
            })
            .await;

        assert!(tracker.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tracker_times_out_on_stuck_task() {
        let tracker = SettlementTracker::new();
        tracker
            .spawn(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;

        assert!(!tracker.wait_idle(Duration::from_millis(20)).await);
        tracker.abort_all().await;
    }

    #[tokio::test]
    async fn test_tracker_idle_without_tasks() {
        let tracker = SettlementTracker::new();
        assert!(tracker.wait_idle(Duration::from_millis(1)).await);
        assert_eq!(tracker.active_tasks().await, 0);
    }
}
