//! Recording provider adapter for tests: replays scripted replies and
//! captures every forwarded request so tests can assert dispatch counts.

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{Dialect, ForwardRequest, ProviderAdapter, ProviderReply, RawChunkStream, UsageTap};
use crate::error::AppError;

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub dialect: Dialect,
    pub body: Bytes,
    pub stream: bool,
}

enum MockReply {
    Unary {
        status: StatusCode,
        body: serde_json::Value,
    },
    Stream {
        chunks: Vec<Bytes>,
        hang_after: bool,
    },
    Unavailable,
}

#[derive(Default)]
pub struct MockProviderAdapter {
    calls: Mutex<Vec<RecordedCall>>,
    replies: Mutex<VecDeque<MockReply>>,
}

impl MockProviderAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_unary(&self, status: StatusCode, body: serde_json::Value) {
        self.replies
            .lock()
            .unwrap()
            .push_back(MockReply::Unary { status, body });
    }

    /// Script a streaming reply; chunks are raw SSE frames.
    pub fn push_stream(&self, chunks: Vec<String>) {
        self.replies.lock().unwrap().push_back(MockReply::Stream {
            chunks: chunks.into_iter().map(Bytes::from).collect(),
            hang_after: false,
        });
    }

    /// Script a stream that never ends after its chunks, to model a client
    /// disconnecting while the upstream is still open.
    pub fn push_hanging_stream(&self, chunks: Vec<String>) {
        self.replies.lock().unwrap().push_back(MockReply::Stream {
            chunks: chunks.into_iter().map(Bytes::from).collect(),
            hang_after: true,
        });
    }

    pub fn push_unavailable(&self) {
        self.replies
            .lock()
            .unwrap()
            .push_back(MockReply::Unavailable);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderAdapter for MockProviderAdapter {
    async fn forward(&self, request: ForwardRequest) -> Result<ProviderReply, AppError> {
        self.calls.lock().unwrap().push(RecordedCall {
            dialect: request.dialect,
            body: request.body.clone(),
            stream: request.stream,
        });

        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(MockReply::Unary { status, body }) => {
                let body = Bytes::from(serde_json::to_vec(&body).map_err(|e| {
                    AppError::Internal(format!("bad scripted body: {e}"))
                })?);
                let usage = if status.is_success() {
                    super::sse::usage_from_body(&body)
                } else {
                    None
                };
                Ok(ProviderReply::Unary {
                    status,
                    body,
                    usage,
                })
            }
            Some(MockReply::Stream { chunks, hang_after }) => {
                let head = futures_util::stream::iter(chunks.into_iter().map(Ok));
                let raw: RawChunkStream = if hang_after {
                    head.chain(futures_util::stream::pending()).boxed()
                } else {
                    head.boxed()
                };
                let (chunks, usage_rx) = UsageTap::new(raw);
                Ok(ProviderReply::Stream {
                    status: StatusCode::OK,
                    chunks,
                    usage_rx,
                })
            }
            Some(MockReply::Unavailable) => Err(AppError::UpstreamUnavailable(
                "scripted connection failure".to_string(),
            )),
            None => Err(AppError::Internal(
                "mock adapter has no scripted reply".to_string(),
            )),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
