//! Uniform contract over upstream LLM providers.
//!
//! Adapters forward an opaque request body and report either a full
//! response with usage or a chunk stream whose usage resolves once the
//! stream ends. Dialect routing is static by endpoint; adapters never
//! translate between dialects or rewrite the `model` field.

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::Stream;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::AppError;

pub mod http;
pub mod sse;

#[cfg(any(test, feature = "test-utils", debug_assertions))]
pub mod mock;

pub use http::HttpProviderAdapter;

/// Upstream family an endpoint routes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }
}

/// Wire format chosen by the inbound endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    OpenAiChat,
    OpenAiResponses,
    AnthropicMessages,
}

impl Dialect {
    /// Upstream path, identical to the ingress path.
    pub fn path(&self) -> &'static str {
        match self {
            Dialect::OpenAiChat => "/v1/chat/completions",
            Dialect::OpenAiResponses => "/v1/responses",
            Dialect::AnthropicMessages => "/v1/messages",
        }
    }

    pub fn provider(&self) -> ProviderKind {
        match self {
            Dialect::OpenAiChat | Dialect::OpenAiResponses => ProviderKind::OpenAi,
            Dialect::AnthropicMessages => ProviderKind::Anthropic,
        }
    }
}

/// Per-call token counts as reported by the upstream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    pub fn is_cache_hit(&self) -> bool {
        self.cache_read_tokens > 0
    }
}

/// Request handed to an adapter; the body is forwarded byte-for-byte.
#[derive(Clone, Debug)]
pub struct ForwardRequest {
    pub dialect: Dialect,
    pub body: Bytes,
    pub stream: bool,
    pub timeout: Duration,
}

/// How a chunk stream ended. `completed` without usage is the "usage
/// unavailable" sentinel; an incomplete end means the client disconnected
/// or the upstream broke mid-stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamEnd {
    pub usage: Option<Usage>,
    pub completed: bool,
}

/// Adapter result, branched on once by the pipeline.
pub enum ProviderReply {
    Unary {
        status: StatusCode,
        body: Bytes,
        usage: Option<Usage>,
    },
    Stream {
        status: StatusCode,
        chunks: UsageTap,
        usage_rx: oneshot::Receiver<StreamEnd>,
    },
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn forward(&self, request: ForwardRequest) -> Result<ProviderReply, AppError>;

    fn name(&self) -> &str;
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Raw upstream chunk stream with any error type erased.
pub type RawChunkStream = BoxStream<'static, Result<Bytes, BoxError>>;

/// Passthrough stream that feeds every chunk to the SSE usage parser and
/// resolves the stream-end signal exactly once: on normal end, on upstream
/// failure, or on drop (client disconnect).
pub struct UsageTap {
    inner: RawChunkStream,
    parser: sse::SseUsageParser,
    end_tx: Option<oneshot::Sender<StreamEnd>>,
}

impl UsageTap {
    pub fn new(inner: RawChunkStream) -> (Self, oneshot::Receiver<StreamEnd>) {
        let (end_tx, end_rx) = oneshot::channel();
        (
            Self {
                inner,
                parser: sse::SseUsageParser::new(),
                end_tx: Some(end_tx),
            },
            end_rx,
        )
    }

    fn finish(&mut self, completed: bool) {
        if let Some(tx) = self.end_tx.take() {
            let _ = tx.send(StreamEnd {
                usage: self.parser.usage(),
                completed,
            });
        }
    }
}

impl Stream for UsageTap {
    type Item = Result<Bytes, std::convert::Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.parser.feed(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Mid-stream upstream failure: close the client stream
                // cleanly; settlement depends on the usage seen so far.
                tracing::warn!(error = %e, "upstream stream failed mid-flight");
                this.finish(false);
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                this.finish(true);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for UsageTap {
    fn drop(&mut self) {
        self.finish(false);
    }
}
