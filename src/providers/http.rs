use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use std::time::Duration;

use super::{ForwardRequest, ProviderAdapter, ProviderKind, ProviderReply, UsageTap, sse};
use crate::config::ProviderConfig;
use crate::error::AppError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Streams have no usage until the end, so they get a generous total bound
/// instead of the unary deadline.
const STREAM_TIMEOUT_FACTOR: u32 = 10;

/// HTTP adapter dialing one upstream provider family.
pub struct HttpProviderAdapter {
    kind: ProviderKind,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpProviderAdapter {
    pub fn new(kind: ProviderKind, config: &ProviderConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build http client: {e}")))?;

        Ok(Self {
            kind,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn forward(&self, request: ForwardRequest) -> Result<ProviderReply, AppError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            AppError::UpstreamUnavailable(format!(
                "{} provider is not configured",
                self.kind.as_str()
            ))
        })?;

        let url = format!("{}{}", self.base_url, request.dialect.path());
        let timeout = if request.stream {
            request.timeout * STREAM_TIMEOUT_FACTOR
        } else {
            request.timeout
        };

        let mut builder = self
            .client
            .post(&url)
            .timeout(timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body.clone());

        builder = match self.kind {
            ProviderKind::OpenAi => builder.bearer_auth(api_key),
            ProviderKind::Anthropic => builder
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01"),
        };

        let response = builder.send().await.map_err(|e| {
            AppError::UpstreamUnavailable(format!("{}: {e}", self.kind.as_str()))
        })?;

        let status = response.status();

        if request.stream && status.is_success() {
            let raw = response.bytes_stream().map_err(Into::into).boxed();
            let (chunks, usage_rx) = UsageTap::new(raw);
            return Ok(ProviderReply::Stream {
                status,
                chunks,
                usage_rx,
            });
        }

        // Error statuses (and non-streaming calls) are read whole; error
        // bodies carry no billable usage and pass through verbatim.
        let body = response.bytes().await.map_err(|e| {
            AppError::UpstreamUnavailable(format!("{}: {e}", self.kind.as_str()))
        })?;
        let usage = if status.is_success() {
            sse::usage_from_body(&body)
        } else {
            None
        };

        Ok(ProviderReply::Unary {
            status,
            body,
            usage,
        })
    }

    fn name(&self) -> &str {
        self.kind.as_str()
    }
}
