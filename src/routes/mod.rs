use axum::{
    Json, Router,
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::auth::{Principal, PrincipalExtractor};
use crate::error::AppError;
use crate::providers::Dialect;
use crate::server::{MAX_BODY_SIZE, Server};

pub mod admin;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation id attached to every request and echoed in the response.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestId(pub Uuid);

pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    // Honor an id injected by a load balancer, otherwise mint one.
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::try_parse(value).ok())
        .map(RequestId)
        .unwrap_or_else(|| RequestId(Uuid::new_v4()));

    request.extensions_mut().insert(request_id);
    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id.0.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Ingress proxy endpoints; dialect routing is static per path.
pub fn proxy_routes() -> Router<Server> {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .route("/v1/messages", post(messages))
}

async fn chat_completions(
    State(server): State<Server>,
    PrincipalExtractor(principal): PrincipalExtractor,
    request: Request,
) -> Result<Response, AppError> {
    proxy(server, Dialect::OpenAiChat, principal, request).await
}

async fn responses(
    State(server): State<Server>,
    PrincipalExtractor(principal): PrincipalExtractor,
    request: Request,
) -> Result<Response, AppError> {
    proxy(server, Dialect::OpenAiResponses, principal, request).await
}

async fn messages(
    State(server): State<Server>,
    PrincipalExtractor(principal): PrincipalExtractor,
    request: Request,
) -> Result<Response, AppError> {
    proxy(server, Dialect::AnthropicMessages, principal, request).await
}

async fn proxy(
    server: Server,
    dialect: Dialect,
    principal: Principal,
    request: Request,
) -> Result<Response, AppError> {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .copied()
        .unwrap_or_default();

    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_SIZE)
        .await
        .map_err(|e| AppError::InvalidRequest(format!("failed to read request body: {e}")))?;

    server
        .pipeline
        .handle(dialect, principal, body, client_ip, request_id.0)
        .await
}

pub fn health_routes() -> Router<Server> {
    Router::new().route("/", get(health_check))
}

/// 200 when the store and bus are both reachable, 503 otherwise.
async fn health_check(State(server): State<Server>) -> Response {
    let overall = server.health_service.check_all().await;
    let status = if overall.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let mut response = Json(&overall).into_response();
    *response.status_mut() = status;
    response
}
