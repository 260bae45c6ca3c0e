//! Bearer-token authentication and the request principal.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::cache::AuthCache;
use crate::error::AppError;
use crate::ledger::Ledger;
use crate::server::Server;
use crate::storage::{AccountRecord, ApiKeyRecord};

/// Authenticated `(ApiKey, Account)` pair resolved for one request.
#[derive(Clone, Debug)]
pub struct Principal {
    pub api_key: ApiKeyRecord,
    pub account: AccountRecord,
}

/// Turns a bearer token into a [`Principal`], consulting the cache first
/// and enforcing active flags plus the budget precheck on the snapshot.
pub struct Resolver {
    cache: Arc<AuthCache>,
}

impl Resolver {
    pub fn new(cache: Arc<AuthCache>) -> Self {
        Self { cache }
    }

    pub async fn resolve(&self, token: &str) -> Result<Principal, AppError> {
        let api_key = self
            .cache
            .get_api_key(token)
            .await?
            .ok_or_else(|| AppError::Unauthenticated("invalid API key".to_string()))?;

        if !api_key.is_active {
            tracing::warn!(key_name = %api_key.key_name, "rejected deactivated API key");
            return Err(AppError::Unauthenticated(
                "API key is deactivated".to_string(),
            ));
        }

        let account = self
            .cache
            .get_account(&api_key.user_id)
            .await?
            .ok_or_else(|| AppError::AccountMissing(api_key.user_id.clone()))?;

        if !account.is_active {
            tracing::warn!(user_id = %account.user_id, "rejected deactivated account");
            return Err(AppError::AccountDisabled(account.user_id.clone()));
        }

        Ledger::precheck(&account)?;

        Ok(Principal { api_key, account })
    }
}

/// Pull the bearer token out of the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Unauthenticated("missing Authorization header".to_string()))?;

    let token = header.strip_prefix("Bearer ").ok_or_else(|| {
        AppError::Unauthenticated("invalid Authorization header format".to_string())
    })?;

    if token.is_empty() {
        return Err(AppError::Unauthenticated("missing API key".to_string()));
    }

    Ok(token)
}

/// Proxy-route middleware: resolve the caller, stash the principal, and
/// strip the inbound Authorization header so it never reaches an upstream.
pub async fn auth_middleware(
    State(server): State<Server>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers())?;
    let principal = server.resolver.resolve(token).await?;

    request.extensions_mut().insert(principal);
    request.headers_mut().remove(AUTHORIZATION);

    Ok(next.run(request).await)
}

/// Admin-surface middleware: the bearer token must equal the configured
/// shared secret. An empty configured secret disables the surface.
pub async fn admin_auth_middleware(
    State(server): State<Server>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers())?;

    let admin_key = &server.config.admin.api_key;
    if admin_key.is_empty() || token != admin_key {
        tracing::warn!("rejected admin request with invalid key");
        return Err(AppError::Unauthenticated("invalid admin key".to_string()));
    }

    Ok(next.run(request).await)
}

/// Extractor for handlers that need the resolved principal.
pub struct PrincipalExtractor(pub Principal);

impl<S> FromRequestParts<S> for PrincipalExtractor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(PrincipalExtractor)
            .ok_or_else(|| AppError::Internal("missing principal".to_string()))
    }
}
