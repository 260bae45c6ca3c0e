use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::{bus::BusError, storage::StorageError};

/// Application error taxonomy. Each variant maps onto one client-visible
/// status; upstream HTTP errors are passed through verbatim by the pipeline
/// and never surface here.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Unauthenticated(String),
    #[error("account not found: {0}")]
    AccountMissing(String),
    #[error("account is deactivated: {0}")]
    AccountDisabled(String),
    #[error("{0}")]
    BudgetExceeded(String),
    #[error("model not allowed: {0}")]
    ModelForbidden(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable kind used in the error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthenticated(_) => "unauthenticated",
            AppError::AccountMissing(_) => "account_missing",
            AppError::AccountDisabled(_) => "account_disabled",
            AppError::BudgetExceeded(_) => "budget_exceeded",
            AppError::ModelForbidden(_) => "model_forbidden",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::UpstreamUnavailable(_) => "upstream_unavailable",
            AppError::Storage(_) | AppError::Bus(_) | AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::AccountMissing(_)
            | AppError::AccountDisabled(_)
            | AppError::ModelForbidden(_) => StatusCode::FORBIDDEN,
            AppError::BudgetExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::Storage(_) | AppError::Bus(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal failures get a correlation id and a generic body; the
        // detailed cause stays in the logs.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            let correlation_id = uuid::Uuid::new_v4();
            tracing::error!(%correlation_id, error = %self, "internal error");
            format!("internal error (correlation id {correlation_id})")
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": {
                "kind": self.kind(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::Unauthenticated("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::AccountDisabled("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::AccountMissing("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::BudgetExceeded("x".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::ModelForbidden("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::UpstreamUnavailable("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_kind_is_stable() {
        assert_eq!(AppError::Unauthenticated("x".into()).kind(), "unauthenticated");
        assert_eq!(AppError::BudgetExceeded("x".into()).kind(), "budget_exceeded");
        assert_eq!(AppError::Internal("x".into()).kind(), "internal");
    }

    #[tokio::test]
    async fn test_error_envelope_shape() {
        let response = AppError::BudgetExceeded("budget exhausted".into()).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["kind"], "budget_exceeded");
        assert_eq!(value["error"]["message"], "budget exhausted");
    }

    #[tokio::test]
    async fn test_internal_error_body_is_generic() {
        let response = AppError::Internal("connection pool exhausted".into()).into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let message = value["error"]["message"].as_str().unwrap();
        assert!(!message.contains("connection pool"));
    }
}
