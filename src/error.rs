//! Crate-wide error taxonomy.
//!
//! Every subsystem maps its failures into [`GatewayError`] at its public boundary so the
//! HTTP layer and the session layer can apply one consistent status/close-code mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("policy rejected: {0:?}")]
    Policy(Vec<String>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no peers available for {0}")]
    NoPeers(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        GatewayError::Internal(err.to_string())
    }

    /// WebSocket close code per §6.1 of the gateway's external surface.
    pub fn ws_close_code(&self) -> u16 {
        match self {
            GatewayError::Auth(_) => 4403,
            GatewayError::NotFound(_) => 4404,
            GatewayError::NoPeers(_) => 1013,
            _ => 1011,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasons: Option<Vec<String>>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, reasons) = match &self {
            GatewayError::Transport(_) => (StatusCode::BAD_GATEWAY, None),
            GatewayError::Auth(_) => (StatusCode::FORBIDDEN, None),
            GatewayError::Policy(reasons) => (StatusCode::PRECONDITION_FAILED, Some(reasons.clone())),
            GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            GatewayError::NoPeers(_) => (StatusCode::SERVICE_UNAVAILABLE, None),
            GatewayError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };
        let body = ErrorBody {
            error: self.to_string(),
            reasons,
        };
        (status, axum::Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        assert_eq!(GatewayError::Auth("x".into()).ws_close_code(), 4403);
        assert_eq!(GatewayError::NotFound("x".into()).ws_close_code(), 4404);
        assert_eq!(GatewayError::NoPeers("x".into()).ws_close_code(), 1013);
        assert_eq!(GatewayError::Internal("x".into()).ws_close_code(), 1011);
    }

    #[test]
    fn test_policy_reasons_roundtrip() {
        let err = GatewayError::Policy(vec!["peers_healthy".into()]);
        assert!(err.to_string().contains("peers_healthy"));
    }
}
