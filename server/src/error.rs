use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Failure taxonomy surfaced by the broker core. The HTTP layer maps each
/// kind onto a status code; the core itself never retries.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("session not found")]
    NotFound,

    #[error("gateway handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("gateway unreachable: {0}")]
    GatewayUnreachable(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("session has already expired")]
    Expired,

    #[error("session owner tunnel is no longer active")]
    ShareUnavailable,

    #[error("{0}")]
    Forbidden(String),

    #[error("session store unavailable: {0}")]
    Store(#[from] redis::RedisError),

    #[error("bad session payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("workload client error: {0}")]
    Workload(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BrokerError {
    pub fn status(&self) -> StatusCode {
        match self {
            BrokerError::NotFound => StatusCode::NOT_FOUND,
            BrokerError::HandshakeFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::GatewayUnreachable(_) => StatusCode::BAD_GATEWAY,
            BrokerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BrokerError::Expired => StatusCode::GONE,
            BrokerError::ShareUnavailable => StatusCode::CONFLICT,
            BrokerError::Forbidden(_) => StatusCode::FORBIDDEN,
            BrokerError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::Payload(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::Workload(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(BrokerError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            BrokerError::GatewayUnreachable("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            BrokerError::Forbidden("outside window".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(BrokerError::Expired.status(), StatusCode::GONE);
    }
}
