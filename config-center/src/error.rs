use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use raft_store::StoreError;
use raft_store::forward::Reply;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("invalid {0}")]
    Invalid(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("authentication required")]
    Unauthorized,
    #[error("requires {0} privilege")]
    Forbidden(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ConfigError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => Self::NotFound(key),
            StoreError::Invalid(reason) => Self::Invalid(reason),
            other => Self::Store(other),
        }
    }
}

impl ConfigError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Store(StoreError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            Self::Store(StoreError::NoLeader | StoreError::Shutdown) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Store(StoreError::Remote { .. }) => StatusCode::BAD_GATEWAY,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Reply code carried in the response envelope.
    pub fn code(&self) -> String {
        self.status().as_u16().to_string()
    }
}

impl IntoResponse for ConfigError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        }
        (status, Json(Reply::<()>::error(self.code(), self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_client_and_server_classes() {
        let missing: ConfigError = StoreError::NotFound("cfg.current.a.g.x.yaml".into()).into();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let timeout: ConfigError = StoreError::Timeout.into();
        assert_eq!(timeout.code(), "504");

        let no_leader: ConfigError = StoreError::NoLeader.into();
        assert!(no_leader.status().is_server_error());
        assert_eq!(
            ConfigError::PreconditionFailed("live subscribers".into()).code(),
            "412"
        );
    }
}
