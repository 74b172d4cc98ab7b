use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::{model::EngineError, params::ValidationError, protocol};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    pub fn protocol(message: impl Into<String>) -> Self {
        ServiceError::Protocol(message.into())
    }

    /// Human-readable trace carried by the wire failure message.
    pub fn traceback(&self) -> String {
        self.to_string()
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) | ServiceError::Protocol(_) => StatusCode::BAD_REQUEST,
            ServiceError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Engine(_) | ServiceError::Io(_) | ServiceError::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = protocol::Response::failure(&self);

        (status, axum::Json(body)).into_response()
    }
}
