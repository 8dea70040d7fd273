//! Error types for the HTTP bridge

use axum::http::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame from subprocess: {0}")]
    MalformedFrame(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("subprocess exited")]
    ProcessExited,

    #[error("subprocess stdin is not writable")]
    NotWritable,

    #[error("request id {0} is already outstanding")]
    DuplicateId(String),

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("invalid request body: {0}")]
    InvalidRequestBody(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("failed to spawn subprocess: {0}")]
    Spawn(String),

    #[error("HTTP server error: {0}")]
    HttpServer(String),
}

impl BridgeError {
    /// HTTP status this error surfaces as at the router boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::ProcessExited | BridgeError::NotWritable => StatusCode::BAD_GATEWAY,
            BridgeError::DuplicateId(_) => StatusCode::CONFLICT,
            BridgeError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            BridgeError::InvalidRequestBody(_) => StatusCode::BAD_REQUEST,
            BridgeError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
