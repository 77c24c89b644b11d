//! Typed errors for model calls

use thiserror::Error;

/// Failure modes of a model request, classified from the HTTP exchange
#[derive(Debug, Error)]
pub enum LlmError {
    /// No credential configured for the provider
    #[error("Missing credential: {0} is not set")]
    MissingCredential(&'static str),

    /// Rejected credential (HTTP 401/403)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Quota exhausted (HTTP 429)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Request the API refused to process (HTTP 400/404)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Server-side failure (HTTP 5xx)
    #[error("Service error: {0}")]
    ServiceError(String),

    /// Connection, timeout or mid-stream transport failure
    #[error("Network error: {0}")]
    Network(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl LlmError {
    /// Transient failures a caller could retry after waiting
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited(_) | LlmError::ServiceError(_) | LlmError::Network(_)
        )
    }

    pub fn from_http_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 | 403 => LlmError::Unauthorized(body),
            429 => LlmError::RateLimited(body),
            400 | 404 => LlmError::BadRequest(body),
            500..=599 => LlmError::ServiceError(body),
            _ => LlmError::Other(anyhow::anyhow!("HTTP {}: {}", status, body)),
        }
    }

    pub fn from_network_error(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Network(format!("Request timeout: {}", e))
        } else if e.is_connect() {
            LlmError::Network(format!("Connection failed: {}", e))
        } else if let Some(status) = e.status() {
            Self::from_http_status(status, e.to_string())
        } else {
            LlmError::Network(e.to_string())
        }
    }
}
