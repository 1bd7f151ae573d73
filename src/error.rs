use std::time::Duration;

use thiserror::Error;

use crate::ids::Source;

/// Failures a connector call can produce, before and after the retry layer.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("HTTP status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("{origin} failed after {attempts} attempt(s): {last_cause}")]
    Upstream {
        origin: Source,
        attempts: u32,
        last_cause: String,
    },
}

impl SourceError {
    pub fn invalid(raw: impl Into<String>) -> Self {
        Self::InvalidIdentifier(raw.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Network errors, 429 and 5xx are worth another attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Status { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Http(e) => {
                if let Some(status) = e.status() {
                    return status.as_u16() == 429 || status.is_server_error();
                }
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
