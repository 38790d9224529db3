use thiserror::Error;

use crate::auth::StorageError;
use crate::utils::truncate_string;

#[derive(Error, Debug)]
pub enum ApiError {
    /// No response from the server. Never triggers refresh or logout.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unauthorized (status {status}) - token may be expired")]
    AuthExpired { status: u16 },

    /// Terminal auth failure: refresh was impossible or failed and the
    /// session has been logged out.
    #[error("Session expired - please sign in again")]
    SessionExpired,

    #[error("Request failed with status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => ApiError::AuthExpired { status },
            _ => Self::http(status, body),
        }
    }

    /// Plain HTTP error, body truncated to avoid logging excessive data
    pub fn http(status: u16, body: &str) -> Self {
        ApiError::Http {
            status,
            body: truncate_string(body, MAX_ERROR_BODY_LENGTH),
        }
    }

    /// True for 401/403 responses
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::AuthExpired { .. })
    }

    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::AuthExpired { status } | ApiError::Http { status, .. } => Some(*status),
            ApiError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
