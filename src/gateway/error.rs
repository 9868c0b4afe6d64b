//! Gateway error types

use axum::http::StatusCode;
use thiserror::Error;

/// Why a protected image request was refused
///
/// Only the status code and a fixed message ever reach the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    TokenInvalid,
    NotFound,
    AuthenticationRequired,
}

impl DenyReason {
    pub fn status_code(self) -> StatusCode {
        match self {
            DenyReason::TokenInvalid => StatusCode::FORBIDDEN,
            DenyReason::NotFound => StatusCode::NOT_FOUND,
            DenyReason::AuthenticationRequired => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            DenyReason::TokenInvalid => "Forbidden",
            DenyReason::NotFound => "Image not found",
            DenyReason::AuthenticationRequired => "Authentication required",
        }
    }

    /// Check if this reason should result in a 403 Forbidden response
    pub fn is_forbidden(self) -> bool {
        matches!(self, DenyReason::TokenInvalid)
    }

    /// Check if this reason should result in a 404 Not Found response
    pub fn is_not_found(self) -> bool {
        matches!(self, DenyReason::NotFound)
    }
}

/// Gateway server error type
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid bind address '{address}'")]
    InvalidAddress { address: String },

    #[error("Server bind failed: {reason}")]
    BindFailed { reason: String },

    #[error("Fallback image unusable: {reason}")]
    Fallback { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal server error: {reason}")]
    Internal { reason: String },
}
