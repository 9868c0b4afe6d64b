//! Error types for ContentShield
//!
//! One top-level error with per-concern sub-errors, plus the recovery
//! hints the job manager and gateway use to decide between skipping,
//! falling back and denying.

use std::fmt;

use thiserror::Error;

use super::types::{AttachmentId, ItemId};

/// Result type alias for ContentShield operations
pub type Result<T> = std::result::Result<T, ShieldError>;

/// Main error type for ContentShield
#[derive(Error, Debug)]
pub enum ShieldError {
    #[error("Protected URL token rejected")]
    TokenInvalid,

    #[error("Source attachment not found: {attachment}")]
    SourceNotFound { attachment: AttachmentId },

    #[error("Unsupported image format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Transform failed during {stage}: {reason}")]
    TransformFailure { stage: TransformStage, reason: String },

    #[error("Blur job already active for item {item}")]
    JobAlreadyRunning { item: ItemId },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShieldError {
    pub fn transform(stage: TransformStage, reason: impl Into<String>) -> Self {
        ShieldError::TransformFailure {
            stage,
            reason: reason.into(),
        }
    }

    pub fn unsupported(format: impl Into<String>) -> Self {
        ShieldError::UnsupportedFormat {
            format: format.into(),
        }
    }
}

/// Pipeline stage a transform failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformStage {
    Decode,
    Blur,
    Watermark,
    Encode,
    Persist,
}

impl fmt::Display for TransformStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransformStage::Decode => "decode",
            TransformStage::Blur => "blur",
            TransformStage::Watermark => "watermark",
            TransformStage::Encode => "encode",
            TransformStage::Persist => "persist",
        };
        f.write_str(name)
    }
}

/// Metadata and attachment store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Item not found: {item}")]
    ItemNotFound { item: ItemId },

    #[error("Attachment not found: {attachment}")]
    AttachmentNotFound { attachment: AttachmentId },

    #[error("Store backend failed: {reason}")]
    Backend { reason: String },

    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog parse failed: {0}")]
    Catalog(#[from] serde_json::Error),
}

/// Watermark ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt ledger row: {reason}")]
    CorruptRecord { reason: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config load failed: {reason}")]
    LoadFailed { reason: String },

    #[error("Invalid config value: {field} = {value}")]
    InvalidValue { field: String, value: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::LoadFailed {
            reason: err.to_string(),
        }
    }
}

/// Trait for error recovery strategies
pub trait ErrorRecovery {
    /// Check if the error is retryable
    fn is_retryable(&self) -> bool;

    /// Get suggested retry delay in milliseconds
    fn retry_delay_ms(&self) -> Option<u64>;

    /// Get recovery action suggestion
    fn recovery_action(&self) -> RecoveryAction;
}

/// Recovery action suggestions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Retry the operation
    Retry,
    /// Skip this image and continue with the rest
    Skip,
    /// Serve a less specific representation (original or fallback image)
    Fallback,
    /// Refuse the request
    Deny,
    /// Abort the operation
    Abort,
}

impl ErrorRecovery for ShieldError {
    fn is_retryable(&self) -> bool {
        match self {
            ShieldError::Store(e) => e.is_retryable(),
            ShieldError::Ledger(e) => e.is_retryable(),
            ShieldError::Io(_) => true,
            _ => false,
        }
    }

    fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            ShieldError::Store(e) => e.retry_delay_ms(),
            ShieldError::Ledger(e) => e.retry_delay_ms(),
            ShieldError::Io(_) => Some(1000),
            _ => None,
        }
    }

    fn recovery_action(&self) -> RecoveryAction {
        match self {
            ShieldError::TokenInvalid => RecoveryAction::Deny,
            ShieldError::SourceNotFound { .. } => RecoveryAction::Skip,
            ShieldError::UnsupportedFormat { .. } => RecoveryAction::Skip,
            ShieldError::TransformFailure { stage, .. } => match stage {
                TransformStage::Watermark => RecoveryAction::Fallback,
                _ => RecoveryAction::Skip,
            },
            ShieldError::JobAlreadyRunning { .. } => RecoveryAction::Skip,
            ShieldError::Store(e) => e.recovery_action(),
            ShieldError::Ledger(e) => e.recovery_action(),
            ShieldError::Config(_) => RecoveryAction::Abort,
            ShieldError::Image(_) => RecoveryAction::Skip,
            ShieldError::Io(_) => RecoveryAction::Retry,
            ShieldError::Internal(_) => RecoveryAction::Abort,
        }
    }
}

impl ErrorRecovery for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend { .. } | StoreError::Io(_))
    }

    fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            StoreError::Backend { .. } => Some(500),
            StoreError::Io(_) => Some(1000),
            _ => None,
        }
    }

    fn recovery_action(&self) -> RecoveryAction {
        match self {
            StoreError::ItemNotFound { .. } | StoreError::AttachmentNotFound { .. } => {
                RecoveryAction::Skip
            }
            StoreError::Backend { .. } | StoreError::Io(_) => RecoveryAction::Retry,
            StoreError::Catalog(_) => RecoveryAction::Abort,
        }
    }
}

impl ErrorRecovery for LedgerError {
    fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Database(_))
    }

    fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            LedgerError::Database(_) => Some(1000),
            LedgerError::CorruptRecord { .. } => None,
        }
    }

    fn recovery_action(&self) -> RecoveryAction {
        match self {
            LedgerError::Database(_) => RecoveryAction::Retry,
            LedgerError::CorruptRecord { .. } => RecoveryAction::Skip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_failure_falls_back() {
        let err = ShieldError::transform(TransformStage::Watermark, "no method applied");
        assert_eq!(err.recovery_action(), RecoveryAction::Fallback);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_token_invalid_denies() {
        assert_eq!(ShieldError::TokenInvalid.recovery_action(), RecoveryAction::Deny);
    }

    #[test]
    fn test_store_backend_is_retryable() {
        let err: ShieldError = StoreError::Backend { reason: "locked".into() }.into();
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_ms(), Some(500));
    }

    #[test]
    fn test_display_includes_stage() {
        let err = ShieldError::transform(TransformStage::Encode, "bad buffer");
        assert_eq!(err.to_string(), "Transform failed during encode: bad buffer");
    }
}
