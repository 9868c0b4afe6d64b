//! ContentShield Core Module
//!
//! Shared building blocks for every protection component:
//! - Configuration loading and validation
//! - Error types and recovery hints
//! - Domain types (ids, items, attachments, job state)

pub mod config;
pub mod error;
pub mod types;

pub use config::ProtectionConfig;
pub use error::{ErrorRecovery, RecoveryAction, Result, ShieldError, TransformStage};
pub use types::*;
