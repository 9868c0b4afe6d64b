//! ContentShield - access-gated image delivery for sensitive content
//!
//! This crate provides:
//! - Signed protected URLs binding an attachment to its owning item
//! - Per-viewer access decisions (original, watermarked, blurred, fallback)
//! - Background blur jobs with resumable, cancellable progress
//! - Forensic watermarking with a ledger of issued copies
//! - A derivative cache with per-key single-flight creation
//! - Content rewriting that routes inline images through the gateway
//! - An axum HTTP gateway serving protected URLs

pub mod blur;
pub mod cache;
pub mod core;
pub mod gateway;
pub mod imaging;
pub mod jobs;
pub mod logging;
pub mod policy;
pub mod rewrite;
pub mod shield;
pub mod store;
pub mod token;
pub mod watermark;

// Re-export commonly used items
pub use crate::core::config::ProtectionConfig;
pub use crate::core::error::{Result, ShieldError};
pub use crate::core::types::{AccessDecision, AttachmentId, ItemId, SizeClass, Viewer, ViewerId};
pub use gateway::{GatewayServer, ServeOutcome, ServedVariant};
pub use shield::{open_ledger, ContentShield, LeakReport, MaintenanceReport};
pub use store::{AttachmentStore, MemoryStore, MetadataStore};
pub use token::{ProtectedUrl, TokenCodec, UrlMinter};
pub use watermark::{WatermarkCodec, WatermarkLedger, WatermarkRecord};
