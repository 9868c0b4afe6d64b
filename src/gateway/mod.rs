//! Protection Gateway
//!
//! Request-time entry point for protected image URLs:
//! - Token verification (fail closed, no body)
//! - Owner resolution and access decision
//! - Forensic watermarking of originals for known viewers, cached per viewer
//! - Blurred derivative or fallback image for anonymous viewers
//! - axum router with security headers

mod error;
mod routes;
mod server;
mod service;

#[cfg(test)]
mod tests;

pub use error::{DenyReason, GatewayError};
pub use routes::{GatewayState, ViewerResolver, LOGIN_REQUIRED_HEADER};
pub use server::{build_router, GatewayServer, PROTECTED_ROUTE};
pub use service::{
    watermark_identity, FallbackImage, ProtectionGateway, ServeOutcome, ServedImage, ServedVariant,
};
