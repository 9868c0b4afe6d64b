//! Heavy-blur derivative generation
//!
//! - Named intensity presets mapping to iteration count and kernel factor
//! - Separable box blur over RGB with an edge-clamped window
//! - Alpha channel is never touched
//! - Extreme intensity adds a tone reduction pass
//!
//! The engine is pure and deterministic; persistence of the derivative is
//! the caller's concern (see [`crate::cache`]).

mod engine;

pub use engine::{blur_pixels, BlurEngine, BlurIntensity, BlurProfile, EncodedImage};
