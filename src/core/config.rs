//! Configuration module for ContentShield
//!
//! A single immutable [`ProtectionConfig`] is loaded once at startup and
//! passed into component constructors. Sources, later overriding earlier:
//! - Built-in defaults
//! - An optional TOML/JSON/YAML file
//! - `CONTENT_SHIELD__<SECTION>__<FIELD>` environment variables

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;
use crate::blur::BlurIntensity;
use crate::logging::LoggingConfig;
use crate::watermark::{WatermarkMethod, WatermarkStrength};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "CONTENT_SHIELD";

const DAY_SECS: u64 = 24 * 60 * 60;

/// Main protection configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProtectionConfig {
    pub server: ServerConfig,
    pub token: TokenConfig,
    pub blur: BlurConfig,
    pub watermark: WatermarkConfig,
    pub cache: CacheConfig,
    pub ledger: LedgerConfig,

    /// Image served to anonymous viewers when no blurred derivative exists yet
    pub fallback_image: Option<PathBuf>,

    /// JSON catalog seeding the in-memory store
    pub catalog: Option<PathBuf>,

    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

/// HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the gateway binds to
    pub bind_address: String,

    /// Absolute or root-relative URL of the protected endpoint
    pub public_base_url: String,

    /// URL prefix under which the host exposes raw uploads
    pub upload_base_url: String,

    /// Header carrying the authenticated viewer id from the front controller
    pub viewer_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8088".to_string(),
            public_base_url: "/protected".to_string(),
            upload_base_url: "/uploads/".to_string(),
            viewer_header: "x-viewer-id".to_string(),
        }
    }
}

/// Protected URL token configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TokenConfig {
    /// Server secret; a random one is generated at startup when absent
    pub secret: Option<SecretString>,
}

/// Blur derivative configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurConfig {
    pub intensity: BlurIntensity,

    /// Delay between enqueueing a job and the worker picking it up
    pub start_delay_secs: u64,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            intensity: BlurIntensity::Extreme,
            start_delay_secs: 5,
        }
    }
}

impl BlurConfig {
    pub fn start_delay(&self) -> Duration {
        Duration::from_secs(self.start_delay_secs)
    }
}

/// Forensic watermark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    pub enabled: bool,

    /// Methods applied on embed and tried on extract, in priority order
    pub methods: Vec<WatermarkMethod>,

    pub strength: WatermarkStrength,

    /// Number of perturbed coordinates for the pixel method
    pub pixel_points: usize,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            methods: vec![
                WatermarkMethod::Steganographic,
                WatermarkMethod::Metadata,
                WatermarkMethod::PixelPerturbation,
            ],
            strength: WatermarkStrength::Medium,
            pixel_points: 100,
        }
    }
}

/// Derivative cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub directory: PathBuf,

    /// Age after which watermarked derivatives are evicted
    pub watermark_retention_secs: u64,

    /// Age after which blurred derivatives are evicted; `None` keeps them
    pub blur_retention_secs: Option<u64>,

    /// Interval of the background sweep
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_data_dir().join("derivatives"),
            watermark_retention_secs: 7 * DAY_SECS,
            blur_retention_secs: None,
            sweep_interval_secs: 60 * 60,
        }
    }
}

/// Storage backend for watermark records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Memory,
    #[default]
    Sqlite,
}

/// Watermark ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    pub path: PathBuf,

    /// Records older than this are pruned by the sweep; `None` keeps all
    pub retention_days: Option<u32>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Sqlite,
            path: default_data_dir().join("watermarks.db"),
            retention_days: None,
        }
    }
}

/// Request rate limiting. Reserved: parsed and validated, not enforced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: 120,
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "contentshield", "ContentShield")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("data"))
}

impl ProtectionConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: ProtectionConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject values the components cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watermark.enabled && self.watermark.methods.is_empty() {
            return Err(invalid("watermark.methods", "[]"));
        }
        if self.watermark.pixel_points == 0 {
            return Err(invalid("watermark.pixel_points", "0"));
        }
        if self.server.public_base_url.trim().is_empty() {
            return Err(invalid("server.public_base_url", "\"\""));
        }
        if self.server.viewer_header.trim().is_empty() {
            return Err(invalid("server.viewer_header", "\"\""));
        }
        if self.cache.watermark_retention_secs == 0 {
            return Err(invalid("cache.watermark_retention_secs", "0"));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(invalid("cache.sweep_interval_secs", "0"));
        }
        if self.rate_limit.enabled && self.rate_limit.requests_per_minute == 0 {
            return Err(invalid("rate_limit.requests_per_minute", "0"));
        }
        Ok(())
    }

    pub fn with_cache_directory(mut self, directory: PathBuf) -> Self {
        self.cache.directory = directory;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.token.secret = Some(SecretString::new(secret.into()));
        self
    }

    pub fn with_watermark_methods(mut self, methods: Vec<WatermarkMethod>) -> Self {
        self.watermark.methods = methods;
        self
    }

    pub fn with_blur_intensity(mut self, intensity: BlurIntensity) -> Self {
        self.blur.intensity = intensity;
        self
    }

    pub fn with_fallback_image(mut self, path: PathBuf) -> Self {
        self.fallback_image = Some(path);
        self
    }
}

fn invalid(field: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
}
