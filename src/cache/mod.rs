//! Derivative Cache
//!
//! File cache for blurred and watermarked derivatives.
//! - Keyed by source attachment, purpose and identity key
//! - At most one producer per key at a time (per-key lock)
//! - Atomic writes (temp file + rename), readers never see partial files
//! - Age-based expiry per purpose, swept by modification time

#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::core::config::CacheConfig;
use crate::core::error::Result;
use crate::core::types::AttachmentId;
use crate::imaging;

/// Leftover temp files older than this are removed by the sweep
const PARTIAL_GRACE: Duration = Duration::from_secs(60 * 60);
const PARTIAL_PREFIX: &str = ".partial-";

/// Why a derivative exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivativePurpose {
    Blur,
    Watermark,
}

impl DerivativePurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            DerivativePurpose::Blur => "blur",
            DerivativePurpose::Watermark => "wm",
        }
    }

    fn from_filename(name: &str) -> Option<Self> {
        if name.starts_with("blur-") {
            Some(DerivativePurpose::Blur)
        } else if name.starts_with("wm-") {
            Some(DerivativePurpose::Watermark)
        } else {
            None
        }
    }
}

/// Cache key: source attachment, purpose and identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source: AttachmentId,
    pub purpose: DerivativePurpose,
    /// Empty for blur; the viewer binding for watermarks
    pub identity: String,
}

impl CacheKey {
    pub fn blur(source: AttachmentId) -> Self {
        Self {
            source,
            purpose: DerivativePurpose::Blur,
            identity: String::new(),
        }
    }

    pub fn watermark(source: AttachmentId, identity: impl Into<String>) -> Self {
        Self {
            source,
            purpose: DerivativePurpose::Watermark,
            identity: identity.into(),
        }
    }

    fn source_prefix(purpose: DerivativePurpose, source: AttachmentId) -> String {
        format!("{}-{}-", purpose.as_str(), source)
    }

    /// `<purpose>-<source>-<hash16>.<ext>`
    pub fn to_filename(&self, extension: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.purpose.as_str().as_bytes());
        hasher.update(&self.source.0.to_be_bytes());
        hasher.update(self.identity.as_bytes());
        let hash = hasher.finalize().to_hex();
        format!(
            "{}{}.{}",
            Self::source_prefix(self.purpose, self.source),
            &hash[..16],
            extension
        )
    }
}

/// Derivative cache configuration
#[derive(Debug, Clone)]
pub struct DerivativeCacheConfig {
    pub cache_dir: PathBuf,
    pub watermark_ttl: Duration,
    /// `None` keeps blurred derivatives until purged
    pub blur_ttl: Option<Duration>,
}

impl DerivativeCacheConfig {
    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            watermark_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            blur_ttl: None,
        }
    }

    pub fn with_watermark_ttl(mut self, ttl: Duration) -> Self {
        self.watermark_ttl = ttl;
        self
    }

    pub fn with_blur_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.blur_ttl = ttl;
        self
    }
}

impl From<&CacheConfig> for DerivativeCacheConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            cache_dir: config.directory.clone(),
            watermark_ttl: Duration::from_secs(config.watermark_retention_secs),
            blur_ttl: config.blur_retention_secs.map(Duration::from_secs),
        }
    }
}

/// A derivative present in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDerivative {
    pub path: PathBuf,
    /// True when this call produced the file
    pub created: bool,
}

impl CachedDerivative {
    pub fn read(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }
}

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub partials: usize,
}

/// File cache of derivatives
pub struct DerivativeCache {
    config: DerivativeCacheConfig,
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl DerivativeCache {
    pub fn new(config: DerivativeCacheConfig) -> Result<Self> {
        fs::create_dir_all(&config.cache_dir)?;
        Ok(Self {
            config,
            locks: DashMap::new(),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }

    pub fn path_for(&self, key: &CacheKey, extension: &str) -> PathBuf {
        self.config.cache_dir.join(key.to_filename(extension))
    }

    fn ttl(&self, purpose: DerivativePurpose) -> Option<Duration> {
        match purpose {
            DerivativePurpose::Blur => self.config.blur_ttl,
            DerivativePurpose::Watermark => Some(self.config.watermark_ttl),
        }
    }

    fn is_expired(path: &Path, ttl: Option<Duration>) -> bool {
        let Some(ttl) = ttl else {
            return false;
        };
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map_or(false, |age| age > ttl)
    }

    /// Path of a present, unexpired entry
    pub fn lookup(&self, key: &CacheKey, extension: &str) -> Option<PathBuf> {
        let path = self.path_for(key, extension);
        if !path.is_file() || Self::is_expired(&path, self.ttl(key.purpose)) {
            return None;
        }
        Some(path)
    }

    /// Return the cached entry, producing it with `produce` on a miss
    ///
    /// Concurrent callers for the same key wait for the first producer and
    /// then observe its file. A failed `produce` leaves nothing behind.
    pub fn get_or_create<F>(&self, key: &CacheKey, extension: &str, produce: F) -> Result<CachedDerivative>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock();
            self.fill(key, extension, produce)
        };
        self.locks.remove_if(key, |_, held| Arc::strong_count(held) <= 2);
        result
    }

    fn fill<F>(&self, key: &CacheKey, extension: &str, produce: F) -> Result<CachedDerivative>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        if let Some(path) = self.lookup(key, extension) {
            tracing::debug!("Derivative cache hit: {}", path.display());
            return Ok(CachedDerivative { path, created: false });
        }

        let bytes = produce()?;
        let path = self.path_for(key, extension);
        imaging::write_atomic(&path, &bytes)?;
        tracing::debug!("Derivative cached: {} ({} bytes)", path.display(), bytes.len());
        Ok(CachedDerivative { path, created: true })
    }

    pub fn remove(&self, key: &CacheKey, extension: &str) -> Result<bool> {
        remove_if_present(&self.path_for(key, extension))
    }

    /// Remove every derivative of `source` made for `purpose`
    pub fn purge_purpose(&self, source: AttachmentId, purpose: DerivativePurpose) -> Result<usize> {
        self.purge_prefixes(&[CacheKey::source_prefix(purpose, source)])
    }

    /// Remove every derivative of `source`, of any purpose
    pub fn purge_source(&self, source: AttachmentId) -> Result<usize> {
        self.purge_prefixes(&[
            CacheKey::source_prefix(DerivativePurpose::Blur, source),
            CacheKey::source_prefix(DerivativePurpose::Watermark, source),
        ])
    }

    fn purge_prefixes(&self, prefixes: &[String]) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.config.cache_dir)?.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if prefixes.iter().any(|p| name.starts_with(p.as_str())) && remove_if_present(&entry.path())? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete expired entries and abandoned temp files
    pub fn sweep_expired(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for entry in fs::read_dir(&self.config.cache_dir)?.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.starts_with(PARTIAL_PREFIX) {
                if Self::is_expired(&path, Some(PARTIAL_GRACE)) && remove_if_present(&path)? {
                    report.partials += 1;
                }
                continue;
            }

            let Some(purpose) = DerivativePurpose::from_filename(&name) else {
                continue;
            };
            if Self::is_expired(&path, self.ttl(purpose)) && remove_if_present(&path)? {
                report.expired += 1;
            }
        }

        if report.expired > 0 || report.partials > 0 {
            tracing::info!(
                "Cache sweep removed {} expired derivatives and {} partial files",
                report.expired,
                report.partials
            );
        }
        Ok(report)
    }
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
