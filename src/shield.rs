//! ContentShield facade
//!
//! Wires the protection components from one [`ProtectionConfig`] and exposes
//! the operations host applications call.

use std::sync::Arc;

use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::info;

use crate::blur::BlurEngine;
use crate::cache::{DerivativeCache, DerivativeCacheConfig, SweepReport};
use crate::core::config::{LedgerBackend, LedgerConfig, ProtectionConfig};
use crate::core::error::{ConfigError, Result, ShieldError, StoreError};
use crate::core::types::{AttachmentId, BlurJobState, ItemId, SizeClass, Viewer};
use crate::gateway::{build_router, FallbackImage, GatewayState, ProtectionGateway, ServeOutcome, ViewerResolver};
use crate::jobs::{BlurJobManager, EnqueueOutcome, FlagChange, Scheduler, StopOutcome};
use crate::rewrite::ContentRewriter;
use crate::store::{AttachmentStore, MetadataStore};
use crate::token::{ProtectedUrl, TokenCodec, UrlMinter};
use crate::watermark::{
    Extraction, MemoryLedger, SqliteLedger, TraceMatch, WatermarkCodec, WatermarkLedger, WatermarkRecord,
};

/// Upper bound on ledger records considered when tracing a leak
pub const TRACE_CANDIDATE_LIMIT: usize = 500;

/// Open the configured watermark ledger backend
pub async fn open_ledger(config: &LedgerConfig) -> Result<Arc<dyn WatermarkLedger>> {
    match config.backend {
        LedgerBackend::Memory => Ok(Arc::new(MemoryLedger::new())),
        LedgerBackend::Sqlite => Ok(Arc::new(SqliteLedger::open(config.path.clone()).await?)),
    }
}

/// Counts from one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub cache: SweepReport,
    pub ledger_pruned: u64,
}

/// A payload found in a leaked image, with the record of who received it
#[derive(Debug, Clone)]
pub struct LeakReport {
    pub extraction: Extraction,
    pub record: Option<WatermarkRecord>,
}

/// Content protection engine
pub struct ContentShield {
    config: ProtectionConfig,
    minter: UrlMinter,
    metadata: Arc<dyn MetadataStore>,
    cache: Arc<DerivativeCache>,
    jobs: BlurJobManager,
    gateway: Arc<ProtectionGateway>,
    rewriter: ContentRewriter,
    ledger: Arc<dyn WatermarkLedger>,
    watermark: WatermarkCodec,
}

impl ContentShield {
    pub fn new(
        config: ProtectionConfig,
        metadata: Arc<dyn MetadataStore>,
        attachments: Arc<dyn AttachmentStore>,
        ledger: Arc<dyn WatermarkLedger>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self> {
        config.validate()?;

        let codec = TokenCodec::from_config(&config.token)?;
        let minter = UrlMinter::new(codec.clone(), config.server.public_base_url.clone());
        let cache = Arc::new(DerivativeCache::new(DerivativeCacheConfig::from(&config.cache))?);
        let watermark = WatermarkCodec::from_config(&config.watermark);

        let jobs = BlurJobManager::new(
            metadata.clone(),
            attachments.clone(),
            BlurEngine::new(config.blur.intensity),
            cache.clone(),
            scheduler,
        )
        .with_start_delay(config.blur.start_delay());

        let mut gateway = ProtectionGateway::new(
            codec,
            metadata.clone(),
            attachments.clone(),
            cache.clone(),
            ledger.clone(),
        );
        if config.watermark.enabled {
            gateway = gateway.with_watermark(watermark.clone());
        }
        if let Some(path) = &config.fallback_image {
            let fallback = FallbackImage::load(path).map_err(|e| ConfigError::InvalidValue {
                field: "fallback_image".to_string(),
                value: e.to_string(),
            })?;
            gateway = gateway.with_fallback(fallback);
        }

        let rewriter = ContentRewriter::new(minter.clone(), attachments, config.server.upload_base_url.clone());

        info!(
            "ContentShield ready (blur: {:?}, watermark: {}, cache: {})",
            config.blur.intensity,
            if config.watermark.enabled { "on" } else { "off" },
            cache.cache_dir().display()
        );

        Ok(Self {
            config,
            minter,
            metadata,
            cache,
            jobs,
            gateway: Arc::new(gateway),
            rewriter,
            ledger,
            watermark,
        })
    }

    pub fn config(&self) -> &ProtectionConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<ProtectionGateway> {
        &self.gateway
    }

    pub fn jobs(&self) -> &BlurJobManager {
        &self.jobs
    }

    pub fn cache(&self) -> &Arc<DerivativeCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<dyn WatermarkLedger> {
        &self.ledger
    }

    pub fn mint_protected_url(&self, attachment: AttachmentId, item: ItemId, size: SizeClass) -> String {
        self.minter.mint_url(attachment, item, size)
    }

    pub async fn serve(&self, request: &ProtectedUrl, viewer: &Viewer) -> ServeOutcome {
        self.gateway.serve(request, viewer).await
    }

    pub fn enqueue_blur_job(&self, item: ItemId) -> Result<EnqueueOutcome> {
        self.jobs.enqueue(item)
    }

    pub fn stop_blur_job(&self, item: ItemId) -> Result<StopOutcome> {
        self.jobs.stop(item)
    }

    pub fn job_progress(&self, item: ItemId) -> Result<BlurJobState> {
        self.jobs.progress(item)
    }

    pub fn purge_derivatives(&self, item: ItemId) -> Result<usize> {
        self.jobs.purge(item)
    }

    /// Apply the job consequences of an editor toggling the sensitive flag
    pub fn handle_flag_change(&self, item: ItemId, was_sensitive: bool, is_sensitive: bool) -> Result<FlagChange> {
        self.jobs.handle_flag_change(item, was_sensitive, is_sensitive)
    }

    /// Rewrite rendered content of `item` so every image goes through the gateway
    pub fn rewrite_content(&self, item: ItemId, content: &str) -> Result<String> {
        let owner = self
            .metadata
            .item(item)?
            .ok_or(StoreError::ItemNotFound { item })?;
        Ok(self.rewriter.rewrite(&owner, content).into_owned())
    }

    /// Expire cached derivatives and prune ledger records past retention
    pub async fn sweep_cache(&self) -> Result<MaintenanceReport> {
        let cache = self.cache.clone();
        let swept = tokio::task::spawn_blocking(move || cache.sweep_expired())
            .await
            .map_err(|e| ShieldError::Internal(e.to_string()))??;

        let ledger_pruned = match self.config.ledger.retention_days {
            Some(days) => {
                let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
                self.ledger.prune_before(cutoff).await?
            }
            None => 0,
        };

        Ok(MaintenanceReport {
            cache: swept,
            ledger_pruned,
        })
    }

    /// Recover the viewer identity embedded in a leaked copy
    pub async fn identify_leak(&self, bytes: &[u8]) -> Result<Option<LeakReport>> {
        let Some(extraction) = self.watermark.extract(bytes)? else {
            return Ok(None);
        };
        let record = self.ledger.find(&extraction.payload.watermark_id).await?;
        Ok(Some(LeakReport { extraction, record }))
    }

    /// Score the item's issued watermarks against a leak whose payload was stripped
    pub async fn trace_leak(&self, suspect: &[u8], reference: &[u8], item: ItemId) -> Result<Vec<TraceMatch>> {
        let candidates: Vec<_> = self
            .ledger
            .for_item(item, TRACE_CANDIDATE_LIMIT)
            .await?
            .into_iter()
            .map(|r| r.watermark_id)
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let codec = self.watermark.clone();
        let suspect = suspect.to_vec();
        let reference = reference.to_vec();
        tokio::task::spawn_blocking(move || codec.trace(&suspect, &reference, &candidates))
            .await
            .map_err(|e| ShieldError::Internal(e.to_string()))?
    }

    /// HTTP router serving protected URLs
    pub fn router(&self) -> Result<Router> {
        let viewers = ViewerResolver::new(&self.config.server.viewer_header).map_err(|e| {
            ConfigError::InvalidValue {
                field: "server.viewer_header".to_string(),
                value: e.to_string(),
            }
        })?;
        Ok(build_router(GatewayState {
            gateway: self.gateway.clone(),
            viewers,
        }))
    }
}
