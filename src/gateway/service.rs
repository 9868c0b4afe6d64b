//! Request-time protection pipeline

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::{DenyReason, GatewayError};
use crate::cache::{CacheKey, DerivativeCache};
use crate::core::error::{Result, ShieldError, TransformStage};
use crate::core::types::{AccessDecision, Attachment, ItemId, ProtectedItem, Viewer, ViewerId};
use crate::imaging;
use crate::policy::AccessPolicy;
use crate::store::{AttachmentStore, MetadataStore};
use crate::token::{ProtectedUrl, TokenCodec};
use crate::watermark::{WatermarkCodec, WatermarkLedger, WatermarkPayload, WatermarkRecord};

/// Which representation a response carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedVariant {
    Original,
    Watermarked,
    Blurred,
    Fallback,
}

impl ServedVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            ServedVariant::Original => "original",
            ServedVariant::Watermarked => "watermarked",
            ServedVariant::Blurred => "blurred",
            ServedVariant::Fallback => "fallback",
        }
    }
}

/// Image bytes ready to be written to the client
#[derive(Debug, Clone)]
pub struct ServedImage {
    pub bytes: Arc<Vec<u8>>,
    pub mime: String,
    pub variant: ServedVariant,
    /// Owner is sensitive, so the bytes depend on who asked
    pub sensitive: bool,
}

impl ServedImage {
    /// Cache-Control value; only originals of non-sensitive items are public
    pub fn cache_control(&self) -> &'static str {
        match self.variant {
            ServedVariant::Original if !self.sensitive => "public, max-age=31536000",
            ServedVariant::Original => "private, max-age=31536000",
            ServedVariant::Watermarked => "private, max-age=3600",
            ServedVariant::Blurred | ServedVariant::Fallback => "no-cache, no-store, must-revalidate",
        }
    }

    /// Whether the response differs per viewer
    pub fn varies_by_viewer(&self) -> bool {
        self.sensitive || self.variant != ServedVariant::Original
    }
}

/// Outcome of one protected image request
#[derive(Debug, Clone)]
pub enum ServeOutcome {
    Served(ServedImage),
    Denied(DenyReason),
}

impl ServeOutcome {
    pub fn variant(&self) -> Option<ServedVariant> {
        match self {
            ServeOutcome::Served(image) => Some(image.variant),
            ServeOutcome::Denied(_) => None,
        }
    }
}

/// Generic image shown to anonymous viewers when no blurred derivative exists
#[derive(Debug, Clone)]
pub struct FallbackImage {
    bytes: Arc<Vec<u8>>,
    mime: &'static str,
}

impl FallbackImage {
    pub fn from_bytes(bytes: Vec<u8>) -> std::result::Result<Self, GatewayError> {
        let format = imaging::sniff(&bytes).map_err(|e| GatewayError::Fallback { reason: e.to_string() })?;
        Ok(Self {
            mime: imaging::mime_type(format),
            bytes: Arc::new(bytes),
        })
    }

    pub fn load(path: &Path) -> std::result::Result<Self, GatewayError> {
        Self::from_bytes(std::fs::read(path)?)
    }

    fn served(&self) -> ServedImage {
        ServedImage {
            bytes: self.bytes.clone(),
            mime: self.mime.to_string(),
            variant: ServedVariant::Fallback,
            sensitive: true,
        }
    }
}

/// Cache identity binding a watermarked derivative to one viewer and item
pub fn watermark_identity(viewer: ViewerId, item: ItemId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(viewer.0.to_be_bytes());
    hasher.update(b"|");
    hasher.update(item.0.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Verifies protected URLs and serves the representation the policy allows
pub struct ProtectionGateway {
    codec: TokenCodec,
    policy: AccessPolicy,
    metadata: Arc<dyn MetadataStore>,
    attachments: Arc<dyn AttachmentStore>,
    cache: Arc<DerivativeCache>,
    ledger: Arc<dyn WatermarkLedger>,
    watermark: Option<Arc<WatermarkCodec>>,
    fallback: Option<FallbackImage>,
}

impl ProtectionGateway {
    pub fn new(
        codec: TokenCodec,
        metadata: Arc<dyn MetadataStore>,
        attachments: Arc<dyn AttachmentStore>,
        cache: Arc<DerivativeCache>,
        ledger: Arc<dyn WatermarkLedger>,
    ) -> Self {
        Self {
            codec,
            policy: AccessPolicy::new(metadata.clone(), attachments.clone()),
            metadata,
            attachments,
            cache,
            ledger,
            watermark: None,
            fallback: None,
        }
    }

    /// Enable forensic watermarking of originals served to known viewers
    pub fn with_watermark(mut self, codec: WatermarkCodec) -> Self {
        self.watermark = Some(Arc::new(codec));
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackImage) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn ledger(&self) -> &Arc<dyn WatermarkLedger> {
        &self.ledger
    }

    /// Serve one protected image request
    pub async fn serve(&self, request: &ProtectedUrl, viewer: &Viewer) -> ServeOutcome {
        if !self.codec.verify_url(request) {
            warn!(
                attachment = %request.attachment,
                item = %request.item,
                "Rejected protected URL with invalid token"
            );
            return ServeOutcome::Denied(DenyReason::TokenInvalid);
        }

        let attachment = match self.attachments.attachment(request.attachment) {
            Ok(Some(attachment)) => attachment,
            Ok(None) => return ServeOutcome::Denied(DenyReason::NotFound),
            Err(e) => {
                warn!("Attachment lookup for {} failed: {}", request.attachment, e);
                return ServeOutcome::Denied(DenyReason::NotFound);
            }
        };

        let (owner, decision) = self.policy.evaluate(
            &attachment,
            Some(request.item),
            viewer.authenticated,
            self.fallback.is_some(),
        );
        let owner = owner.map(|o| o.item);

        info!(
            attachment = %attachment.id,
            item = owner.as_ref().map(|o| o.id.0),
            sensitive = owner.as_ref().map_or(false, |o| o.sensitive),
            authenticated = viewer.authenticated,
            decision = ?decision,
            "Protected image access"
        );

        match decision {
            AccessDecision::Original => self.serve_original(&attachment, owner.as_ref(), viewer).await,
            AccessDecision::Blurred => self.serve_blurred(&attachment, owner.as_ref()),
            AccessDecision::Deny => ServeOutcome::Denied(DenyReason::AuthenticationRequired),
        }
    }

    async fn serve_original(
        &self,
        attachment: &Attachment,
        owner: Option<&ProtectedItem>,
        viewer: &Viewer,
    ) -> ServeOutcome {
        let source = match self.attachments.read(attachment.id) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to read attachment {}: {}", attachment.id, e);
                return ServeOutcome::Denied(DenyReason::NotFound);
            }
        };

        let target = match (&self.watermark, owner, viewer.id) {
            (Some(codec), Some(item), Some(viewer_id)) if item.sensitive && item.watermark_enabled => {
                Some((codec.clone(), item.id, viewer_id))
            }
            _ => None,
        };

        if let Some((codec, item, viewer_id)) = target {
            match self.watermarked(codec, attachment, &source, item, viewer_id, viewer).await {
                Ok(image) => return ServeOutcome::Served(image),
                Err(e) => warn!(
                    "Watermarking attachment {} for viewer {} failed, serving original: {}",
                    attachment.id, viewer_id, e
                ),
            }
        }

        let mime = imaging::sniff(&source)
            .map(|format| imaging::mime_type(format).to_string())
            .unwrap_or_else(|_| attachment.mime.clone());
        ServeOutcome::Served(ServedImage {
            bytes: Arc::new(source),
            mime,
            variant: ServedVariant::Original,
            sensitive: owner.map_or(false, |item| item.sensitive),
        })
    }

    /// Watermarked copy for `viewer_id`, from the cache or freshly embedded
    async fn watermarked(
        &self,
        codec: Arc<WatermarkCodec>,
        attachment: &Attachment,
        source: &[u8],
        item: ItemId,
        viewer_id: ViewerId,
        viewer: &Viewer,
    ) -> Result<ServedImage> {
        let format = imaging::sniff(source)?;
        let key = CacheKey::watermark(attachment.id, watermark_identity(viewer_id, item));
        let payload = WatermarkPayload::new(viewer_id, item, attachment.id, Utc::now());
        let record = WatermarkRecord {
            watermark_id: payload.watermark_id,
            viewer_id,
            item_id: item,
            source_attachment: attachment.id,
            created_at: Utc::now(),
            source_ip: viewer.ip.map(|ip| ip.to_string()),
        };

        let cache = self.cache.clone();
        let source = source.to_vec();
        let cache_key = key.clone();
        let cached = tokio::task::spawn_blocking(move || {
            cache.get_or_create(&cache_key, imaging::extension(format), || {
                let embedded = codec.embed(&source, &payload)?;
                debug!(
                    "Embedded watermark {} using {:?}",
                    payload.watermark_id, embedded.applied
                );
                Ok(embedded.bytes)
            })
        })
        .await
        .map_err(|e| ShieldError::transform(TransformStage::Watermark, e.to_string()))??;

        if cached.created {
            // An unrecorded copy must not be served or kept
            if let Err(e) = self.ledger.append(record.clone()).await {
                if let Err(remove_err) = self.cache.remove(&key, imaging::extension(format)) {
                    warn!("Failed to drop unrecorded watermark {}: {}", record.watermark_id, remove_err);
                }
                return Err(e.into());
            }
            info!(
                watermark = %record.watermark_id,
                viewer = %viewer_id,
                item = %item,
                "Issued forensic watermark"
            );
        }

        Ok(ServedImage {
            bytes: Arc::new(cached.read()?),
            mime: imaging::mime_type(format).to_string(),
            variant: ServedVariant::Watermarked,
            sensitive: true,
        })
    }

    fn serve_blurred(&self, attachment: &Attachment, owner: Option<&ProtectedItem>) -> ServeOutcome {
        if let Some(item) = owner {
            match self.blurred_bytes(item.id, attachment) {
                Ok(Some(image)) => return ServeOutcome::Served(image),
                Ok(None) => debug!("No blurred derivative yet for attachment {}", attachment.id),
                Err(e) => warn!("Failed to load blurred derivative of {}: {}", attachment.id, e),
            }
        }

        match &self.fallback {
            Some(fallback) => ServeOutcome::Served(fallback.served()),
            None => ServeOutcome::Denied(DenyReason::AuthenticationRequired),
        }
    }

    fn blurred_bytes(&self, item: ItemId, attachment: &Attachment) -> Result<Option<ServedImage>> {
        let Some(blurred) = self.metadata.derivative_mapping(item)?.get(attachment.id) else {
            return Ok(None);
        };
        let Some(record) = self.attachments.attachment(blurred)? else {
            return Ok(None);
        };
        let bytes = self.attachments.read(blurred)?;
        Ok(Some(ServedImage {
            bytes: Arc::new(bytes),
            mime: record.mime,
            variant: ServedVariant::Blurred,
            sensitive: true,
        }))
    }
}
