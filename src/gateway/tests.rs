//! Tests for the protection gateway
//!
//! Covers the serve pipeline end to end over in-memory stores and the
//! HTTP status and header mapping of the router.

use super::*;
use crate::cache::{CacheKey, DerivativeCache, DerivativeCacheConfig};
use crate::core::error::LedgerError;
use crate::core::types::{Attachment, AttachmentId, DerivativeMapping, ItemId, ProtectedItem, SizeClass, Viewer, ViewerId};
use crate::imaging::fixtures;
use crate::store::{MemoryStore, MetadataStore};
use crate::token::{ProtectedUrl, TokenCodec, UrlMinter};
use crate::watermark::{
    LedgerResult, MemoryLedger, WatermarkCodec, WatermarkId, WatermarkLedger, WatermarkMethod, WatermarkRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use image::ImageFormat;
use secrecy::SecretString;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const SENSITIVE: ItemId = ItemId(1);
const PLAIN: ItemId = ItemId(2);
const SENSITIVE_IMAGE: AttachmentId = AttachmentId(10);
const PLAIN_IMAGE: AttachmentId = AttachmentId(20);

fn attachment(id: AttachmentId, parent: ItemId, mime: &str) -> Attachment {
    Attachment {
        id,
        mime: mime.into(),
        width: 48,
        height: 48,
        url: format!("/uploads/{}.png", id),
        parent: Some(parent),
        derivative_of: None,
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    ledger: Arc<MemoryLedger>,
    cache: Arc<DerivativeCache>,
    minter: UrlMinter,
    _dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        store.upsert_item(ProtectedItem::new(SENSITIVE).with_sensitive(true));
        store.upsert_item(ProtectedItem::new(PLAIN));
        store.insert_attachment(attachment(SENSITIVE_IMAGE, SENSITIVE, "image/png"), fixtures::png(48, 48, 1));
        store.insert_attachment(attachment(PLAIN_IMAGE, PLAIN, "image/png"), fixtures::png(48, 48, 2));

        let dir = TempDir::new().unwrap();
        let cache = Arc::new(DerivativeCache::new(DerivativeCacheConfig::with_cache_dir(dir.path().to_path_buf())).unwrap());
        let codec = TokenCodec::new(&SecretString::new("gateway-test-secret".into())).unwrap();
        Self {
            store,
            ledger: Arc::new(MemoryLedger::new()),
            cache,
            minter: UrlMinter::new(codec, "/protected"),
            _dir: dir,
        }
    }

    fn gateway(&self) -> ProtectionGateway {
        ProtectionGateway::new(
            self.minter.codec().clone(),
            self.store.clone(),
            self.store.clone(),
            self.cache.clone(),
            self.ledger.clone(),
        )
        .with_watermark(WatermarkCodec::default())
    }

    fn url(&self, attachment: AttachmentId, item: ItemId) -> ProtectedUrl {
        self.minter.protected_url(attachment, item, SizeClass::Full)
    }
}

fn served(outcome: ServeOutcome) -> ServedImage {
    match outcome {
        ServeOutcome::Served(image) => image,
        ServeOutcome::Denied(reason) => panic!("unexpected denial: {:?}", reason),
    }
}

fn fallback() -> FallbackImage {
    FallbackImage::from_bytes(fixtures::png(4, 4, 99)).unwrap()
}

#[tokio::test]
async fn test_tampered_token_is_denied() {
    let h = Harness::new();
    let gateway = h.gateway();
    let mut url = h.url(PLAIN_IMAGE, PLAIN);
    url.item = SENSITIVE;

    let outcome = gateway.serve(&url, &Viewer::anonymous()).await;
    assert!(matches!(outcome, ServeOutcome::Denied(DenyReason::TokenInvalid)));
}

#[tokio::test]
async fn test_missing_attachment_is_not_found() {
    let h = Harness::new();
    let outcome = h.gateway().serve(&h.url(AttachmentId(999), PLAIN), &Viewer::anonymous()).await;
    assert!(matches!(outcome, ServeOutcome::Denied(DenyReason::NotFound)));
}

#[tokio::test]
async fn test_plain_item_serves_original() {
    let h = Harness::new();
    let image = served(h.gateway().serve(&h.url(PLAIN_IMAGE, PLAIN), &Viewer::anonymous()).await);
    assert_eq!(image.variant, ServedVariant::Original);
    assert_eq!(image.mime, "image/png");
    assert_eq!(image.bytes.as_ref(), &fixtures::png(48, 48, 2));
}

#[tokio::test]
async fn test_anonymous_without_derivative_or_fallback_is_denied() {
    let h = Harness::new();
    let outcome = h.gateway().serve(&h.url(SENSITIVE_IMAGE, SENSITIVE), &Viewer::anonymous()).await;
    assert!(matches!(outcome, ServeOutcome::Denied(DenyReason::AuthenticationRequired)));
}

#[tokio::test]
async fn test_anonymous_gets_fallback_then_blurred() {
    let h = Harness::new();
    let gateway = h.gateway().with_fallback(fallback());
    let url = h.url(SENSITIVE_IMAGE, SENSITIVE);

    let image = served(gateway.serve(&url, &Viewer::anonymous()).await);
    assert_eq!(image.variant, ServedVariant::Fallback);

    let blurred_bytes = fixtures::png(48, 48, 7);
    let mut blurred = attachment(AttachmentId(11), SENSITIVE, "image/png");
    blurred.derivative_of = Some(SENSITIVE_IMAGE);
    h.store.insert_attachment(blurred, blurred_bytes.clone());
    let mut mapping = DerivativeMapping::new();
    mapping.insert(SENSITIVE_IMAGE, AttachmentId(11));
    h.store.set_derivative_mapping(SENSITIVE, &mapping).unwrap();

    let image = served(gateway.serve(&url, &Viewer::anonymous()).await);
    assert_eq!(image.variant, ServedVariant::Blurred);
    assert_eq!(image.bytes.as_ref(), &blurred_bytes);
}

#[tokio::test]
async fn test_authenticated_viewer_gets_cached_watermark() {
    let h = Harness::new();
    let gateway = h.gateway();
    let url = h.url(SENSITIVE_IMAGE, SENSITIVE);
    let viewer = Viewer::authenticated(ViewerId(42)).with_ip("203.0.113.9".parse().unwrap());

    let first = served(gateway.serve(&url, &viewer).await);
    assert_eq!(first.variant, ServedVariant::Watermarked);
    assert_ne!(first.bytes.as_ref(), &fixtures::png(48, 48, 1));

    let extraction = WatermarkCodec::default().extract(&first.bytes).unwrap().unwrap();
    assert_eq!(extraction.payload.viewer_id, ViewerId(42));
    assert_eq!(extraction.payload.item_id, SENSITIVE);

    let record = h.ledger.find(&extraction.payload.watermark_id).await.unwrap().unwrap();
    assert_eq!(record.source_attachment, SENSITIVE_IMAGE);
    assert_eq!(record.source_ip.as_deref(), Some("203.0.113.9"));

    let second = served(gateway.serve(&url, &viewer).await);
    assert_eq!(first.bytes, second.bytes);
    assert_eq!(h.ledger.len(), 1);

    let other = served(gateway.serve(&url, &Viewer::authenticated(ViewerId(43))).await);
    assert_ne!(other.bytes, first.bytes);
    assert_eq!(h.ledger.len(), 2);
    assert_eq!(h.ledger.for_viewer(ViewerId(43), 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_watermark_skipped_when_disabled_or_anonymous_id() {
    let h = Harness::new();
    h.store.update_item(SENSITIVE, |item| item.watermark_enabled = false).unwrap();
    let gateway = h.gateway();
    let url = h.url(SENSITIVE_IMAGE, SENSITIVE);

    let image = served(gateway.serve(&url, &Viewer::authenticated(ViewerId(42))).await);
    assert_eq!(image.variant, ServedVariant::Original);

    h.store.update_item(SENSITIVE, |item| item.watermark_enabled = true).unwrap();
    let no_id = Viewer {
        authenticated: true,
        ..Viewer::anonymous()
    };
    let image = served(gateway.serve(&url, &no_id).await);
    assert_eq!(image.variant, ServedVariant::Original);
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn test_watermark_failure_serves_original() {
    let h = Harness::new();
    let jpeg = fixtures::encoded(&fixtures::noise(48, 48, 5), ImageFormat::Jpeg);
    h.store.insert_attachment(attachment(AttachmentId(30), SENSITIVE, "image/jpeg"), jpeg.clone());
    let gateway = ProtectionGateway::new(
        h.minter.codec().clone(),
        h.store.clone(),
        h.store.clone(),
        h.cache.clone(),
        h.ledger.clone(),
    )
    .with_watermark(WatermarkCodec::new(vec![WatermarkMethod::Metadata]));

    let image = served(gateway.serve(&h.url(AttachmentId(30), SENSITIVE), &Viewer::authenticated(ViewerId(1))).await);
    assert_eq!(image.variant, ServedVariant::Original);
    assert_eq!(image.mime, "image/jpeg");
    assert_eq!(image.bytes.as_ref(), &jpeg);
    assert!(h.ledger.is_empty());
}

#[test]
fn test_watermark_identity_binds_viewer_and_item() {
    let a = watermark_identity(ViewerId(1), ItemId(2));
    assert_eq!(a.len(), 64);
    assert_eq!(a, watermark_identity(ViewerId(1), ItemId(2)));
    assert_ne!(a, watermark_identity(ViewerId(2), ItemId(1)));
}

#[test]
fn test_viewer_resolver() {
    let resolver = ViewerResolver::new("X-Viewer-Id").unwrap();
    let mut headers = HeaderMap::new();
    assert_eq!(resolver.resolve(&headers), Viewer::anonymous());

    headers.insert("x-viewer-id", HeaderValue::from_static("17"));
    headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.4, 10.0.0.1"));
    let viewer = resolver.resolve(&headers);
    assert_eq!(viewer.id, Some(ViewerId(17)));
    assert!(viewer.authenticated);
    assert_eq!(viewer.ip, Some("198.51.100.4".parse().unwrap()));

    headers.insert("x-viewer-id", HeaderValue::from_static("0"));
    assert!(!resolver.resolve(&headers).authenticated);
}

#[test]
fn test_deny_status_codes() {
    assert_eq!(DenyReason::TokenInvalid.status_code(), StatusCode::FORBIDDEN);
    assert_eq!(DenyReason::NotFound.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(DenyReason::AuthenticationRequired.status_code(), StatusCode::UNAUTHORIZED);
    assert!(DenyReason::TokenInvalid.is_forbidden());
    assert!(DenyReason::NotFound.is_not_found());
}

fn router(gateway: ProtectionGateway) -> axum::Router {
    build_router(GatewayState {
        gateway: Arc::new(gateway),
        viewers: ViewerResolver::new("x-viewer-id").unwrap(),
    })
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_http_watermarked_response() {
    let h = Harness::new();
    let app = router(h.gateway());
    let uri = h.minter.mint_url(SENSITIVE_IMAGE, SENSITIVE, SizeClass::Full);

    let request = Request::builder()
        .uri(uri)
        .header("x-viewer-id", "42")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "private, max-age=3600");
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    assert_eq!(response.headers()["x-frame-options"], "DENY");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(!body.is_empty());
}

#[tokio::test]
async fn test_http_blurred_response_marks_login_required() {
    let h = Harness::new();
    let app = router(h.gateway().with_fallback(fallback()));
    let uri = h.minter.mint_url(SENSITIVE_IMAGE, SENSITIVE, SizeClass::Full);

    let response = app.oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[LOGIN_REQUIRED_HEADER], "true");
    assert_eq!(
        response.headers()[header::CACHE_CONTROL],
        "no-cache, no-store, must-revalidate"
    );
}

#[tokio::test]
async fn test_http_denials_carry_no_details() {
    let h = Harness::new();
    let app = router(h.gateway());

    let forged = "/protected?protected_image=20&item=2&size=full&token=00";
    let response = app.clone().oneshot(get(forged)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(to_bytes(response.into_body(), usize::MAX).await.unwrap().is_empty());

    let response = app.clone().oneshot(get("/protected")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let uri = h.minter.mint_url(SENSITIVE_IMAGE, SENSITIVE, SizeClass::Full);
    let response = app.clone().oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"Authentication required");

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
}

/// Ledger whose writes always fail
struct BrokenLedger;

#[async_trait]
impl WatermarkLedger for BrokenLedger {
    async fn append(&self, _record: WatermarkRecord) -> LedgerResult<()> {
        Err(LedgerError::CorruptRecord {
            reason: "disk full".into(),
        })
    }

    async fn find(&self, _id: &WatermarkId) -> LedgerResult<Option<WatermarkRecord>> {
        Ok(None)
    }

    async fn for_viewer(&self, _viewer: ViewerId, _limit: usize) -> LedgerResult<Vec<WatermarkRecord>> {
        Ok(Vec::new())
    }

    async fn for_item(&self, _item: ItemId, _limit: usize) -> LedgerResult<Vec<WatermarkRecord>> {
        Ok(Vec::new())
    }

    async fn prune_before(&self, _cutoff: DateTime<Utc>) -> LedgerResult<u64> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_unrecorded_watermark_is_not_served_or_cached() {
    let h = Harness::new();
    let gateway = ProtectionGateway::new(
        h.minter.codec().clone(),
        h.store.clone(),
        h.store.clone(),
        h.cache.clone(),
        Arc::new(BrokenLedger),
    )
    .with_watermark(WatermarkCodec::default());
    let url = h.url(SENSITIVE_IMAGE, SENSITIVE);
    let viewer = Viewer::authenticated(ViewerId(42));
    let key = CacheKey::watermark(SENSITIVE_IMAGE, watermark_identity(ViewerId(42), SENSITIVE));

    for _ in 0..2 {
        let image = served(gateway.serve(&url, &viewer).await);
        assert_eq!(image.variant, ServedVariant::Original);
        assert_eq!(image.bytes.as_ref(), &fixtures::png(48, 48, 1));
        assert!(h.cache.lookup(&key, "png").is_none());
    }
}

#[tokio::test]
async fn test_http_sensitive_original_is_never_publicly_cached() {
    let h = Harness::new();
    let app = router(ProtectionGateway::new(
        h.minter.codec().clone(),
        h.store.clone(),
        h.store.clone(),
        h.cache.clone(),
        h.ledger.clone(),
    ));

    let uri = h.minter.mint_url(SENSITIVE_IMAGE, SENSITIVE, SizeClass::Full);
    let request = Request::builder()
        .uri(uri)
        .header("x-viewer-id", "42")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cache_control = response.headers()[header::CACHE_CONTROL].to_str().unwrap();
    assert!(!cache_control.contains("public"));
    assert_eq!(cache_control, "private, max-age=31536000");
    assert_eq!(response.headers()[header::VARY], "x-viewer-id");

    let plain = h.minter.mint_url(PLAIN_IMAGE, PLAIN, SizeClass::Full);
    let response = app.oneshot(get(&plain)).await.unwrap();
    assert_eq!(response.headers()[header::CACHE_CONTROL], "public, max-age=31536000");
    assert!(response.headers().get(header::VARY).is_none());
}

#[tokio::test]
async fn test_http_decodes_percent_encoded_query() {
    let h = Harness::new();
    let app = router(h.gateway());
    let url = h.url(PLAIN_IMAGE, PLAIN);
    let uri = format!(
        "/protected?protected_image=%32%30&item=2&size=full&token={}&utm=x",
        url.token
    );
    let response = app.oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
