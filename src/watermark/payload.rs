//! Watermark identity and payload

use std::fmt;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::core::error::{Result, ShieldError, TransformStage};
use crate::core::types::{AttachmentId, ItemId, ViewerId};

/// Current payload layout version
pub const PAYLOAD_VERSION: u8 = 1;

/// 256-bit watermark identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatermarkId([u8; 32]);

impl WatermarkId {
    /// Fresh id bound to the viewer, item, source and time, salted with randomness
    pub fn generate(viewer: ViewerId, item: ItemId, source: AttachmentId, at: DateTime<Utc>) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut hasher = Sha256::new();
        hasher.update(viewer.0.to_be_bytes());
        hasher.update(item.0.to_be_bytes());
        hasher.update(source.0.to_be_bytes());
        hasher.update(at.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
        hasher.update(salt);
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(raw: &str) -> Option<Self> {
        let bytes = hex::decode(raw).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Seed for the pattern-based methods
    pub fn seed(&self) -> u64 {
        let digest = blake3::hash(&self.0);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }
}

impl fmt::Display for WatermarkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for WatermarkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WatermarkId({})", &self.to_hex()[..16])
    }
}

impl Serialize for WatermarkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for WatermarkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        WatermarkId::from_hex(&raw).ok_or_else(|| serde::de::Error::custom("invalid watermark id"))
    }
}

/// Identity carried inside a watermarked image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkPayload {
    #[serde(rename = "id")]
    pub watermark_id: WatermarkId,
    #[serde(rename = "viewer")]
    pub viewer_id: ViewerId,
    #[serde(rename = "item")]
    pub item_id: ItemId,
    #[serde(rename = "time")]
    pub timestamp: i64,
    #[serde(rename = "version")]
    pub format_version: u8,
}

impl WatermarkPayload {
    pub fn new(viewer: ViewerId, item: ItemId, source: AttachmentId, at: DateTime<Utc>) -> Self {
        Self {
            watermark_id: WatermarkId::generate(viewer, item, source, at),
            viewer_id: viewer,
            item_id: item,
            timestamp: at.timestamp(),
            format_version: PAYLOAD_VERSION,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| ShieldError::transform(TransformStage::Watermark, e.to_string()))
    }

    /// `None` for anything that is not a payload of a known version
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let payload: WatermarkPayload = serde_json::from_slice(bytes).ok()?;
        (payload.format_version == PAYLOAD_VERSION).then_some(payload)
    }
}
