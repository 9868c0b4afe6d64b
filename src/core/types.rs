//! Core domain types shared by every protection component
//!
//! - Opaque identifiers for attachments, items and viewers
//! - Attachment and protected item records as the stores expose them
//! - Blur job state and the per-item derivative mapping
//! - Size classes carried in protected URLs

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::OnceLock;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Zero is never a valid id
            pub fn is_valid(self) -> bool {
                self.0 > 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

opaque_id!(
    /// Identifier of a stored media attachment
    AttachmentId
);
opaque_id!(
    /// Identifier of a content item that may own attachments
    ItemId
);
opaque_id!(
    /// Identifier of an authenticated viewer
    ViewerId
);

/// Class marker used in item bodies to reference an attachment inline
pub const ATTACHMENT_CLASS_PREFIX: &str = "attachment-";

fn inline_reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\battachment-(\d+)\b").expect("valid inline reference pattern"))
}

/// A stored media attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub mime: String,
    pub width: u32,
    pub height: u32,
    /// Public URL the host renders for this attachment
    pub url: String,
    /// Item the attachment was uploaded to
    #[serde(default)]
    pub parent: Option<ItemId>,
    /// Set on blurred derivatives, pointing back at the original
    #[serde(default)]
    pub derivative_of: Option<AttachmentId>,
}

impl Attachment {
    pub fn is_derivative(&self) -> bool {
        self.derivative_of.is_some()
    }
}

/// A content item that may be flagged sensitive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedItem {
    pub id: ItemId,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub primary_image: Option<AttachmentId>,
    #[serde(default)]
    pub body: String,
    /// Attachments the editor explicitly marked as protected
    #[serde(default)]
    pub protected_ids: BTreeSet<AttachmentId>,
    #[serde(default = "default_true")]
    pub watermark_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ProtectedItem {
    pub fn new(id: ItemId) -> Self {
        Self {
            id,
            sensitive: false,
            primary_image: None,
            body: String::new(),
            protected_ids: BTreeSet::new(),
            watermark_enabled: true,
        }
    }

    pub fn with_sensitive(mut self, sensitive: bool) -> Self {
        self.sensitive = sensitive;
        self
    }

    pub fn with_primary_image(mut self, attachment: AttachmentId) -> Self {
        self.primary_image = Some(attachment);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_protected(mut self, attachment: AttachmentId) -> Self {
        self.protected_ids.insert(attachment);
        self
    }

    pub fn with_watermark(mut self, enabled: bool) -> Self {
        self.watermark_enabled = enabled;
        self
    }

    /// Attachments referenced inline in the body, in order of first mention
    pub fn inline_attachments(&self) -> Vec<AttachmentId> {
        let mut seen = BTreeSet::new();
        inline_reference_pattern()
            .captures_iter(&self.body)
            .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
            .map(AttachmentId)
            .filter(|id| id.is_valid() && seen.insert(*id))
            .collect()
    }

    pub fn mentions(&self, attachment: AttachmentId) -> bool {
        self.inline_attachments().contains(&attachment)
    }
}

/// Requested rendition of an attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Thumbnail,
    Medium,
    Large,
    Full,
    Custom { width: u32, height: u32 },
}

impl Default for SizeClass {
    fn default() -> Self {
        SizeClass::Full
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeClass::Thumbnail => f.write_str("thumbnail"),
            SizeClass::Medium => f.write_str("medium"),
            SizeClass::Large => f.write_str("large"),
            SizeClass::Full => f.write_str("full"),
            SizeClass::Custom { width, height } => write!(f, "{}x{}", width, height),
        }
    }
}

impl FromStr for SizeClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thumbnail" => Ok(SizeClass::Thumbnail),
            "medium" => Ok(SizeClass::Medium),
            "large" => Ok(SizeClass::Large),
            "full" => Ok(SizeClass::Full),
            other => {
                let (w, h) = other
                    .split_once('x')
                    .ok_or_else(|| format!("unknown size class '{}'", other))?;
                let width = w.parse::<u32>().map_err(|_| format!("invalid width '{}'", w))?;
                let height = h.parse::<u32>().map_err(|_| format!("invalid height '{}'", h))?;
                if width == 0 || height == 0 {
                    return Err(format!("empty size '{}'", other));
                }
                Ok(SizeClass::Custom { width, height })
            }
        }
    }
}

impl Serialize for SizeClass {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SizeClass {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle phase of an item's blur job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BlurPhase {
    #[default]
    None,
    Queued,
    Processing,
    Stopping,
    Complete,
}

impl BlurPhase {
    /// Queued, processing or waiting for a stop to be observed
    pub fn is_active(self) -> bool {
        matches!(self, BlurPhase::Queued | BlurPhase::Processing | BlurPhase::Stopping)
    }
}

impl fmt::Display for BlurPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlurPhase::None => "none",
            BlurPhase::Queued => "queued",
            BlurPhase::Processing => "processing",
            BlurPhase::Stopping => "stopping",
            BlurPhase::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Persisted progress of an item's blur job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlurJobState {
    pub phase: BlurPhase,
    pub total_images: u32,
    pub processed_images: u32,
    pub queued_at: Option<DateTime<Utc>>,
}

impl BlurJobState {
    pub fn queued(now: DateTime<Utc>) -> Self {
        Self {
            phase: BlurPhase::Queued,
            total_images: 0,
            processed_images: 0,
            queued_at: Some(now),
        }
    }

    /// Completion percentage, 100 for an empty job
    pub fn percent(&self) -> u8 {
        if self.total_images == 0 {
            return if self.phase == BlurPhase::Complete { 100 } else { 0 };
        }
        let pct = u64::from(self.processed_images.min(self.total_images)) * 100
            / u64::from(self.total_images);
        pct as u8
    }
}

/// One original to blurred derivative pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeEntry {
    pub original: AttachmentId,
    pub blurred: AttachmentId,
}

/// Ordered original to blurred mapping persisted per item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct DerivativeMapping {
    entries: Vec<DerivativeEntry>,
}

impl DerivativeMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, original: AttachmentId) -> Option<AttachmentId> {
        self.entries
            .iter()
            .find(|entry| entry.original == original)
            .map(|entry| entry.blurred)
    }

    pub fn contains(&self, original: AttachmentId) -> bool {
        self.get(original).is_some()
    }

    /// Insert or replace the derivative for `original`, keeping its position
    pub fn insert(&mut self, original: AttachmentId, blurred: AttachmentId) -> Option<AttachmentId> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.original == original) {
            let previous = entry.blurred;
            entry.blurred = blurred;
            return Some(previous);
        }
        self.entries.push(DerivativeEntry { original, blurred });
        None
    }

    pub fn entries(&self) -> &[DerivativeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of the access decision for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessDecision {
    Original,
    Blurred,
    Deny,
}

/// The requesting viewer as the front controller identified them
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Viewer {
    pub id: Option<ViewerId>,
    pub authenticated: bool,
    pub ip: Option<IpAddr>,
}

impl Viewer {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(id: ViewerId) -> Self {
        Self {
            id: Some(id),
            authenticated: true,
            ip: None,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_parse_roundtrip() {
        for raw in ["thumbnail", "medium", "large", "full", "640x480"] {
            let parsed: SizeClass = raw.parse().unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
        assert!("0x10".parse::<SizeClass>().is_err());
        assert!("huge".parse::<SizeClass>().is_err());
    }

    #[test]
    fn test_inline_attachments_in_order_without_duplicates() {
        let item = ProtectedItem::new(ItemId(1)).with_body(
            r#"<img class="attachment-12" src="a"><p>x</p><img class="size-full attachment-7"><img class="attachment-12">"#,
        );
        assert_eq!(item.inline_attachments(), vec![AttachmentId(12), AttachmentId(7)]);
        assert!(item.mentions(AttachmentId(7)));
        assert!(!item.mentions(AttachmentId(1)));
    }

    #[test]
    fn test_mapping_insert_replaces_in_place() {
        let mut mapping = DerivativeMapping::new();
        assert_eq!(mapping.insert(AttachmentId(1), AttachmentId(10)), None);
        mapping.insert(AttachmentId(2), AttachmentId(20));
        assert_eq!(mapping.insert(AttachmentId(1), AttachmentId(11)), Some(AttachmentId(10)));
        assert_eq!(mapping.entries()[0].blurred, AttachmentId(11));
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn test_job_percent() {
        let mut state = BlurJobState::default();
        assert_eq!(state.percent(), 0);
        state.total_images = 4;
        state.processed_images = 3;
        assert_eq!(state.percent(), 75);
        state = BlurJobState { phase: BlurPhase::Complete, ..Default::default() };
        assert_eq!(state.percent(), 100);
    }
}
