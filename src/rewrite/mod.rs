//! Content rewrite pass
//!
//! Rewrites every image reference in rendered content of a sensitive item
//! to a protected URL. Rules run in a fixed order; each one only touches
//! references it can resolve to a stored, non-derivative attachment.


use std::borrow::Cow;
use std::sync::{Arc, OnceLock};

use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::core::types::{AttachmentId, ItemId, ProtectedItem, SizeClass};
use crate::store::AttachmentStore;
use crate::token::UrlMinter;

/// Attributes that can carry an image URL on an `<img>` tag
pub const IMAGE_URL_ATTRIBUTES: [&str; 6] = ["src", "srcset", "data-src", "data-srcset", "data-lazy-src", "data-original"];

/// One rewrite capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteRule {
    /// `<img>` tags carrying an `attachment-<id>` class
    AttachmentClassImage,
    /// Elements carrying a `data-id="<id>"` attribute
    DataIdElement,
    /// `<img>` tags whose `src` points into the upload area
    UploadSourceImage,
    /// CSS `url(...)` references into the upload area
    BackgroundImage,
    /// Plain occurrences of the item's own attachment URLs
    KnownAttachmentUrl,
}

impl RewriteRule {
    pub const DEFAULT: [RewriteRule; 5] = [
        RewriteRule::AttachmentClassImage,
        RewriteRule::DataIdElement,
        RewriteRule::UploadSourceImage,
        RewriteRule::BackgroundImage,
        RewriteRule::KnownAttachmentUrl,
    ];
}

fn pattern(cell: &'static OnceLock<Regex>, source: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("valid rewrite pattern"))
}

fn img_tag() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"(?i)<img\b[^>]*>")
}

fn class_reference() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r#"(?i)\bclass\s*=\s*["'][^"']*\battachment-(\d+)\b"#)
}

fn data_id_element() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r#"(?i)<[a-z][^>]*\bdata-id\s*=\s*["'](\d+)["'][^>]*>"#)
}

fn src_attribute() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r#"(?i)\ssrc\s*=\s*["']([^"']*)["']"#)
}

fn url_attributes() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(
        &CELL,
        r#"(?i)(\s)(src|srcset|data-src|data-srcset|data-lazy-src|data-original)\s*=\s*["'][^"']*["']"#,
    )
}

fn css_url() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r#"url\(\s*(?:&quot;|["'])?([^"')&]*)(?:&quot;|["'])?\s*\)"#)
}

/// Escape a URL for use inside an HTML attribute
fn html_attr(url: &str) -> String {
    url.replace('&', "&amp;")
}

/// Rewrites image references to protected URLs
pub struct ContentRewriter {
    minter: UrlMinter,
    attachments: Arc<dyn AttachmentStore>,
    upload_base_url: String,
    rules: Vec<RewriteRule>,
    size: SizeClass,
}

impl ContentRewriter {
    pub fn new(minter: UrlMinter, attachments: Arc<dyn AttachmentStore>, upload_base_url: impl Into<String>) -> Self {
        Self {
            minter,
            attachments,
            upload_base_url: upload_base_url.into(),
            rules: RewriteRule::DEFAULT.to_vec(),
            size: SizeClass::Full,
        }
    }

    pub fn with_rules(mut self, rules: Vec<RewriteRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_size(mut self, size: SizeClass) -> Self {
        self.size = size;
        self
    }

    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    /// Rewrite `content` rendered for `item`; non-sensitive items pass through
    pub fn rewrite<'a>(&self, item: &ProtectedItem, content: &'a str) -> Cow<'a, str> {
        if !item.sensitive {
            return Cow::Borrowed(content);
        }

        let mut current = Cow::Borrowed(content);
        for rule in &self.rules {
            let next = self.apply(*rule, item.id, &current);
            if let Cow::Owned(rewritten) = next {
                current = Cow::Owned(rewritten);
            }
        }
        current
    }

    fn apply<'c>(&self, rule: RewriteRule, item: ItemId, content: &'c str) -> Cow<'c, str> {
        match rule {
            RewriteRule::AttachmentClassImage => img_tag().replace_all(content, |caps: &Captures| {
                let tag = &caps[0];
                class_reference()
                    .captures(tag)
                    .and_then(|c| c[1].parse::<u64>().ok())
                    .and_then(|id| self.protected_for(AttachmentId(id), item))
                    .map_or_else(|| tag.to_string(), |url| replace_url_attributes(tag, &url))
            }),
            RewriteRule::DataIdElement => data_id_element().replace_all(content, |caps: &Captures| {
                let tag = &caps[0];
                let Some(id) = caps[1].parse::<u64>().ok().map(AttachmentId) else {
                    return tag.to_string();
                };
                match (self.original_url(id), self.protected_for(id, item)) {
                    (Some(original), Some(url)) if !original.is_empty() => tag.replace(&original, &url),
                    _ => tag.to_string(),
                }
            }),
            RewriteRule::UploadSourceImage => img_tag().replace_all(content, |caps: &Captures| {
                let tag = &caps[0];
                src_attribute()
                    .captures(tag)
                    .and_then(|c| self.resolve_upload_url(&c[1]))
                    .and_then(|id| self.protected_for(id, item))
                    .map_or_else(|| tag.to_string(), |url| replace_url_attributes(tag, &url))
            }),
            RewriteRule::BackgroundImage => css_url().replace_all(content, |caps: &Captures| {
                let whole = &caps[0];
                let source = &caps[1];
                self.resolve_upload_url(source)
                    .and_then(|id| self.protected_for(id, item))
                    .map_or_else(|| whole.to_string(), |url| whole.replace(source, &url))
            }),
            RewriteRule::KnownAttachmentUrl => self.replace_known_urls(item, content),
        }
    }

    /// Escaped protected URL for a non-derivative stored attachment
    fn protected_for(&self, attachment: AttachmentId, item: ItemId) -> Option<String> {
        if !attachment.is_valid() {
            return None;
        }
        match self.attachments.attachment(attachment) {
            Ok(Some(record)) if !record.is_derivative() => {
                Some(html_attr(&self.minter.mint_url(attachment, item, self.size)))
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Rewrite lookup for attachment {} failed: {}", attachment, e);
                None
            }
        }
    }

    fn original_url(&self, attachment: AttachmentId) -> Option<String> {
        self.attachments.attachment(attachment).ok().flatten().map(|a| a.url)
    }

    fn resolve_upload_url(&self, url: &str) -> Option<AttachmentId> {
        if self.upload_base_url.is_empty() || !url.contains(&self.upload_base_url) {
            return None;
        }
        match self.attachments.find_by_url(url) {
            Ok(found) => found,
            Err(e) => {
                warn!("Rewrite lookup for URL {} failed: {}", url, e);
                None
            }
        }
    }

    fn replace_known_urls<'c>(&self, item: ItemId, content: &'c str) -> Cow<'c, str> {
        let attached = match self.attachments.attached_to(item) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Failed to list attachments of item {}: {}", item, e);
                return Cow::Borrowed(content);
            }
        };

        let mut current = Cow::Borrowed(content);
        for id in attached {
            let Some(original) = self.original_url(id).filter(|u| !u.is_empty()) else {
                continue;
            };
            if !current.contains(original.as_str()) {
                continue;
            }
            if let Some(url) = self.protected_for(id, item) {
                debug!("Rewriting plain URL of attachment {} in item {}", id, item);
                current = Cow::Owned(current.replace(original.as_str(), &url));
            }
        }
        current
    }
}

/// Point every image URL attribute of `tag` at `url`
fn replace_url_attributes(tag: &str, url: &str) -> String {
    url_attributes()
        .replace_all(tag, |caps: &Captures| format!("{}{}=\"{}\"", &caps[1], &caps[2], url))
        .into_owned()
}
