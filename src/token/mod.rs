//! Protected URL tokens
//!
//! Every protected image URL carries `(attachment, item, size, token)`,
//! where the token is an HMAC-SHA256 of the tuple under the server secret.
//! Tokens are deterministic for a tuple, cannot be forged without the
//! secret and are compared in constant time. There is no expiry.

#[cfg(test)]
mod tests;

use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::core::config::TokenConfig;
use crate::core::error::ConfigError;
use crate::core::types::{AttachmentId, ItemId, SizeClass};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_DOMAIN: &[u8] = b"content-shield/protected-image/v1";

/// Length of a token in hex characters
pub const TOKEN_HEX_LEN: usize = 64;

/// Mints and verifies protected URL tokens
#[derive(Clone)]
pub struct TokenCodec {
    keyed: HmacSha256,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(secret: &SecretString) -> Result<Self, ConfigError> {
        Self::from_key(secret.expose_secret().as_bytes())
    }

    fn from_key(key: &[u8]) -> Result<Self, ConfigError> {
        if key.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "token.secret".to_string(),
                value: "\"\"".to_string(),
            });
        }
        let keyed = HmacSha256::new_from_slice(key).map_err(|e| ConfigError::InvalidValue {
            field: "token.secret".to_string(),
            value: e.to_string(),
        })?;
        Ok(Self { keyed })
    }

    /// Codec keyed with a fresh random secret
    pub fn ephemeral() -> Result<Self, ConfigError> {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::from_key(&key)
    }

    /// Codec for the configured secret, or an ephemeral one when none is set
    pub fn from_config(config: &TokenConfig) -> Result<Self, ConfigError> {
        match &config.secret {
            Some(secret) => Self::new(secret),
            None => {
                tracing::warn!(
                    "No token secret configured; protected URLs will not survive a restart"
                );
                Self::ephemeral()
            }
        }
    }

    fn mac_for(&self, attachment: AttachmentId, item: ItemId, size: SizeClass) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(TOKEN_DOMAIN);
        mac.update(&[0]);
        mac.update(&attachment.0.to_be_bytes());
        mac.update(&item.0.to_be_bytes());
        mac.update(size.to_string().as_bytes());
        mac
    }

    /// Token for the tuple, as lowercase hex
    pub fn mint(&self, attachment: AttachmentId, item: ItemId, size: SizeClass) -> String {
        let digest = self.mac_for(attachment, item, size).finalize().into_bytes();
        hex::encode(digest)
    }

    /// Constant-time check of `token` against the tuple. Malformed input fails.
    pub fn verify(&self, attachment: AttachmentId, item: ItemId, size: SizeClass, token: &str) -> bool {
        if !attachment.is_valid() || !item.is_valid() || token.len() != TOKEN_HEX_LEN {
            return false;
        }
        let Ok(raw) = hex::decode(token) else {
            return false;
        };
        self.mac_for(attachment, item, size).verify_slice(&raw).is_ok()
    }

    pub fn verify_url(&self, url: &ProtectedUrl) -> bool {
        self.verify(url.attachment, url.item, url.size, &url.token)
    }
}

/// The parameters of a protected image URL, in query-string form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedUrl {
    #[serde(rename = "protected_image")]
    pub attachment: AttachmentId,
    pub item: ItemId,
    #[serde(default)]
    pub size: SizeClass,
    pub token: String,
}

impl ProtectedUrl {
    /// Query string without the leading `?`
    pub fn to_query(&self) -> String {
        serde_urlencoded::to_string(self).unwrap_or_default()
    }

    /// Full URL under `base`, which may already carry a query string
    pub fn to_url(&self, base: &str) -> String {
        let separator = match base.find('?') {
            None => "?",
            Some(_) if base.ends_with('?') || base.ends_with('&') => "",
            Some(_) => "&",
        };
        format!("{}{}{}", base, separator, self.to_query())
    }

    /// Decode the parameters of a query string; `None` if any is missing or malformed
    pub fn from_query(query: &str) -> Option<Self> {
        serde_urlencoded::from_str(query.trim_start_matches('?')).ok()
    }

    /// Parse a full URL; anything before `?` is ignored
    pub fn parse(url: &str) -> Option<Self> {
        let (_, query) = url.split_once('?')?;
        Self::from_query(query)
    }
}

/// Builds protected URLs under the gateway's public base URL
#[derive(Debug, Clone)]
pub struct UrlMinter {
    codec: TokenCodec,
    base_url: String,
}

impl UrlMinter {
    pub fn new(codec: TokenCodec, base_url: impl Into<String>) -> Self {
        Self {
            codec,
            base_url: base_url.into(),
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn protected_url(&self, attachment: AttachmentId, item: ItemId, size: SizeClass) -> ProtectedUrl {
        ProtectedUrl {
            attachment,
            item,
            size,
            token: self.codec.mint(attachment, item, size),
        }
    }

    pub fn mint_url(&self, attachment: AttachmentId, item: ItemId, size: SizeClass) -> String {
        self.protected_url(attachment, item, size).to_url(&self.base_url)
    }
}
