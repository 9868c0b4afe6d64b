//! Access Policy
//!
//! Decides, per request, whether a viewer gets the original, the blurred
//! derivative, or nothing. Owner resolution walks several association
//! strategies and prefers a sensitive owner whenever one exists.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::warn;

use crate::core::types::{AccessDecision, Attachment, ItemId, ProtectedItem};
use crate::store::{AttachmentStore, MetadataStore, StoreResult};

/// Pure access decision for one request
pub fn decide(owner: Option<&ProtectedItem>, authenticated: bool, blur_available: bool) -> AccessDecision {
    match owner {
        None => AccessDecision::Original,
        Some(item) if !item.sensitive => AccessDecision::Original,
        Some(_) if authenticated => AccessDecision::Original,
        Some(_) if blur_available => AccessDecision::Blurred,
        Some(_) => AccessDecision::Deny,
    }
}

/// Association strategy linking an attachment to an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerStrategy {
    /// Item named by a verified protected URL
    Hint,
    Parent,
    PrimaryImage,
    ProtectedIds,
    BodyMention,
}

impl OwnerStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            OwnerStrategy::Hint => "hint",
            OwnerStrategy::Parent => "parent",
            OwnerStrategy::PrimaryImage => "primary_image",
            OwnerStrategy::ProtectedIds => "protected_ids",
            OwnerStrategy::BodyMention => "body_mention",
        }
    }
}

/// Resolved owner and the strategy that found it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOwner {
    pub item: ProtectedItem,
    pub strategy: OwnerStrategy,
}

/// Owner resolution over the store contracts
pub struct AccessPolicy {
    metadata: Arc<dyn MetadataStore>,
    attachments: Arc<dyn AttachmentStore>,
}

impl AccessPolicy {
    pub fn new(metadata: Arc<dyn MetadataStore>, attachments: Arc<dyn AttachmentStore>) -> Self {
        Self { metadata, attachments }
    }

    /// Find the item governing access to `attachment`
    ///
    /// Candidates are gathered strategy by strategy; the first sensitive one
    /// wins, otherwise the first one found. Derivatives have no owner.
    pub fn resolve_owner(&self, attachment: &Attachment, hint: Option<ItemId>) -> Option<ResolvedOwner> {
        if attachment.is_derivative() {
            return None;
        }

        let mut first: Option<ResolvedOwner> = None;
        let mut seen = Vec::new();

        for strategy in [
            OwnerStrategy::Hint,
            OwnerStrategy::Parent,
            OwnerStrategy::PrimaryImage,
            OwnerStrategy::ProtectedIds,
            OwnerStrategy::BodyMention,
        ] {
            let ids = match self.candidates(strategy, attachment, hint) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(
                        "Owner lookup for attachment {} via {} failed: {}",
                        attachment.id,
                        strategy.as_str(),
                        e
                    );
                    continue;
                }
            };

            for id in ids {
                if !id.is_valid() || seen.contains(&id) {
                    continue;
                }
                seen.push(id);

                let item = match self.metadata.item(id) {
                    Ok(Some(item)) => item,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Failed to load item {}: {}", id, e);
                        continue;
                    }
                };

                if item.sensitive {
                    return Some(ResolvedOwner { item, strategy });
                }
                if first.is_none() {
                    first = Some(ResolvedOwner { item, strategy });
                }
            }
        }

        first
    }

    fn candidates(
        &self,
        strategy: OwnerStrategy,
        attachment: &Attachment,
        hint: Option<ItemId>,
    ) -> StoreResult<Vec<ItemId>> {
        match strategy {
            OwnerStrategy::Hint => Ok(hint.into_iter().collect()),
            OwnerStrategy::Parent => Ok(attachment.parent.into_iter().collect()),
            OwnerStrategy::PrimaryImage => self.metadata.items_with_primary_image(attachment.id),
            OwnerStrategy::ProtectedIds => self.metadata.items_protecting(attachment.id),
            OwnerStrategy::BodyMention => self.metadata.items_mentioning(attachment.id),
        }
    }

    /// Whether anonymous viewers of `owner` can be shown something other than a denial
    pub fn blur_available(&self, owner: &ProtectedItem, attachment: &Attachment, has_fallback: bool) -> bool {
        if has_fallback {
            return true;
        }
        match self.metadata.derivative_mapping(owner.id) {
            Ok(mapping) => mapping.contains(attachment.id),
            Err(e) => {
                warn!("Failed to load derivative mapping for item {}: {}", owner.id, e);
                false
            }
        }
    }

    /// Resolve the owner and decide in one step
    pub fn evaluate(
        &self,
        attachment: &Attachment,
        hint: Option<ItemId>,
        authenticated: bool,
        has_fallback: bool,
    ) -> (Option<ResolvedOwner>, AccessDecision) {
        let owner = self.resolve_owner(attachment, hint);
        let blur_available = owner
            .as_ref()
            .map_or(false, |o| self.blur_available(&o.item, attachment, has_fallback));
        let decision = decide(owner.as_ref().map(|o| &o.item), authenticated, blur_available);
        (owner, decision)
    }

    pub fn attachments(&self) -> &Arc<dyn AttachmentStore> {
        &self.attachments
    }
}
