//! Tests for the access policy

use super::*;
use crate::core::error::StoreError;
use crate::core::types::{AttachmentId, BlurJobState, DerivativeMapping};
use crate::store::MemoryStore;
use proptest::prelude::*;

fn attachment(id: u64, parent: Option<u64>) -> Attachment {
    Attachment {
        id: AttachmentId(id),
        mime: "image/png".into(),
        width: 4,
        height: 4,
        url: format!("/uploads/{}.png", id),
        parent: parent.map(ItemId),
        derivative_of: None,
    }
}

fn policy(store: Arc<MemoryStore>) -> AccessPolicy {
    AccessPolicy::new(store.clone(), store)
}

#[test]
fn test_decide_table() {
    let plain = ProtectedItem::new(ItemId(1));
    let sensitive = ProtectedItem::new(ItemId(2)).with_sensitive(true);

    assert_eq!(decide(None, false, false), AccessDecision::Original);
    assert_eq!(decide(Some(&plain), false, false), AccessDecision::Original);
    assert_eq!(decide(Some(&sensitive), true, false), AccessDecision::Original);
    assert_eq!(decide(Some(&sensitive), false, true), AccessDecision::Blurred);
    assert_eq!(decide(Some(&sensitive), false, false), AccessDecision::Deny);
}

#[test]
fn test_sensitive_candidate_wins_over_earlier_plain_one() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_item(ProtectedItem::new(ItemId(1)));
    store.upsert_item(
        ProtectedItem::new(ItemId(2))
            .with_sensitive(true)
            .with_body("<img class=\"attachment-9\">"),
    );
    let image = attachment(9, Some(1));

    let owner = policy(store).resolve_owner(&image, None).unwrap();
    assert_eq!(owner.item.id, ItemId(2));
    assert_eq!(owner.strategy, OwnerStrategy::BodyMention);
}

#[test]
fn test_first_candidate_when_none_sensitive() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_item(ProtectedItem::new(ItemId(1)));
    store.upsert_item(ProtectedItem::new(ItemId(2)).with_primary_image(AttachmentId(9)));
    let image = attachment(9, Some(1));

    let owner = policy(store).resolve_owner(&image, None).unwrap();
    assert_eq!(owner.item.id, ItemId(1));
    assert_eq!(owner.strategy, OwnerStrategy::Parent);
}

#[test]
fn test_hint_is_checked_first() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_item(ProtectedItem::new(ItemId(5)).with_sensitive(true));
    let image = attachment(9, None);

    let owner = policy(store).resolve_owner(&image, Some(ItemId(5))).unwrap();
    assert_eq!(owner.strategy, OwnerStrategy::Hint);
}

#[test]
fn test_unowned_and_derivative_attachments_have_no_owner() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_item(ProtectedItem::new(ItemId(1)).with_sensitive(true));
    let policy = policy(store);

    assert!(policy.resolve_owner(&attachment(3, None), None).is_none());

    let mut derived = attachment(4, Some(1));
    derived.derivative_of = Some(AttachmentId(3));
    assert!(policy.resolve_owner(&derived, Some(ItemId(1))).is_none());
}

struct FailingMetadata {
    inner: MemoryStore,
}

impl MetadataStore for FailingMetadata {
    fn item(&self, id: ItemId) -> StoreResult<Option<ProtectedItem>> {
        self.inner.item(id)
    }
    fn items_with_primary_image(&self, _: AttachmentId) -> StoreResult<Vec<ItemId>> {
        Err(StoreError::Backend { reason: "offline".into() })
    }
    fn items_protecting(&self, attachment: AttachmentId) -> StoreResult<Vec<ItemId>> {
        self.inner.items_protecting(attachment)
    }
    fn items_mentioning(&self, attachment: AttachmentId) -> StoreResult<Vec<ItemId>> {
        self.inner.items_mentioning(attachment)
    }
    fn derivative_mapping(&self, item: ItemId) -> StoreResult<DerivativeMapping> {
        self.inner.derivative_mapping(item)
    }
    fn set_derivative_mapping(&self, item: ItemId, mapping: &DerivativeMapping) -> StoreResult<()> {
        self.inner.set_derivative_mapping(item, mapping)
    }
    fn job_state(&self, item: ItemId) -> StoreResult<BlurJobState> {
        self.inner.job_state(item)
    }
    fn set_job_state(&self, item: ItemId, state: &BlurJobState) -> StoreResult<()> {
        self.inner.set_job_state(item, state)
    }
}

#[test]
fn test_failing_strategy_is_skipped() {
    let inner = MemoryStore::new();
    inner.upsert_item(
        ProtectedItem::new(ItemId(3))
            .with_sensitive(true)
            .with_protected(AttachmentId(9)),
    );
    let metadata = Arc::new(FailingMetadata { inner });
    let policy = AccessPolicy::new(metadata, Arc::new(MemoryStore::new()));

    let owner = policy.resolve_owner(&attachment(9, None), None).unwrap();
    assert_eq!(owner.item.id, ItemId(3));
    assert_eq!(owner.strategy, OwnerStrategy::ProtectedIds);
}

#[test]
fn test_evaluate_uses_mapping_or_fallback() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_item(ProtectedItem::new(ItemId(1)).with_sensitive(true));
    let image = attachment(9, Some(1));
    let policy = policy(store.clone());

    assert_eq!(policy.evaluate(&image, None, false, false).1, AccessDecision::Deny);
    assert_eq!(policy.evaluate(&image, None, false, true).1, AccessDecision::Blurred);
    assert_eq!(policy.evaluate(&image, None, true, false).1, AccessDecision::Original);

    let mut mapping = DerivativeMapping::new();
    mapping.insert(AttachmentId(9), AttachmentId(10));
    store.set_derivative_mapping(ItemId(1), &mapping).unwrap();
    assert_eq!(policy.evaluate(&image, None, false, false).1, AccessDecision::Blurred);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_sensitive_owner_never_original_for_anonymous(
        blur_available in any::<bool>(),
        watermark in any::<bool>(),
        id in 1u64..10_000,
    ) {
        let item = ProtectedItem::new(ItemId(id)).with_sensitive(true).with_watermark(watermark);
        prop_assert_ne!(decide(Some(&item), false, blur_available), AccessDecision::Original);
    }

    #[test]
    fn prop_any_sensitive_reference_protects(sensitive_slot in 0usize..4, plain_parent in any::<bool>()) {
        let store = Arc::new(MemoryStore::new());
        let target = AttachmentId(50);
        let builders: [fn(ProtectedItem) -> ProtectedItem; 4] = [
            |i| i,
            |i| i.with_primary_image(AttachmentId(50)),
            |i| i.with_protected(AttachmentId(50)),
            |i| i.with_body("<img class=\"attachment-50\">"),
        ];
        for (slot, build) in builders.iter().enumerate() {
            let item = build(ProtectedItem::new(ItemId(slot as u64 + 1)))
                .with_sensitive(slot == sensitive_slot);
            store.upsert_item(item);
        }
        let parent = if plain_parent || sensitive_slot == 0 { Some(1) } else { None };
        let image = attachment(target.0, parent);

        let (owner, decision) = policy(store).evaluate(&image, None, false, false);
        prop_assert!(owner.unwrap().item.sensitive);
        prop_assert_ne!(decision, AccessDecision::Original);
    }
}
