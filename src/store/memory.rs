//! In-process store backing both contracts
//!
//! Used by the bundled server (seeded from a JSON catalog) and by tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Deserialize;

use super::{AttachmentStore, MetadataStore, StoreResult};
use crate::core::error::StoreError;
use crate::core::types::{
    Attachment, AttachmentId, BlurJobState, DerivativeMapping, ItemId, ProtectedItem,
};

#[derive(Debug, Clone)]
enum Blob {
    Inline(Vec<u8>),
    File(PathBuf),
}

#[derive(Default)]
struct State {
    items: BTreeMap<ItemId, ProtectedItem>,
    attachments: BTreeMap<AttachmentId, Attachment>,
    blobs: HashMap<AttachmentId, Blob>,
    mappings: HashMap<ItemId, DerivativeMapping>,
    jobs: HashMap<ItemId, BlurJobState>,
    next_id: u64,
}

impl State {
    fn allocate_id(&mut self) -> AttachmentId {
        let floor = self.attachments.keys().next_back().map_or(0, |id| id.0);
        self.next_id = self.next_id.max(floor) + 1;
        AttachmentId(self.next_id)
    }

    fn items_where<F>(&self, predicate: F) -> Vec<ItemId>
    where
        F: Fn(&ProtectedItem) -> bool,
    {
        self.items
            .values()
            .filter(|item| predicate(item))
            .map(|item| item.id)
            .collect()
    }
}

/// Attachment entry of a JSON catalog
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogAttachment {
    #[serde(flatten)]
    pub attachment: Attachment,
    /// File holding the attachment bytes, relative to the catalog
    pub path: PathBuf,
}

/// Seed data for [`MemoryStore`]
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Catalog {
    #[serde(default)]
    pub items: Vec<ProtectedItem>,
    #[serde(default)]
    pub attachments: Vec<CatalogAttachment>,
}

/// Thread-safe in-memory implementation of both store contracts
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a catalog file; relative attachment paths resolve against its directory
    pub fn from_catalog_file(path: &Path) -> StoreResult<Self> {
        let raw = std::fs::read(path)?;
        let catalog: Catalog = serde_json::from_slice(&raw)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let store = Self::new();
        for item in catalog.items {
            store.upsert_item(item);
        }
        for entry in catalog.attachments {
            let file = if entry.path.is_absolute() {
                entry.path
            } else {
                base.join(entry.path)
            };
            store.insert_attachment_file(entry.attachment, file);
        }
        Ok(store)
    }

    pub fn upsert_item(&self, item: ProtectedItem) {
        self.state.write().items.insert(item.id, item);
    }

    /// Apply `update` to a stored item, returning the updated copy
    pub fn update_item<F>(&self, id: ItemId, update: F) -> StoreResult<ProtectedItem>
    where
        F: FnOnce(&mut ProtectedItem),
    {
        let mut state = self.state.write();
        let item = state
            .items
            .get_mut(&id)
            .ok_or(StoreError::ItemNotFound { item: id })?;
        update(item);
        Ok(item.clone())
    }

    pub fn insert_attachment(&self, attachment: Attachment, bytes: Vec<u8>) {
        let mut state = self.state.write();
        state.blobs.insert(attachment.id, Blob::Inline(bytes));
        state.attachments.insert(attachment.id, attachment);
    }

    pub fn insert_attachment_file(&self, attachment: Attachment, path: PathBuf) {
        let mut state = self.state.write();
        state.blobs.insert(attachment.id, Blob::File(path));
        state.attachments.insert(attachment.id, attachment);
    }

    /// All derivative attachments currently registered
    pub fn derivatives(&self) -> Vec<Attachment> {
        self.state
            .read()
            .attachments
            .values()
            .filter(|a| a.is_derivative())
            .cloned()
            .collect()
    }

    pub fn item_ids(&self) -> Vec<ItemId> {
        self.state.read().items.keys().copied().collect()
    }
}

impl MetadataStore for MemoryStore {
    fn item(&self, id: ItemId) -> StoreResult<Option<ProtectedItem>> {
        Ok(self.state.read().items.get(&id).cloned())
    }

    fn items_with_primary_image(&self, attachment: AttachmentId) -> StoreResult<Vec<ItemId>> {
        Ok(self.state.read().items_where(|item| item.primary_image == Some(attachment)))
    }

    fn items_protecting(&self, attachment: AttachmentId) -> StoreResult<Vec<ItemId>> {
        Ok(self.state.read().items_where(|item| item.protected_ids.contains(&attachment)))
    }

    fn items_mentioning(&self, attachment: AttachmentId) -> StoreResult<Vec<ItemId>> {
        Ok(self.state.read().items_where(|item| item.mentions(attachment)))
    }

    fn derivative_mapping(&self, item: ItemId) -> StoreResult<DerivativeMapping> {
        Ok(self.state.read().mappings.get(&item).cloned().unwrap_or_default())
    }

    fn set_derivative_mapping(&self, item: ItemId, mapping: &DerivativeMapping) -> StoreResult<()> {
        let mut state = self.state.write();
        if mapping.is_empty() {
            state.mappings.remove(&item);
        } else {
            state.mappings.insert(item, mapping.clone());
        }
        Ok(())
    }

    fn job_state(&self, item: ItemId) -> StoreResult<BlurJobState> {
        Ok(self.state.read().jobs.get(&item).cloned().unwrap_or_default())
    }

    fn set_job_state(&self, item: ItemId, state: &BlurJobState) -> StoreResult<()> {
        self.state.write().jobs.insert(item, state.clone());
        Ok(())
    }
}

impl AttachmentStore for MemoryStore {
    fn attachment(&self, id: AttachmentId) -> StoreResult<Option<Attachment>> {
        Ok(self.state.read().attachments.get(&id).cloned())
    }

    fn read(&self, id: AttachmentId) -> StoreResult<Vec<u8>> {
        let blob = self
            .state
            .read()
            .blobs
            .get(&id)
            .cloned()
            .ok_or(StoreError::AttachmentNotFound { attachment: id })?;
        match blob {
            Blob::Inline(bytes) => Ok(bytes),
            Blob::File(path) => Ok(std::fs::read(path)?),
        }
    }

    fn attached_to(&self, item: ItemId) -> StoreResult<Vec<AttachmentId>> {
        Ok(self
            .state
            .read()
            .attachments
            .values()
            .filter(|a| a.parent == Some(item))
            .map(|a| a.id)
            .collect())
    }

    fn find_by_url(&self, url: &str) -> StoreResult<Option<AttachmentId>> {
        Ok(self
            .state
            .read()
            .attachments
            .values()
            .find(|a| a.url == url)
            .map(|a| a.id))
    }

    fn insert_derivative(
        &self,
        original: AttachmentId,
        owner: ItemId,
        path: &Path,
        mime: &str,
    ) -> StoreResult<AttachmentId> {
        let mut state = self.state.write();
        let source = state
            .attachments
            .get(&original)
            .cloned()
            .ok_or(StoreError::AttachmentNotFound { attachment: original })?;

        let id = state.allocate_id();
        let attachment = Attachment {
            id,
            mime: mime.to_string(),
            width: source.width,
            height: source.height,
            url: format!("derivative://{}", id),
            parent: Some(owner),
            derivative_of: Some(original),
        };
        state.blobs.insert(id, Blob::File(path.to_path_buf()));
        state.attachments.insert(id, attachment);
        Ok(id)
    }

    fn delete(&self, id: AttachmentId) -> StoreResult<()> {
        let mut state = self.state.write();
        state.attachments.remove(&id);
        state.blobs.remove(&id);
        Ok(())
    }
}
