//! Collaborator contracts for the host content store
//!
//! The engine never owns items or attachments. It reads them, and writes
//! only its own per-item metadata (derivative mapping and job state) and
//! derivative attachments, through these traits.

mod memory;

pub use memory::{Catalog, CatalogAttachment, MemoryStore};

use std::path::Path;

use crate::core::error::StoreError;
use crate::core::types::{
    Attachment, AttachmentId, BlurJobState, DerivativeMapping, ItemId, ProtectedItem,
};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Per-item metadata
pub trait MetadataStore: Send + Sync {
    fn item(&self, id: ItemId) -> StoreResult<Option<ProtectedItem>>;

    /// Items whose primary image is `attachment`
    fn items_with_primary_image(&self, attachment: AttachmentId) -> StoreResult<Vec<ItemId>>;

    /// Items listing `attachment` among their explicitly protected ids
    fn items_protecting(&self, attachment: AttachmentId) -> StoreResult<Vec<ItemId>>;

    /// Items whose body references `attachment` inline
    fn items_mentioning(&self, attachment: AttachmentId) -> StoreResult<Vec<ItemId>>;

    fn derivative_mapping(&self, item: ItemId) -> StoreResult<DerivativeMapping>;

    fn set_derivative_mapping(&self, item: ItemId, mapping: &DerivativeMapping) -> StoreResult<()>;

    fn job_state(&self, item: ItemId) -> StoreResult<BlurJobState>;

    fn set_job_state(&self, item: ItemId, state: &BlurJobState) -> StoreResult<()>;
}

/// Attachment records and their binary content
pub trait AttachmentStore: Send + Sync {
    fn attachment(&self, id: AttachmentId) -> StoreResult<Option<Attachment>>;

    fn read(&self, id: AttachmentId) -> StoreResult<Vec<u8>>;

    /// Attachments uploaded directly to `item`
    fn attached_to(&self, item: ItemId) -> StoreResult<Vec<AttachmentId>>;

    fn find_by_url(&self, url: &str) -> StoreResult<Option<AttachmentId>>;

    /// Register the file at `path` as a derivative of `original`, owned by `owner`
    fn insert_derivative(
        &self,
        original: AttachmentId,
        owner: ItemId,
        path: &Path,
        mime: &str,
    ) -> StoreResult<AttachmentId>;

    fn delete(&self, id: AttachmentId) -> StoreResult<()>;
}
