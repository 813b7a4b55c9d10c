//! Contract between persisted records and the durable store.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Accessors the durable store needs from any record it manages.
///
/// Records serialise to JSON; equality of two records is defined as
/// equality of their serialised form, which lets the store skip no-op
/// updates without walking the object graph.
pub trait StoreObject: Clone + Serialize + DeserializeOwned + Send + 'static {
    fn id(&self) -> &str;

    fn created_at(&self) -> Option<DateTime<Utc>>;
    fn set_created_at(&mut self, at: DateTime<Utc>);

    fn deleted_at(&self) -> Option<DateTime<Utc>>;
    fn set_deleted_at(&mut self, at: DateTime<Utc>);

    /// Tokens that block hard deletion until removed.
    fn finalizers(&self) -> &[String];

    fn resource_version(&self) -> u64;
    fn set_resource_version(&mut self, version: u64);

    /// Advances the optimistic-concurrency version by one.
    fn bump_resource_version(&mut self) {
        self.set_resource_version(self.resource_version() + 1);
    }
}

/// Metadata identifying the object an event refers to.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ObjectMeta {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Error deriving [`ObjectMeta`] from a record.
#[derive(Debug, Clone, Error)]
#[error("object has no id")]
pub struct MissingObjectId;

impl ObjectMeta {
    /// Derives event metadata from a stored record. Fails when the record
    /// carries no ID, since an event without a subject is useless.
    pub fn from_object<T: StoreObject>(object: &T) -> Result<Self, MissingObjectId> {
        if object.id().is_empty() {
            return Err(MissingObjectId);
        }
        Ok(Self {
            id: object.id().to_string(),
            created_at: object.created_at(),
        })
    }
}
