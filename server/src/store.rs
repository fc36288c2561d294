//! This module defines the interfaces of the two storage collaborators the pipeline depends on: an object store
//! holding source images and their previews, and a document store holding photo records.
//!
//! Concrete implementations live in [crate::fs_store] and [crate::sqlite_store].

use {
    anyhow::Result,
    async_trait::async_trait,
    bytes::Bytes,
    futures::stream::BoxStream,
    serde_json::{Map, Value},
};

/// The fields of a stored document
pub type Fields = Map<String, Value>;

/// A document and its identifier
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object {container}/{key} not found")]
    NotFound { container: String, key: String },

    #[error("invalid object key: {0:?}")]
    InvalidKey(String),
}

/// A blob retrieved from an object store
#[derive(Debug, Clone)]
pub struct Blob {
    pub container: String,
    pub key: String,
    pub content_type: String,
    pub data: Bytes,
}

/// Object store holding source images and derived previews, organized into named containers
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Retrieve an object and its content type
    async fn get(&self, container: &str, key: &str) -> Result<(Bytes, String)>;

    async fn exists(&self, container: &str, key: &str) -> Result<bool>;

    /// Create or replace an object
    async fn put(&self, container: &str, key: &str, data: Bytes) -> Result<()>;

    async fn delete(&self, container: &str, key: &str) -> Result<()>;

    /// Enumerate the keys and content types of all objects in a container
    fn list<'a>(&'a self, container: &'a str) -> BoxStream<'a, Result<(String, String)>>;

    /// Retrieve an object as a [Blob]
    async fn blob(&self, container: &str, key: &str) -> Result<Blob> {
        let (data, content_type) = self.get(container, key).await?;

        Ok(Blob {
            container: container.into(),
            key: key.into(),
            content_type,
            data,
        })
    }
}

/// A session with a document store
///
/// Sessions are not meant to be shared between concurrent workers; open one per worker with a [Connector].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Find the documents in `collection` whose `field` equals `value`, in insertion order
    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
        limit: Option<usize>,
    ) -> Result<Vec<Document>>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Fields>>;

    /// Write a document.  If `merge` is true, `fields` are merged into any existing document rather than
    /// replacing it.
    async fn set(&self, collection: &str, id: &str, fields: Fields, merge: bool) -> Result<()>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Lazily enumerate every document in `collection`, ordered by the value of `order_by`
    fn stream<'a>(
        &'a self,
        collection: &'a str,
        order_by: &'a str,
    ) -> BoxStream<'a, Result<Document>>;
}

/// Opens independent [DocumentStore] sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DocumentStore>>;
}

/// Merge `update` into `base` the way a merging document write does: nested objects are merged key by key, and
/// any other value replaces what was there.
pub fn merge_fields(base: &mut Fields, update: Fields) {
    for (key, value) in update {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                merge_fields(existing, nested)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
