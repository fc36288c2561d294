//! Photo ingestion shared (e.g. protocol) code
//!
//! This crate contains the [serde](https://crates.io/crates/serde)-enabled structs and enums which define the
//! ingestion trigger payload, the structured event emitted for each ingestion, and the canonical per-photo record
//! kept in the document store.  Failure-replay tooling depends on [IngestEvent] field-for-field, so changes here are
//! protocol changes.
//!
//! The `tag_value` submodule defines the normalized representation of embedded image tags.

#![deny(warnings)]

use {
    chrono::NaiveDateTime,
    serde_derive::{Deserialize, Serialize},
};

pub use tag_value::{Metadata, TagValue};

pub mod tag_value;

/// Default name of the top-level collection holding one document per customer
pub const DEFAULT_CUSTOMER_COLLECTION: &str = "customers";

/// Default name of the per-customer collection holding photo records
pub const DEFAULT_RECORDS_COLLECTION: &str = "images";

/// Names of the stored [PhotoRecord] fields, for use in document store queries
pub mod fields {
    pub const RECORD_ID: &str = "record_id";
    pub const CONTENT_KEY: &str = "content_key";
    pub const CONTAINER_REF: &str = "container_ref";
    pub const ACQUISITION_TIME: &str = "acquisition_time";
    pub const METADATA: &str = "metadata";
    pub const DERIVED_IMAGE_REF: &str = "derived_image_ref";
    pub const CAPTION: &str = "caption";
}

fn default_customer_collection() -> String {
    DEFAULT_CUSTOMER_COLLECTION.into()
}

fn default_records_collection() -> String {
    DEFAULT_RECORDS_COLLECTION.into()
}

/// Build the path of the collection holding a customer's photo records
pub fn records_collection_path(
    customer_collection: &str,
    customer_id: &str,
    records_collection: &str,
) -> String {
    format!(
        "{}/{}/{}",
        customer_collection, customer_id, records_collection
    )
}

/// Represents a request to ingest a single blob, as delivered by the ingestion trigger
///
/// The identifying fields are optional at the type level so that a message missing one of them can still be
/// decoded and reported with whatever context it does carry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IngestMessage {
    /// The storage container holding the blob
    pub container_ref: Option<String>,

    /// The key of the blob within its container
    pub blob_ref: Option<String>,

    /// The customer (user) on whose behalf the blob is ingested
    pub customer_id: Option<String>,

    #[serde(default = "default_customer_collection")]
    pub customer_collection: String,

    #[serde(default = "default_records_collection")]
    pub records_collection: String,
}

impl IngestMessage {
    /// Create a message for the specified blob using the default collection names
    pub fn new(container_ref: &str, blob_ref: &str, customer_id: &str) -> Self {
        Self {
            container_ref: Some(container_ref.into()),
            blob_ref: Some(blob_ref.into()),
            customer_id: Some(customer_id.into()),
            customer_collection: default_customer_collection(),
            records_collection: default_records_collection(),
        }
    }
}

/// Push-subscription style wrapper around an [IngestMessage]
///
/// `data` holds the base64 encoding of the JSON-serialized message.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PushEnvelope {
    pub data: String,
}

/// Structured event emitted once per ingestion
///
/// Identifiers which were missing from the triggering message serialize as `null`; they are never omitted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestEvent {
    Success {
        user_id: Option<String>,
        container_ref: Option<String>,
        blob_ref: Option<String>,
    },

    Error {
        user_id: Option<String>,
        container_ref: Option<String>,
        blob_ref: Option<String>,
        /// Short description of the failure
        error: String,
        /// Full diagnostic chain of the failure
        trace: String,
    },
}

impl IngestEvent {
    pub fn is_success(&self) -> bool {
        matches!(self, IngestEvent::Success { .. })
    }

    /// Rebuild the message which produced this event, if the event carries all of its identifiers
    ///
    /// Collection names are not part of the event, so the defaults are assumed.
    pub fn message(&self) -> Option<IngestMessage> {
        let (user_id, container_ref, blob_ref) = match self {
            IngestEvent::Success {
                user_id,
                container_ref,
                blob_ref,
            }
            | IngestEvent::Error {
                user_id,
                container_ref,
                blob_ref,
                ..
            } => (user_id, container_ref, blob_ref),
        };

        Some(IngestMessage::new(
            container_ref.as_deref()?,
            blob_ref.as_deref()?,
            user_id.as_deref()?,
        ))
    }
}

/// The canonical per-photo document kept in the document store
///
/// Optional fields which are not set are not stored at all, so the number of stored fields reflects how complete
/// a record is.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PhotoRecord {
    /// Unique identifier assigned at first insert; never changes
    pub record_id: String,

    /// Storage key of the source blob; the natural deduplication key
    pub content_key: String,

    /// Storage container holding the source blob
    pub container_ref: String,

    /// When the photo was taken, or the sentinel epoch if that could not be determined
    pub acquisition_time: NaiveDateTime,

    #[serde(default)]
    pub metadata: Metadata,

    /// Key of the generated preview, in the same container as the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_image_ref: Option<String>,

    /// Caption written by the external captioning service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}
