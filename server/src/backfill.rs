//! This module generates missing previews for records which were written without one.

use {
    crate::{
        media, pool,
        records::has_field,
        store::{Connector, DocumentStore, Fields, ObjectStore},
    },
    anyhow::Result,
    futures::TryStreamExt,
    photos_shared::fields,
    serde_derive::Serialize,
    serde_json::{json, Value},
    std::{
        fmt::{self, Display},
        sync::Arc,
    },
    tracing::{info, warn},
};

#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    /// Records found without a preview
    pub pending: usize,
    /// Records which gained a preview
    pub attached: usize,
    pub failed: usize,
}

/// A record lacking a preview
#[derive(Debug, Clone)]
struct Pending {
    id: String,
    container_ref: String,
    content_key: String,
}

impl Display for Pending {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "record {} ({}/{})", self.id, self.container_ref, self.content_key)
    }
}

fn text<'a>(fields: &'a Fields, field: &str) -> Option<&'a str> {
    match fields.get(field) {
        Some(Value::String(value)) => Some(value),
        _ => None,
    }
}

async fn scan(store: &dyn DocumentStore, collection: &str) -> Result<Vec<Pending>> {
    let mut pending = Vec::new();
    let mut documents = store.stream(collection, fields::ACQUISITION_TIME);

    while let Some(document) = documents.try_next().await? {
        if has_field(&document.fields, fields::DERIVED_IMAGE_REF) {
            continue;
        }

        if let (Some(container_ref), Some(content_key)) = (
            text(&document.fields, fields::CONTAINER_REF),
            text(&document.fields, fields::CONTENT_KEY),
        ) {
            pending.push(Pending {
                id: document.id.clone(),
                container_ref: container_ref.into(),
                content_key: content_key.into(),
            });
        } else {
            warn!("record {} in {} has no source reference", document.id, collection);
        }
    }

    Ok(pending)
}

/// Generate the preview of `record` and attach it, unless the record gained one (or disappeared) meanwhile.
/// Returns true if a preview was attached.
async fn attach(
    objects: &dyn ObjectStore,
    store: &dyn DocumentStore,
    collection: &str,
    record: &Pending,
) -> Result<bool> {
    let blob = objects.blob(&record.container_ref, &record.content_key).await?;

    let name = if let Some(name) = media::derive_preview(objects, &blob).await? {
        name
    } else {
        return Ok(false);
    };

    match store.get(collection, &record.id).await? {
        Some(current) if !has_field(&current, fields::DERIVED_IMAGE_REF) => {
            let mut update = Fields::new();
            update.insert(fields::DERIVED_IMAGE_REF.into(), json!(name));

            store.set(collection, &record.id, update, true).await?;

            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Attach previews to every record in `collection` lacking one, using `workers` concurrent workers
pub async fn backfill(
    objects: Arc<dyn ObjectStore>,
    connector: Arc<dyn Connector>,
    collection: &str,
    workers: usize,
) -> Result<BackfillReport> {
    let pending = {
        let session = connector.connect().await?;

        scan(session.as_ref(), collection).await?
    };

    let count = pending.len();

    info!(
        "generating previews for {} records in {} with {} workers",
        count, collection, workers
    );

    let collection = Arc::new(collection.to_owned());

    let tally = pool::run(connector, pending, workers, move |session, record| {
        let objects = objects.clone();
        let collection = collection.clone();

        async move { attach(objects.as_ref(), session.as_ref(), &collection, &record).await }
    })
    .await;

    Ok(BackfillReport {
        pending: count,
        attached: tally.done.into_iter().filter(|&attached| attached).count(),
        failed: tally.failed,
    })
}
