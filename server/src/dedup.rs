//! This module implements the dedup sweep, which collapses the records sharing a content key down to the most
//! complete one.
//!
//! The sweep runs in two phases.  The first streams the whole records collection on a single session, collecting
//! the distinct content keys, and then closes that session.  The second deals those keys out to a pool of workers,
//! each with its own session, which resolve one key at a time.  Since every key is dealt exactly once, no two
//! workers ever resolve the same key.

use {
    crate::{
        pool,
        store::{Connector, Document, DocumentStore, Fields},
    },
    anyhow::Result,
    futures::TryStreamExt,
    photos_shared::fields,
    serde_derive::Serialize,
    serde_json::{json, Value},
    std::{collections::HashSet, sync::Arc},
    tracing::{info, warn},
};

#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Records seen while collecting content keys
    pub records_scanned: usize,
    pub distinct_keys: usize,
    /// Keys which had duplicates and were collapsed to one record
    pub resolved: usize,
    pub deleted: usize,
    /// Keys which could not be resolved because of store errors
    pub failed: usize,
}

/// Completeness score of a record: the number of fields it holds
pub fn score(fields: &Fields) -> usize {
    fields.len()
}

/// Index of the best of `candidates`: the first one with the highest score
pub fn best(candidates: &[Document]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .fold(None, |leader: Option<(usize, usize)>, (index, candidate)| {
            let current = score(&candidate.fields);

            match leader {
                Some((_, high)) if high >= current => leader,
                _ => Some((index, current)),
            }
        })
        .map(|(index, _)| index)
}

/// Collect the distinct content keys of `collection`, in order of first appearance, along with the number of
/// records scanned
pub async fn distinct_keys(
    store: &dyn DocumentStore,
    collection: &str,
) -> Result<(usize, Vec<String>)> {
    let mut scanned = 0;
    let mut seen = HashSet::new();
    let mut keys = Vec::new();

    let mut documents = store.stream(collection, fields::ACQUISITION_TIME);

    while let Some(document) = documents.try_next().await? {
        scanned += 1;

        match document.fields.get(fields::CONTENT_KEY) {
            Some(Value::String(key)) => {
                if seen.insert(key.clone()) {
                    keys.push(key.clone());
                }
            }
            _ => warn!("record {} in {} has no content key", document.id, collection),
        }
    }

    Ok((scanned, keys))
}

/// Delete every record with content key `key` except the best one, returning the number deleted
pub async fn resolve_key(store: &dyn DocumentStore, collection: &str, key: &str) -> Result<usize> {
    let candidates = store
        .query(collection, fields::CONTENT_KEY, &json!(key), None)
        .await?;

    if candidates.len() < 2 {
        return Ok(0);
    }

    let keep = best(&candidates).unwrap_or(0);

    let mut deleted = 0;

    for (index, candidate) in candidates.iter().enumerate() {
        if index != keep {
            store.delete(collection, &candidate.id).await?;

            deleted += 1;
        }
    }

    info!(
        "kept record {} for {} and deleted {} duplicate(s)",
        candidates[keep].id, key, deleted
    );

    Ok(deleted)
}

/// Sweep `collection` for records sharing a content key, using `workers` concurrent workers
pub async fn sweep(
    connector: Arc<dyn Connector>,
    collection: &str,
    workers: usize,
) -> Result<SweepReport> {
    let (records_scanned, keys) = {
        let session = connector.connect().await?;

        distinct_keys(session.as_ref(), collection).await?
    };

    let distinct_keys = keys.len();

    info!(
        "sweeping {} distinct keys from {} records in {} with {} workers",
        distinct_keys, records_scanned, collection, workers
    );

    let collection = Arc::new(collection.to_owned());

    let tally = pool::run(connector, keys, workers, move |session, key| {
        let collection = collection.clone();

        async move { resolve_key(session.as_ref(), &collection, &key).await }
    })
    .await;

    Ok(SweepReport {
        records_scanned,
        distinct_keys,
        resolved: tally.done.iter().filter(|&&deleted| deleted > 0).count(),
        deleted: tally.done.iter().sum(),
        failed: tally.failed,
    })
}
