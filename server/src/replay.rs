//! This module re-runs ingestion in bulk: replaying failures recorded in an event log, and ingesting every image
//! in a container.

use {
    crate::{ingest::Ingestor, media, store::ObjectStore},
    anyhow::Result,
    futures::TryStreamExt,
    photos_shared::{IngestEvent, IngestMessage},
    serde_derive::Serialize,
    std::{collections::HashSet, path::Path},
    tokio::fs,
    tracing::{info, warn},
};

#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Inputs which could not be turned into an ingestion
    pub skipped: usize,
}

impl BatchReport {
    fn record(&mut self, event: &IngestEvent) {
        if event.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Re-run, in order, the ingestions recorded as failed in the event log at `path`
///
/// Malformed lines and failure events lacking an identifier are skipped.  The log is read in full before anything
/// is replayed, so it may also be the log `ingestor` appends to.
pub async fn reingest(ingestor: &Ingestor, path: impl AsRef<Path>) -> Result<BatchReport> {
    let text = fs::read_to_string(path).await?;

    let mut report = BatchReport::default();

    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<IngestEvent>(line) {
            Ok(event) => event,
            Err(e) => {
                warn!("skipping malformed event on line {}: {}", index + 1, e);

                report.skipped += 1;

                continue;
            }
        };

        if event.is_success() {
            continue;
        }

        if let Some(message) = event.message() {
            report.record(&ingestor.handle(&message).await);
        } else {
            warn!("skipping event on line {} which lacks identifiers", index + 1);

            report.skipped += 1;
        }
    }

    info!("replay complete: {:?}", report);

    Ok(report)
}

/// Ingest, one at a time, every image in `container` on behalf of `customer_id`
///
/// Objects which are the previews of other listed images are skipped, as are objects which are not images.
pub async fn ingest_container(
    objects: &dyn ObjectStore,
    ingestor: &Ingestor,
    container: &str,
    customer_id: &str,
) -> Result<BatchReport> {
    let listing = objects.list(container).try_collect::<Vec<_>>().await?;

    let previews = listing
        .iter()
        .filter(|(key, content_type)| {
            media::is_image(content_type) && media::preview_name(key) != *key
        })
        .map(|(key, _)| media::preview_name(key))
        .collect::<HashSet<_>>();

    let mut report = BatchReport::default();

    for (key, content_type) in &listing {
        if !media::is_image(content_type) || previews.contains(key) {
            report.skipped += 1;

            continue;
        }

        report.record(
            &ingestor
                .handle(&IngestMessage::new(container, key, customer_id))
                .await,
        );
    }

    info!("ingested {}: {:?}", container, report);

    Ok(report)
}
