//! This module runs the ingestion of a single blob: tag extraction, acquisition time, preview generation and the
//! record write, followed by the structured [IngestEvent] describing the outcome.

use {
    crate::{
        acquisition, media, metadata,
        records::{self, Observation, UpsertOutcome, WritePolicy},
        store::{DocumentStore, ObjectStore},
    },
    anyhow::{anyhow, Context, Error, Result},
    base64::{engine::general_purpose::STANDARD, Engine},
    photos_shared::{records_collection_path, IngestEvent, IngestMessage, Metadata, PushEnvelope},
    serde_derive::Deserialize,
    std::{path::Path, sync::Arc},
    tokio::{
        fs::{File as AsyncFile, OpenOptions},
        io::AsyncWriteExt,
        sync::Mutex as AsyncMutex,
        task,
    },
    tracing::{error, info, warn},
};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("ingest message is missing {0}")]
    MissingField(&'static str),

    #[error("invalid ingest payload: {0}")]
    InvalidPayload(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Envelope(PushEnvelope),
    Message(IngestMessage),
}

/// Decode a request body holding either a plain JSON [IngestMessage] or a [PushEnvelope] wrapping one
pub fn decode(body: &[u8]) -> Result<IngestMessage, IngestError> {
    let invalid = |e: &dyn std::fmt::Display| IngestError::InvalidPayload(e.to_string());

    match serde_json::from_slice::<Payload>(body).map_err(|e| invalid(&e))? {
        Payload::Message(message) => Ok(message),
        Payload::Envelope(PushEnvelope { data }) => {
            serde_json::from_slice(&STANDARD.decode(data.trim()).map_err(|e| invalid(&e))?)
                .map_err(|e| invalid(&e))
        }
    }
}

/// An [IngestMessage] whose identifiers are all present
#[derive(Debug, Clone)]
struct Target<'a> {
    container_ref: &'a str,
    blob_ref: &'a str,
    collection: String,
}

fn target(message: &IngestMessage) -> Result<Target<'_>, IngestError> {
    let container_ref = message
        .container_ref
        .as_deref()
        .ok_or(IngestError::MissingField("container_ref"))?;

    let blob_ref = message
        .blob_ref
        .as_deref()
        .ok_or(IngestError::MissingField("blob_ref"))?;

    let customer_id = message
        .customer_id
        .as_deref()
        .ok_or(IngestError::MissingField("customer_id"))?;

    Ok(Target {
        container_ref,
        blob_ref,
        collection: records_collection_path(
            &message.customer_collection,
            customer_id,
            &message.records_collection,
        ),
    })
}

/// Appends [IngestEvent]s to a file as JSON lines
pub struct EventLog {
    file: AsyncMutex<AsyncFile>,
}

impl EventLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: AsyncMutex::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?,
            ),
        })
    }

    pub async fn append(&self, event: &IngestEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;

        file.write_all(&line).await?;
        file.flush().await?;

        Ok(())
    }
}

/// Result of a successful ingestion
#[derive(Debug, Clone, PartialEq)]
pub struct Ingested {
    pub outcome: UpsertOutcome,
    pub derived_image_ref: Option<String>,
}

/// Runs ingestions against injected object and document stores
pub struct Ingestor {
    objects: Arc<dyn ObjectStore>,
    documents: Arc<dyn DocumentStore>,
    policy: WritePolicy,
    events: Option<EventLog>,
}

impl Ingestor {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        documents: Arc<dyn DocumentStore>,
        policy: WritePolicy,
        events: Option<EventLog>,
    ) -> Self {
        Self {
            objects,
            documents,
            policy,
            events,
        }
    }

    /// Ingest the blob named by `message`.
    ///
    /// A tag extraction failure degrades to empty metadata.  A preview generation failure does not prevent the
    /// record from being written, but it is still returned as an error so that the ingestion is reported as failed
    /// and may be replayed.
    pub async fn ingest(&self, message: &IngestMessage) -> Result<Ingested> {
        let target = target(message)?;

        let blob = self
            .objects
            .blob(target.container_ref, target.blob_ref)
            .await?;

        let metadata = {
            let data = blob.data.clone();
            let content_type = blob.content_type.clone();

            match task::spawn_blocking(move || metadata::extract(&data, &content_type))
                .await
                .map_err(Error::from)
                .and_then(|result| result)
            {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(
                        "unable to extract tags from {}/{}: {:?}",
                        target.container_ref, target.blob_ref, e
                    );

                    Metadata::new()
                }
            }
        };

        let acquisition_time = acquisition::resolve(&metadata, target.blob_ref);

        let derived = media::derive_preview(self.objects.as_ref(), &blob).await;

        let outcome = records::upsert(
            self.documents.as_ref(),
            &target.collection,
            self.policy,
            Observation {
                content_key: target.blob_ref.into(),
                container_ref: target.container_ref.into(),
                acquisition_time,
                metadata,
                derived_image_ref: derived.as_ref().ok().cloned().flatten(),
            },
        )
        .await?;

        let derived_image_ref = derived.with_context(|| {
            format!(
                "unable to generate preview of {}/{} (record {} written without it)",
                target.container_ref,
                target.blob_ref,
                outcome.record_id()
            )
        })?;

        Ok(Ingested {
            outcome,
            derived_image_ref,
        })
    }

    /// Ingest the blob named by `message` and emit the resulting [IngestEvent], which is also returned
    pub async fn handle(&self, message: &IngestMessage) -> IngestEvent {
        let event = event(message, self.ingest(message).await.map(drop));

        self.emit(&event).await;

        event
    }

    /// Log `event` and append it to the event log, if any
    pub async fn emit(&self, event: &IngestEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                if event.is_success() {
                    info!(target: "ingest", "{}", json)
                } else {
                    error!(target: "ingest", "{}", json)
                }
            }
            Err(e) => error!("unable to serialize {:?}: {:?}", event, e),
        }

        if let Some(events) = &self.events {
            if let Err(e) = events.append(event).await {
                error!("unable to append to event log: {:?}", e);
            }
        }
    }
}

/// Build the event describing the ingestion of `message`
pub fn event(message: &IngestMessage, result: Result<()>) -> IngestEvent {
    let user_id = message.customer_id.clone();
    let container_ref = message.container_ref.clone();
    let blob_ref = message.blob_ref.clone();

    match result {
        Ok(()) => IngestEvent::Success {
            user_id,
            container_ref,
            blob_ref,
        },
        Err(e) => IngestEvent::Error {
            user_id,
            container_ref,
            blob_ref,
            error: e.to_string(),
            trace: format!("{:?}", e),
        },
    }
}

/// Build the error event for a request body which could not be decoded
pub fn undecodable(error: IngestError) -> IngestEvent {
    IngestEvent::Error {
        user_id: None,
        container_ref: None,
        blob_ref: None,
        error: error.to_string(),
        trace: format!("{:?}", anyhow!(error)),
    }
}
