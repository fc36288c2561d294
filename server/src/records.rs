//! This module writes [PhotoRecord]s to a document store.

use {
    crate::store::{DocumentStore, Fields},
    anyhow::{anyhow, Result},
    chrono::NaiveDateTime,
    futures::TryStreamExt,
    photos_shared::{fields, Metadata, PhotoRecord},
    serde_json::{json, Value},
    std::{
        fmt::{self, Display},
        str::FromStr,
    },
    tracing::debug,
    uuid::Uuid,
};

/// How a new ingestion is written to the records collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Merge into the existing record for the same content key, creating one only if none exists
    #[default]
    FindOrCreate,

    /// Always write a new record, leaving duplicates for the dedup sweep to resolve
    BlindUpsert,
}

impl FromStr for WritePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "find-or-create" => Ok(WritePolicy::FindOrCreate),
            "blind-upsert" => Ok(WritePolicy::BlindUpsert),
            _ => Err(anyhow!("unknown write policy: {}", s)),
        }
    }
}

impl Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            WritePolicy::FindOrCreate => "find-or-create",
            WritePolicy::BlindUpsert => "blind-upsert",
        })
    }
}

/// What ingestion learned about a blob, ready to be written as a record
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub content_key: String,
    pub container_ref: String,
    pub acquisition_time: NaiveDateTime,
    pub metadata: Metadata,
    pub derived_image_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new record was written with this `record_id`
    Created(String),

    /// The observation was merged into the existing record with this `record_id`
    Merged(String),
}

impl UpsertOutcome {
    pub fn record_id(&self) -> &str {
        match self {
            UpsertOutcome::Created(id) | UpsertOutcome::Merged(id) => id,
        }
    }
}

fn to_fields(record: &PhotoRecord) -> Result<Fields> {
    match serde_json::to_value(record)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(anyhow!("record did not serialize as an object")),
    }
}

async fn create(
    store: &dyn DocumentStore,
    collection: &str,
    observation: Observation,
) -> Result<String> {
    let record = PhotoRecord {
        record_id: Uuid::new_v4().to_string(),
        content_key: observation.content_key,
        container_ref: observation.container_ref,
        acquisition_time: observation.acquisition_time,
        metadata: observation.metadata,
        derived_image_ref: observation.derived_image_ref,
        caption: None,
    };

    store
        .set(collection, &record.record_id, to_fields(&record)?, false)
        .await?;

    debug!("created record {} for {}", record.record_id, record.content_key);

    Ok(record.record_id)
}

/// Write `observation` to `collection` according to `policy`.
///
/// With [WritePolicy::FindOrCreate], an existing record for the same content key (the first one, if several
/// exist) only gains the derived image reference, and only if it does not have one yet.
pub async fn upsert(
    store: &dyn DocumentStore,
    collection: &str,
    policy: WritePolicy,
    observation: Observation,
) -> Result<UpsertOutcome> {
    if policy == WritePolicy::FindOrCreate {
        if let Some(existing) = store
            .query(
                collection,
                fields::CONTENT_KEY,
                &json!(observation.content_key),
                Some(1),
            )
            .await?
            .into_iter()
            .next()
        {
            if let Some(derived_image_ref) = observation.derived_image_ref {
                if !has_field(&existing.fields, fields::DERIVED_IMAGE_REF) {
                    let mut update = Fields::new();
                    update.insert(fields::DERIVED_IMAGE_REF.into(), json!(derived_image_ref));

                    store.set(collection, &existing.id, update, true).await?;
                }
            }

            debug!("merged into record {} for {}", existing.id, observation.content_key);

            return Ok(UpsertOutcome::Merged(existing.id));
        }
    }

    Ok(UpsertOutcome::Created(
        create(store, collection, observation).await?,
    ))
}

/// Return true if `fields` holds a non-null value for `field`
pub fn has_field(fields: &Fields, field: &str) -> bool {
    !matches!(fields.get(field), None | Some(Value::Null))
}

/// Count the records in `collection` holding a non-null value for `field`
pub async fn count_with_field(
    store: &dyn DocumentStore,
    collection: &str,
    field: &str,
) -> Result<usize> {
    store
        .stream(collection, fields::RECORD_ID)
        .try_fold(0, |count, document| async move {
            Ok(if has_field(&document.fields, field) {
                count + 1
            } else {
                count
            })
        })
        .await
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{sqlite_store::SqliteConnector, store::Connector},
        maplit::btreemap,
        photos_shared::TagValue,
        tempfile::TempDir,
    };

    const COLLECTION: &str = "customers/u/images";

    fn observation(content_key: &str, derived_image_ref: Option<&str>) -> Observation {
        Observation {
            content_key: content_key.into(),
            container_ref: "photos".into(),
            acquisition_time: crate::acquisition::sentinel(),
            metadata: btreemap! { "Make".to_string() => TagValue::Text("Acme".into()) },
            derived_image_ref: derived_image_ref.map(String::from),
        }
    }

    async fn store(dir: &TempDir) -> Result<Box<dyn DocumentStore>> {
        SqliteConnector::new(
            dir.path()
                .join("state.dat")
                .to_str()
                .ok_or_else(|| anyhow!("invalid UTF-8"))?,
        )
        .connect()
        .await
    }

    async fn records(store: &dyn DocumentStore, content_key: &str) -> Result<Vec<PhotoRecord>> {
        store
            .query(COLLECTION, fields::CONTENT_KEY, &json!(content_key), None)
            .await?
            .into_iter()
            .map(|document| {
                serde_json::from_value(Value::Object(document.fields)).map_err(anyhow::Error::from)
            })
            .collect()
    }

    #[test]
    fn policies() -> Result<()> {
        assert_eq!(WritePolicy::FindOrCreate, WritePolicy::default());
        assert_eq!(WritePolicy::BlindUpsert, "blind-upsert".parse()?);
        assert_eq!(WritePolicy::FindOrCreate, "find-or-create".parse()?);
        assert!("sometimes".parse::<WritePolicy>().is_err());
        assert_eq!("blind-upsert", WritePolicy::BlindUpsert.to_string());

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn find_or_create() -> Result<()> {
        let dir = TempDir::new()?;
        let store = store(&dir).await?;
        let store = store.as_ref();

        let created = upsert(
            store,
            COLLECTION,
            WritePolicy::FindOrCreate,
            observation("a.jpg", None),
        )
        .await?;

        assert!(matches!(created, UpsertOutcome::Created(_)));

        let merged = upsert(
            store,
            COLLECTION,
            WritePolicy::FindOrCreate,
            observation("a.jpg", Some("a.webp")),
        )
        .await?;

        assert_eq!(UpsertOutcome::Merged(created.record_id().into()), merged);

        let found = records(store, "a.jpg").await?;

        assert_eq!(1, found.len());
        assert_eq!(created.record_id(), found[0].record_id);
        assert_eq!(Some("a.webp"), found[0].derived_image_ref.as_deref());

        // Once set, the derived image reference is left alone.
        upsert(
            store,
            COLLECTION,
            WritePolicy::FindOrCreate,
            observation("a.jpg", Some("other.webp")),
        )
        .await?;

        assert_eq!(
            Some("a.webp"),
            records(store, "a.jpg").await?[0].derived_image_ref.as_deref()
        );

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn blind_upsert_duplicates() -> Result<()> {
        let dir = TempDir::new()?;
        let store = store(&dir).await?;
        let store = store.as_ref();

        let first = upsert(
            store,
            COLLECTION,
            WritePolicy::BlindUpsert,
            observation("a.jpg", None),
        )
        .await?;
        let second = upsert(
            store,
            COLLECTION,
            WritePolicy::BlindUpsert,
            observation("a.jpg", Some("a.webp")),
        )
        .await?;

        assert_ne!(first.record_id(), second.record_id());
        assert_eq!(2, records(store, "a.jpg").await?.len());

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn absent_optionals_are_not_stored() -> Result<()> {
        let dir = TempDir::new()?;
        let store = store(&dir).await?;
        let store = store.as_ref();

        let outcome = upsert(
            store,
            COLLECTION,
            WritePolicy::FindOrCreate,
            observation("a.jpg", None),
        )
        .await?;

        let fields = store
            .get(COLLECTION, outcome.record_id())
            .await?
            .ok_or_else(|| anyhow!("record not found"))?;

        assert!(!fields.contains_key(fields::DERIVED_IMAGE_REF));
        assert!(!fields.contains_key(fields::CAPTION));
        assert_eq!(Some(&json!("1970-01-01T00:00:00")), fields.get(fields::ACQUISITION_TIME));

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn counts_fields() -> Result<()> {
        let dir = TempDir::new()?;
        let store = store(&dir).await?;
        let store = store.as_ref();

        upsert(
            store,
            COLLECTION,
            WritePolicy::FindOrCreate,
            observation("a.jpg", Some("a.webp")),
        )
        .await?;
        upsert(store, COLLECTION, WritePolicy::FindOrCreate, observation("b.jpg", None)).await?;
        upsert(
            store,
            COLLECTION,
            WritePolicy::FindOrCreate,
            observation("c.jpg", Some("c.webp")),
        )
        .await?;

        assert_eq!(2, count_with_field(store, COLLECTION, fields::DERIVED_IMAGE_REF).await?);
        assert_eq!(3, count_with_field(store, COLLECTION, fields::CONTENT_KEY).await?);
        assert_eq!(0, count_with_field(store, COLLECTION, fields::CAPTION).await?);

        Ok(())
    }
}
