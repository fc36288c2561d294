#![deny(warnings)]

use {
    anyhow::Result,
    photos_server::{
        fs_store::FsObjectStore,
        ingest::{EventLog, Ingestor},
        records::{self, WritePolicy},
        sqlite_store::SqliteDocumentStore,
        Connector, SqliteConnector,
    },
    photos_shared::records_collection_path,
    serde::Serialize,
    std::sync::Arc,
    structopt::StructOpt,
};

#[derive(StructOpt, Debug)]
struct Collection {
    /// Customer whose records to process
    customer_id: String,

    /// Top-level collection holding one document per customer
    #[structopt(long, default_value = "customers")]
    customer_collection: String,

    /// Per-customer collection holding photo records
    #[structopt(long, default_value = "images")]
    records_collection: String,
}

impl Collection {
    fn path(&self) -> String {
        records_collection_path(
            &self.customer_collection,
            &self.customer_id,
            &self.records_collection,
        )
    }
}

#[derive(StructOpt, Debug)]
struct Ingestion {
    /// Directory holding one subdirectory per object store container
    #[structopt(long)]
    object_root: String,

    /// File to which to append ingestion events as JSON lines
    #[structopt(long)]
    event_log: Option<String>,

    /// How records are written: "find-or-create" or "blind-upsert"
    #[structopt(long, default_value = "find-or-create")]
    write_policy: WritePolicy,
}

impl Ingestion {
    async fn ingestor(&self, state_file: &str) -> Result<Ingestor> {
        let events = if let Some(event_log) = &self.event_log {
            Some(EventLog::open(event_log).await?)
        } else {
            None
        };

        Ok(Ingestor::new(
            Arc::new(FsObjectStore::new(&self.object_root)),
            Arc::new(SqliteDocumentStore::new(
                photos_server::open(state_file).await?,
            )),
            self.write_policy,
            events,
        ))
    }
}

#[derive(StructOpt, Debug)]
#[structopt(name = "photos-admin", about = "Photo ingestion pipeline admin tool")]
enum Command {
    /// Collapse records sharing a content key down to the most complete one
    Sweep {
        /// SQLite database to create or reuse
        #[structopt(long)]
        state_file: String,

        #[structopt(flatten)]
        collection: Collection,

        /// Number of concurrent workers (default: half the available parallelism)
        #[structopt(long)]
        workers: Option<usize>,
    },

    /// Generate previews for records which lack one
    BackfillPreviews {
        /// SQLite database to create or reuse
        #[structopt(long)]
        state_file: String,

        /// Directory holding one subdirectory per object store container
        #[structopt(long)]
        object_root: String,

        #[structopt(flatten)]
        collection: Collection,

        /// Number of concurrent workers (default: the available parallelism)
        #[structopt(long)]
        workers: Option<usize>,
    },

    /// Re-run the failed ingestions recorded in an event log
    Reingest {
        /// SQLite database to create or reuse
        #[structopt(long)]
        state_file: String,

        #[structopt(flatten)]
        ingestion: Ingestion,

        /// Event log to replay
        replay_log: String,
    },

    /// Ingest every image in a container
    IngestContainer {
        /// SQLite database to create or reuse
        #[structopt(long)]
        state_file: String,

        #[structopt(flatten)]
        ingestion: Ingestion,

        /// Container to ingest
        container: String,

        /// Customer on whose behalf to ingest
        customer_id: String,
    },

    /// Count the records which hold a value for a field
    CountField {
        /// SQLite database to create or reuse
        #[structopt(long)]
        state_file: String,

        #[structopt(flatten)]
        collection: Collection,

        /// Field to look for (e.g. "caption")
        field: String,
    },
}

fn print(report: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init_timed();

    match Command::from_args() {
        Command::Sweep {
            state_file,
            collection,
            workers,
        } => print(
            &photos_server::sweep(
                Arc::new(SqliteConnector::new(state_file)),
                &collection.path(),
                workers.unwrap_or_else(|| photos_server::default_workers(2)),
            )
            .await?,
        ),

        Command::BackfillPreviews {
            state_file,
            object_root,
            collection,
            workers,
        } => print(
            &photos_server::backfill(
                Arc::new(FsObjectStore::new(object_root)),
                Arc::new(SqliteConnector::new(state_file)),
                &collection.path(),
                workers.unwrap_or_else(|| photos_server::default_workers(1)),
            )
            .await?,
        ),

        Command::Reingest {
            state_file,
            ingestion,
            replay_log,
        } => print(
            &photos_server::reingest(&ingestion.ingestor(&state_file).await?, replay_log).await?,
        ),

        Command::IngestContainer {
            state_file,
            ingestion,
            container,
            customer_id,
        } => {
            let objects = FsObjectStore::new(&ingestion.object_root);

            print(
                &photos_server::ingest_container(
                    &objects,
                    &ingestion.ingestor(&state_file).await?,
                    &container,
                    &customer_id,
                )
                .await?,
            )
        }

        Command::CountField {
            state_file,
            collection,
            field,
        } => {
            let session = SqliteConnector::new(state_file).connect().await?;

            println!(
                "{}",
                records::count_with_field(session.as_ref(), &collection.path(), &field).await?
            );

            Ok(())
        }
    }
}
