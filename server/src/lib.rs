#![deny(warnings)]

use {
    crate::{
        fs_store::FsObjectStore,
        ingest::{EventLog, Ingestor},
        records::WritePolicy,
        sqlite_store::SqliteDocumentStore,
        warp_util::HttpError,
    },
    anyhow::Result,
    bytes::Bytes,
    sqlx::{
        sqlite::{SqliteConnectOptions, SqliteJournalMode},
        ConnectOptions, SqliteConnection,
    },
    std::{convert::Infallible, net::SocketAddrV4, sync::Arc, time::Duration},
    structopt::StructOpt,
    tracing::info,
    warp::{
        http::{header, response::Response, status::StatusCode},
        hyper::Body,
        Filter, Rejection, Reply,
    },
};

pub use {
    backfill::{backfill, BackfillReport},
    dedup::{sweep, SweepReport},
    pool::default_workers,
    replay::{ingest_container, reingest, BatchReport},
    sqlite_store::SqliteConnector,
    store::{Connector, DocumentStore, ObjectStore},
};

pub mod acquisition;
pub mod backfill;
pub mod dedup;
pub mod fs_store;
pub mod ingest;
pub mod media;
pub mod metadata;
pub mod pool;
pub mod records;
pub mod replay;
pub mod sqlite_store;
pub mod store;
mod warp_util;

#[cfg(test)]
mod test_util;

/// Largest accepted ingestion request body
const MAX_BODY_SIZE: u64 = 64 * 1024;

const BUSY_TIMEOUT_SECS: u64 = 30;

#[derive(StructOpt, Debug)]
#[structopt(name = "photos-server", about = "Photo ingestion endpoint")]
pub struct Options {
    /// Address to which to bind
    #[structopt(long)]
    pub address: SocketAddrV4,

    /// SQLite database to create or reuse
    #[structopt(long)]
    pub state_file: String,

    /// Directory holding one subdirectory per object store container
    #[structopt(long)]
    pub object_root: String,

    /// File to which to append ingestion events as JSON lines
    #[structopt(long)]
    pub event_log: Option<String>,

    /// How records are written: "find-or-create" or "blind-upsert"
    #[structopt(long, default_value = "find-or-create")]
    pub write_policy: WritePolicy,
}

pub async fn open(state_file: &str) -> Result<SqliteConnection> {
    let mut conn = format!("sqlite://{}", state_file)
        .parse::<SqliteConnectOptions>()?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))
        .connect()
        .await?;

    for statement in schema::DDL_STATEMENTS {
        sqlx::query(statement).execute(&mut conn).await?;
    }

    Ok(conn)
}

fn response() -> warp::http::response::Builder {
    Response::builder()
}

async fn handle_ingest(ingestor: &Ingestor, body: &[u8]) -> Result<Response<Body>> {
    let (event, status) = match ingest::decode(body) {
        Ok(message) => {
            let event = ingestor.handle(&message).await;

            let status = if event.is_success() {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };

            (event, status)
        }

        Err(e) => {
            let event = ingest::undecodable(e);

            ingestor.emit(&event).await;

            (event, StatusCode::BAD_REQUEST)
        }
    };

    Ok(response()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&event)?))?)
}

pub fn routes(
    ingestor: Arc<Ingestor>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    warp::post()
        .and(warp::path("ingest"))
        .and(warp::path::end())
        .and(warp::body::content_length_limit(MAX_BODY_SIZE))
        .and(warp::body::bytes())
        .and_then(move |body: Bytes| {
            let ingestor = ingestor.clone();

            async move {
                handle_ingest(&ingestor, &body)
                    .await
                    .map_err(|e| Rejection::from(HttpError::from(e)))
            }
        })
        .recover(warp_util::handle_rejection)
        .with(warp::log("photos"))
}

pub async fn serve(options: &Options) -> Result<()> {
    let events = if let Some(event_log) = &options.event_log {
        Some(EventLog::open(event_log).await?)
    } else {
        None
    };

    let ingestor = Arc::new(Ingestor::new(
        Arc::new(FsObjectStore::new(&options.object_root)),
        Arc::new(SqliteDocumentStore::new(open(&options.state_file).await?)),
        options.write_policy,
        events,
    ));

    let (address, future) = warp::serve(routes(ingestor)).try_bind_ephemeral(options.address)?;

    info!(
        "listening on {} with write policy {}",
        address, options.write_policy
    );

    future.await;

    Ok(())
}
