//! This module provides [SqliteDocumentStore], a [DocumentStore] which keeps each document as JSON text in a
//! single SQLite table, and [SqliteConnector], which opens a fresh connection per session.

use {
    crate::store::{merge_fields, Connector, Document, DocumentStore, Fields},
    anyhow::{anyhow, Error, Result},
    async_trait::async_trait,
    futures::stream::{self, BoxStream, StreamExt},
    lazy_static::lazy_static,
    regex::Regex,
    serde_json::Value,
    sqlx::{sqlite::SqliteRow, Connection, Row, SqliteConnection},
    std::collections::VecDeque,
    tokio::sync::Mutex as AsyncMutex,
};

/// Number of documents fetched per query while streaming a collection
const PAGE_SIZE: usize = 500;

/// Convert a field name into a JSON path usable in SQL text.
///
/// Field names are spliced into queries (so that expression indexes apply), which is why only plain identifiers
/// are accepted.
fn json_path(field: &str) -> Result<String> {
    lazy_static! {
        static ref FIELD_PATTERN: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    }

    if FIELD_PATTERN.is_match(field) {
        Ok(format!("$.{}", field))
    } else {
        Err(anyhow!("unsupported field name: {:?}", field))
    }
}

fn document(row: &SqliteRow) -> Result<Document> {
    Ok(Document {
        id: row.get::<String, _>(0),
        fields: serde_json::from_str(row.get::<&str, _>(1))?,
    })
}

/// Position of the last document returned while streaming: its sort key (as JSON text) and rowid
#[derive(Debug, Clone)]
struct Cursor {
    key: String,
    rowid: i64,
}

#[derive(Default)]
struct Pager {
    cursor: Option<Cursor>,
    buffer: VecDeque<Document>,
    exhausted: bool,
}

/// A [DocumentStore] session over a single SQLite connection
pub struct SqliteDocumentStore {
    conn: AsyncMutex<SqliteConnection>,
}

impl SqliteDocumentStore {
    pub fn new(conn: SqliteConnection) -> Self {
        Self {
            conn: AsyncMutex::new(conn),
        }
    }

    /// Fetch the page of `collection` which follows `cursor` in (`order_by`, rowid) order.
    ///
    /// Pages are keyed on the last row seen rather than an offset, so documents inserted or deleted behind the
    /// cursor do not shift the rest of the scan.  Documents lacking `order_by` sort first.
    async fn page(
        &self,
        collection: &str,
        order_by: &str,
        cursor: Option<&Cursor>,
    ) -> Result<(Vec<Document>, Option<Cursor>)> {
        let path = json_path(order_by)?;

        let rows = sqlx::query(&format!(
            "SELECT id, fields, rowid, json_quote(json_extract(fields, '{0}')) FROM documents \
             WHERE collection = ?1 \
             AND (?3 IS NULL \
                  OR json_extract(fields, '{0}') > json_extract(?2, '$') \
                  OR (json_extract(fields, '{0}') IS json_extract(?2, '$') AND rowid > ?3) \
                  OR (json_extract(?2, '$') IS NULL AND json_extract(fields, '{0}') IS NOT NULL)) \
             ORDER BY json_extract(fields, '{0}'), rowid LIMIT ?4",
            path
        ))
        .bind(collection)
        .bind(cursor.map(|cursor| cursor.key.as_str()).unwrap_or("null"))
        .bind(cursor.map(|cursor| cursor.rowid))
        .bind(i64::try_from(PAGE_SIZE)?)
        .fetch_all(&mut *self.conn.lock().await)
        .await?;

        let next = rows.last().map(|row| Cursor {
            rowid: row.get::<i64, _>(2),
            key: row
                .get::<Option<String>, _>(3)
                .unwrap_or_else(|| "null".to_owned()),
        });

        Ok((rows.iter().map(document).collect::<Result<_>>()?, next))
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        // A negative LIMIT means "no limit" to SQLite.
        let limit = limit.map(i64::try_from).transpose()?.unwrap_or(-1);

        sqlx::query(&format!(
            "SELECT id, fields FROM documents WHERE collection = ?1 \
             AND json_extract(fields, '{}') = json_extract(?2, '$') ORDER BY rowid LIMIT ?3",
            json_path(field)?
        ))
        .bind(collection)
        .bind(serde_json::to_string(value)?)
        .bind(limit)
        .fetch_all(&mut *self.conn.lock().await)
        .await?
        .iter()
        .map(document)
        .collect()
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Fields>> {
        sqlx::query("SELECT fields FROM documents WHERE collection = ?1 AND id = ?2")
            .bind(collection)
            .bind(id)
            .fetch_optional(&mut *self.conn.lock().await)
            .await?
            .map(|row| serde_json::from_str(row.get::<&str, _>(0)).map_err(Error::from))
            .transpose()
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields, merge: bool) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut tx = conn.begin().await?;

        let fields = if merge {
            if let Some(row) =
                sqlx::query("SELECT fields FROM documents WHERE collection = ?1 AND id = ?2")
                    .bind(collection)
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
            {
                let mut existing = serde_json::from_str::<Fields>(row.get::<&str, _>(0))?;
                merge_fields(&mut existing, fields);
                existing
            } else {
                fields
            }
        } else {
            fields
        };

        sqlx::query(
            "INSERT INTO documents (collection, id, fields) VALUES (?1, ?2, ?3) \
             ON CONFLICT (collection, id) DO UPDATE SET fields = excluded.fields",
        )
        .bind(collection)
        .bind(id)
        .bind(serde_json::to_string(&fields)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE collection = ?1 AND id = ?2")
            .bind(collection)
            .bind(id)
            .execute(&mut *self.conn.lock().await)
            .await?;

        Ok(())
    }

    fn stream<'a>(
        &'a self,
        collection: &'a str,
        order_by: &'a str,
    ) -> BoxStream<'a, Result<Document>> {
        stream::try_unfold(Pager::default(), move |mut pager| async move {
            if pager.buffer.is_empty() && !pager.exhausted {
                let (page, next) = self
                    .page(collection, order_by, pager.cursor.as_ref())
                    .await?;

                pager.exhausted = page.len() < PAGE_SIZE;
                pager.cursor = next.or(pager.cursor);
                pager.buffer.extend(page);
            }

            Ok::<_, Error>(pager.buffer.pop_front().map(|document| (document, pager)))
        })
        .boxed()
    }
}

/// Opens a new SQLite connection to the same state file for every session
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    state_file: String,
}

impl SqliteConnector {
    pub fn new(state_file: impl Into<String>) -> Self {
        Self {
            state_file: state_file.into(),
        }
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self) -> Result<Box<dyn DocumentStore>> {
        Ok(Box::new(SqliteDocumentStore::new(
            crate::open(&self.state_file).await?,
        )))
    }
}
