use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{DOCUMENT_COLUMNS, SqliteStore, models::*, validate_identifier, vector_column};
use crate::error::{RagError, Result};
use crate::storage::DocumentStore;
use crate::text;

/// Default rune count at or below which records are never embedded.
pub const MIN_EMBEDDABLE_LENGTH: usize = 10;

pub(crate) fn map_document(row: &Row<'_>) -> rusqlite::Result<Document> {
    let metadata: String = row.get(2)?;
    let status: String = row.get(4)?;
    Ok(Document {
        id: row.get(0)?,
        content: row.get(1)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        content_tokens: row.get(3)?,
        embedding_status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
        })?,
        chunk_length: row.get::<_, i64>(5)? as usize,
        revision: row.get(6)?,
        created_at: row.get::<_, DateTime<Utc>>(7)?,
    })
}

fn existing_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn strip_reserved(mut metadata: Map<String, Value>) -> Map<String, Value> {
    for key in RESERVED_METADATA_KEYS {
        metadata.remove(key);
    }
    metadata
}

impl SqliteStore {
    fn schema_sql(&self) -> String {
        let t = &self.collection;
        let fts = self.fts_table();
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{{}}',
                content_tokens TEXT NOT NULL DEFAULT '',
                embedding_status TEXT NOT NULL DEFAULT 'pending',
                chunk_length INTEGER NOT NULL DEFAULT 0,
                revision INTEGER NOT NULL DEFAULT 1,
                created_at DATETIME NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_{t}_status ON {t}(embedding_status, created_at);

            CREATE VIRTUAL TABLE IF NOT EXISTS {fts} USING fts5(
                doc_id UNINDEXED,
                content_tokens
            );
            "#
        )
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn initialize(&self, vector_indexes: &[String]) -> Result<()> {
        for id in vector_indexes {
            validate_identifier(id)?;
        }
        let table = self.collection.clone();
        let schema = self.schema_sql();
        let wanted: Vec<String> = vector_indexes.to_vec();

        let added = self
            .db
            .call(move |conn| {
                // The write lock is taken up front so a concurrent initializer
                // (another pool connection or process) sees our columns.
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute_batch(&schema)?;
                let columns = existing_columns(&tx, &table)?;
                let mut added = Vec::new();
                for id in &wanted {
                    let column = vector_column(id);
                    if !columns.contains(&column) {
                        tx.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} BLOB"))?;
                        added.push(column);
                    }
                }
                tx.commit()?;
                Ok(added)
            })
            .await?;

        if let Ok(mut registered) = self.vector_indexes.write() {
            for id in vector_indexes {
                if !registered.contains(id) {
                    registered.push(id.clone());
                }
            }
        }

        info!(
            "Collection {} initialized ({} vector column(s) added)",
            self.collection,
            added.len()
        );
        Ok(())
    }

    async fn upsert(&self, docs: Vec<NewDocument>) -> Result<Vec<Document>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let table = self.collection.clone();
        let fts = self.fts_table();
        let clear_vectors: String = self
            .registered_vector_columns()
            .iter()
            .map(|c| format!(", {c} = NULL"))
            .collect();
        let min_length = self.min_embeddable_length;

        self.db
            .call(move |conn| {
                let upsert_sql = format!(
                    r#"
                    INSERT INTO {table} (id, content, metadata, content_tokens, embedding_status, chunk_length, revision, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)
                    ON CONFLICT(id) DO UPDATE SET
                        content = excluded.content,
                        metadata = excluded.metadata,
                        content_tokens = excluded.content_tokens,
                        embedding_status = excluded.embedding_status,
                        chunk_length = excluded.chunk_length,
                        revision = {table}.revision + 1
                        {clear_vectors}
                    RETURNING {DOCUMENT_COLUMNS}
                    "#
                );

                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut stored = Vec::with_capacity(docs.len());
                for doc in docs {
                    let id = doc
                        .id
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                    let tokens = text::content_tokens(&doc.content);
                    let chunk_length = text::rune_count(&doc.content);
                    let status = if chunk_length <= min_length {
                        EmbeddingStatus::Completed
                    } else {
                        EmbeddingStatus::Pending
                    };
                    let metadata = serde_json::to_string(&strip_reserved(doc.metadata))?;

                    let record = tx.query_row(
                        &upsert_sql,
                        params![
                            id,
                            doc.content,
                            metadata,
                            tokens,
                            status.as_str(),
                            chunk_length as i64,
                            Utc::now(),
                        ],
                        map_document,
                    )?;

                    tx.execute(&format!("DELETE FROM {fts} WHERE doc_id = ?"), params![id])?;
                    tx.execute(
                        &format!("INSERT INTO {fts} (doc_id, content_tokens) VALUES (?, ?)"),
                        params![id, tokens],
                    )?;
                    stored.push(record);
                }
                tx.commit()?;
                debug!("Upserted {} record(s) into {}", stored.len(), table);
                Ok(stored)
            })
            .await
    }

    async fn get(&self, id: &str) -> Result<Document> {
        let table = self.collection.clone();
        let key = id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {DOCUMENT_COLUMNS} FROM {table} WHERE id = ?"),
                    params![key],
                    map_document,
                )
                .optional()?
                .ok_or(RagError::NotFound(key))
            })
            .await
    }

    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.collection.clone();
        let ids = ids.to_vec();
        self.db
            .call(move |conn| {
                let placeholders = vec!["?"; ids.len()].join(", ");
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM {table} WHERE id IN ({placeholders})"
                ))?;
                let mut found: Vec<Document> = stmt
                    .query_map(rusqlite::params_from_iter(ids.iter()), map_document)?
                    .collect::<rusqlite::Result<_>>()?;
                found.sort_by_key(|d| ids.iter().position(|id| *id == d.id));
                Ok(found)
            })
            .await
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<Document>> {
        let table = self.collection.clone();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM {table} ORDER BY created_at, id LIMIT ? OFFSET ?"
                ))?;
                let docs = stmt
                    .query_map(params![limit as i64, offset as i64], map_document)?
                    .collect::<rusqlite::Result<_>>()?;
                Ok(docs)
            })
            .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let table = self.collection.clone();
        let fts = self.fts_table();
        let key = id.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(&format!("DELETE FROM {fts} WHERE doc_id = ?"), params![key])?;
                let rows = tx.execute(&format!("DELETE FROM {table} WHERE id = ?"), params![key])?;
                tx.commit()?;
                if rows == 0 {
                    Err(RagError::NotFound(key))
                } else {
                    Ok(())
                }
            })
            .await
    }

    async fn pending(&self, limit: usize) -> Result<Vec<Document>> {
        let table = self.collection.clone();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM {table} WHERE embedding_status = 'pending' ORDER BY created_at, id LIMIT ?"
                ))?;
                let docs = stmt
                    .query_map(params![limit as i64], map_document)?
                    .collect::<rusqlite::Result<_>>()?;
                Ok(docs)
            })
            .await
    }

    async fn count_by_status(&self, status: EmbeddingStatus) -> Result<usize> {
        let table = self.collection.clone();
        self.db
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM {table} WHERE embedding_status = ?"),
                    params![status.as_str()],
                    |row| row.get(0),
                )?;
                Ok(n as usize)
            })
            .await
    }

    async fn claim(&self, id: &str, revision: i64) -> Result<bool> {
        let table = self.collection.clone();
        let key = id.to_string();
        self.db
            .call(move |conn| {
                let rows = conn.execute(
                    &format!(
                        "UPDATE {table} SET embedding_status = 'processing' \
                         WHERE id = ? AND revision = ? AND embedding_status = 'pending'"
                    ),
                    params![key, revision],
                )?;
                Ok(rows == 1)
            })
            .await
    }

    async fn release_claims(&self) -> Result<usize> {
        let table = self.collection.clone();
        let released = self
            .db
            .call(move |conn| {
                let rows = conn.execute(
                    &format!(
                        "UPDATE {table} SET embedding_status = 'pending' \
                         WHERE embedding_status = 'processing'"
                    ),
                    [],
                )?;
                Ok(rows)
            })
            .await?;
        if released > 0 {
            info!(
                "Released {} record(s) left in processing in {}",
                released, self.collection
            );
        }
        Ok(released)
    }

    async fn finish(&self, id: &str, revision: i64, status: EmbeddingStatus) -> Result<bool> {
        let table = self.collection.clone();
        let key = id.to_string();
        self.db
            .call(move |conn| {
                let rows = conn.execute(
                    &format!(
                        "UPDATE {table} SET embedding_status = ? \
                         WHERE id = ? AND revision = ? AND embedding_status = 'processing'"
                    ),
                    params![status.as_str(), key, revision],
                )?;
                Ok(rows == 1)
            })
            .await
    }
}
