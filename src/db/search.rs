use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

use super::documents::map_document;
use super::{DOCUMENT_COLUMNS, SqliteStore, models::ScoredDocument, serialize_vector, vector_column};
use crate::error::{RagError, Result};
use crate::storage::{Filters, FulltextIndex, VectorIndex};
use crate::text;

/// `WHERE` fragments (prefixed with `AND`) and bound values for a metadata
/// selector against table alias `d`.
fn filter_clauses(filters: &Filters) -> (String, Vec<SqlValue>) {
    let mut sql = String::new();
    let mut params = Vec::new();
    for (key, value) in filters {
        let path = format!("$.\"{}\"", key.replace('"', "\\\""));
        match value {
            Value::Null => {
                sql.push_str(" AND json_extract(d.metadata, ?) IS NULL");
                params.push(SqlValue::Text(path));
            }
            other => {
                sql.push_str(" AND json_extract(d.metadata, ?) = ?");
                params.push(SqlValue::Text(path));
                params.push(json_to_sql(other));
            }
        }
    }
    (sql, params)
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn escape_like(token: &str) -> String {
    token
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Scale scores so the best hit is exactly 1.0.
pub(crate) fn normalize_scores(results: &mut [ScoredDocument]) {
    let top = results.iter().map(|r| r.score).fold(f64::MIN, f64::max);
    if top > 0.0 {
        for r in results.iter_mut() {
            r.score /= top;
        }
    } else {
        for r in results.iter_mut() {
            r.score = 1.0;
        }
    }
}

#[async_trait]
impl FulltextIndex for SqliteStore {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<ScoredDocument>> {
        let Some(expression) = text::fts_match_expression(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let table = self.collection.clone();
        let fts = self.fts_table();
        let (filter_sql, filter_params) = filter_clauses(filters);

        let mut results = self
            .db
            .call(move |conn| {
                let columns = prefixed_columns("d");
                let sql = format!(
                    r#"
                    SELECT {columns}, bm25({fts}) AS rank
                    FROM {fts}
                    JOIN {table} d ON d.id = {fts}.doc_id
                    WHERE {fts} MATCH ?{filter_sql}
                    ORDER BY rank
                    LIMIT ?
                    "#
                );
                let mut params = vec![SqlValue::Text(expression)];
                params.extend(filter_params);
                params.push(SqlValue::Integer(limit as i64));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                        let rank: f64 = row.get(8)?;
                        Ok(ScoredDocument {
                            document: map_document(row)?,
                            score: -rank,
                        })
                    })
                    .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>());
                match rows {
                    Ok(rows) => Ok(rows),
                    Err(e) if e.to_string().contains("fts5: syntax error") => {
                        warn!("FTS5 rejected query, returning no results: {e}");
                        Ok(Vec::new())
                    }
                    Err(e) => Err(RagError::from(e)),
                }
            })
            .await?;

        normalize_scores(&mut results);
        Ok(results)
    }

    async fn scan(
        &self,
        query: &str,
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<ScoredDocument>> {
        let terms: Vec<String> = {
            let mut seen = HashSet::new();
            text::tokenize(query)
                .into_iter()
                .filter(|t| seen.insert(t.clone()))
                .collect()
        };
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let table = self.collection.clone();
        let (filter_sql, filter_params) = filter_clauses(filters);
        let like_terms = terms.clone();

        let candidates = self
            .db
            .call(move |conn| {
                let columns = prefixed_columns("d");
                let any_term = vec!["(' ' || d.content_tokens || ' ') LIKE ? ESCAPE '\\'"; like_terms.len()]
                    .join(" OR ");
                let sql = format!(
                    "SELECT {columns} FROM {table} d WHERE ({any_term}){filter_sql}"
                );
                let mut params: Vec<SqlValue> = like_terms
                    .iter()
                    .map(|t| SqlValue::Text(format!("% {} %", escape_like(t))))
                    .collect();
                params.extend(filter_params);

                let mut stmt = conn.prepare(&sql)?;
                let docs = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), map_document)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(docs)
            })
            .await?;

        let mut results: Vec<ScoredDocument> = candidates
            .into_iter()
            .map(|document| {
                let tokens: HashSet<&str> = document.content_tokens.split(' ').collect();
                let hits = terms.iter().filter(|t| tokens.contains(t.as_str())).count();
                ScoredDocument {
                    score: hits as f64 / terms.len() as f64,
                    document,
                }
            })
            .filter(|r| r.score > 0.0)
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(limit);
        normalize_scores(&mut results);
        Ok(results)
    }
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn store_vector(
        &self,
        index: &str,
        id: &str,
        revision: i64,
        vector: &[f32],
    ) -> Result<bool> {
        super::validate_identifier(index)?;
        let table = self.collection.clone();
        let column = vector_column(index);
        let key = id.to_string();
        let blob = serialize_vector(vector);
        self.db
            .call(move |conn| {
                let rows = conn.execute(
                    &format!("UPDATE {table} SET {column} = ? WHERE id = ? AND revision = ?"),
                    rusqlite::params![blob, key, revision],
                )?;
                Ok(rows == 1)
            })
            .await
    }

    async fn search(
        &self,
        index: &str,
        vector: &[f32],
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<ScoredDocument>> {
        super::validate_identifier(index)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let table = self.collection.clone();
        let column = vector_column(index);
        let blob = serialize_vector(vector);
        let (filter_sql, filter_params) = filter_clauses(filters);

        self.db
            .call(move |conn| {
                let columns = prefixed_columns("d");
                let sql = format!(
                    r#"
                    SELECT {columns}, vec_distance_cosine(d.{column}, ?) AS distance
                    FROM {table} d
                    WHERE d.{column} IS NOT NULL AND d.embedding_status = 'completed'{filter_sql}
                    ORDER BY distance ASC
                    LIMIT ?
                    "#
                );
                let mut params = vec![SqlValue::Blob(blob)];
                params.extend(filter_params);
                params.push(SqlValue::Integer(limit as i64));

                let mut stmt = conn.prepare(&sql)?;
                let results = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                        let distance: f64 = row.get(8)?;
                        Ok(ScoredDocument {
                            document: map_document(row)?,
                            score: 1.0 - distance,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(results)
            })
            .await
    }
}

fn prefixed_columns(alias: &str) -> String {
    DOCUMENT_COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::db::models::{EmbeddingStatus, NewDocument};
    use crate::storage::DocumentStore;
    use serde_json::{Map, json};

    async fn seeded() -> SqliteStore {
        let store = SqliteStore::new(Db::open_in_memory().unwrap(), "docs").unwrap();
        store.initialize(&["main".to_string()]).await.unwrap();
        store
            .upsert(vec![
                NewDocument::new("The capital of France is Paris.")
                    .with_id("fr")
                    .with_metadata("region", "west"),
                NewDocument::new("The capital of Germany is Berlin.")
                    .with_id("de")
                    .with_metadata("region", "central"),
                NewDocument::new("Rust programming language notes.").with_id("rs"),
            ])
            .await
            .unwrap();
        store
    }

    async fn embed_as(store: &SqliteStore, id: &str, vector: &[f32]) {
        let doc = store.get(id).await.unwrap();
        assert!(store.claim(id, doc.revision).await.unwrap());
        assert!(store.store_vector("main", id, doc.revision, vector).await.unwrap());
        store
            .finish(id, doc.revision, EmbeddingStatus::Completed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fulltext_search_ranks_and_normalizes() {
        let store = seeded().await;
        let results = FulltextIndex::search(&store, "Berlin", 5, &Map::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document.id, "de");
        assert!((results[0].score - 1.0).abs() < 1e-9);

        let results = FulltextIndex::search(&store, "capital", 5, &Map::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_fulltext_search_applies_filters() {
        let store = seeded().await;
        let mut filters = Map::new();
        filters.insert("region".into(), json!("west"));
        let results = FulltextIndex::search(&store, "capital", 5, &filters)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document.id, "fr");
    }

    #[tokio::test]
    async fn test_null_filter_selects_records_without_the_key() {
        let store = seeded().await;
        let mut filters = Map::new();
        filters.insert("region".into(), serde_json::Value::Null);
        let results = FulltextIndex::scan(&store, "capital programming", 5, &filters)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document.id, "rs");
        assert!(results[0].document.matches_filters(&filters));
    }

    #[tokio::test]
    async fn test_fulltext_search_without_terms_is_empty() {
        let store = seeded().await;
        assert!(
            FulltextIndex::search(&store, "?!", 5, &Map::new())
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            FulltextIndex::search(&store, "nonexistentword", 5, &Map::new())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_scan_scores_by_term_coverage() {
        let store = seeded().await;
        let results = store
            .scan("capital of Germany", 5, &Map::new())
            .await
            .unwrap();
        assert_eq!(results[0].document.id, "de");
        assert!((results[0].score - 1.0).abs() < 1e-9);
        assert_eq!(results.len(), 2);
        assert!(results[1].score < 1.0);
    }

    #[tokio::test]
    async fn test_vector_search_orders_by_similarity() {
        let store = seeded().await;
        let mut a = vec![0.0f32; 4];
        a[0] = 1.0;
        let mut b = vec![0.0f32; 4];
        b[1] = 1.0;
        embed_as(&store, "fr", &a).await;
        embed_as(&store, "de", &b).await;

        let results = VectorIndex::search(&store, "main", &[0.9, 0.1, 0.0, 0.0], 5, &Map::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 2, "pending records are not searchable");
        assert_eq!(results[0].document.id, "fr");
        assert!(results[0].score > results[1].score);
        assert!(results[0].score <= 1.0 + 1e-6);
    }

    #[tokio::test]
    async fn test_store_vector_rejects_stale_revision() {
        let store = seeded().await;
        let doc = store.get("fr").await.unwrap();
        store
            .upsert(vec![NewDocument::new("The capital of France is still Paris.").with_id("fr")])
            .await
            .unwrap();
        assert!(
            !store
                .store_vector("main", "fr", doc.revision, &[1.0, 0.0])
                .await
                .unwrap()
        );
    }
}
