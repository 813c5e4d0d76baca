use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{Row, TransactionBehavior, params};
use tracing::debug;

use super::{SqliteStore, models::Triple};
use crate::error::Result;
use crate::storage::{GraphStore, TripleQuery};

fn map_triple(row: &Row<'_>) -> rusqlite::Result<Triple> {
    Ok(Triple {
        subject: row.get(0)?,
        predicate: row.get(1)?,
        object: row.get(2)?,
    })
}

/// `WHERE` clause (possibly empty) and bound values for a triple query.
fn where_clause(query: &TripleQuery) -> (String, Vec<Value>) {
    let collate = if query.ignore_case { " COLLATE NOCASE" } else { "" };
    let mut conditions = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    let mut any_of = |column: &str, values: &[String], collate: &str, negate: bool| {
        if values.is_empty() {
            return;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        let op = if negate { "NOT IN" } else { "IN" };
        conditions.push(format!("{column}{collate} {op} ({placeholders})"));
        params.extend(values.iter().map(|v| Value::Text(v.clone())));
    };
    any_of("subject", &query.subjects, collate, false);
    any_of("predicate", &query.predicates, "", false);
    any_of("object", &query.objects, collate, false);
    any_of("predicate", &query.exclude_predicates, "", true);

    if let Some(node) = &query.touching {
        conditions.push(format!("(subject{collate} = ? OR object{collate} = ?)"));
        params.push(Value::Text(node.clone()));
        params.push(Value::Text(node.clone()));
    }
    if let Some(needle) = &query.node_contains {
        // instr() is case-sensitive, so both sides are folded when asked.
        if query.ignore_case {
            conditions.push("(instr(lower(subject), lower(?)) > 0 OR instr(lower(object), lower(?)) > 0)".to_string());
        } else {
            conditions.push("(instr(subject, ?) > 0 OR instr(object, ?) > 0)".to_string());
        }
        params.push(Value::Text(needle.clone()));
        params.push(Value::Text(needle.clone()));
    }

    if conditions.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), params)
    }
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn initialize(&self) -> Result<()> {
        let t = self.triples_table();
        self.db
            .call(move |conn| {
                conn.execute_batch(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {t} (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        subject TEXT NOT NULL,
                        predicate TEXT NOT NULL,
                        object TEXT NOT NULL,
                        UNIQUE(subject, predicate, object)
                    );

                    CREATE INDEX IF NOT EXISTS idx_{t}_subject ON {t}(subject, predicate);
                    CREATE INDEX IF NOT EXISTS idx_{t}_object ON {t}(object, predicate);
                    "#
                ))?;
                Ok(())
            })
            .await
    }

    async fn add_edges(&self, edges: &[Triple]) -> Result<usize> {
        if edges.is_empty() {
            return Ok(0);
        }
        let t = self.triples_table();
        let edges = edges.to_vec();
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut inserted = 0;
                {
                    let mut stmt = tx.prepare(&format!(
                        "INSERT OR IGNORE INTO {t} (subject, predicate, object) VALUES (?, ?, ?)"
                    ))?;
                    for edge in &edges {
                        inserted += stmt.execute(params![edge.subject, edge.predicate, edge.object])?;
                    }
                }
                tx.commit()?;
                debug!("Inserted {} of {} edge(s) into {}", inserted, edges.len(), t);
                Ok(inserted)
            })
            .await
    }

    async fn remove_edge(&self, edge: &Triple) -> Result<bool> {
        let t = self.triples_table();
        let edge = edge.clone();
        self.db
            .call(move |conn| {
                let rows = conn.execute(
                    &format!("DELETE FROM {t} WHERE subject = ? AND predicate = ? AND object = ?"),
                    params![edge.subject, edge.predicate, edge.object],
                )?;
                Ok(rows > 0)
            })
            .await
    }

    async fn remove_matching(&self, query: &TripleQuery) -> Result<usize> {
        let t = self.triples_table();
        let (clause, params) = where_clause(query);
        self.db
            .call(move |conn| {
                let rows = conn.execute(
                    &format!("DELETE FROM {t}{clause}"),
                    rusqlite::params_from_iter(params.iter()),
                )?;
                Ok(rows)
            })
            .await
    }

    async fn query(&self, query: &TripleQuery) -> Result<Vec<Triple>> {
        let t = self.triples_table();
        let (clause, mut params) = where_clause(query);
        let limit = match query.limit {
            Some(n) => {
                params.push(Value::Integer(n as i64));
                " LIMIT ?"
            }
            None => "",
        };
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT subject, predicate, object FROM {t}{clause} ORDER BY id{limit}"
                ))?;
                let triples = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), map_triple)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(triples)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::db::models::APPEARS_IN;

    async fn graph() -> SqliteStore {
        let store = SqliteStore::new(Db::open_in_memory().unwrap(), "kg").unwrap();
        GraphStore::initialize(&store).await.unwrap();
        GraphStore::initialize(&store).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_relations_crud() {
        let store = graph().await;
        let inserted = store
            .add_edges(&[
                Triple::new("RxDB", "BUILT_FOR", "JavaScript"),
                Triple::new("RxDB", "IS_A", "Database"),
                Triple::new("RxDB", "BUILT_FOR", "JavaScript"),
                Triple::new("RxDB", APPEARS_IN, "doc-1"),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 3, "duplicate triple is ignored");

        // Same pair, different predicate is a separate edge
        assert!(
            store
                .add_edge(Triple::new("RxDB", "SUPPORTS", "JavaScript"))
                .await
                .unwrap()
        );

        let out = store.out_edges("RxDB").await.unwrap();
        assert_eq!(out.len(), 4);
        let into = store.in_edges("JavaScript").await.unwrap();
        assert_eq!(into.len(), 2);

        assert!(
            store
                .remove_edge(&Triple::new("RxDB", "IS_A", "Database"))
                .await
                .unwrap()
        );
        assert_eq!(store.all_triples().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_query_builder_filters() {
        let store = graph().await;
        store
            .add_edges(&[
                Triple::new("Paris", "CAPITAL_OF", "France"),
                Triple::new("Paris", APPEARS_IN, "d1"),
                Triple::new("Berlin", "CAPITAL_OF", "Germany"),
                Triple::new("Lyon", "CITY_IN", "France"),
            ])
            .await
            .unwrap();

        let touching = store
            .query(&TripleQuery::new().touching("france").ignore_case())
            .await
            .unwrap();
        assert_eq!(touching.len(), 2);

        let without_links = store
            .query(&TripleQuery::new().subject("Paris").exclude_predicate(APPEARS_IN))
            .await
            .unwrap();
        assert_eq!(without_links, vec![Triple::new("Paris", "CAPITAL_OF", "France")]);

        let contains = store
            .query(&TripleQuery::new().node_contains("ERM").ignore_case())
            .await
            .unwrap();
        assert_eq!(contains, vec![Triple::new("Berlin", "CAPITAL_OF", "Germany")]);

        let limited = store.query(&TripleQuery::new().limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);

        let removed = store
            .remove_matching(&TripleQuery::new().predicate(APPEARS_IN).object("d1"))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.all_triples().await.unwrap().len(), 3);
    }
}
