//! Capability interfaces the engine consumes.
//!
//! A backend implements each narrow trait independently; nothing above this
//! layer sees backend query syntax. [`crate::db::SqliteStore`] implements all
//! four.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::db::models::{Document, EmbeddingStatus, NewDocument, ScoredDocument, Triple};
use crate::error::Result;

/// Exact-match metadata selector, AND-combined.
pub type Filters = Map<String, Value>;

/// Keyed record storage with revisions and embedding status.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create missing tables and one vector column per identifier.
    async fn initialize(&self, vector_indexes: &[String]) -> Result<()>;

    /// Insert or replace records. Existing ids get `revision + 1`, fresh
    /// tokens, cleared vectors and status reset to `pending` (or `completed`
    /// when too short to embed).
    async fn upsert(&self, docs: Vec<NewDocument>) -> Result<Vec<Document>>;

    /// Fetch one record; `RagError::NotFound` when absent.
    async fn get(&self, id: &str) -> Result<Document>;

    /// Fetch the records that exist among `ids`, in `ids` order.
    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<Document>>;

    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<Document>>;

    /// Remove a record and its index entries; `RagError::NotFound` when absent.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Up to `limit` records currently `pending`, oldest first.
    async fn pending(&self, limit: usize) -> Result<Vec<Document>>;

    async fn count_by_status(&self, status: EmbeddingStatus) -> Result<usize>;

    /// Atomically move `pending -> processing` for this exact revision.
    /// Returns `false` when another sweep already claimed it or it changed.
    async fn claim(&self, id: &str, revision: i64) -> Result<bool>;

    /// Return every `processing` record to `pending`. Run once at startup,
    /// before any sweep, to recover claims a stopped process never finished.
    async fn release_claims(&self) -> Result<usize>;

    /// Atomically move `processing -> status` for this exact revision.
    async fn finish(&self, id: &str, revision: i64, status: EmbeddingStatus) -> Result<bool>;
}

/// Ranked keyword search over the tokens column.
#[async_trait]
pub trait FulltextIndex: Send + Sync {
    /// Native-score ranking; the top hit is normalised to 1.0.
    async fn search(&self, query: &str, limit: usize, filters: &Filters)
    -> Result<Vec<ScoredDocument>>;

    /// Permissive scan: any record sharing at least one token, scored by the
    /// fraction of query tokens it contains.
    async fn scan(&self, query: &str, limit: usize, filters: &Filters)
    -> Result<Vec<ScoredDocument>>;
}

/// Ranked cosine-similarity search over named float columns.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Write a vector for `id` only if the record is still at `revision`.
    async fn store_vector(
        &self,
        index: &str,
        id: &str,
        revision: i64,
        vector: &[f32],
    ) -> Result<bool>;

    /// Completed records by cosine similarity, descending.
    async fn search(
        &self,
        index: &str,
        vector: &[f32],
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<ScoredDocument>>;
}

/// Directed labeled multigraph of triples.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    /// Insert edges; duplicates of an existing triple are ignored.
    async fn add_edges(&self, edges: &[Triple]) -> Result<usize>;

    async fn remove_edge(&self, edge: &Triple) -> Result<bool>;

    /// Remove every edge the query selects.
    async fn remove_matching(&self, query: &TripleQuery) -> Result<usize>;

    async fn query(&self, query: &TripleQuery) -> Result<Vec<Triple>>;

    async fn add_edge(&self, edge: Triple) -> Result<bool> {
        Ok(self.add_edges(std::slice::from_ref(&edge)).await? > 0)
    }

    async fn out_edges(&self, node: &str) -> Result<Vec<Triple>> {
        self.query(&TripleQuery::new().subject(node)).await
    }

    async fn in_edges(&self, node: &str) -> Result<Vec<Triple>> {
        self.query(&TripleQuery::new().object(node)).await
    }

    async fn all_triples(&self) -> Result<Vec<Triple>> {
        self.query(&TripleQuery::new()).await
    }
}

/// Composable edge selector. Empty lists mean "any".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TripleQuery {
    pub subjects: Vec<String>,
    pub predicates: Vec<String>,
    pub objects: Vec<String>,
    pub exclude_predicates: Vec<String>,
    /// Edge has this node as subject or object.
    pub touching: Option<String>,
    /// Subject or object contains this substring.
    pub node_contains: Option<String>,
    /// Compare node names without regard to case.
    pub ignore_case: bool,
    pub limit: Option<usize>,
}

impl TripleQuery {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subjects.push(subject.into());
        self
    }

    #[must_use]
    pub fn subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subjects.extend(subjects.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicates.push(predicate.into());
        self
    }

    #[must_use]
    pub fn object(mut self, object: impl Into<String>) -> Self {
        self.objects.push(object.into());
        self
    }

    #[must_use]
    pub fn exclude_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.exclude_predicates.push(predicate.into());
        self
    }

    #[must_use]
    pub fn touching(mut self, node: impl Into<String>) -> Self {
        self.touching = Some(node.into());
        self
    }

    #[must_use]
    pub fn node_contains(mut self, needle: impl Into<String>) -> Self {
        self.node_contains = Some(needle.into());
        self
    }

    #[must_use]
    pub fn ignore_case(mut self) -> Self {
        self.ignore_case = true;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triple_query_builder_composes() {
        let q = TripleQuery::new()
            .subjects(["a", "b"])
            .predicate("KNOWS")
            .exclude_predicate("APPEARS_IN")
            .ignore_case()
            .limit(3);
        assert_eq!(q.subjects, vec!["a", "b"]);
        assert_eq!(q.predicates, vec!["KNOWS"]);
        assert_eq!(q.exclude_predicates, vec!["APPEARS_IN"]);
        assert!(q.ignore_case);
        assert_eq!(q.limit, Some(3));
        assert!(q.objects.is_empty());
    }
}
