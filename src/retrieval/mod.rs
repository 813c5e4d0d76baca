//! Query types and multi-mode retrieval.
//!
//! - **[`engine`]**: mode dispatch over the storage ports
//! - **[`fusion`]**: reciprocal rank fusion
//! - **[`graph`]**: subgraph expansion and graph export

pub mod engine;
pub mod fusion;
pub mod graph;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::models::{ScoredDocument, Triple};
use crate::storage::Filters;

pub use engine::Retriever;
pub use graph::{GraphData, GraphNode, GraphRelationship};

/// Retrieval strategy. Unknown names parse as [`QueryMode::Fulltext`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum QueryMode {
    Vector,
    #[default]
    Fulltext,
    Local,
    Graph,
    /// Served as [`QueryMode::Hybrid`]; there is no community detection.
    Global,
    Hybrid,
    /// Graph neighbourhoods of the query entities. With a vector index,
    /// entities missing from the graph are also matched against record
    /// embeddings; without one that expansion is skipped and only entities
    /// already in the graph contribute.
    Mix,
    Naive,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Vector => "vector",
            QueryMode::Fulltext => "fulltext",
            QueryMode::Local => "local",
            QueryMode::Graph => "graph",
            QueryMode::Global => "global",
            QueryMode::Hybrid => "hybrid",
            QueryMode::Mix => "mix",
            QueryMode::Naive => "naive",
        }
    }
}

impl From<&str> for QueryMode {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "vector" => QueryMode::Vector,
            "local" => QueryMode::Local,
            "graph" => QueryMode::Graph,
            "global" => QueryMode::Global,
            "hybrid" => QueryMode::Hybrid,
            "mix" => QueryMode::Mix,
            "naive" => QueryMode::Naive,
            _ => QueryMode::Fulltext,
        }
    }
}

impl From<String> for QueryMode {
    fn from(s: String) -> Self {
        QueryMode::from(s.as_str())
    }
}

impl From<QueryMode> for String {
    fn from(mode: QueryMode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a `retrieve`/`query` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryParam {
    #[serde(default)]
    pub mode: QueryMode,
    /// Zero means the configured default.
    #[serde(default)]
    pub limit: usize,
    /// Drop results scoring below this after ranking.
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub filters: Filters,
}

impl Default for QueryParam {
    fn default() -> Self {
        Self {
            mode: QueryMode::default(),
            limit: 5,
            threshold: None,
            filters: Map::new(),
        }
    }
}

impl QueryParam {
    pub fn new(mode: QueryMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }
}

/// One retrieved record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub content: String,
    pub score: f64,
    pub metadata: Map<String, Value>,
    /// Graph edges that caused the record to be included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recalled_triples: Option<Vec<Triple>>,
}

impl From<ScoredDocument> for SearchResult {
    fn from(scored: ScoredDocument) -> Self {
        Self {
            id: scored.document.id,
            content: scored.document.content,
            score: scored.score,
            metadata: scored.document.metadata,
            recalled_triples: None,
        }
    }
}
