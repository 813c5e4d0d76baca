use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Predicate linking an entity (subject) to the document id (object) it was
/// extracted from. Never part of user-facing graph output.
pub const APPEARS_IN: &str = "APPEARS_IN";
/// Attribute predicate: `entity -[TYPE]-> type`.
pub const TYPE: &str = "TYPE";
/// Attribute predicate: `entity -[DESCRIPTION]-> description`.
pub const DESCRIPTION: &str = "DESCRIPTION";

/// Keys owned by the record itself; stripped from caller metadata.
pub const RESERVED_METADATA_KEYS: [&str; 3] = ["id", "content", "_rev"];

/// Embedding lifecycle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Processing => "processing",
            EmbeddingStatus::Completed => "completed",
            EmbeddingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EmbeddingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EmbeddingStatus::Pending),
            "processing" => Ok(EmbeddingStatus::Processing),
            "completed" => Ok(EmbeddingStatus::Completed),
            "failed" => Ok(EmbeddingStatus::Failed),
            other => Err(format!("unknown embedding status: {other}")),
        }
    }
}

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub content_tokens: String,
    pub embedding_status: EmbeddingStatus,
    pub chunk_length: usize,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Whether every metadata selector in `filters` matches exactly. A `null`
    /// selector matches a missing key as well as an explicit `null`.
    pub fn matches_filters(&self, filters: &Map<String, Value>) -> bool {
        filters.iter().all(|(key, expected)| match expected {
            Value::Null => self.metadata.get(key).is_none_or(Value::is_null),
            _ => self.metadata.get(key) == Some(expected),
        })
    }
}

/// Input to an upsert. A missing `id` gets a generated one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewDocument {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NewDocument {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A record paired with a retrieval score.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f64,
}

/// A directed, labeled graph edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl Triple {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }

    /// Attribute edges describe a node rather than connect two entities.
    pub fn is_attribute(&self) -> bool {
        self.predicate == TYPE || self.predicate == DESCRIPTION
    }
}
