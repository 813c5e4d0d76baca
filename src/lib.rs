//! # graphrag: Graph-augmented RAG engine
//!
//! Ingests text, derives full-text tokens, vector embeddings and an
//! entity/relationship graph in the background, and answers queries with
//! several retrieval strategies over SQLite + sqlite-vec.
//!
//! ## Architecture
//!
//! - **[`config`]**: Configuration loading, validation, and defaults
//! - **[`db`]**: SQLite + sqlite-vec backend (records, FTS5, vectors, triples)
//! - **[`storage`]**: Capability traits the engine consumes
//! - **[`embedder`]** / **[`llm`]**: Model ports plus deterministic mocks
//! - **[`worker`]**: Embedding sweep, rate limiter, extraction pool
//! - **[`retrieval`]**: Vector, fulltext, graph, hybrid (RRF) and mix modes
//! - **[`rag`]**: The facade tying ingestion, workers and queries together

pub mod config;
pub mod db;
pub mod embedder;
pub mod error;
pub mod llm;
pub mod logging;
pub mod prompt;
pub mod rag;
pub mod retrieval;
pub mod storage;
pub mod text;
pub mod worker;

pub use config::Config;
pub use db::models::{Document, EmbeddingStatus, NewDocument, Triple};
pub use error::{RagError, Result};
pub use rag::{Rag, RagBuilder};
pub use retrieval::{GraphData, QueryMode, QueryParam, SearchResult};
