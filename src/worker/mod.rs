//! Background work: the recurring embedding sweep and the extraction pool.

pub mod embedding;
pub mod extraction;
pub mod rate_limit;

pub use embedding::{EmbeddingProcessor, EmbeddingWorker, RegisteredIndex, SweepReport};
pub use extraction::{ExtractionPool, extraction_edges};
pub use rate_limit::RateLimiter;
