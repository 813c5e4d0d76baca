//! Background embedding of pending records.
//!
//! Lifecycle per record: `pending -> processing -> completed | failed`.
//! Claiming and finishing are conditional updates keyed on status and
//! revision, so overlapping sweeps never embed the same revision twice and a
//! record re-upserted mid-flight keeps its fresh `pending` status.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rate_limit::RateLimiter;
use crate::config::EmbeddingConfig;
use crate::db::models::{Document, EmbeddingStatus};
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::storage::{DocumentStore, VectorIndex};

/// A vector index and the embedder that feeds it.
#[derive(Clone)]
pub struct RegisteredIndex {
    pub identifier: String,
    pub embedder: Arc<dyn Embedder>,
}

/// Outcome counts of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Records this sweep moved to `processing`.
    pub claimed: usize,
    /// Records another sweep had already claimed or that changed meanwhile.
    pub skipped: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Stateless sweep logic shared by the periodic worker and manual triggers.
#[derive(Clone)]
pub struct EmbeddingProcessor {
    documents: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorIndex>,
    indexes: Arc<Vec<RegisteredIndex>>,
    limiter: Arc<RateLimiter>,
    batch_size: usize,
    call_timeout: Duration,
    min_chunk_length: usize,
}

impl EmbeddingProcessor {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorIndex>,
        indexes: Vec<RegisteredIndex>,
        limiter: Arc<RateLimiter>,
        config: &EmbeddingConfig,
    ) -> Self {
        Self {
            documents,
            vectors,
            indexes: Arc::new(indexes),
            limiter,
            batch_size: config.batch_size.max(1),
            call_timeout: config.call_timeout(),
            min_chunk_length: config.min_chunk_length,
        }
    }

    /// Claim and embed up to one batch of pending records, one record at a
    /// time. Stops early once `cancel` fires.
    pub async fn sweep(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        let batch = self.documents.pending(self.batch_size).await?;
        let mut report = SweepReport::default();

        for doc in batch {
            if cancel.is_cancelled() {
                debug!("Sweep cancelled, leaving remaining records pending");
                break;
            }
            let id = doc.id.clone();
            match self.process(doc).await {
                Ok(None) => report.skipped += 1,
                Ok(Some(status)) => {
                    report.claimed += 1;
                    match status {
                        EmbeddingStatus::Completed => report.completed += 1,
                        _ => report.failed += 1,
                    }
                }
                Err(e) => warn!("Embedding bookkeeping failed for {id}: {e}"),
            }
        }

        Ok(report)
    }

    /// Returns the final status, or `None` when the record was not claimed.
    async fn process(&self, doc: Document) -> Result<Option<EmbeddingStatus>> {
        if !self.documents.claim(&doc.id, doc.revision).await? {
            debug!("Record {} already claimed, skipping", doc.id);
            return Ok(None);
        }

        let mut status = if doc.chunk_length <= self.min_chunk_length {
            EmbeddingStatus::Completed
        } else {
            let outcomes = join_all(self.indexes.iter().map(|index| self.embed_into(index, &doc))).await;
            let mut all_ok = !outcomes.is_empty();
            for (index, outcome) in self.indexes.iter().zip(outcomes) {
                if let Err(e) = outcome {
                    warn!(
                        "Embedding {} into index {} failed: {e}",
                        doc.id, index.identifier
                    );
                    all_ok = false;
                }
            }
            if all_ok {
                EmbeddingStatus::Completed
            } else {
                EmbeddingStatus::Failed
            }
        };

        let finished = match self.documents.finish(&doc.id, doc.revision, status).await {
            Ok(finished) => finished,
            Err(e) => {
                // Never leave a claim behind: fall back to `failed`.
                warn!("Recording {status} for {} failed, marking it failed: {e}", doc.id);
                status = EmbeddingStatus::Failed;
                self.documents
                    .finish(&doc.id, doc.revision, EmbeddingStatus::Failed)
                    .await?
            }
        };
        if !finished {
            debug!(
                "Record {} changed while embedding, result discarded",
                doc.id
            );
        }
        Ok(Some(status))
    }

    async fn embed_into(&self, index: &RegisteredIndex, doc: &Document) -> Result<()> {
        self.limiter.acquire().await;
        let vector = tokio::time::timeout(self.call_timeout, index.embedder.embed(&doc.content))
            .await
            .map_err(|_| {
                RagError::Timeout(format!(
                    "embedding call exceeded {:?}",
                    self.call_timeout
                ))
            })??;
        let expected = index.embedder.dimensions();
        if expected > 0 && vector.len() != expected {
            return Err(crate::embedder::EmbedderError::DimensionMismatch {
                expected,
                actual: vector.len(),
            }
            .into());
        }
        self.vectors
            .store_vector(&index.identifier, &doc.id, doc.revision, &vector)
            .await?;
        Ok(())
    }
}

/// The recurring sweep for one collection.
pub struct EmbeddingWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl EmbeddingWorker {
    /// Start sweeping every `interval`, the first sweep one interval from now.
    pub fn spawn(processor: EmbeddingProcessor, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            info!("Embedding worker started (interval {:?})", interval);
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // A started sweep always runs to completion.
                        match processor.sweep(&token).await {
                            Ok(report) if report.claimed > 0 => debug!(
                                "Embedding sweep: {} completed, {} failed, {} skipped",
                                report.completed, report.failed, report.skipped
                            ),
                            Ok(_) => {}
                            Err(e) => warn!("Embedding sweep failed: {e}"),
                        }
                    }
                }
            }
            info!("Embedding worker stopped");
        });

        Self { cancel, handle }
    }

    /// Signal cancellation and wait for the in-flight sweep to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Embedding worker ended abnormally: {e}");
        }
    }
}
