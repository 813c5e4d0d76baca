//! Entity and relationship extraction into the graph.
//!
//! One tracked task per inserted document; a counting semaphore bounds how
//! many hold an LLM call at once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::config::ExtractionConfig;
use crate::db::models::{APPEARS_IN, DESCRIPTION, TYPE, Triple};
use crate::error::{RagError, Result};
use crate::llm::Llm;
use crate::prompt::{Extraction, entity_extraction_prompt, parse_extraction};
use crate::storage::GraphStore;

pub struct ExtractionPool {
    llm: Arc<dyn Llm>,
    graph: Arc<dyn GraphStore>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    call_timeout: Duration,
    record_attributes: bool,
}

impl ExtractionPool {
    pub fn new(llm: Arc<dyn Llm>, graph: Arc<dyn GraphStore>, config: &ExtractionConfig) -> Self {
        Self {
            llm,
            graph,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            call_timeout: config.call_timeout(),
            record_attributes: config.record_entity_attributes,
        }
    }

    /// Queue extraction for one document. Returns immediately.
    pub fn submit(&self, doc_id: String, text: String) {
        let llm = self.llm.clone();
        let graph = self.graph.clone();
        let permits = self.permits.clone();
        let cancel = self.cancel.clone();
        let call_timeout = self.call_timeout;
        let record_attributes = self.record_attributes;

        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            if cancel.is_cancelled() {
                debug!("Extraction for {doc_id} skipped after shutdown");
                return;
            }

            let outcome = extract(llm.as_ref(), &text, call_timeout).await;
            let extraction = match outcome {
                Ok(extraction) => extraction,
                Err(e) => {
                    warn!("Extraction for {doc_id} failed: {e}");
                    return;
                }
            };

            let edges = extraction_edges(&doc_id, &extraction, record_attributes);
            match graph.add_edges(&edges).await {
                Ok(added) => debug!(
                    "Extracted {} entities, {} relationships from {doc_id} ({added} new edges)",
                    extraction.entities.len(),
                    extraction.relationships.len()
                ),
                Err(e) => warn!("Writing extracted edges for {doc_id} failed: {e}"),
            }
        });
    }

    /// Block until every submitted task has finished.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop admitting queued tasks and drain the ones holding a permit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.wait().await;
    }
}

async fn extract(llm: &dyn Llm, text: &str, call_timeout: Duration) -> Result<Extraction> {
    let prompt = entity_extraction_prompt(text);
    let raw = tokio::time::timeout(call_timeout, llm.complete(&prompt))
        .await
        .map_err(|_| RagError::Timeout(format!("extraction call exceeded {call_timeout:?}")))??;
    parse_extraction(&raw)
}

/// Graph edges for one extraction. Nameless entities and incomplete
/// relationships are dropped.
pub fn extraction_edges(doc_id: &str, extraction: &Extraction, record_attributes: bool) -> Vec<Triple> {
    let mut edges = Vec::new();

    for entity in &extraction.entities {
        let name = entity.name.trim();
        if name.is_empty() {
            continue;
        }
        edges.push(Triple::new(name, APPEARS_IN, doc_id));
        if record_attributes {
            let entity_type = entity.entity_type.trim();
            if !entity_type.is_empty() {
                edges.push(Triple::new(name, TYPE, entity_type));
            }
            let description = entity.description.trim();
            if !description.is_empty() {
                edges.push(Triple::new(name, DESCRIPTION, description));
            }
        }
    }

    for rel in &extraction.relationships {
        let (source, relation, target) = (rel.source.trim(), rel.relation.trim(), rel.target.trim());
        if source.is_empty() || relation.is_empty() || target.is_empty() {
            continue;
        }
        edges.push(Triple::new(source, relation, target));
    }

    edges
}
