//! The RAG facade: storage lifecycle, ingestion and query entry points.
//!
//! ```no_run
//! # async fn demo() -> graphrag::Result<()> {
//! use std::sync::Arc;
//! use graphrag::{Config, QueryMode, QueryParam, Rag};
//! use graphrag::embedder::mock::MockEmbedder;
//!
//! let rag = Rag::builder(Config::in_memory())
//!     .embedder(Arc::new(MockEmbedder::default()))
//!     .build()?;
//! rag.initialize_storages().await?;
//! rag.insert("The capital of France is Paris.").await?;
//! let hits = rag.retrieve("Paris", &QueryParam::new(QueryMode::Fulltext)).await?;
//! rag.finalize_storages().await?;
//! # Ok(()) }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::db::models::{APPEARS_IN, Document, EmbeddingStatus, NewDocument};
use crate::db::{Db, SqliteStore};
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::llm::Llm;
use crate::prompt::{NO_RELEVANT_INFORMATION, rag_answer_prompt};
use crate::retrieval::graph::{export_graph, search_graph, subgraph};
use crate::retrieval::{GraphData, QueryParam, Retriever, SearchResult};
use crate::storage::{DocumentStore, FulltextIndex, GraphStore, TripleQuery, VectorIndex};
use crate::worker::{
    EmbeddingProcessor, EmbeddingWorker, ExtractionPool, RateLimiter, RegisteredIndex, SweepReport,
};

/// Identifier used by [`RagBuilder::embedder`].
pub const DEFAULT_VECTOR_INDEX: &str = "embedding";

struct Backend {
    documents: Arc<dyn DocumentStore>,
    fulltext: Arc<dyn FulltextIndex>,
    vectors: Arc<dyn VectorIndex>,
    graph: Arc<dyn GraphStore>,
}

/// Collects ports before any storage is touched.
pub struct RagBuilder {
    config: Config,
    backend: Option<Backend>,
    indexes: Vec<RegisteredIndex>,
    llm: Option<Arc<dyn Llm>>,
}

impl RagBuilder {
    /// Use `backend` for all four storage ports instead of opening the
    /// SQLite store named in the config.
    #[must_use]
    pub fn with_backend<B>(mut self, backend: Arc<B>) -> Self
    where
        B: DocumentStore + FulltextIndex + VectorIndex + GraphStore + 'static,
    {
        self.backend = Some(Backend {
            documents: backend.clone(),
            fulltext: backend.clone(),
            vectors: backend.clone(),
            graph: backend,
        });
        self
    }

    /// Register the primary vector index under [`DEFAULT_VECTOR_INDEX`].
    #[must_use]
    pub fn embedder(self, embedder: Arc<dyn Embedder>) -> Self {
        self.vector_index(DEFAULT_VECTOR_INDEX, embedder)
    }

    /// Register a named vector index. The first one registered is the index
    /// queries run against; every index is filled by the embedding worker.
    #[must_use]
    pub fn vector_index(mut self, identifier: impl Into<String>, embedder: Arc<dyn Embedder>) -> Self {
        self.indexes.push(RegisteredIndex {
            identifier: identifier.into(),
            embedder,
        });
        self
    }

    #[must_use]
    pub fn llm(mut self, llm: Arc<dyn Llm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn build(self) -> Result<Rag> {
        self.config
            .validate()
            .map_err(|e| RagError::Config(format!("{e:#}")))?;
        for index in &self.indexes {
            crate::db::validate_identifier(&index.identifier)?;
        }

        let backend = match self.backend {
            Some(backend) => backend,
            None => {
                let db = Db::open_path(&self.config.db_path, self.config.pool_size)?;
                let store = Arc::new(
                    SqliteStore::new(db, &self.config.collection)?
                        .with_min_embeddable_length(self.config.embedding.min_chunk_length),
                );
                Backend {
                    documents: store.clone(),
                    fulltext: store.clone(),
                    vectors: store.clone(),
                    graph: store,
                }
            }
        };

        let mut retriever = Retriever::new(
            backend.documents.clone(),
            backend.fulltext.clone(),
            backend.vectors.clone(),
            self.config.retrieval.clone(),
        )
        .with_graph(backend.graph.clone());
        if let Some(primary) = self.indexes.first() {
            retriever =
                retriever.with_primary_index(primary.clone(), self.config.embedding.call_timeout());
        }
        if let Some(llm) = &self.llm {
            retriever = retriever.with_llm(llm.clone());
        }

        let limiter = Arc::new(RateLimiter::per_second(
            self.config.embedding.calls_per_second,
        ));
        debug!(
            "Embedding calls limited to one per {:?} across {} index(es)",
            limiter.interval(),
            self.indexes.len()
        );
        let processor = EmbeddingProcessor::new(
            backend.documents.clone(),
            backend.vectors.clone(),
            self.indexes.clone(),
            limiter,
            &self.config.embedding,
        );

        let extraction = match &self.llm {
            Some(llm) if self.config.extraction.enabled => Some(ExtractionPool::new(
                llm.clone(),
                backend.graph.clone(),
                &self.config.extraction,
            )),
            _ => None,
        };

        Ok(Rag {
            config: self.config,
            documents: backend.documents,
            graph: backend.graph,
            indexes: self.indexes,
            llm: self.llm,
            retriever,
            processor,
            extraction,
            worker: Mutex::new(None),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

/// A collection with its background workers.
pub struct Rag {
    config: Config,
    documents: Arc<dyn DocumentStore>,
    graph: Arc<dyn GraphStore>,
    indexes: Vec<RegisteredIndex>,
    llm: Option<Arc<dyn Llm>>,
    retriever: Retriever,
    processor: EmbeddingProcessor,
    extraction: Option<ExtractionPool>,
    worker: Mutex<Option<EmbeddingWorker>>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl Rag {
    pub fn builder(config: Config) -> RagBuilder {
        RagBuilder {
            config,
            backend: None,
            indexes: Vec::new(),
            llm: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create tables, indexes and vector columns, then start the embedding
    /// worker. Safe to call repeatedly and concurrently.
    pub async fn initialize_storages(&self) -> Result<()> {
        self.ensure_open()?;
        // Held for the whole setup so concurrent first calls run it once at a time.
        let mut worker = self.worker.lock().await;
        self.ensure_open()?;

        let identifiers: Vec<String> = self.indexes.iter().map(|i| i.identifier.clone()).collect();
        self.documents.initialize(&identifiers).await?;
        self.graph.initialize().await?;
        if !self.initialized.load(Ordering::SeqCst) {
            // No sweep of ours has run yet, so any claim is left over from a
            // previous process.
            self.documents.release_claims().await?;
        }
        self.initialized.store(true, Ordering::SeqCst);

        if worker.is_none() && !self.indexes.is_empty() {
            *worker = Some(EmbeddingWorker::spawn(
                self.processor.clone(),
                self.config.embedding.interval(),
            ));
        }
        info!(
            "Storages ready for collection {} ({} vector index(es))",
            self.config.collection,
            self.indexes.len()
        );
        Ok(())
    }

    /// Store one text and return its generated id.
    pub async fn insert(&self, text: impl Into<String>) -> Result<String> {
        let mut ids = self.insert_batch(vec![NewDocument::new(text)]).await?;
        ids.pop()
            .ok_or_else(|| RagError::Parse("upsert returned no record".to_string()))
    }

    /// Upsert records and queue their graph extraction. Only storage errors
    /// are reported; embedding and extraction happen in the background.
    pub async fn insert_batch(&self, docs: Vec<NewDocument>) -> Result<Vec<String>> {
        self.ready().await?;
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let stored = self.documents.upsert(docs).await?;
        if let Some(pool) = &self.extraction {
            for doc in &stored {
                pool.submit(doc.id.clone(), doc.content.clone());
            }
        }
        debug!("Inserted {} record(s)", stored.len());
        Ok(stored.into_iter().map(|d| d.id).collect())
    }

    /// Retrieve, then answer with the LLM (or return the numbered context
    /// when no LLM is configured).
    pub async fn query(&self, text: &str, param: &QueryParam) -> Result<String> {
        let results = self.retrieve(text, param).await?;
        if results.is_empty() {
            return Ok(NO_RELEVANT_INFORMATION.to_string());
        }

        let context = numbered_context(&results);
        let Some(llm) = &self.llm else {
            return Ok(context);
        };
        let deadline = self.config.retrieval.llm_timeout();
        let answer = tokio::time::timeout(deadline, llm.complete(&rag_answer_prompt(&context, text)))
            .await
            .map_err(|_| RagError::Timeout(format!("answer generation exceeded {deadline:?}")))??;
        Ok(answer)
    }

    pub async fn retrieve(&self, text: &str, param: &QueryParam) -> Result<Vec<SearchResult>> {
        self.ready().await?;
        self.retriever.retrieve(text, param).await
    }

    /// Neighbourhood of `node_id` up to `depth` hops (`<= 0` means 1).
    pub async fn get_subgraph(&self, node_id: &str, depth: i32) -> Result<GraphData> {
        self.ready().await?;
        subgraph(self.graph.as_ref(), node_id, depth).await
    }

    /// Depth-1 neighbourhoods of every entity whose name contains `text`.
    pub async fn search_graph(&self, text: &str) -> Result<GraphData> {
        self.ready().await?;
        search_graph(self.graph.as_ref(), text).await
    }

    pub async fn export_graph(&self) -> Result<GraphData> {
        self.ready().await?;
        export_graph(self.graph.as_ref()).await
    }

    pub async fn list_documents(&self, offset: usize, limit: usize) -> Result<Vec<Document>> {
        self.ready().await?;
        self.documents.list(offset, limit).await
    }

    /// `RagError::NotFound` when the id is unknown.
    pub async fn get_document(&self, id: &str) -> Result<Document> {
        self.ready().await?;
        self.documents.get(id).await
    }

    /// Remove a record and the `APPEARS_IN` edges pointing at it.
    pub async fn delete_document(&self, id: &str) -> Result<()> {
        self.ready().await?;
        self.documents.delete(id).await?;
        let unlinked = self
            .graph
            .remove_matching(&TripleQuery::new().predicate(APPEARS_IN).object(id))
            .await?;
        debug!("Deleted {id} and {unlinked} entity link(s)");
        Ok(())
    }

    pub async fn embedding_status(&self, id: &str) -> Result<EmbeddingStatus> {
        Ok(self.get_document(id).await?.embedding_status)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.ready().await?;
        self.documents.count_by_status(EmbeddingStatus::Pending).await
    }

    /// Run one embedding sweep now. Overlapping with the worker's own sweep
    /// is safe; each record is claimed at most once.
    pub async fn process_pending_embeddings(&self) -> Result<SweepReport> {
        self.ready().await?;
        if self.indexes.is_empty() {
            return Ok(SweepReport::default());
        }
        self.processor.sweep(&CancellationToken::new()).await
    }

    /// Block until every queued extraction has finished.
    pub async fn wait(&self) {
        if let Some(pool) = &self.extraction {
            pool.wait().await;
        }
    }

    /// Stop the embedding worker after its current sweep and drain running
    /// extractions. Later calls fail with `RagError::Closed`.
    pub async fn finalize_storages(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(worker) = self.worker.lock().await.take() {
            worker.shutdown().await;
        }
        if let Some(pool) = &self.extraction {
            pool.shutdown().await;
        }
        info!("Storages for collection {} finalized", self.config.collection);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RagError::Closed);
        }
        Ok(())
    }

    async fn ready(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.initialized.load(Ordering::SeqCst) {
            self.initialize_storages().await?;
        }
        Ok(())
    }
}

/// `[1] first\n[2] second ...`
fn numbered_context(results: &[SearchResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("[{}] {}", i + 1, r.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Triple;
    use crate::embedder::mock::MockEmbedder;
    use crate::llm::mock::MockLlm;
    use crate::retrieval::QueryMode;

    fn extraction_answer(prompt: &str) -> String {
        if prompt.contains("RxDB") {
            r#"{"entities":[{"name":"RxDB","type":"TECHNOLOGY"},{"name":"JavaScript"}],
                "relationships":[{"source":"RxDB","target":"JavaScript","relation":"BUILT_FOR"}]}"#
                .to_string()
        } else {
            r#"{"entities":[]}"#.to_string()
        }
    }

    #[tokio::test]
    async fn test_operations_initialize_lazily() {
        let rag = Rag::builder(Config::in_memory()).build().unwrap();
        let id = rag.insert("Lazily created tables still work.").await.unwrap();
        assert_eq!(rag.get_document(&id).await.unwrap().revision, 1);

        // No embedder: nothing to embed, records stay pending.
        assert_eq!(rag.process_pending_embeddings().await.unwrap(), SweepReport::default());
        assert_eq!(rag.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_formats_context_without_llm() {
        let rag = Rag::builder(Config::in_memory()).build().unwrap();
        rag.initialize_storages().await.unwrap();
        rag.insert_batch(vec![
            NewDocument::new("Rust has ownership.").with_id("a"),
            NewDocument::new("Rust has borrowing.").with_id("b"),
        ])
        .await
        .unwrap();

        let answer = rag
            .query("ownership", &QueryParam::new(QueryMode::Fulltext))
            .await
            .unwrap();
        assert_eq!(answer, "[1] Rust has ownership.");

        let answer = rag
            .query("nonexistent", &QueryParam::default())
            .await
            .unwrap();
        assert_eq!(answer, NO_RELEVANT_INFORMATION);
    }

    #[tokio::test]
    async fn test_query_answers_with_llm() {
        let llm = Arc::new(MockLlm::from_fn(|prompt| {
            if prompt.contains("-Context-") {
                Ok(format!("ANSWER: {}", prompt.contains("[1] Rust has ownership.")))
            } else {
                Ok(r#"{"entities":[]}"#.to_string())
            }
        }));
        let rag = Rag::builder(Config::in_memory()).llm(llm).build().unwrap();
        rag.insert("Rust has ownership.").await.unwrap();

        let answer = rag
            .query("ownership", &QueryParam::new(QueryMode::Fulltext))
            .await
            .unwrap();
        assert_eq!(answer, "ANSWER: true");
        rag.finalize_storages().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_cleans_entity_links() {
        let rag = Rag::builder(Config::in_memory())
            .llm(Arc::new(MockLlm::from_fn(|p| Ok(extraction_answer(p)))))
            .build()
            .unwrap();
        let id = rag
            .insert("RxDB is a database built for JavaScript.")
            .await
            .unwrap();
        rag.wait().await;

        let links = rag
            .graph
            .query(&TripleQuery::new().predicate(APPEARS_IN).object(id.as_str()))
            .await
            .unwrap();
        assert_eq!(links.len(), 2);

        rag.delete_document(&id).await.unwrap();
        assert!(rag.get_document(&id).await.unwrap_err().is_not_found());
        assert!(rag.delete_document(&id).await.unwrap_err().is_not_found());

        let remaining = rag.graph.all_triples().await.unwrap();
        assert!(remaining.iter().all(|t| t.predicate != APPEARS_IN));
        assert!(remaining.contains(&Triple::new("RxDB", "BUILT_FOR", "JavaScript")));

        let graph = rag.export_graph().await.unwrap();
        assert_eq!(graph.node("RxDB").unwrap().entity_type.as_deref(), Some("TECHNOLOGY"));
    }

    #[tokio::test]
    async fn test_extraction_can_be_disabled() {
        let mut config = Config::in_memory();
        config.extraction.enabled = false;
        let llm = Arc::new(MockLlm::from_fn(|p| Ok(extraction_answer(p))));
        let rag = Rag::builder(config).llm(llm.clone()).build().unwrap();

        rag.insert("RxDB is a database built for JavaScript.")
            .await
            .unwrap();
        rag.wait().await;
        assert_eq!(llm.calls(), 0);
        assert!(rag.export_graph().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_closes_facade() {
        let rag = Rag::builder(Config::in_memory())
            .embedder(Arc::new(MockEmbedder::new(32)))
            .build()
            .unwrap();
        rag.initialize_storages().await.unwrap();
        rag.finalize_storages().await.unwrap();
        rag.finalize_storages().await.unwrap();

        assert!(matches!(rag.insert("too late").await, Err(RagError::Closed)));
        assert!(matches!(
            rag.initialize_storages().await,
            Err(RagError::Closed)
        ));
        assert!(matches!(
            rag.retrieve("x", &QueryParam::default()).await,
            Err(RagError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_min_chunk_length_applies_at_insert_and_sweep() {
        let mut config = Config::in_memory();
        config.embedding.min_chunk_length = 3;
        let embedder = Arc::new(MockEmbedder::new(16));
        let rag = Rag::builder(config).embedder(embedder.clone()).build().unwrap();

        let note = rag.insert("tiny note").await.unwrap();
        let abc = rag.insert("abc").await.unwrap();
        assert_eq!(rag.embedding_status(&note).await.unwrap(), EmbeddingStatus::Pending);
        assert_eq!(rag.embedding_status(&abc).await.unwrap(), EmbeddingStatus::Completed);

        let report = rag.process_pending_embeddings().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(embedder.calls(), 1);
        rag.finalize_storages().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_initialize_releases_stale_claims() {
        let store = Arc::new(SqliteStore::new(Db::open_in_memory().unwrap(), "docs").unwrap());
        DocumentStore::initialize(&*store, &[]).await.unwrap();
        let doc = store
            .upsert(vec![NewDocument::new("claimed by a process that died").with_id("c")])
            .await
            .unwrap()
            .remove(0);
        assert!(store.claim("c", doc.revision).await.unwrap());

        let rag = Rag::builder(Config::in_memory())
            .with_backend(store.clone())
            .build()
            .unwrap();
        rag.initialize_storages().await.unwrap();
        assert_eq!(rag.embedding_status("c").await.unwrap(), EmbeddingStatus::Pending);

        // Later calls leave live claims alone.
        assert!(store.claim("c", doc.revision).await.unwrap());
        rag.initialize_storages().await.unwrap();
        assert_eq!(
            rag.embedding_status("c").await.unwrap(),
            EmbeddingStatus::Processing
        );
    }

    #[test]
    fn test_build_rejects_invalid_setup() {
        let mut config = Config::in_memory();
        config.collection = "drop table".to_string();
        assert!(matches!(
            Rag::builder(config).build(),
            Err(RagError::Config(_))
        ));

        let bad_index = Rag::builder(Config::in_memory())
            .vector_index("not valid", Arc::new(MockEmbedder::new(8)))
            .build();
        assert!(bad_index.is_err());
    }
}
