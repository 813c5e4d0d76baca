//! Mode dispatch over the storage ports.
//!
//! Vector and Fulltext are single index lookups. Hybrid fuses both with
//! RRF. Local/Graph and Mix ask the LLM which entities the query is about
//! and walk the graph from there, falling back to Fulltext whenever that
//! step fails.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tracing::{debug, warn};

use super::fusion::reciprocal_rank_fusion;
use super::graph::{GraphData, subgraph};
use super::{QueryMode, QueryParam, SearchResult};
use crate::config::RetrievalConfig;
use crate::db::models::{APPEARS_IN, DESCRIPTION, ScoredDocument, TYPE, Triple};
use crate::error::{RagError, Result};
use crate::llm::Llm;
use crate::prompt::{parse_query_entities, query_entities_prompt};
use crate::storage::{DocumentStore, Filters, FulltextIndex, GraphStore, TripleQuery, VectorIndex};
use crate::worker::RegisteredIndex;

/// Stateless query executor; cheap to clone.
#[derive(Clone)]
pub struct Retriever {
    documents: Arc<dyn DocumentStore>,
    fulltext: Arc<dyn FulltextIndex>,
    vectors: Arc<dyn VectorIndex>,
    graph: Option<Arc<dyn GraphStore>>,
    primary: Option<RegisteredIndex>,
    llm: Option<Arc<dyn Llm>>,
    config: RetrievalConfig,
    embed_timeout: Duration,
}

impl Retriever {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        fulltext: Arc<dyn FulltextIndex>,
        vectors: Arc<dyn VectorIndex>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            documents,
            fulltext,
            vectors,
            graph: None,
            primary: None,
            llm: None,
            config,
            embed_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_graph(mut self, graph: Arc<dyn GraphStore>) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Index used by Vector, Hybrid and Mix, with the deadline for
    /// embedding the query text.
    #[must_use]
    pub fn with_primary_index(mut self, index: RegisteredIndex, embed_timeout: Duration) -> Self {
        self.primary = Some(index);
        self.embed_timeout = embed_timeout;
        self
    }

    #[must_use]
    pub fn with_llm(mut self, llm: Arc<dyn Llm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Run `query` in the requested mode. A zero limit means the configured
    /// default; the threshold is applied after ranking.
    pub async fn retrieve(&self, query: &str, param: &QueryParam) -> Result<Vec<SearchResult>> {
        let limit = if param.limit == 0 {
            self.config.default_limit
        } else {
            param.limit
        };
        let filters = &param.filters;

        let mut results = match param.mode {
            QueryMode::Vector => into_results(self.vector(query, limit, filters).await?),
            QueryMode::Fulltext => into_results(self.fulltext(query, limit, filters).await?),
            QueryMode::Naive => into_results(self.fulltext.scan(query, limit, filters).await?),
            QueryMode::Hybrid | QueryMode::Global => {
                into_results(self.hybrid(query, limit, filters).await?)
            }
            QueryMode::Local | QueryMode::Graph => self.local(query, limit, filters).await?,
            QueryMode::Mix => self.mix(query, limit, filters).await?,
        };

        if let Some(threshold) = param.threshold {
            results.retain(|r| r.score >= threshold);
        }
        debug!(
            "Retrieved {} result(s) for {:?} in {} mode",
            results.len(),
            query,
            param.mode
        );
        Ok(results)
    }

    async fn fulltext(
        &self,
        query: &str,
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<ScoredDocument>> {
        self.fulltext.search(query, limit, filters).await
    }

    async fn vector(
        &self,
        query: &str,
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<ScoredDocument>> {
        let index = self.primary_index()?;
        let vector = tokio::time::timeout(self.embed_timeout, index.embedder.embed(query))
            .await
            .map_err(|_| {
                RagError::Timeout(format!(
                    "query embedding exceeded {:?}",
                    self.embed_timeout
                ))
            })??;
        self.vectors
            .search(&index.identifier, &vector, limit, filters)
            .await
    }

    async fn hybrid(
        &self,
        query: &str,
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<ScoredDocument>> {
        self.primary_index()?;
        let candidates = limit.saturating_mul(2);
        let (fulltext, vector) = tokio::join!(
            self.fulltext(query, candidates, filters),
            self.vector(query, candidates, filters)
        );
        let fulltext = fulltext?;
        let vector = match vector {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Vector half of hybrid search failed, using full-text only: {e}");
                Vec::new()
            }
        };

        if fulltext.is_empty() && vector.is_empty() {
            return self.fulltext(query, limit, filters).await;
        }
        Ok(reciprocal_rank_fusion(
            vec![fulltext, vector],
            self.config.rrf_k,
            limit,
        ))
    }

    /// Documents linked to the query's entities and to their one-hop
    /// neighbours, all scored 1.0.
    async fn local(&self, query: &str, limit: usize, filters: &Filters) -> Result<Vec<SearchResult>> {
        let (llm, graph) = self.graph_ports(QueryMode::Local)?;
        let Some(entities) = self.entities_or_fallback(llm, query).await else {
            return Ok(into_results(self.fulltext(query, limit, filters).await?));
        };

        let per_entity = try_join_all(
            entities
                .iter()
                .map(|entity| linked_documents(graph.as_ref(), entity)),
        )
        .await?;

        let mut evidence = Evidence::default();
        for (doc_id, triples) in per_entity.into_iter().flatten() {
            evidence.add(doc_id, triples);
        }

        let docs = self
            .documents
            .find_by_ids(&evidence.top_ids(limit.saturating_mul(2)))
            .await?;
        Ok(docs
            .into_iter()
            .filter(|doc| doc.matches_filters(filters))
            .take(limit)
            .map(|doc| {
                let recalled = evidence.triples.remove(&doc.id);
                SearchResult {
                    id: doc.id,
                    content: doc.content,
                    score: 1.0,
                    metadata: doc.metadata,
                    recalled_triples: recalled,
                }
            })
            .collect())
    }

    /// Local's entity lookup, plus vector-assisted discovery for entities
    /// with no relation in the graph; the union of every discovered
    /// entity's subgraph decides which documents come back.
    async fn mix(&self, query: &str, limit: usize, filters: &Filters) -> Result<Vec<SearchResult>> {
        let (llm, graph) = self.graph_ports(QueryMode::Mix)?;
        let Some(entities) = self.entities_or_fallback(llm, query).await else {
            return Ok(into_results(self.fulltext(query, limit, filters).await?));
        };

        let found = try_join_all(
            entities
                .iter()
                .map(|entity| self.discover(graph.as_ref(), entity, limit, filters)),
        )
        .await?;
        let mut seen = HashSet::new();
        let discovered: Vec<String> = found
            .into_iter()
            .flatten()
            .filter(|name| seen.insert(name.clone()))
            .collect();
        if discovered.is_empty() {
            return Ok(Vec::new());
        }

        let depth = i32::try_from(self.config.mix_depth).unwrap_or(i32::MAX);
        let graphs = try_join_all(
            discovered
                .iter()
                .map(|name| subgraph(graph.as_ref(), name, depth)),
        )
        .await?;
        let mut union = GraphData::default();
        for g in graphs {
            union.merge(g);
        }

        let names: Vec<&str> = union.nodes.iter().map(|n| n.id.as_str()).collect();
        let links = graph
            .query(&TripleQuery::new().subjects(names).predicate(APPEARS_IN))
            .await?;

        // Documents mentioning more of the subgraph rank higher.
        let mut order: Vec<String> = Vec::new();
        let mut mentions: HashMap<String, Vec<String>> = HashMap::new();
        for link in links {
            let entry = mentions.entry(link.object.clone()).or_insert_with(|| {
                order.push(link.object.clone());
                Vec::new()
            });
            entry.push(link.subject);
        }
        order.sort_by_key(|id| std::cmp::Reverse(mentions.get(id).map_or(0, Vec::len)));
        order.truncate(limit.saturating_mul(2));

        let docs = self.documents.find_by_ids(&order).await?;
        let mut results: Vec<SearchResult> = docs
            .into_iter()
            .filter(|doc| doc.matches_filters(filters))
            .take(limit)
            .map(|doc| {
                let entities = mentions.remove(&doc.id).unwrap_or_default();
                let mut recalled: Vec<Triple> = union
                    .relationships
                    .iter()
                    .filter(|r| entities.contains(&r.source) || entities.contains(&r.target))
                    .map(Triple::from)
                    .collect();
                if recalled.is_empty() {
                    recalled = entities
                        .iter()
                        .map(|e| Triple::new(e, APPEARS_IN, &doc.id))
                        .collect();
                }
                SearchResult {
                    id: doc.id,
                    content: doc.content,
                    score: entities.len() as f64,
                    metadata: doc.metadata,
                    recalled_triples: Some(recalled),
                }
            })
            .collect();
        normalize(&mut results);
        Ok(results)
    }

    /// Graph names standing for `entity`: the entity itself when the graph
    /// knows it, otherwise the entities of documents whose vectors sit above
    /// the similarity floor.
    async fn discover(
        &self,
        graph: &dyn GraphStore,
        entity: &str,
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<String>> {
        let related = graph
            .query(
                &TripleQuery::new()
                    .touching(entity)
                    .ignore_case()
                    .exclude_predicate(APPEARS_IN)
                    .exclude_predicate(TYPE)
                    .exclude_predicate(DESCRIPTION)
                    .limit(1),
            )
            .await?;
        if let Some(edge) = related.first() {
            let name = if edge.subject.eq_ignore_ascii_case(entity) {
                &edge.subject
            } else {
                &edge.object
            };
            return Ok(vec![name.clone()]);
        }

        let mut found: Vec<String> = graph
            .query(
                &TripleQuery::new()
                    .subject(entity)
                    .ignore_case()
                    .predicate(APPEARS_IN)
                    .limit(1),
            )
            .await?
            .into_iter()
            .map(|t| t.subject)
            .collect();

        if self.primary.is_none() {
            debug!("No vector index, entity {entity:?} not expanded");
            return Ok(found);
        }
        let hits = match self.vector(entity, limit, filters).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Vector expansion for entity {entity:?} failed: {e}");
                return Ok(found);
            }
        };
        let floor = self.config.mix_similarity_floor;
        let accepted: Vec<String> = hits
            .into_iter()
            .filter(|hit| hit.score > floor)
            .map(|hit| hit.document.id)
            .collect();
        if accepted.is_empty() {
            return Ok(found);
        }

        let query = accepted
            .iter()
            .fold(TripleQuery::new().predicate(APPEARS_IN), |q, id| {
                q.object(id.as_str())
            });
        found.extend(graph.query(&query).await?.into_iter().map(|t| t.subject));
        Ok(found)
    }

    /// Entity names from the LLM, or `None` when Fulltext should take over.
    async fn entities_or_fallback(&self, llm: &Arc<dyn Llm>, query: &str) -> Option<Vec<String>> {
        match self.query_entities(llm.as_ref(), query).await {
            Ok(entities) if !entities.is_empty() => Some(entities),
            Ok(_) => {
                debug!("No entities found in {query:?}, falling back to full-text");
                None
            }
            Err(e) => {
                warn!("Entity extraction for {query:?} failed, falling back to full-text: {e}");
                None
            }
        }
    }

    async fn query_entities(&self, llm: &dyn Llm, query: &str) -> Result<Vec<String>> {
        let deadline = self.config.llm_timeout();
        let raw = tokio::time::timeout(deadline, llm.complete(&query_entities_prompt(query)))
            .await
            .map_err(|_| RagError::Timeout(format!("entity extraction exceeded {deadline:?}")))??;
        parse_query_entities(&raw)
    }

    fn primary_index(&self) -> Result<&RegisteredIndex> {
        self.primary.as_ref().ok_or_else(|| {
            RagError::Config("vector retrieval requires an embedder".to_string())
        })
    }

    fn graph_ports(&self, mode: QueryMode) -> Result<(&Arc<dyn Llm>, &Arc<dyn GraphStore>)> {
        match (&self.llm, &self.graph) {
            (Some(llm), Some(graph)) => Ok((llm, graph)),
            _ => Err(RagError::Config(format!(
                "{mode} retrieval requires an LLM and a graph store"
            ))),
        }
    }
}

/// Document ids in discovery order, with the edges that led to each.
#[derive(Default)]
struct Evidence {
    order: Vec<String>,
    triples: HashMap<String, Vec<Triple>>,
}

impl Evidence {
    fn add(&mut self, doc_id: String, triples: Vec<Triple>) {
        let entry = self.triples.entry(doc_id.clone()).or_insert_with(|| {
            self.order.push(doc_id);
            Vec::new()
        });
        for triple in triples {
            if !entry.contains(&triple) {
                entry.push(triple);
            }
        }
    }

    fn top_ids(&self, n: usize) -> Vec<String> {
        self.order.iter().take(n).cloned().collect()
    }
}

/// `(document id, justifying edges)` for an entity: documents it appears in
/// directly, then documents its one-hop neighbours appear in.
async fn linked_documents(graph: &dyn GraphStore, entity: &str) -> Result<Vec<(String, Vec<Triple>)>> {
    let direct_query = TripleQuery::new()
        .subject(entity)
        .ignore_case()
        .predicate(APPEARS_IN);
    let relations_query = TripleQuery::new()
        .touching(entity)
        .ignore_case()
        .exclude_predicate(APPEARS_IN)
        .exclude_predicate(TYPE)
        .exclude_predicate(DESCRIPTION);
    let (direct, relations) =
        tokio::try_join!(graph.query(&direct_query), graph.query(&relations_query))?;

    let mut linked: Vec<(String, Vec<Triple>)> = direct
        .into_iter()
        .map(|link| (link.object.clone(), vec![link]))
        .collect();

    let mut neighbours: Vec<&str> = Vec::new();
    for edge in &relations {
        let other = if edge.subject.eq_ignore_ascii_case(entity) {
            edge.object.as_str()
        } else {
            edge.subject.as_str()
        };
        if !neighbours.contains(&other) {
            neighbours.push(other);
        }
    }
    if neighbours.is_empty() {
        return Ok(linked);
    }

    let indirect = graph
        .query(
            &TripleQuery::new()
                .subjects(neighbours.iter().copied())
                .predicate(APPEARS_IN),
        )
        .await?;
    for link in indirect {
        let mut why: Vec<Triple> = relations
            .iter()
            .filter(|r| r.subject == link.subject || r.object == link.subject)
            .cloned()
            .collect();
        let doc_id = link.object.clone();
        why.push(link);
        linked.push((doc_id, why));
    }
    Ok(linked)
}

fn into_results(scored: Vec<ScoredDocument>) -> Vec<SearchResult> {
    scored.into_iter().map(SearchResult::from).collect()
}

fn normalize(results: &mut [SearchResult]) {
    let top = results.iter().map(|r| r.score).fold(f64::MIN, f64::max);
    if top > 0.0 {
        for r in results.iter_mut() {
            r.score /= top;
        }
    }
}
