//! Subgraph expansion over the triple store.
//!
//! `APPEARS_IN` edges never show up in [`GraphData`]; `TYPE` and
//! `DESCRIPTION` edges are folded into node attributes instead of being
//! traversed.

use std::collections::{HashMap, HashSet};

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::db::models::{APPEARS_IN, DESCRIPTION, TYPE, Triple};
use crate::error::Result;
use crate::storage::{GraphStore, TripleQuery};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphRelationship {
    pub source: String,
    pub target: String,
    pub relation: String,
}

impl From<&GraphRelationship> for Triple {
    fn from(rel: &GraphRelationship) -> Self {
        Triple::new(&rel.source, &rel.relation, &rel.target)
    }
}

/// Nodes and relationships of a (sub)graph, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphData {
    pub nodes: Vec<GraphNode>,
    pub relationships: Vec<GraphRelationship>,
}

impl GraphData {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn has_relationship(&self, source: &str, relation: &str, target: &str) -> bool {
        self.relationships
            .iter()
            .any(|r| r.source == source && r.relation == relation && r.target == target)
    }

    /// Union with `other`, de-duplicating nodes by name and edges by triple.
    pub fn merge(&mut self, other: GraphData) {
        let mut builder = GraphBuilder::from(std::mem::take(self));
        for node in other.nodes {
            builder.add_node_with(node);
        }
        for rel in other.relationships {
            builder.add_relationship(rel);
        }
        *self = builder.finish();
    }
}

/// Accumulates a graph while keeping nodes and edges unique.
#[derive(Default)]
struct GraphBuilder {
    nodes: Vec<GraphNode>,
    positions: HashMap<String, usize>,
    relationships: Vec<GraphRelationship>,
    seen: HashSet<GraphRelationship>,
}

impl From<GraphData> for GraphBuilder {
    fn from(data: GraphData) -> Self {
        let mut builder = GraphBuilder::default();
        for node in data.nodes {
            builder.add_node_with(node);
        }
        for rel in data.relationships {
            builder.add_relationship(rel);
        }
        builder
    }
}

impl GraphBuilder {
    /// Returns `true` when the node is new.
    fn add_node(&mut self, id: &str) -> bool {
        self.add_node_with(GraphNode {
            id: id.to_string(),
            ..GraphNode::default()
        })
    }

    fn add_node_with(&mut self, node: GraphNode) -> bool {
        match self.positions.get(&node.id) {
            Some(&pos) => {
                let existing = &mut self.nodes[pos];
                if existing.entity_type.is_none() {
                    existing.entity_type = node.entity_type;
                }
                if existing.description.is_none() {
                    existing.description = node.description;
                }
                false
            }
            None => {
                self.positions.insert(node.id.clone(), self.nodes.len());
                self.nodes.push(node);
                true
            }
        }
    }

    fn add_relationship(&mut self, rel: GraphRelationship) {
        self.add_node(&rel.source);
        self.add_node(&rel.target);
        if self.seen.insert(rel.clone()) {
            self.relationships.push(rel);
        }
    }

    /// Fold a `TYPE`/`DESCRIPTION` edge into its subject node.
    fn add_attribute(&mut self, edge: &Triple) {
        self.add_node(&edge.subject);
        let Some(&pos) = self.positions.get(&edge.subject) else {
            return;
        };
        let node = &mut self.nodes[pos];
        let slot = match edge.predicate.as_str() {
            TYPE => &mut node.entity_type,
            DESCRIPTION => &mut node.description,
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(edge.object.clone());
        }
    }

    /// Add a non-`APPEARS_IN` triple. Returns the endpoints seen for the
    /// first time.
    fn add_triple(&mut self, edge: &Triple) -> Vec<String> {
        if edge.is_attribute() {
            self.add_attribute(edge);
            return Vec::new();
        }
        let mut discovered = Vec::new();
        for endpoint in [&edge.subject, &edge.object] {
            if self.add_node(endpoint) {
                discovered.push(endpoint.clone());
            }
        }
        self.add_relationship(GraphRelationship {
            source: edge.subject.clone(),
            target: edge.object.clone(),
            relation: edge.predicate.clone(),
        });
        discovered
    }

    fn finish(self) -> GraphData {
        GraphData {
            nodes: self.nodes,
            relationships: self.relationships,
        }
    }
}

/// Breadth-first neighbourhood of `seed`, following edges in both
/// directions. `depth <= 0` is treated as 1.
pub async fn subgraph(graph: &dyn GraphStore, seed: &str, depth: i32) -> Result<GraphData> {
    let depth = depth.max(1);
    let mut builder = GraphBuilder::default();
    builder.add_node(seed);
    let mut frontier = vec![seed.to_string()];

    for _ in 0..depth {
        if frontier.is_empty() {
            break;
        }
        let per_node = try_join_all(frontier.iter().map(|node| async move {
            let query = TripleQuery::new()
                .touching(node.as_str())
                .exclude_predicate(APPEARS_IN);
            graph.query(&query).await
        }))
        .await?;

        let mut next = Vec::new();
        for edge in per_node.iter().flatten() {
            next.extend(builder.add_triple(edge));
        }
        frontier = next;
    }

    // Nodes found on the last level still carry their attributes.
    if !frontier.is_empty() {
        let attributes = graph
            .query(
                &TripleQuery::new()
                    .subjects(frontier)
                    .predicate(TYPE)
                    .predicate(DESCRIPTION),
            )
            .await?;
        for edge in &attributes {
            builder.add_attribute(edge);
        }
    }

    Ok(builder.finish())
}

/// Union of depth-1 subgraphs around every entity whose name contains
/// `text`, ignoring case.
pub async fn search_graph(graph: &dyn GraphStore, text: &str) -> Result<GraphData> {
    let needle = text.trim().to_lowercase();
    if needle.is_empty() {
        return Ok(GraphData::default());
    }

    let candidates = graph
        .query(&TripleQuery::new().node_contains(needle.as_str()).ignore_case())
        .await?;

    let mut seeds: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for edge in &candidates {
        // Document ids and attribute values are not entities.
        let mut names = vec![&edge.subject];
        if edge.predicate != APPEARS_IN && !edge.is_attribute() {
            names.push(&edge.object);
        }
        for name in names {
            if name.to_lowercase().contains(&needle) && seen.insert(name.clone()) {
                seeds.push(name.clone());
            }
        }
    }

    let graphs = try_join_all(seeds.iter().map(|seed| subgraph(graph, seed, 1))).await?;
    let mut result = GraphData::default();
    for g in graphs {
        result.merge(g);
    }
    Ok(result)
}

/// The whole entity graph.
pub async fn export_graph(graph: &dyn GraphStore) -> Result<GraphData> {
    let mut builder = GraphBuilder::default();
    for edge in graph.all_triples().await? {
        if edge.predicate == APPEARS_IN {
            builder.add_node(&edge.subject);
        } else {
            builder.add_triple(&edge);
        }
    }
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Db, SqliteStore};

    async fn chain() -> SqliteStore {
        let store = SqliteStore::new(Db::open_in_memory().unwrap(), "kg").unwrap();
        GraphStore::initialize(&store).await.unwrap();
        store
            .add_edges(&[
                Triple::new("A", "LINKS", "B"),
                Triple::new("B", "LINKS", "C"),
                Triple::new("D", "POINTS_TO", "C"),
                Triple::new("C", "LINKS", "E"),
                Triple::new("A", APPEARS_IN, "doc-1"),
                Triple::new("B", TYPE, "CONCEPT"),
                Triple::new("C", DESCRIPTION, "third node"),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_subgraph_respects_depth() {
        let store = chain().await;

        let one = subgraph(&store, "A", 1).await.unwrap();
        assert_eq!(one.relationships.len(), 1);
        assert!(one.has_relationship("A", "LINKS", "B"));
        assert_eq!(one.node("B").unwrap().entity_type.as_deref(), Some("CONCEPT"));

        let two = subgraph(&store, "A", 2).await.unwrap();
        assert!(two.has_relationship("B", "LINKS", "C"));
        assert!(!two.has_relationship("C", "LINKS", "E"));
        assert_eq!(two.node("C").unwrap().description.as_deref(), Some("third node"));

        // Incoming edges are followed too.
        let three = subgraph(&store, "A", 3).await.unwrap();
        assert!(three.has_relationship("D", "POINTS_TO", "C"));
        assert!(three.has_relationship("C", "LINKS", "E"));
    }

    #[tokio::test]
    async fn test_subgraph_excludes_appears_in_and_clamps_depth() {
        let store = chain().await;
        for depth in [0, -3, 1] {
            let g = subgraph(&store, "A", depth).await.unwrap();
            assert_eq!(g.relationships.len(), 1, "depth {depth}");
            assert!(g.relationships.iter().all(|r| r.relation != APPEARS_IN));
            assert!(g.node("doc-1").is_none());
        }
    }

    #[tokio::test]
    async fn test_subgraph_of_unknown_node() {
        let store = chain().await;
        let g = subgraph(&store, "Nowhere", 2).await.unwrap();
        assert_eq!(g.nodes.len(), 1);
        assert!(g.relationships.is_empty());
    }

    #[tokio::test]
    async fn test_search_graph_matches_names() {
        let store = chain().await;
        store
            .add_edges(&[Triple::new("Alpha Centauri", APPEARS_IN, "doc-2")])
            .await
            .unwrap();

        let g = search_graph(&store, "alpha").await.unwrap();
        assert!(g.node("Alpha Centauri").is_some());
        assert!(g.node("doc-2").is_none());

        let g = search_graph(&store, "d").await.unwrap();
        assert!(g.has_relationship("D", "POINTS_TO", "C"));
        assert!(g.node("third node").is_none());

        assert!(search_graph(&store, "  ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_export_graph() {
        let store = chain().await;
        let g = export_graph(&store).await.unwrap();
        assert_eq!(g.relationships.len(), 4);
        assert!(g.relationships.iter().all(|r| r.relation != APPEARS_IN));
        assert!(g.node("doc-1").is_none());
        assert!(g.node("CONCEPT").is_none());
        assert_eq!(g.node("B").unwrap().entity_type.as_deref(), Some("CONCEPT"));
    }

    #[test]
    fn test_merge_deduplicates() {
        let mut a = GraphData {
            nodes: vec![GraphNode {
                id: "x".into(),
                ..GraphNode::default()
            }],
            relationships: vec![GraphRelationship {
                source: "x".into(),
                target: "y".into(),
                relation: "R".into(),
            }],
        };
        let b = GraphData {
            nodes: vec![GraphNode {
                id: "x".into(),
                entity_type: Some("T".into()),
                description: None,
            }],
            relationships: a.relationships.clone(),
        };
        a.merge(b);
        assert_eq!(a.nodes.len(), 2);
        assert_eq!(a.relationships.len(), 1);
        assert_eq!(a.node("x").unwrap().entity_type.as_deref(), Some("T"));
    }
}
