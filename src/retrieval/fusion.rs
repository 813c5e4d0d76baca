//! Reciprocal rank fusion.

use std::collections::HashMap;

use crate::db::models::ScoredDocument;
use crate::db::search::normalize_scores;

/// Fuse ranked lists: each record scores `Σ 1 / (rank + k)` over the lists it
/// appears in (rank is 0-based). The fused list is cut to `limit` and
/// rescaled so the top score is 1.0. Equal scores keep first-seen order.
pub fn reciprocal_rank_fusion(
    lists: Vec<Vec<ScoredDocument>>,
    k: f64,
    limit: usize,
) -> Vec<ScoredDocument> {
    let mut fused: Vec<ScoredDocument> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for list in lists {
        for (rank, mut scored) in list.into_iter().enumerate() {
            let contribution = 1.0 / (rank as f64 + k);
            match positions.get(&scored.document.id) {
                Some(&pos) => fused[pos].score += contribution,
                None => {
                    positions.insert(scored.document.id.clone(), fused.len());
                    scored.score = contribution;
                    fused.push(scored);
                }
            }
        }
    }

    fused.sort_by(|a, b| b.score.total_cmp(&a.score));
    fused.truncate(limit);
    normalize_scores(&mut fused);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Document, EmbeddingStatus};
    use chrono::Utc;
    use serde_json::Map;

    fn scored(id: &str, score: f64) -> ScoredDocument {
        ScoredDocument {
            document: Document {
                id: id.into(),
                content: format!("content of {id}"),
                metadata: Map::new(),
                content_tokens: String::new(),
                embedding_status: EmbeddingStatus::Completed,
                chunk_length: 12,
                revision: 1,
                created_at: Utc::now(),
            },
            score,
        }
    }

    fn ids(results: &[ScoredDocument]) -> Vec<&str> {
        results.iter().map(|r| r.document.id.as_str()).collect()
    }

    #[test]
    fn test_disjoint_top_hits_both_survive() {
        let fulltext = vec![scored("ft-only", 9.0), scored("ft-2", 3.0)];
        let vector = vec![scored("vec-only", 0.9), scored("vec-2", 0.5)];

        let fused = reciprocal_rank_fusion(vec![fulltext, vector], 60.0, 2);
        let mut top = ids(&fused);
        top.sort();
        assert_eq!(top, vec!["ft-only", "vec-only"]);
        assert!(fused.iter().all(|r| (r.score - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_shared_hits_accumulate() {
        let fulltext = vec![scored("a", 1.0), scored("shared", 0.8)];
        let vector = vec![scored("b", 0.9), scored("shared", 0.7)];

        let fused = reciprocal_rank_fusion(vec![fulltext, vector], 60.0, 3);
        assert_eq!(fused[0].document.id, "shared");
        assert_eq!(fused[0].score, 1.0);
        // 1/60 against 2/61
        let expected = (1.0 / 60.0) / (2.0 / 61.0);
        assert!((fused[1].score - expected).abs() < 1e-12);
    }

    #[test]
    fn test_source_scores_are_ignored() {
        // Rank decides, not the raw score scale of either list.
        let fused = reciprocal_rank_fusion(
            vec![vec![scored("x", 1000.0), scored("y", 999.0)]],
            60.0,
            5,
        );
        assert_eq!(ids(&fused), vec!["x", "y"]);
        assert!((fused[1].score - 60.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_and_small_k() {
        assert!(reciprocal_rank_fusion(vec![vec![], vec![]], 60.0, 5).is_empty());

        let fused = reciprocal_rank_fusion(
            vec![vec![scored("a", 1.0), scored("b", 1.0)]],
            1.0,
            5,
        );
        assert!((fused[1].score - 0.5).abs() < 1e-12);
    }
}
