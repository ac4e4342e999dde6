//! Hybrid-search execution over the SQLite store
//!
//! The vector arm fetches the filtered candidate rows and ranks them by
//! cosine similarity in Rust (the embedded rendition of the vector index);
//! the FTS arm ranks the same candidate set through the collection's FTS5
//! shadow table. Both arms are fused with Reciprocal Rank Fusion in
//! `engram-core`.

use engram_core::search::{reciprocal_rank_fusion, SearchMode};
use engram_core::{cosine_similarity, parse_query, SearchRequest};
use engram_types::Result;
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};

use super::storage_err;

/// One filtered candidate of a hybrid search
#[derive(Debug, Clone)]
pub struct CandidateRow<K> {
    pub key: K,
    pub embedding: Vec<f32>,
    pub created_at: i64,
}

/// Rank the FTS arm: top `limit` rowid keys for `query_text` against one
/// FTS5 shadow table, best first. `bm25()` scores lower-is-better, so the
/// returned score is its negation.
pub(crate) async fn fts_arm(
    pool: &SqlitePool,
    fts_table: &str,
    query_text: &str,
    limit: usize,
) -> Result<Vec<(i64, f64)>> {
    let Some(match_expr) = parse_query(query_text).to_fts5() else {
        return Ok(Vec::new());
    };

    // Table names are compile-time constants, never caller input
    let sql = format!(
        "SELECT rowid, bm25({fts_table}) AS rank FROM {fts_table} \
         WHERE {fts_table} MATCH ?1 ORDER BY rank LIMIT ?2"
    );
    let rows = sqlx::query(&sql)
        .bind(&match_expr)
        .bind(limit as i64)
        .fetch_all(pool)
        .await
        .map_err(|e| storage_err("fts search", e))?;

    let mut ranked = Vec::with_capacity(rows.len());
    for row in rows {
        let rowid: i64 = row.try_get("rowid").map_err(|e| storage_err("fts rowid", e))?;
        let rank: f64 = row.try_get("rank").map_err(|e| storage_err("fts rank", e))?;
        ranked.push((rowid, -rank));
    }
    Ok(ranked)
}

/// Fuse the two arms over the filtered candidate set
///
/// `candidates` already satisfy the caller's filters and status predicate;
/// FTS hits outside that set are discarded, which is what confines the text
/// arm to the same candidates. Keys are the main table's rowids.
pub(crate) fn fuse_candidates(
    candidates: &[CandidateRow<i64>],
    fts_ranked: Vec<(i64, f64)>,
    request: &SearchRequest,
) -> Vec<(i64, f64)> {
    let overscan = request.k.saturating_mul(3).max(1);

    let mut vector_ranked: Vec<(i64, f64)> = candidates
        .iter()
        .filter(|c| !c.embedding.is_empty() && !request.query_embedding.is_empty())
        .map(|c| {
            (
                c.key,
                cosine_similarity(&request.query_embedding, &c.embedding),
            )
        })
        .filter(|(_, similarity)| {
            request.mode == SearchMode::Fts || *similarity >= request.threshold
        })
        .collect();
    vector_ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    vector_ranked.truncate(overscan);

    let candidate_keys: HashSet<i64> = candidates.iter().map(|c| c.key).collect();
    let mut fts_filtered: Vec<(i64, f64)> = fts_ranked
        .into_iter()
        .filter(|(key, _)| candidate_keys.contains(key))
        .collect();
    fts_filtered.truncate(overscan);

    let tie_keys: HashMap<i64, (i64, i64)> = candidates
        .iter()
        .map(|c| (c.key, (c.created_at, c.key)))
        .collect();

    reciprocal_rank_fusion(
        request.mode,
        &vector_ranked,
        &fts_filtered,
        request.k,
        request.rrf_k,
        |key| tie_keys.get(key).copied().unwrap_or((0, *key)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: i64, embedding: Vec<f32>, created_at: i64) -> CandidateRow<i64> {
        CandidateRow {
            key,
            embedding,
            created_at,
        }
    }

    fn request(mode: SearchMode, embedding: Vec<f32>, threshold: f64) -> SearchRequest {
        SearchRequest {
            query_text: String::new(),
            query_embedding: embedding,
            k: 10,
            threshold,
            mode,
            ..SearchRequest::default()
        }
    }

    #[test]
    fn test_vector_mode_orders_by_similarity() {
        let candidates = vec![
            candidate(1, vec![1.0, 0.0], 10),
            candidate(2, vec![0.0, 1.0], 20),
            candidate(3, vec![0.9, 0.1], 30),
        ];
        let fused = fuse_candidates(
            &candidates,
            Vec::new(),
            &request(SearchMode::Vector, vec![1.0, 0.0], 0.0),
        );
        assert_eq!(fused[0].0, 1);
        assert_eq!(fused[1].0, 3);
    }

    #[test]
    fn test_threshold_drops_dissimilar_candidates() {
        let candidates = vec![
            candidate(1, vec![1.0, 0.0], 10),
            candidate(2, vec![0.0, 1.0], 20),
        ];
        let fused = fuse_candidates(
            &candidates,
            Vec::new(),
            &request(SearchMode::Vector, vec![1.0, 0.0], 0.5),
        );
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].0, 1);
    }

    #[test]
    fn test_fts_hits_outside_candidates_are_dropped() {
        let candidates = vec![candidate(1, vec![1.0, 0.0], 10)];
        let fused = fuse_candidates(
            &candidates,
            vec![(99, 5.0), (1, 2.0)],
            &request(SearchMode::Fts, Vec::new(), 0.0),
        );
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].0, 1);
    }

    #[test]
    fn test_hybrid_rewards_presence_in_both_arms() {
        let candidates = vec![
            candidate(1, vec![1.0, 0.0], 10),
            candidate(2, vec![0.95, 0.05], 20),
        ];
        // Candidate 2 trails on vector rank but leads the text arm
        let fused = fuse_candidates(
            &candidates,
            vec![(2, 3.0)],
            &request(SearchMode::Hybrid, vec![1.0, 0.0], 0.0),
        );
        assert_eq!(fused[0].0, 2);
        // 1/(60+2) + 1/(60+1) beats 1/(60+1) alone
        assert!(fused[0].1 > fused[1].1);
    }
}
