//! Hybrid retriever - reciprocal-rank fusion of FTS and vector candidates.
//!
//! Both indexes are oversampled, fused by rank (which erases the scale gap
//! between BM25 and cosine distance), hydrated against the relational
//! store, post-filtered by source_type and tags, and truncated to `limit`.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::db::Database;
use crate::embedding::Embedder;
use crate::error::{Result, UridxError};

/// RRF constant; by convention 60.
const RRF_C: f64 = 60.0;

/// Oversample factor on `limit` when pulling from each index.
const OVERSAMPLE: usize = 5;

/// One fused search result row.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub source_uri: String,
    pub title: Option<String>,
    pub source_type: Option<String>,
    pub chunk_text: String,
    pub score: f64,
    pub tags: Vec<String>,
}

/// Search the index with a hybrid (lexical + semantic) query.
///
/// With `semantic = false` the vector pass is skipped and ranking degrades
/// to pure BM25 order under the same fusion formula.
pub fn hybrid_search(
    db: &Database,
    embedder: &dyn Embedder,
    query: &str,
    limit: usize,
    source_type: Option<&str>,
    tags: &[String],
    semantic: bool,
) -> Result<Vec<SearchResult>> {
    if limit == 0 || query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let fetch = limit.saturating_mul(OVERSAMPLE);

    let lexical = db.fts_topn(&fts_match_expr(query), fetch)?;

    let semantic_hits = if semantic {
        let mut vectors = embedder.embed(&[query])?;
        let query_vec = vectors.pop().ok_or_else(|| {
            UridxError::Transient("embedder returned no vector for the query".to_string())
        })?;
        let dimension = db.embed_dimension()?;
        if query_vec.len() != dimension {
            return Err(UridxError::Config(format!(
                "query embedding dimension {} does not match persisted embed_dimension {}",
                query_vec.len(),
                dimension
            )));
        }
        db.vector_knn(&query_vec, fetch)?
    } else {
        Vec::new()
    };

    let fused = rrf_fuse(&lexical, &semantic_hits);

    // Hydrate, dropping candidates whose item vanished underneath us.
    let mut results = Vec::with_capacity(limit);
    db.with_conn(|conn| {
        let mut chunk_stmt = conn.prepare(
            "SELECT c.text, i.id, i.source_uri, i.title, i.source_type
             FROM chunk c JOIN item i ON i.id = c.item_id
             WHERE c.id = ?1",
        )?;
        let mut tag_stmt =
            conn.prepare("SELECT tag FROM tag WHERE item_id = ?1 ORDER BY tag")?;

        for (chunk_id, score) in &fused {
            if results.len() >= limit {
                break;
            }

            let row = chunk_stmt
                .query_row(params![chunk_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })
                .optional()?;

            let Some((chunk_text, item_id, source_uri, title, item_source_type)) = row else {
                continue;
            };

            if let Some(wanted) = source_type {
                if item_source_type.as_deref() != Some(wanted) {
                    continue;
                }
            }

            let item_tags: Vec<String> = tag_stmt
                .query_map(params![item_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<_>>()?;

            if !tags.iter().all(|t| item_tags.contains(t)) {
                continue;
            }

            results.push(SearchResult {
                source_uri,
                title,
                source_type: item_source_type,
                chunk_text,
                score: *score,
                tags: item_tags,
            });
        }
        Ok(())
    })?;

    Ok(results)
}

/// Reciprocal-rank fusion: `score(c) = sum over lists of 1 / (rank + C)`
/// with 1-based ranks, summed only over lists where `c` appears. Returns
/// `(chunk_id, score)` sorted by descending score, ties broken by lower
/// chunk id.
pub fn rrf_fuse(lexical: &[(i64, f64)], semantic: &[(i64, f64)]) -> Vec<(i64, f64)> {
    let mut scores: HashMap<i64, f64> = HashMap::new();

    for (rank, (chunk_id, _)) in lexical.iter().enumerate() {
        *scores.entry(*chunk_id).or_insert(0.0) += 1.0 / (RRF_C + (rank + 1) as f64);
    }
    for (rank, (chunk_id, _)) in semantic.iter().enumerate() {
        *scores.entry(*chunk_id).or_insert(0.0) += 1.0 / (RRF_C + (rank + 1) as f64);
    }

    let mut fused: Vec<(i64, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    fused
}

/// Turn a free-form query into an FTS5 MATCH expression: alphanumeric
/// tokens, each quoted, OR-joined. Quoting keeps user input from being
/// parsed as FTS syntax; OR keeps recall high for fusion.
fn fts_match_expr(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrf_both_lists_beat_single_list() {
        let lexical = vec![(1, -2.0), (2, -1.5), (3, -1.0)];
        let semantic = vec![(2, 0.1), (4, 0.2)];
        let fused = rrf_fuse(&lexical, &semantic);
        // chunk 2 appears in both lists and must rank first
        assert_eq!(fused[0].0, 2);
        assert!((fused[0].1 - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-12);
    }

    #[test]
    fn rrf_exact_scores_and_tie_break() {
        // FTS ranks A > B > C; semantic ranks B > A > C.
        // A = 1/61 + 1/62, B = 1/62 + 1/61: a tie, broken by lower id.
        let a = 10;
        let b = 20;
        let c = 30;
        let lexical = vec![(a, -3.0), (b, -2.0), (c, -1.0)];
        let semantic = vec![(b, 0.1), (a, 0.2), (c, 0.3)];
        let fused = rrf_fuse(&lexical, &semantic);

        assert_eq!(fused[0].0, a);
        assert_eq!(fused[1].0, b);
        assert_eq!(fused[2].0, c);
        assert!((fused[0].1 - fused[1].1).abs() < 1e-12);
        assert!((fused[2].1 - 2.0 / 63.0).abs() < 1e-12);
    }

    #[test]
    fn rrf_is_rank_driven_not_score_driven() {
        // Raw scores are ignored; only positions matter.
        let l1 = vec![(1, -100.0), (2, -0.5)];
        let l2 = vec![(1, -0.01), (2, -0.009)];
        assert_eq!(rrf_fuse(&l1, &[]), rrf_fuse(&l2, &[]));
    }

    #[test]
    fn rrf_empty_lists() {
        assert!(rrf_fuse(&[], &[]).is_empty());
    }

    #[test]
    fn match_expr_quotes_and_ors_tokens() {
        assert_eq!(
            fts_match_expr("apple dessert"),
            "\"apple\" OR \"dessert\""
        );
        assert_eq!(fts_match_expr("c++ (fast)"), "\"c\" OR \"fast\"");
        assert_eq!(fts_match_expr("  "), "");
    }

    #[test]
    fn match_expr_neutralizes_fts_syntax() {
        // NEAR/AND/quotes from the user arrive as plain quoted tokens
        let expr = fts_match_expr("\"broken NEAR(query");
        assert_eq!(expr, "\"broken\" OR \"NEAR\" OR \"query\"");
    }
}
