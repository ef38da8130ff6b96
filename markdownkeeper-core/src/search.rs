//! Pure hybrid scoring functions for the retriever.
//!
//! Everything here is a pure function over already-fetched candidate data
//! (vectors, token sets, timestamps). The application crate owns fetching
//! candidates from the Store and calls these to rank them.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Utc};
use sha2::{Digest, Sha256};

use crate::embedding::cosine_similarity_clamped;

pub const WEIGHT_VEC: f32 = 0.45;
pub const WEIGHT_CHUNK: f32 = 0.30;
pub const WEIGHT_LEX: f32 = 0.20;
pub const WEIGHT_CONCEPT: f32 = 0.05;
pub const FRESHNESS_BONUS: f32 = 0.05;

/// Retrieval mode requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Semantic,
    Lexical,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "semantic" => Some(SearchMode::Semantic),
            "lexical" => Some(SearchMode::Lexical),
            _ => None,
        }
    }
}

/// Normalize a raw query string: trim, collapse internal whitespace runs,
/// lowercase.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Tokenize a normalized query into the set `Q` used by lexical/concept
/// scoring.
pub fn query_tokens(normalized_query: &str) -> HashSet<String> {
    normalized_query
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// `SHA-256(normalized || "\x00" || limit)`, the query cache key.
pub fn query_hash(normalized_query: &str, limit: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_query.as_bytes());
    hasher.update([0u8]);
    hasher.update(limit.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `s_vec(D) = cosine(v_q, v_D)` clamped to `[0, 1]`.
pub fn score_vec(query_vector: &[f32], document_vector: &[f32]) -> f32 {
    cosine_similarity_clamped(query_vector, document_vector)
}

/// `s_chunk(D) = max_i cosine(v_q, v_{c_i})`, or `0` if the document has no
/// chunk vectors.
pub fn score_chunk(query_vector: &[f32], chunk_vectors: &[Vec<f32>]) -> f32 {
    chunk_vectors
        .iter()
        .map(|v| cosine_similarity_clamped(query_vector, v))
        .fold(0.0f32, f32::max)
}

/// `s_lex(D) = |Q ∩ T_D| / max(|Q|, 1)`.
pub fn score_lex(query_tokens: &HashSet<String>, document_tokens: &HashSet<String>) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let overlap = query_tokens.intersection(document_tokens).count();
    overlap as f32 / query_tokens.len().max(1) as f32
}

/// `s_concept(D) = 1.0` if any query token matches a document concept.
pub fn score_concept(query_tokens: &HashSet<String>, document_concepts: &[String]) -> f32 {
    if document_concepts
        .iter()
        .any(|concept| query_tokens.contains(concept))
    {
        1.0
    } else {
        0.0
    }
}

/// `0.05` if `updated_at` falls in the current UTC year, else `0.0`.
pub fn freshness(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    if updated_at.year() == now.year() {
        FRESHNESS_BONUS
    } else {
        0.0
    }
}

/// The full hybrid score, bounded to `[0, 1.05]` by construction (weights
/// sum to 1.0 plus the freshness bonus).
pub fn hybrid_score(s_vec: f32, s_chunk: f32, s_lex: f32, s_concept: f32, freshness: f32) -> f32 {
    WEIGHT_VEC * s_vec + WEIGHT_CHUNK * s_chunk + WEIGHT_LEX * s_lex + WEIGHT_CONCEPT * s_concept
        + freshness
}

/// A single ranked candidate, carrying just what the tie-break rule needs.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedDocument {
    pub document_id: i64,
    pub score: f32,
    pub updated_at: DateTime<Utc>,
}

/// Sort candidates by `score` descending, then `updated_at` descending, then
/// `id` ascending, and truncate to `limit`.
pub fn rank(mut candidates: Vec<RankedDocument>, limit: usize) -> Vec<RankedDocument> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
    candidates.truncate(limit);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tokens(words: &[&str]) -> HashSet<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalize_collapses_whitespace_and_lowercases() {
        assert_eq!(normalize_query("  Hello   World  "), "hello world");
    }

    #[test]
    fn lex_score_is_overlap_over_query_len() {
        let q = tokens(&["kubernetes", "deployment"]);
        let d = tokens(&["kubernetes", "guide"]);
        assert_eq!(score_lex(&q, &d), 0.5);
    }

    #[test]
    fn lex_score_empty_query_is_zero() {
        assert_eq!(score_lex(&HashSet::new(), &tokens(&["a"])), 0.0);
    }

    #[test]
    fn concept_score_is_boolean() {
        let q = tokens(&["kubernetes"]);
        assert_eq!(score_concept(&q, &["kubernetes".to_string()]), 1.0);
        assert_eq!(score_concept(&q, &["networking".to_string()]), 0.0);
    }

    #[test]
    fn chunk_score_is_max_over_chunks() {
        let query = vec![1.0, 0.0];
        let chunks = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        assert_eq!(score_chunk(&query, &chunks), 1.0);
    }

    #[test]
    fn chunk_score_zero_with_no_chunks() {
        assert_eq!(score_chunk(&[1.0, 0.0], &[]), 0.0);
    }

    #[test]
    fn freshness_only_for_current_year() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let this_year = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let last_year = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(freshness(this_year, now), FRESHNESS_BONUS);
        assert_eq!(freshness(last_year, now), 0.0);
    }

    #[test]
    fn hybrid_score_is_bounded() {
        let max = hybrid_score(1.0, 1.0, 1.0, 1.0, FRESHNESS_BONUS);
        assert!(max <= 1.05 + 1e-6);
        let min = hybrid_score(0.0, 0.0, 0.0, 0.0, 0.0);
        assert_eq!(min, 0.0);
    }

    #[test]
    fn hybrid_score_monotone_in_each_term() {
        let base = hybrid_score(0.1, 0.1, 0.1, 0.0, 0.0);
        assert!(hybrid_score(0.2, 0.1, 0.1, 0.0, 0.0) > base);
        assert!(hybrid_score(0.1, 0.2, 0.1, 0.0, 0.0) > base);
        assert!(hybrid_score(0.1, 0.1, 0.2, 0.0, 0.0) > base);
        assert!(hybrid_score(0.1, 0.1, 0.1, 1.0, 0.0) > base);
    }

    #[test]
    fn rank_orders_by_score_then_recency_then_id() {
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let candidates = vec![
            RankedDocument { document_id: 3, score: 0.5, updated_at: t1 },
            RankedDocument { document_id: 2, score: 0.5, updated_at: t2 },
            RankedDocument { document_id: 1, score: 0.9, updated_at: t1 },
        ];
        let ranked = rank(candidates, 10);
        assert_eq!(
            ranked.iter().map(|r| r.document_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn rank_truncates_to_limit() {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let candidates = (0..5)
            .map(|i| RankedDocument { document_id: i, score: i as f32, updated_at: t })
            .collect();
        assert_eq!(rank(candidates, 2).len(), 2);
    }
}
