//! The Retriever: normalizes a query, checks the query cache, computes the
//! §4.G hybrid score, applies progressive delivery, and writes the cache.

use std::collections::HashSet;

use chrono::Utc;
use markdownkeeper_core::embedding::{cosine_similarity_clamped, EmbeddingProvider};
use markdownkeeper_core::error::CoreResult;
use markdownkeeper_core::search::{
    freshness, hybrid_score, normalize_query, query_hash, query_tokens, rank, score_chunk,
    score_concept, score_lex, RankedDocument, SearchMode,
};
use markdownkeeper_core::store::{DocumentView, GetDocumentOptions};
use tracing::warn;

use crate::config::{CacheConfig, RetrievalConfig};
use crate::sqlite_store::SqliteStore;
use crate::vector_index::BruteForceIndex;

/// The arguments to a single `search` call, mirroring the CLI/API knobs.
pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
    pub mode: SearchMode,
    pub include_content: bool,
    pub max_tokens: Option<usize>,
    pub section: Option<String>,
}

pub struct SearchResult {
    pub documents: Vec<DocumentView>,
    pub cache_hit: bool,
}

/// Executes §4.G's `search` operation. `vector_index`, when present, narrows
/// the semantic candidate set before the full hybrid score is recomputed;
/// when absent, all document vectors are scanned directly.
pub async fn search(
    store: &SqliteStore,
    embedder: &dyn EmbeddingProvider,
    vector_index: Option<&BruteForceIndex>,
    cache: &CacheConfig,
    retrieval: &RetrievalConfig,
    request: SearchRequest,
) -> CoreResult<SearchResult> {
    let normalized = normalize_query(&request.query);
    let q_tokens = query_tokens(&normalized);
    let hash = query_hash(&normalized, request.limit);

    if cache.enabled {
        if let Some(ids) = store.cache_lookup(&hash, cache.ttl_seconds).await? {
            let documents = load_documents(store, &ids, &request).await?;
            return Ok(SearchResult { documents, cache_hit: true });
        }
    }

    let ranked = match request.mode {
        SearchMode::Lexical => rank_lexical(store, &normalized, &q_tokens, request.limit).await?,
        SearchMode::Semantic => match embedder.embed(&normalized).await {
            Ok(query_vector) => {
                let ranked =
                    rank_semantic(store, vector_index, &query_vector, &q_tokens, retrieval, request.limit)
                        .await?;
                if ranked.is_empty() {
                    rank_lexical(store, &normalized, &q_tokens, request.limit).await?
                } else {
                    ranked
                }
            }
            Err(e) => {
                warn!("embedding backend error, falling back to lexical search: {e}");
                rank_lexical(store, &normalized, &q_tokens, request.limit).await?
            }
        },
    };

    let ids: Vec<i64> = ranked.iter().map(|r| r.document_id).collect();
    if cache.enabled {
        store.cache_store(&hash, &ids).await?;
    }

    let documents = load_documents(store, &ids, &request).await?;
    Ok(SearchResult { documents, cache_hit: false })
}

/// Lexical-only ranking: `s_lex` over FTS candidates, no embedding required.
async fn rank_lexical(
    store: &SqliteStore,
    normalized: &str,
    q_tokens: &HashSet<String>,
    limit: usize,
) -> CoreResult<Vec<RankedDocument>> {
    let candidates = store.fetch_keyword_candidates(normalized, (limit * 4).max(50)).await?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for (document_id, _chunk_id) in candidates {
        if !seen.insert(document_id) {
            continue;
        }
        let Some(document) = store.document_by_id(document_id).await? else { continue };
        let tokens = store.document_tokens(document_id).await?;
        let s_lex = score_lex(q_tokens, &tokens);
        if s_lex > 0.0 {
            out.push(RankedDocument { document_id, score: s_lex, updated_at: document.updated_at });
        }
    }

    Ok(rank(out, limit))
}

/// Hybrid semantic ranking over a candidate set (narrowed by `vector_index`
/// when present, else all documents with a stored vector).
async fn rank_semantic(
    store: &SqliteStore,
    vector_index: Option<&BruteForceIndex>,
    query_vector: &[f32],
    q_tokens: &HashSet<String>,
    retrieval: &RetrievalConfig,
    limit: usize,
) -> CoreResult<Vec<RankedDocument>> {
    let candidate_size = retrieval.candidate_set_size(limit);

    let candidates = match vector_index {
        Some(index) if !index.is_empty() => index.search(query_vector, candidate_size),
        _ => {
            let mut scored: Vec<_> = store
                .all_document_vectors()
                .await?
                .into_iter()
                .map(|(id, updated_at, vector)| {
                    (id, updated_at, cosine_similarity_clamped(query_vector, &vector))
                })
                .collect();
            scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(candidate_size);
            scored
        }
    };

    let now = Utc::now();
    let mut out = Vec::with_capacity(candidates.len());
    for (document_id, updated_at, s_vec) in candidates {
        let chunk_vectors = store.chunk_vectors_for_document(document_id).await?;
        let s_chunk = score_chunk(query_vector, &chunk_vectors);
        let tokens = store.document_tokens(document_id).await?;
        let s_lex = score_lex(q_tokens, &tokens);
        let concepts = store.document_concepts(document_id).await?;
        let s_concept = score_concept(q_tokens, &concepts);
        let fresh = freshness(updated_at, now);

        let score = hybrid_score(s_vec, s_chunk, s_lex, s_concept, fresh);
        if score > 0.0 {
            out.push(RankedDocument { document_id, score, updated_at });
        }
    }

    Ok(rank(out, limit))
}

async fn load_documents(
    store: &SqliteStore,
    ids: &[i64],
    request: &SearchRequest,
) -> CoreResult<Vec<DocumentView>> {
    let options = GetDocumentOptions {
        include_content: request.include_content,
        max_tokens: request.max_tokens,
        section: request.section.clone(),
    };

    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(view) = store.get_document(*id, options.clone()).await? {
            out.push(view);
        }
    }
    Ok(out)
}

/// Rebuilds a [`BruteForceIndex`] from the Store's current document vectors,
/// for `build-index` and startup warm-up.
pub async fn rebuild_vector_index(store: &SqliteStore, dimension: usize) -> CoreResult<BruteForceIndex> {
    let mut index = BruteForceIndex::new(dimension);
    index.build(store.all_document_vectors().await?);
    Ok(index)
}
