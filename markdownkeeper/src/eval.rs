//! `embeddings-eval` / `semantic-benchmark`: retrieval quality and latency
//! harnesses driven by a labeled cases file.
//!
//! No direct teacher precedent covers retrieval evaluation — this is
//! original tooling, grounded in §8's testable-properties framing (ranking
//! is judged by recall/MRR against seed scenarios, not by eyeballing
//! results) and built from the same `SearchRequest`/`search` surface
//! `retriever.rs` already exposes to `api.rs`.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use markdownkeeper_core::error::{CoreError, CoreResult};
use markdownkeeper_core::embedding::EmbeddingProvider;
use markdownkeeper_core::search::SearchMode;

use crate::config::{CacheConfig, RetrievalConfig};
use crate::retriever::{self, SearchRequest};
use crate::sqlite_store::SqliteStore;
use crate::vector_index::BruteForceIndex;

#[derive(Debug, Deserialize)]
pub struct EvalCase {
    pub query: String,
    pub relevant_document_ids: Vec<i64>,
}

pub fn load_cases(path: &std::path::Path) -> CoreResult<Vec<EvalCase>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CoreError::Invalid(format!("cannot read cases file {}: {e}", path.display())))?;
    serde_json::from_str(&text).map_err(|e| CoreError::Invalid(format!("malformed cases file: {e}")))
}

#[derive(Debug, Serialize)]
pub struct CaseResult {
    pub query: String,
    pub recall_at_k: f64,
    pub reciprocal_rank: f64,
}

#[derive(Debug, Serialize)]
pub struct EvalSummary {
    pub cases: usize,
    pub k: usize,
    pub mean_recall_at_k: f64,
    pub mean_reciprocal_rank: f64,
    pub per_case: Vec<CaseResult>,
}

/// Runs every case once in semantic mode and scores recall@k / MRR against
/// `relevant_document_ids`.
pub async fn run_eval(
    store: &SqliteStore,
    embedder: &dyn EmbeddingProvider,
    vector_index: Option<&BruteForceIndex>,
    cache: &CacheConfig,
    retrieval: &RetrievalConfig,
    cases: &[EvalCase],
    k: usize,
) -> CoreResult<EvalSummary> {
    let mut per_case = Vec::with_capacity(cases.len());
    for case in cases {
        let request = SearchRequest {
            query: case.query.clone(),
            limit: k,
            mode: SearchMode::Semantic,
            include_content: false,
            max_tokens: None,
            section: None,
        };
        let result = retriever::search(store, embedder, vector_index, cache, retrieval, request).await?;
        let ranked_ids: Vec<i64> = result.documents.iter().map(|v| v.document.id).collect();
        per_case.push(score_case(&case.query, &ranked_ids, &case.relevant_document_ids));
    }

    let mean_recall_at_k = mean(per_case.iter().map(|c| c.recall_at_k));
    let mean_reciprocal_rank = mean(per_case.iter().map(|c| c.reciprocal_rank));

    Ok(EvalSummary { cases: cases.len(), k, mean_recall_at_k, mean_reciprocal_rank, per_case })
}

fn score_case(query: &str, ranked_ids: &[i64], relevant: &[i64]) -> CaseResult {
    if relevant.is_empty() {
        return CaseResult { query: query.to_string(), recall_at_k: 1.0, reciprocal_rank: 1.0 };
    }

    let hits = ranked_ids.iter().filter(|id| relevant.contains(id)).count();
    let recall_at_k = hits as f64 / relevant.len() as f64;

    let reciprocal_rank = ranked_ids
        .iter()
        .position(|id| relevant.contains(id))
        .map(|pos| 1.0 / (pos + 1) as f64)
        .unwrap_or(0.0);

    CaseResult { query: query.to_string(), recall_at_k, reciprocal_rank }
}

fn mean(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let count = values.clone().count();
    if count == 0 {
        return 0.0;
    }
    values.sum::<f64>() / count as f64
}

pub fn print_eval_summary_text(summary: &EvalSummary) {
    println!("Retrieval eval — {} cases, k={}", summary.cases, summary.k);
    println!("  mean recall@{}: {:.3}", summary.k, summary.mean_recall_at_k);
    println!("  mean MRR:       {:.3}", summary.mean_reciprocal_rank);
    for case in &summary.per_case {
        println!("    {:<40} recall={:.2} rr={:.2}", truncate(&case.query, 40), case.recall_at_k, case.reciprocal_rank);
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max.saturating_sub(1)).chain(std::iter::once('…')).collect()
    }
}

#[derive(Debug, Serialize)]
pub struct BenchmarkSummary {
    pub cases: usize,
    pub iterations: usize,
    pub mean_recall_at_k: f64,
    pub mean_latency: Duration,
    pub p50_latency: Duration,
    pub p95_latency: Duration,
}

/// Runs every case `iterations` times, measuring wall-clock latency per
/// query, and reports the same recall@k quality numbers alongside timing
/// percentiles.
pub async fn run_benchmark(
    store: &SqliteStore,
    embedder: &dyn EmbeddingProvider,
    vector_index: Option<&BruteForceIndex>,
    cache: &CacheConfig,
    retrieval: &RetrievalConfig,
    cases: &[EvalCase],
    k: usize,
    iterations: usize,
) -> CoreResult<BenchmarkSummary> {
    let mut latencies = Vec::with_capacity(cases.len() * iterations.max(1));
    let mut recalls = Vec::with_capacity(cases.len() * iterations.max(1));

    for _ in 0..iterations.max(1) {
        for case in cases {
            let request = SearchRequest {
                query: case.query.clone(),
                limit: k,
                mode: SearchMode::Semantic,
                include_content: false,
                max_tokens: None,
                section: None,
            };
            let start = Instant::now();
            let result = retriever::search(store, embedder, vector_index, cache, retrieval, request).await?;
            latencies.push(start.elapsed());

            let ranked_ids: Vec<i64> = result.documents.iter().map(|v| v.document.id).collect();
            recalls.push(score_case(&case.query, &ranked_ids, &case.relevant_document_ids).recall_at_k);
        }
    }

    latencies.sort();
    let mean_latency = if latencies.is_empty() {
        Duration::ZERO
    } else {
        latencies.iter().sum::<Duration>() / latencies.len() as u32
    };
    let p50_latency = percentile(&latencies, 0.50);
    let p95_latency = percentile(&latencies, 0.95);

    Ok(BenchmarkSummary {
        cases: cases.len(),
        iterations: iterations.max(1),
        mean_recall_at_k: mean(recalls.into_iter()),
        mean_latency,
        p50_latency,
        p95_latency,
    })
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

pub fn print_benchmark_summary_text(summary: &BenchmarkSummary) {
    println!("Semantic benchmark — {} cases × {} iterations", summary.cases, summary.iterations);
    println!("  mean recall@k: {:.3}", summary.mean_recall_at_k);
    println!("  mean latency:  {:?}", summary.mean_latency);
    println!("  p50 latency:   {:?}", summary.p50_latency);
    println!("  p95 latency:   {:?}", summary.p95_latency);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_case_recall_and_mrr() {
        let result = score_case("q", &[3, 1, 2], &[1, 2]);
        assert_eq!(result.recall_at_k, 1.0);
        assert!((result.reciprocal_rank - 0.5).abs() < 1e-9);
    }

    #[test]
    fn score_case_empty_relevant_set_is_trivially_satisfied() {
        let result = score_case("q", &[1, 2], &[]);
        assert_eq!(result.recall_at_k, 1.0);
        assert_eq!(result.reciprocal_rank, 1.0);
    }

    #[test]
    fn score_case_no_hits() {
        let result = score_case("q", &[9, 8], &[1]);
        assert_eq!(result.recall_at_k, 0.0);
        assert_eq!(result.reciprocal_rank, 0.0);
    }

    #[test]
    fn percentile_picks_bounds() {
        let xs = vec![Duration::from_millis(1), Duration::from_millis(2), Duration::from_millis(3)];
        assert_eq!(percentile(&xs, 0.0), Duration::from_millis(1));
        assert_eq!(percentile(&xs, 1.0), Duration::from_millis(3));
    }
}
