//! `embeddings-generate` / `embeddings-status`: on-demand embedding
//! regeneration and coverage reporting.
//!
//! The ingestor already embeds every document/chunk inline on upsert, so
//! these commands exist for one case the watch loop doesn't handle itself:
//! the active embedding backend changed (a different model, or hash
//! fallback swapped for a model backend) and documents embedded under the
//! old backend need to be re-embedded under the new one. Grounded on the
//! teacher's `embed_cmd.rs` batch/dry-run pattern, adapted from "embed
//! whatever has no vector yet" to "embed whatever was embedded under a
//! different backend id than the one currently active."

use markdownkeeper_core::embedding::EmbeddingProvider;
use markdownkeeper_core::error::{CoreError, CoreResult};
use serde::Serialize;
use sqlx::Row;

use crate::progress::{ProgressEvent, ProgressReporter};
use crate::sqlite_store::SqliteStore;

#[derive(Serialize)]
pub struct EmbeddingsStatus {
    pub active_backend: String,
    pub documents_total: u64,
    pub documents_current: u64,
    pub documents_stale: u64,
    pub stale_backends_present: Vec<String>,
}

pub async fn embeddings_status(store: &SqliteStore, embedder: &dyn EmbeddingProvider) -> CoreResult<EmbeddingsStatus> {
    let stale_documents = find_stale_documents(store, embedder.backend_id()).await?;
    let documents_total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(store.pool())
        .await
        .map_err(|e| CoreError::Backend(e.to_string()))?;

    let stale_backends_present: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT backend FROM embeddings WHERE backend != ?",
    )
    .bind(embedder.backend_id())
    .fetch_all(store.pool())
    .await
    .map_err(|e| CoreError::Backend(e.to_string()))?;

    let documents_total = documents_total as u64;
    let documents_stale = stale_documents.len() as u64;
    Ok(EmbeddingsStatus {
        active_backend: embedder.backend_id().to_string(),
        documents_total,
        documents_current: documents_total.saturating_sub(documents_stale),
        documents_stale,
        stale_backends_present,
    })
}

pub fn print_embeddings_status_text(status: &EmbeddingsStatus) {
    println!("Active embedding backend: {}", status.active_backend);
    println!("  documents:        {}", status.documents_total);
    println!("  up to date:       {}", status.documents_current);
    println!("  stale:            {}", status.documents_stale);
    if !status.stale_backends_present.is_empty() {
        println!("  stale backends:   {}", status.stale_backends_present.join(", "));
    }
}

/// Re-embeds every document whose stored backend id no longer matches the
/// active embedder, via [`SqliteStore::regenerate_embeddings`] rather than
/// a full re-parse/upsert (bytes on disk haven't changed, only the
/// backend). Returns the number of documents regenerated.
pub async fn embeddings_generate(
    store: &SqliteStore,
    embedder: &dyn EmbeddingProvider,
    progress: &dyn ProgressReporter,
) -> CoreResult<u64> {
    let stale_documents = find_stale_documents(store, embedder.backend_id()).await?;
    let total = stale_documents.len() as u64;
    for (n, (document_id, _path)) in stale_documents.iter().enumerate() {
        progress.report(ProgressEvent::Embedding { n: n as u64, total });
        store.regenerate_embeddings(*document_id, embedder).await?;
    }
    if total > 0 {
        progress.report(ProgressEvent::Embedding { n: total, total });
    }
    Ok(total)
}

async fn find_stale_documents(store: &SqliteStore, active_backend: &str) -> CoreResult<Vec<(i64, String)>> {
    let rows = sqlx::query(
        r#"
        SELECT d.id AS id, d.path AS path
        FROM documents d
        LEFT JOIN embeddings e
            ON e.owner_kind = 'document' AND e.owner_id = d.id AND e.backend = ?
        WHERE e.owner_id IS NULL
        "#,
    )
    .bind(active_backend)
    .fetch_all(store.pool())
    .await
    .map_err(|e| CoreError::Backend(e.to_string()))?;

    Ok(rows.into_iter().map(|row| (row.get("id"), row.get("path"))).collect())
}
