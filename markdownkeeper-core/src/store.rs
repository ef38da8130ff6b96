//! The storage abstraction implemented by the SQLite-backed Store in the
//! application crate (and by an in-memory fake in tests).

use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::CoreResult;
use crate::models::{Document, Link, LinkStatus, ParsedDocument};

/// Options for [`Store::get_document`], mirroring the CLI/API knobs that
/// control progressive delivery.
#[derive(Debug, Clone, Default)]
pub struct GetDocumentOptions {
    pub include_content: bool,
    pub max_tokens: Option<usize>,
    pub section: Option<String>,
}

/// A chunk as returned alongside a document view, already filtered by
/// `section` and truncated by `max_tokens` if requested.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkView {
    pub heading_path: String,
    pub content: String,
}

/// The full read-side view of a document used by `get_document`,
/// `check-links`, and the JSON-RPC `get_document` method.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentView {
    pub document: Document,
    pub headings: Vec<String>,
    pub tags: Vec<String>,
    pub concepts: Vec<String>,
    pub chunks: Option<Vec<ChunkView>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub documents: u64,
    pub headings: u64,
    pub links: u64,
    pub chunks: u64,
    pub embeddings: u64,
    pub broken_links: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub database_path: String,
    pub database_bytes: u64,
    pub stats: StoreStatsSummary,
    pub event_queue: EventQueueStatus,
    pub stale_embedding_backends: Vec<String>,
}

/// Plain-data mirror of [`StoreStats`] that derives `PartialEq`/`Eq`
/// without pulling `u64` equality edge cases into `HealthReport` itself.
pub type StoreStatsSummary = StoreStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbeddingCoverage {
    pub documents_total: u64,
    pub documents_embedded: u64,
    pub chunks_total: u64,
    pub chunks_embedded: u64,
}

impl EmbeddingCoverage {
    pub fn document_fraction(&self) -> f64 {
        if self.documents_total == 0 {
            return 1.0;
        }
        self.documents_embedded as f64 / self.documents_total as f64
    }

    pub fn chunk_fraction(&self) -> f64 {
        if self.chunks_total == 0 {
            return 1.0;
        }
        self.chunks_embedded as f64 / self.chunks_total as f64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventQueueStatus {
    pub queued: u64,
    pub in_flight: u64,
    pub done: u64,
    pub failed: u64,
}

/// The Store owns all durable state: documents, headings, links, tags,
/// concepts, chunks, embeddings, the query cache, and the event log.
///
/// Implementations must uphold the invariants in the data model: a single
/// writer per mutation, query-cache flush in the same transaction as any
/// document mutation, and cascading deletes.
#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotent schema create/migrate. Additive migrations only; must
    /// never destroy existing data.
    async fn initialize(&self) -> CoreResult<()>;

    /// Transactional upsert: if `content_hash` is unchanged, touch
    /// `updated_at` only; otherwise replace headings/links/tags/concepts/
    /// chunks, recompute embeddings via `embedder`, and flush the query
    /// cache. Returns the document id.
    async fn upsert_document(
        &self,
        path: &str,
        parsed: &ParsedDocument,
        embedder: &dyn EmbeddingProvider,
    ) -> CoreResult<i64>;

    /// Deletes the document at `path` and cascades to its headings, links,
    /// chunks, and embeddings; flushes the query cache. Returns whether a
    /// row existed.
    async fn delete_by_path(&self, path: &str) -> CoreResult<bool>;

    async fn get_document(
        &self,
        id: i64,
        options: GetDocumentOptions,
    ) -> CoreResult<Option<DocumentView>>;

    async fn list_by_concept(&self, concept: &str, limit: usize) -> CoreResult<Vec<Document>>;

    async fn stats(&self) -> CoreResult<StoreStats>;

    async fn health_report(&self) -> CoreResult<HealthReport>;

    async fn embedding_coverage(&self) -> CoreResult<EmbeddingCoverage>;

    async fn event_queue_status(&self) -> CoreResult<EventQueueStatus>;

    /// All links across all documents, for `check-links` to walk.
    async fn list_links(&self) -> CoreResult<Vec<Link>>;

    /// Links belonging to a single document, for a scoped `check-links` run.
    async fn list_links_for_document(&self, document_id: i64) -> CoreResult<Vec<Link>>;

    /// Records the outcome of checking one link. `checked_at` is the check
    /// time, not a document mutation, so this does not flush the query cache.
    async fn set_link_status(
        &self,
        document_id: i64,
        target: &str,
        status: LinkStatus,
    ) -> CoreResult<()>;
}
