//! The Ingestor: the sole writer of Document/Heading/Link/Tag/Concept/Chunk/
//! Embedding rows, driven by leased [`crate::event_queue::LeasedEvent`]s.

use markdownkeeper_core::embedding::EmbeddingProvider;
use markdownkeeper_core::error::{CoreError, CoreResult};
use markdownkeeper_core::models::EventKind;
use markdownkeeper_core::parser;
use markdownkeeper_core::store::Store;

use crate::event_queue::LeasedEvent;

/// Runs one coalesced event to completion. Filesystem reads use the file's
/// current bytes without locking: a read that fails mid-burst returns
/// `Retry` so the Event Queue backs off and tries again later.
pub async fn ingest_event(
    store: &dyn Store,
    embedder: &dyn EmbeddingProvider,
    event: &LeasedEvent,
) -> CoreResult<()> {
    match event.kind {
        EventKind::Create | EventKind::Modify => ingest_path(store, embedder, &event.path).await,
        EventKind::Delete => {
            store.delete_by_path(&event.path).await?;
            Ok(())
        }
        EventKind::Move => {
            store.delete_by_path(&event.path).await?;
            let dst = event
                .new_path
                .as_deref()
                .ok_or_else(|| CoreError::Invalid("move event missing new_path".to_string()))?;
            ingest_path(store, embedder, dst).await
        }
    }
}

async fn ingest_path(store: &dyn Store, embedder: &dyn EmbeddingProvider, path: &str) -> CoreResult<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CoreError::Retry(format!("{path}: {e}")))?;

    let parsed = parser::parse(&text);
    store.upsert_document(path, &parsed, embedder).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use markdownkeeper_core::models::{Document, Link, LinkStatus, ParsedDocument};
    use markdownkeeper_core::store::{
        ChunkView, DocumentView, EmbeddingCoverage, EventQueueStatus, GetDocumentOptions,
        HealthReport, StoreStats,
    };
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    struct FakeEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FakeEmbedder {
        async fn embed(&self, _text: &str) -> CoreResult<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
        fn dimension(&self) -> usize {
            2
        }
        fn backend_id(&self) -> &str {
            "hash-v1"
        }
    }

    #[derive(Default)]
    struct FakeStore {
        upserted: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn initialize(&self) -> CoreResult<()> {
            Ok(())
        }
        async fn upsert_document(
            &self,
            path: &str,
            _parsed: &ParsedDocument,
            _embedder: &dyn EmbeddingProvider,
        ) -> CoreResult<i64> {
            self.upserted.lock().unwrap().push(path.to_string());
            Ok(1)
        }
        async fn delete_by_path(&self, path: &str) -> CoreResult<bool> {
            self.deleted.lock().unwrap().push(path.to_string());
            Ok(true)
        }
        async fn get_document(
            &self,
            _id: i64,
            _options: GetDocumentOptions,
        ) -> CoreResult<Option<DocumentView>> {
            Ok(None)
        }
        async fn list_by_concept(&self, _concept: &str, _limit: usize) -> CoreResult<Vec<Document>> {
            Ok(Vec::new())
        }
        async fn stats(&self) -> CoreResult<StoreStats> {
            Ok(StoreStats::default())
        }
        async fn health_report(&self) -> CoreResult<HealthReport> {
            Ok(HealthReport::default())
        }
        async fn embedding_coverage(&self) -> CoreResult<EmbeddingCoverage> {
            Ok(EmbeddingCoverage::default())
        }
        async fn event_queue_status(&self) -> CoreResult<EventQueueStatus> {
            Ok(EventQueueStatus::default())
        }
        async fn list_links(&self) -> CoreResult<Vec<Link>> {
            Ok(Vec::new())
        }
        async fn list_links_for_document(&self, _document_id: i64) -> CoreResult<Vec<Link>> {
            Ok(Vec::new())
        }
        async fn set_link_status(
            &self,
            _document_id: i64,
            _target: &str,
            _status: LinkStatus,
        ) -> CoreResult<()> {
            Ok(())
        }
    }

    fn leased(kind: EventKind, path: &str, new_path: Option<&str>) -> LeasedEvent {
        LeasedEvent {
            id: 1,
            path: path.to_string(),
            kind,
            new_path: new_path.map(|s| s.to_string()),
            attempt_count: 0,
        }
    }

    #[tokio::test]
    async fn create_reads_and_upserts() {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"# Alpha\nbody text").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let store = FakeStore::default();
        let embedder = FakeEmbedder;
        let event = leased(EventKind::Create, &path, None);

        ingest_event(&store, &embedder, &event).await.unwrap();
        assert_eq!(store.upserted.lock().unwrap().as_slice(), &[path]);
    }

    #[tokio::test]
    async fn missing_file_yields_retry() {
        let store = FakeStore::default();
        let embedder = FakeEmbedder;
        let event = leased(EventKind::Modify, "/nonexistent/path/does-not-exist.md", None);

        let err = ingest_event(&store, &embedder, &event).await.unwrap_err();
        assert!(matches!(err, CoreError::Retry(_)));
    }

    #[tokio::test]
    async fn delete_calls_store_delete() {
        let store = FakeStore::default();
        let embedder = FakeEmbedder;
        let event = leased(EventKind::Delete, "/some/path.md", None);

        ingest_event(&store, &embedder, &event).await.unwrap();
        assert_eq!(store.deleted.lock().unwrap().as_slice(), &["/some/path.md".to_string()]);
    }

    #[tokio::test]
    async fn move_deletes_source_then_ingests_destination() {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"# Beta\nmoved body").unwrap();
        let dst = file.path().to_str().unwrap().to_string();

        let store = FakeStore::default();
        let embedder = FakeEmbedder;
        let event = leased(EventKind::Move, "/old/path.md", Some(&dst));

        ingest_event(&store, &embedder, &event).await.unwrap();
        assert_eq!(store.deleted.lock().unwrap().as_slice(), &["/old/path.md".to_string()]);
        assert_eq!(store.upserted.lock().unwrap().as_slice(), &[dst]);
    }
}
