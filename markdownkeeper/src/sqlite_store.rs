//! SQLite-backed implementation of [`markdownkeeper_core::store::Store`].

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use markdownkeeper_core::embedding::{vec_to_blob, EmbeddingProvider};
use markdownkeeper_core::error::{CoreError, CoreResult};
use markdownkeeper_core::models::{Document, Link, LinkStatus, ParsedDocument};
use markdownkeeper_core::store::{
    ChunkView, DocumentView, EmbeddingCoverage, EventQueueStatus, GetDocumentOptions,
    HealthReport, Store, StoreStats,
};
use sqlx::{Row, SqlitePool};

pub struct SqliteStore {
    pool: SqlitePool,
    database_path: String,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, database_path: String) -> Self {
        Self { pool, database_path }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Keyword candidate chunks for a query, via FTS5 BM25 ranking.
    /// Returns `(document_id, chunk_id)` pairs ordered best-first.
    pub async fn fetch_keyword_candidates(
        &self,
        normalized_query: &str,
        limit: usize,
    ) -> CoreResult<Vec<(i64, i64)>> {
        if normalized_query.is_empty() {
            return Ok(Vec::new());
        }
        let match_query = fts_match_query(normalized_query);
        let rows = sqlx::query(
            r#"
            SELECT document_id, chunk_id
            FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(match_query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<i64, _>("document_id"), row.get::<i64, _>("chunk_id")))
            .collect())
    }

    /// All documents with a stored document-level embedding, for brute-force
    /// vector search. Returns `(document_id, updated_at, vector)`.
    pub async fn all_document_vectors(&self) -> CoreResult<Vec<(i64, DateTime<Utc>, Vec<f32>)>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id AS id, d.updated_at AS updated_at, e.vector AS vector
            FROM documents d
            JOIN embeddings e ON e.owner_kind = 'document' AND e.owner_id = d.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let id: i64 = row.get("id");
                let updated_at: i64 = row.get("updated_at");
                let blob: Vec<u8> = row.get("vector");
                (id, from_unix(updated_at), markdownkeeper_core::embedding::blob_to_vec(&blob))
            })
            .collect())
    }

    /// All chunk embeddings for a document, for `s_chunk` scoring.
    pub async fn chunk_vectors_for_document(&self, document_id: i64) -> CoreResult<Vec<Vec<f32>>> {
        let rows = sqlx::query(
            r#"
            SELECT e.vector AS vector
            FROM chunks c
            JOIN embeddings e ON e.owner_kind = 'chunk' AND e.owner_id = c.id
            WHERE c.document_id = ?
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                markdownkeeper_core::embedding::blob_to_vec(&blob)
            })
            .collect())
    }

    /// Lowercased, deduplicated body tokens for a document (`T_D` in the
    /// lexical score), reconstructed from its chunks.
    pub async fn document_tokens(&self, document_id: i64) -> CoreResult<std::collections::HashSet<String>> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT content FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        Ok(rows
            .iter()
            .flat_map(|content| content.split_whitespace())
            .map(|w| w.to_lowercase())
            .collect())
    }

    pub async fn document_concepts(&self, document_id: i64) -> CoreResult<Vec<String>> {
        sqlx::query_scalar("SELECT concept FROM document_concepts WHERE document_id = ?")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)
    }

    pub async fn document_by_id(&self, id: i64) -> CoreResult<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, path, title, summary, category, token_estimate, content_hash, created_at, updated_at FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(row.map(document_from_row))
    }

    pub async fn cache_lookup(&self, query_hash: &str, ttl_seconds: u64) -> CoreResult<Option<Vec<i64>>> {
        let row = sqlx::query(
            "SELECT created_at, result_document_ids FROM query_cache WHERE query_hash = ?",
        )
        .bind(query_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        let Some(row) = row else { return Ok(None) };
        let created_at: i64 = row.get("created_at");
        let now = Utc::now().timestamp();
        if now - created_at > ttl_seconds as i64 {
            sqlx::query("DELETE FROM query_cache WHERE query_hash = ?")
                .bind(query_hash)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
            return Ok(None);
        }

        let ids_csv: String = row.get("result_document_ids");
        let ids = parse_id_list(&ids_csv);

        sqlx::query(
            "UPDATE query_cache SET hit_count = hit_count + 1, last_accessed = ? WHERE query_hash = ?",
        )
        .bind(now)
        .bind(query_hash)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(Some(ids))
    }

    pub async fn cache_store(&self, query_hash: &str, document_ids: &[i64]) -> CoreResult<()> {
        let now = Utc::now().timestamp();
        let ids_csv = document_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
        sqlx::query(
            r#"
            INSERT INTO query_cache (query_hash, result_document_ids, created_at, last_accessed, hit_count)
            VALUES (?, ?, ?, ?, 0)
            ON CONFLICT(query_hash) DO UPDATE SET
                result_document_ids = excluded.result_document_ids,
                created_at = excluded.created_at,
                last_accessed = excluded.last_accessed,
                hit_count = 0
            "#,
        )
        .bind(query_hash)
        .bind(ids_csv)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    /// Re-embeds a document's chunks and document-level vector in place,
    /// without touching `content_hash`/`updated_at` or any parsed rows.
    ///
    /// `upsert_document` only regenerates embeddings when `content_hash`
    /// changes (idempotence, property 2); an embedding-backend swap leaves
    /// the bytes on disk untouched, so `embeddings-generate` needs this
    /// side door to force regeneration against the document's existing
    /// chunk rows instead of re-running the full upsert.
    pub async fn regenerate_embeddings(&self, document_id: i64, embedder: &dyn EmbeddingProvider) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let now = Utc::now();

        let chunk_rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, content FROM chunks WHERE document_id = ? ORDER BY ordinal ASC")
                .bind(document_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(backend_err)?;

        for (chunk_id, content) in &chunk_rows {
            let vector = embedder.embed(content).await?;
            write_embedding(&mut tx, "chunk", *chunk_id, &vector, embedder.backend_id(), now).await?;
        }

        let title: String = sqlx::query_scalar("SELECT title FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(backend_err)?;

        let doc_embedding_text = if chunk_rows.is_empty() {
            title
        } else {
            chunk_rows.iter().map(|(_, content)| content.as_str()).collect::<Vec<_>>().join("\n\n")
        };
        let doc_vector = embedder.embed(&doc_embedding_text).await?;
        write_embedding(&mut tx, "document", document_id, &doc_vector, embedder.backend_id(), now).await?;

        sqlx::query("DELETE FROM query_cache").execute(&mut *tx).await.map_err(backend_err)?;

        tx.commit().await.map_err(backend_err)?;
        Ok(())
    }
}

fn parse_id_list(csv: &str) -> Vec<i64> {
    csv.split(',').filter(|s| !s.is_empty()).filter_map(|s| s.parse().ok()).collect()
}

fn fts_match_query(normalized_query: &str) -> String {
    normalized_query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn to_unix(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_unix(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

fn backend_err(e: sqlx::Error) -> CoreError {
    CoreError::Retry(e.to_string())
}

fn document_from_row(row: sqlx::sqlite::SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        path: row.get("path"),
        title: row.get("title"),
        summary: row.get("summary"),
        category: row.get("category"),
        token_estimate: row.get("token_estimate"),
        content_hash: row.get("content_hash"),
        created_at: from_unix(row.get("created_at")),
        updated_at: from_unix(row.get("updated_at")),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn initialize(&self) -> CoreResult<()> {
        crate::migrate::migrate_pool(&self.pool).await.map_err(|e| CoreError::Fatal(e.to_string()))
    }

    async fn upsert_document(
        &self,
        path: &str,
        parsed: &ParsedDocument,
        embedder: &dyn EmbeddingProvider,
    ) -> CoreResult<i64> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        let existing: Option<(i64, String)> =
            sqlx::query_as("SELECT id, content_hash FROM documents WHERE path = ?")
                .bind(path)
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend_err)?;

        let now = Utc::now();

        if let Some((doc_id, existing_hash)) = &existing {
            if existing_hash == &parsed.content_hash {
                sqlx::query("UPDATE documents SET updated_at = ? WHERE id = ?")
                    .bind(to_unix(now))
                    .bind(doc_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(backend_err)?;
                tx.commit().await.map_err(backend_err)?;
                return Ok(*doc_id);
            }
        }

        let doc_id = if let Some((doc_id, _)) = existing {
            delete_document_children(&mut tx, doc_id).await?;
            sqlx::query(
                r#"
                UPDATE documents SET title = ?, summary = ?, category = ?, token_estimate = ?,
                    content_hash = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&parsed.title)
            .bind(&parsed.summary)
            .bind(&parsed.category)
            .bind(parsed.token_estimate)
            .bind(&parsed.content_hash)
            .bind(to_unix(now))
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
            doc_id
        } else {
            let result = sqlx::query(
                r#"
                INSERT INTO documents (path, title, summary, category, token_estimate, content_hash, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(path)
            .bind(&parsed.title)
            .bind(&parsed.summary)
            .bind(&parsed.category)
            .bind(parsed.token_estimate)
            .bind(&parsed.content_hash)
            .bind(to_unix(now))
            .bind(to_unix(now))
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
            result.last_insert_rowid()
        };

        for heading in &parsed.headings {
            sqlx::query(
                "INSERT INTO headings (document_id, ordinal, level, text, anchor) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(doc_id)
            .bind(heading.ordinal)
            .bind(heading.level as i64)
            .bind(&heading.text)
            .bind(&heading.anchor)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        }

        for (ordinal, link) in parsed.links.iter().enumerate() {
            sqlx::query(
                "INSERT INTO links (document_id, ordinal, target, is_external, status) VALUES (?, ?, ?, ?, 'unknown')",
            )
            .bind(doc_id)
            .bind(ordinal as i64)
            .bind(&link.target)
            .bind(link.is_external)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        }

        for tag in &parsed.tags {
            sqlx::query("INSERT OR IGNORE INTO document_tags (document_id, tag) VALUES (?, ?)")
                .bind(doc_id)
                .bind(tag.to_lowercase())
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
        }

        for concept in &parsed.concepts {
            sqlx::query("INSERT OR IGNORE INTO document_concepts (document_id, concept) VALUES (?, ?)")
                .bind(doc_id)
                .bind(concept.to_lowercase())
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
        }

        let mut chunk_ids = Vec::with_capacity(parsed.chunks.len());
        for chunk in &parsed.chunks {
            let result = sqlx::query(
                "INSERT INTO chunks (document_id, ordinal, heading_path, content, token_estimate) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(doc_id)
            .bind(chunk.ordinal)
            .bind(&chunk.heading_path)
            .bind(&chunk.content)
            .bind(chunk.token_estimate)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
            let chunk_id = result.last_insert_rowid();
            chunk_ids.push(chunk_id);

            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, content) VALUES (?, ?, ?)")
                .bind(chunk_id)
                .bind(doc_id)
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
        }

        for (chunk_id, chunk) in chunk_ids.iter().zip(parsed.chunks.iter()) {
            let vector = embedder.embed(&chunk.content).await?;
            write_embedding(&mut tx, "chunk", *chunk_id, &vector, embedder.backend_id(), now).await?;
        }

        let doc_embedding_text = if parsed.chunks.is_empty() {
            parsed.title.clone()
        } else {
            parsed
                .chunks
                .iter()
                .map(|c| c.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        };
        let doc_vector = embedder.embed(&doc_embedding_text).await?;
        write_embedding(&mut tx, "document", doc_id, &doc_vector, embedder.backend_id(), now).await?;

        sqlx::query("DELETE FROM query_cache").execute(&mut *tx).await.map_err(backend_err)?;

        tx.commit().await.map_err(backend_err)?;
        Ok(doc_id)
    }

    async fn delete_by_path(&self, path: &str) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        let doc_id: Option<i64> = sqlx::query_scalar("SELECT id FROM documents WHERE path = ?")
            .bind(path)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend_err)?;

        let Some(doc_id) = doc_id else {
            tx.commit().await.map_err(backend_err)?;
            return Ok(false);
        };

        delete_document_children(&mut tx, doc_id).await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        sqlx::query("DELETE FROM query_cache").execute(&mut *tx).await.map_err(backend_err)?;

        tx.commit().await.map_err(backend_err)?;
        Ok(true)
    }

    async fn get_document(
        &self,
        id: i64,
        options: GetDocumentOptions,
    ) -> CoreResult<Option<DocumentView>> {
        let Some(document) = self.document_by_id(id).await? else {
            return Ok(None);
        };

        let headings: Vec<String> = sqlx::query_scalar(
            "SELECT text FROM headings WHERE document_id = ? ORDER BY ordinal",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        let tags: Vec<String> = sqlx::query_scalar(
            "SELECT tag FROM document_tags WHERE document_id = ? ORDER BY tag",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        let concepts = self.document_concepts(id).await?;

        let chunks = if options.include_content {
            let rows: Vec<(String, String, i64)> = sqlx::query_as(
                "SELECT heading_path, content, token_estimate FROM chunks WHERE document_id = ? ORDER BY ordinal",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

            Some(apply_section_and_budget(rows, options.section.as_deref(), options.max_tokens))
        } else {
            None
        };

        Ok(Some(DocumentView { document, headings, tags, concepts, chunks }))
    }

    async fn list_by_concept(&self, concept: &str, limit: usize) -> CoreResult<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id AS id, d.path AS path, d.title AS title, d.summary AS summary,
                   d.category AS category, d.token_estimate AS token_estimate,
                   d.content_hash AS content_hash, d.created_at AS created_at, d.updated_at AS updated_at
            FROM documents d
            JOIN document_concepts dc ON dc.document_id = d.id
            WHERE dc.concept = ?
            ORDER BY d.updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(concept.to_lowercase())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(rows.into_iter().map(document_from_row).collect())
    }

    async fn stats(&self) -> CoreResult<StoreStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let headings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM headings")
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM links")
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let embeddings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let broken_links: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM links WHERE status = 'broken'")
                .fetch_one(&self.pool)
                .await
                .map_err(backend_err)?;

        Ok(StoreStats {
            documents: documents as u64,
            headings: headings as u64,
            links: links as u64,
            chunks: chunks as u64,
            embeddings: embeddings as u64,
            broken_links: broken_links as u64,
        })
    }

    async fn health_report(&self) -> CoreResult<HealthReport> {
        let stats = self.stats().await?;
        let event_queue = self.event_queue_status().await?;
        let database_bytes = std::fs::metadata(&self.database_path).map(|m| m.len()).unwrap_or(0);
        let stale_embedding_backends: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT backend FROM embeddings")
                .fetch_all(&self.pool)
                .await
                .map_err(backend_err)?;

        Ok(HealthReport {
            database_path: self.database_path.clone(),
            database_bytes,
            stats,
            event_queue,
            stale_embedding_backends,
        })
    }

    async fn embedding_coverage(&self) -> CoreResult<EmbeddingCoverage> {
        let documents_total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let documents_embedded: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE owner_kind = 'document'")
                .fetch_one(&self.pool)
                .await
                .map_err(backend_err)?;
        let chunks_total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let chunks_embedded: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE owner_kind = 'chunk'")
                .fetch_one(&self.pool)
                .await
                .map_err(backend_err)?;

        Ok(EmbeddingCoverage {
            documents_total: documents_total as u64,
            documents_embedded: documents_embedded as u64,
            chunks_total: chunks_total as u64,
            chunks_embedded: chunks_embedded as u64,
        })
    }

    async fn event_queue_status(&self) -> CoreResult<EventQueueStatus> {
        let mut status = EventQueueStatus::default();
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM event_log GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(backend_err)?;
        for (kind, count) in rows {
            match kind.as_str() {
                "queued" => status.queued = count as u64,
                "in_flight" => status.in_flight = count as u64,
                "done" => status.done = count as u64,
                "failed" => status.failed = count as u64,
                _ => {}
            }
        }
        Ok(status)
    }

    async fn list_links(&self) -> CoreResult<Vec<Link>> {
        let rows = sqlx::query(
            "SELECT document_id, target, is_external, status, checked_at FROM links ORDER BY document_id, ordinal",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(rows.into_iter().map(link_from_row).collect())
    }

    async fn list_links_for_document(&self, document_id: i64) -> CoreResult<Vec<Link>> {
        let rows = sqlx::query(
            "SELECT document_id, target, is_external, status, checked_at FROM links WHERE document_id = ? ORDER BY ordinal",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(rows.into_iter().map(link_from_row).collect())
    }

    async fn set_link_status(
        &self,
        document_id: i64,
        target: &str,
        status: LinkStatus,
    ) -> CoreResult<()> {
        let now = to_unix(Utc::now());
        sqlx::query(
            "UPDATE links SET status = ?, checked_at = ? WHERE document_id = ? AND target = ?",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(document_id)
        .bind(target)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }
}

fn link_from_row(row: sqlx::sqlite::SqliteRow) -> Link {
    let checked_at: Option<i64> = row.get("checked_at");
    let status: String = row.get("status");
    Link {
        document_id: row.get("document_id"),
        target: row.get("target"),
        is_external: row.get("is_external"),
        status: link_status_from_str(&status),
        checked_at: checked_at.map(from_unix),
    }
}

fn link_status_from_str(s: &str) -> LinkStatus {
    match s {
        "ok" => LinkStatus::Ok,
        "broken" => LinkStatus::Broken,
        _ => LinkStatus::Unknown,
    }
}

async fn delete_document_children(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    doc_id: i64,
) -> CoreResult<()> {
    sqlx::query(
        "DELETE FROM embeddings WHERE owner_kind = 'chunk' AND owner_id IN (SELECT id FROM chunks WHERE document_id = ?)",
    )
    .bind(doc_id)
    .execute(&mut **tx)
    .await
    .map_err(backend_err)?;
    sqlx::query("DELETE FROM embeddings WHERE owner_kind = 'document' AND owner_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await
        .map_err(backend_err)?;
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await
        .map_err(backend_err)?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await
        .map_err(backend_err)?;
    sqlx::query("DELETE FROM headings WHERE document_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await
        .map_err(backend_err)?;
    sqlx::query("DELETE FROM links WHERE document_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await
        .map_err(backend_err)?;
    sqlx::query("DELETE FROM document_tags WHERE document_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await
        .map_err(backend_err)?;
    sqlx::query("DELETE FROM document_concepts WHERE document_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await
        .map_err(backend_err)?;
    Ok(())
}

async fn write_embedding(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    owner_kind: &str,
    owner_id: i64,
    vector: &[f32],
    backend: &str,
    generated_at: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO embeddings (owner_kind, owner_id, backend, dimension, vector, generated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(owner_kind, owner_id) DO UPDATE SET
            backend = excluded.backend,
            dimension = excluded.dimension,
            vector = excluded.vector,
            generated_at = excluded.generated_at
        "#,
    )
    .bind(owner_kind)
    .bind(owner_id)
    .bind(backend)
    .bind(vector.len() as i64)
    .bind(vec_to_blob(vector))
    .bind(to_unix(generated_at))
    .execute(&mut **tx)
    .await
    .map_err(backend_err)?;
    Ok(())
}

/// Filter chunks by `section` (case-insensitive substring of `heading_path`)
/// then greedily include whole chunks up to `max_tokens`.
fn apply_section_and_budget(
    rows: Vec<(String, String, i64)>,
    section: Option<&str>,
    max_tokens: Option<usize>,
) -> Vec<ChunkView> {
    let filtered: Vec<(String, String, i64)> = match section {
        Some(needle) => {
            let needle = needle.to_lowercase();
            rows.into_iter()
                .filter(|(heading_path, _, _)| heading_path.to_lowercase().contains(&needle))
                .collect()
        }
        None => rows,
    };

    let Some(budget) = max_tokens else {
        return filtered
            .into_iter()
            .map(|(heading_path, content, _)| ChunkView { heading_path, content })
            .collect();
    };

    let mut out = Vec::new();
    let mut used = 0usize;
    for (heading_path, content, token_estimate) in filtered {
        let tokens = token_estimate.max(0) as usize;
        if !out.is_empty() && used + tokens > budget {
            break;
        }
        used += tokens;
        out.push(ChunkView { heading_path, content });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_filter_matches_case_insensitively() {
        let rows = vec![
            ("Install/Steps".to_string(), "run cargo build".to_string(), 3),
            ("Install/Prereqs".to_string(), "need rust".to_string(), 2),
        ];
        let out = apply_section_and_budget(rows, Some("steps"), None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "run cargo build");
    }

    #[test]
    fn budget_always_includes_at_least_one_chunk() {
        let rows = vec![("p".to_string(), "a".repeat(500), 200)];
        let out = apply_section_and_budget(rows, None, Some(10));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn budget_stops_before_exceeding() {
        let rows = vec![
            ("p".to_string(), "one".to_string(), 50),
            ("p".to_string(), "two".to_string(), 60),
        ];
        let out = apply_section_and_budget(rows, None, Some(50));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "one");
    }
}
