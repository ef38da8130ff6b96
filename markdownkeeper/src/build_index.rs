//! `build-index --output-dir D`: static by-category/by-concept Markdown
//! index generation, plus a snapshot of the vector index.
//!
//! Per-§1's scoping, static index-file generation is an "external
//! collaborator" of the core — it reads the Store's rows but isn't part of
//! the tested core invariants, so this queries `SqliteStore`'s pool directly
//! rather than going through the `Store` trait, the same way the teacher's
//! `export.rs` and `stats.rs` read straight off the pool for reporting.

use std::collections::BTreeMap;
use std::path::Path;

use markdownkeeper_core::error::{CoreError, CoreResult};
use sqlx::Row;

use crate::retriever;
use crate::sqlite_store::SqliteStore;

pub struct BuildIndexSummary {
    pub categories_written: usize,
    pub concepts_written: usize,
    pub vector_index_entries: usize,
}

struct DocEntry {
    id: i64,
    path: String,
    title: String,
    summary: String,
}

pub async fn build_index(
    store: &SqliteStore,
    embedder_dimension: usize,
    output_dir: &Path,
) -> CoreResult<BuildIndexSummary> {
    std::fs::create_dir_all(output_dir)
        .map_err(|e| CoreError::Backend(format!("failed to create {}: {e}", output_dir.display())))?;

    let by_category_dir = output_dir.join("by-category");
    let by_concept_dir = output_dir.join("by-concept");
    std::fs::create_dir_all(&by_category_dir).map_err(|e| CoreError::Backend(e.to_string()))?;
    std::fs::create_dir_all(&by_concept_dir).map_err(|e| CoreError::Backend(e.to_string()))?;

    let category_groups = fetch_by_category(store).await?;
    for (category, docs) in &category_groups {
        let file_name = slug(category.as_deref().unwrap_or("uncategorized"));
        write_index_file(&by_category_dir.join(format!("{file_name}.md")), category.as_deref().unwrap_or("Uncategorized"), docs)?;
    }

    let concept_groups = fetch_by_concept(store).await?;
    for (concept, docs) in &concept_groups {
        write_index_file(&by_concept_dir.join(format!("{}.md", slug(concept))), concept, docs)?;
    }

    let index = retriever::rebuild_vector_index(store, embedder_dimension).await?;
    let vector_index_entries = index.len();
    index
        .save(&output_dir.join("faiss.index.meta.json"))
        .map_err(|e| CoreError::Backend(format!("failed to save vector index: {e}")))?;

    Ok(BuildIndexSummary {
        categories_written: category_groups.len(),
        concepts_written: concept_groups.len(),
        vector_index_entries,
    })
}

async fn fetch_by_category(store: &SqliteStore) -> CoreResult<BTreeMap<Option<String>, Vec<DocEntry>>> {
    let rows = sqlx::query("SELECT id, path, title, summary, category FROM documents ORDER BY category, title")
        .fetch_all(store.pool())
        .await
        .map_err(|e| CoreError::Backend(e.to_string()))?;

    let mut groups: BTreeMap<Option<String>, Vec<DocEntry>> = BTreeMap::new();
    for row in rows {
        let category: Option<String> = row.get("category");
        let entry = DocEntry {
            id: row.get("id"),
            path: row.get("path"),
            title: row.get("title"),
            summary: row.get("summary"),
        };
        groups.entry(category).or_default().push(entry);
    }
    Ok(groups)
}

async fn fetch_by_concept(store: &SqliteStore) -> CoreResult<BTreeMap<String, Vec<DocEntry>>> {
    let rows = sqlx::query(
        r#"
        SELECT dc.concept AS concept, d.id AS id, d.path AS path, d.title AS title, d.summary AS summary
        FROM document_concepts dc
        JOIN documents d ON d.id = dc.document_id
        ORDER BY dc.concept, d.title
        "#,
    )
    .fetch_all(store.pool())
    .await
    .map_err(|e| CoreError::Backend(e.to_string()))?;

    let mut groups: BTreeMap<String, Vec<DocEntry>> = BTreeMap::new();
    for row in rows {
        let concept: String = row.get("concept");
        let entry =
            DocEntry { id: row.get("id"), path: row.get("path"), title: row.get("title"), summary: row.get("summary") };
        groups.entry(concept).or_default().push(entry);
    }
    Ok(groups)
}

fn write_index_file(path: &Path, heading: &str, docs: &[DocEntry]) -> CoreResult<()> {
    let mut body = format!("# {heading}\n\n");
    for doc in docs {
        body.push_str(&format!("- [{}]({}) (#{}) — {}\n", doc.title, doc.path, doc.id, doc.summary));
    }
    std::fs::write(path, body).map_err(|e| CoreError::Backend(format!("failed to write {}: {e}", path.display())))
}

fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_dash = false;
    for ch in text.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_collapses_punctuation() {
        assert_eq!(slug("Kubernetes / Deployment!"), "kubernetes-deployment");
    }

    #[test]
    fn slug_falls_back_for_empty_input() {
        assert_eq!(slug("---"), "untitled");
    }
}
