//! Vector index: an abstraction over nearest-neighbor search on document
//! embeddings, per §9's design note (`{build, add, search, save, load}`).
//!
//! No ANN crate (hnsw, faiss, instant-distance, usearch) appears in any
//! example repo's dependency tree, so this is the only implementation: exact
//! brute-force cosine search over an in-memory table. Per §9, results must be
//! identical whether the index is present or absent — trivially true here
//! since both paths run the same scan.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use markdownkeeper_core::embedding::cosine_similarity_clamped;
use serde::{Deserialize, Serialize};

struct Entry {
    document_id: i64,
    updated_at: DateTime<Utc>,
    vector: Vec<f32>,
}

/// Exact nearest-neighbor index over document-level embeddings.
#[derive(Default)]
pub struct BruteForceIndex {
    dimension: usize,
    entries: Vec<Entry>,
}

impl BruteForceIndex {
    pub fn new(dimension: usize) -> Self {
        Self { dimension, entries: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Replaces the index contents wholesale, as from a full Store scan.
    pub fn build(&mut self, vectors: Vec<(i64, DateTime<Utc>, Vec<f32>)>) {
        self.entries = vectors
            .into_iter()
            .map(|(document_id, updated_at, vector)| Entry { document_id, updated_at, vector })
            .collect();
    }

    /// Inserts a document's vector, replacing any existing entry for it.
    pub fn add(&mut self, document_id: i64, updated_at: DateTime<Utc>, vector: Vec<f32>) {
        match self.entries.iter_mut().find(|e| e.document_id == document_id) {
            Some(existing) => {
                existing.updated_at = updated_at;
                existing.vector = vector;
            }
            None => self.entries.push(Entry { document_id, updated_at, vector }),
        }
    }

    pub fn remove(&mut self, document_id: i64) {
        self.entries.retain(|e| e.document_id != document_id);
    }

    /// Returns up to `k` `(document_id, updated_at, s_vec)` triples ordered
    /// by cosine similarity to `query`, clamped per the scoring contract.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(i64, DateTime<Utc>, f32)> {
        let mut scored: Vec<(i64, DateTime<Utc>, f32)> = self
            .entries
            .iter()
            .map(|e| (e.document_id, e.updated_at, cosine_similarity_clamped(query, &e.vector)))
            .collect();
        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// Persists to the spec's sibling-file name `faiss.index.meta.json`
    /// (JSON fallback, since no native ANN library is linked).
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let persisted = Persisted {
            dimensions: self.dimension,
            id_map: self.entries.iter().map(|e| e.document_id).collect(),
            updated_at: self.entries.iter().map(|e| e.updated_at.timestamp()).collect(),
            embeddings: self.entries.iter().map(|e| e.vector.clone()).collect(),
        };
        let json = serde_json::to_vec(&persisted)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        let persisted: Persisted = serde_json::from_slice(&bytes)?;
        let entries = persisted
            .id_map
            .into_iter()
            .zip(persisted.updated_at)
            .zip(persisted.embeddings)
            .map(|((document_id, ts), vector)| Entry {
                document_id,
                updated_at: Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now),
                vector,
            })
            .collect();
        Ok(Self { dimension: persisted.dimensions, entries })
    }
}

#[derive(Serialize, Deserialize)]
struct Persisted {
    dimensions: usize,
    id_map: Vec<i64>,
    updated_at: Vec<i64>,
    embeddings: Vec<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, vector: Vec<f32>) -> (i64, DateTime<Utc>, Vec<f32>) {
        (id, Utc::now(), vector)
    }

    #[test]
    fn search_orders_by_similarity_descending() {
        let mut index = BruteForceIndex::new(2);
        index.build(vec![entry(1, vec![0.0, 1.0]), entry(2, vec![1.0, 0.0]), entry(3, vec![0.7, 0.7])]);

        let results = index.search(&[1.0, 0.0], 2);
        assert_eq!(results[0].0, 2);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn add_replaces_existing_entry() {
        let mut index = BruteForceIndex::new(2);
        index.add(1, Utc::now(), vec![1.0, 0.0]);
        index.add(1, Utc::now(), vec![0.0, 1.0]);
        assert_eq!(index.len(), 1);
        let results = index.search(&[0.0, 1.0], 1);
        assert!((results[0].2 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn remove_drops_entry() {
        let mut index = BruteForceIndex::new(2);
        index.add(1, Utc::now(), vec![1.0, 0.0]);
        index.remove(1);
        assert!(index.is_empty());
    }

    #[test]
    fn save_and_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faiss.index.meta.json");

        let mut index = BruteForceIndex::new(2);
        index.build(vec![entry(1, vec![1.0, 0.0]), entry(2, vec![0.0, 1.0])]);
        index.save(&path).unwrap();

        let loaded = BruteForceIndex::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        let results = loaded.search(&[1.0, 0.0], 1);
        assert_eq!(results[0].0, 1);
    }
}
