//! Embedding backends: a model-backed embedder (preferred) and a
//! deterministic hash-based fallback. Both implement
//! [`markdownkeeper_core::embedding::EmbeddingProvider`].

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use markdownkeeper_core::embedding::{l2_normalize, EmbeddingProvider};
use markdownkeeper_core::error::{CoreError, CoreResult};
use markdownkeeper_core::search::normalize_query;

use crate::config::EmbeddingsConfig;

/// Deterministic fallback embedder: no model download, no network, stable
/// across processes. Used when `embeddings.backend = "hash-v1"` or when the
/// model backend fails to initialize.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let normalized = normalize_query(text);
        // Per-occurrence accumulation, not the deduplicated token set scoring
        // uses for lexical overlap: a repeated word should add weight again.
        for token in normalized.split_whitespace() {
            let mut hasher = Sha256::new();
            hasher.update(token.as_bytes());
            let digest = hasher.finalize();
            let index_bytes: [u8; 8] = digest[..8].try_into().expect("sha256 digest is 32 bytes");
            let index = (u64::from_be_bytes(index_bytes) as usize) % self.dimension;
            vector[index] += 1.0;
        }
        Ok(l2_normalize(vector))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn backend_id(&self) -> &str {
        "hash-v1"
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> CoreResult<fastembed::EmbeddingModel> {
    match name {
        "all-MiniLM-L6-v2" | "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => Err(CoreError::Backend(format!(
            "unknown embeddings.model: '{other}'. Supported: all-MiniLM-L6-v2, bge-small-en-v1.5, \
             bge-base-en-v1.5, bge-large-en-v1.5, nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large"
        ))),
    }
}

fn model_dimension(name: &str) -> usize {
    match name {
        "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5"
        | "multilingual-e5-base" => 768,
        "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
        _ => 384,
    }
}

/// Wraps a local `fastembed` sentence-embedding model. The model is loaded
/// lazily on first use (and may block on a one-time download), guarded by a
/// mutex since `fastembed::TextEmbedding::embed` takes `&mut self`.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct ModelEmbedder {
    model_name: String,
    dimension: usize,
    backend_id: String,
    inner: Mutex<Option<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl ModelEmbedder {
    pub fn new(model_name: &str) -> Self {
        let dimension = model_dimension(model_name);
        Self {
            model_name: model_name.to_string(),
            dimension,
            backend_id: format!("model:{model_name}"),
            inner: Mutex::new(None),
        }
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for ModelEmbedder {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        let mut guard = self.inner.lock().await;
        if guard.is_none() {
            let model_name = self.model_name.clone();
            let loaded = tokio::task::spawn_blocking(move || {
                let fastembed_model = config_to_fastembed_model(&model_name)?;
                fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(fastembed_model).with_show_download_progress(true),
                )
                .map_err(|e| CoreError::Backend(format!("failed to initialize local embedding model: {e}")))
            })
            .await
            .map_err(|e| CoreError::Backend(format!("embedding model init task panicked: {e}")))??;
            *guard = Some(loaded);
        }

        let model = guard.as_mut().expect("initialized above");
        let mut embeddings = model
            .embed(vec![text.to_string()], None)
            .map_err(|e| CoreError::Backend(format!("local embedding failed: {e}")))?;
        let vector = embeddings
            .pop()
            .ok_or_else(|| CoreError::Backend("empty embedding response".to_string()))?;
        Ok(l2_normalize(vector))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn backend_id(&self) -> &str {
        &self.backend_id
    }
}

/// Builds the active embedder per `[embeddings]` config: `"model"` wraps
/// [`ModelEmbedder`], `"hash-v1"` uses [`HashEmbedder`] at the model's
/// dimension so query/document vectors stay comparable if the backend is
/// later switched back.
pub fn create_embedder(config: &EmbeddingsConfig) -> Box<dyn EmbeddingProvider> {
    let dimension = model_dimension(&config.model);
    if config.is_model_backed() {
        #[cfg(feature = "local-embeddings-fastembed")]
        {
            return Box::new(ModelEmbedder::new(&config.model));
        }
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        {
            tracing::warn!(
                "embeddings.backend = 'model' but this build has no local model feature enabled; \
                 falling back to hash-v1"
            );
        }
    }
    Box::new(HashEmbedder::new(dimension))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(32);
        let a = embedder.embed("kubernetes deployment guide").await.unwrap();
        let b = embedder.embed("kubernetes deployment guide").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn hash_embedder_is_unit_norm() {
        let embedder = HashEmbedder::new(32);
        let v = embedder.embed("alpha beta gamma").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3 || norm == 0.0);
    }

    #[tokio::test]
    async fn hash_embedder_weights_repeated_tokens() {
        let embedder = HashEmbedder::new(32);
        let single = embedder.embed("kubernetes deployment").await.unwrap();
        let repeated = embedder.embed("kubernetes kubernetes deployment").await.unwrap();
        assert_ne!(
            single, repeated,
            "a repeated token must add extra weight, not collapse to the same vector"
        );
    }

    #[tokio::test]
    async fn hash_embedder_empty_text_yields_zero_vector() {
        let embedder = HashEmbedder::new(32);
        let v = embedder.embed("").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn backend_id_reports_hash_v1() {
        let embedder = HashEmbedder::default();
        assert_eq!(embedder.backend_id(), "hash-v1");
    }

    #[test]
    fn model_dimension_table_matches_known_models() {
        assert_eq!(model_dimension("all-MiniLM-L6-v2"), 384);
        assert_eq!(model_dimension("bge-large-en-v1.5"), 1024);
        assert_eq!(model_dimension("unknown-model"), 384);
    }
}
