use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, ErrorContext, Result};
use crate::models::RetrievedPassage;

// ============================================================================
// Retriever seam
// ============================================================================

/// Nearest-neighbour search over a fixed index snapshot.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Up to `k` passages, best match first.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievedPassage>>;
}

/// Process-wide read-only index handle, filled once the index has loaded.
#[derive(Clone, Default)]
pub struct RetrieverHandle {
    inner: Arc<OnceLock<Arc<dyn Retriever>>>,
}

impl RetrieverHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready(retriever: Arc<dyn Retriever>) -> Self {
        let handle = Self::new();
        handle.install(retriever);
        handle
    }

    /// Returns false if an index was already installed.
    pub fn install(&self, retriever: Arc<dyn Retriever>) -> bool {
        self.inner.set(retriever).is_ok()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.get().is_some()
    }

    pub fn get(&self) -> Result<Arc<dyn Retriever>> {
        self.inner.get().cloned().ok_or_else(AppError::index_not_ready)
    }
}

// ============================================================================
// Embeddings
// ============================================================================

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| AppError::internal(format!("HTTP client build failed: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": text
            }))
            .send()
            .await
            .map_err(|e| AppError::external(format!("Embedding request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::external(format!(
                "Embedding endpoint returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AppError::external(format!("Failed to extract embedding: {}", e)))?;
        Ok(body.embedding)
    }
}

// ============================================================================
// Vector index
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Failed to read index file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid index JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Index snapshot contains no chunks")]
    Empty,

    #[error("Chunk {index} has dimension {found}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },
}

/// One chunk of the exported snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    pub text: String,
    #[serde(default = "unknown_source")]
    pub source: String,
    pub embedding: Vec<f32>,
}

fn unknown_source() -> String {
    "unknown".to_string()
}

/// Brute-force index over an exported snapshot.
///
/// Scores are squared euclidean distances, so lower is closer. Ties keep
/// snapshot order, which makes ranking deterministic.
pub struct VectorIndex {
    records: Arc<Vec<IndexRecord>>,
    dimension: usize,
    embedder: Arc<dyn Embedder>,
}

impl VectorIndex {
    pub fn from_records(
        records: Vec<IndexRecord>,
        embedder: Arc<dyn Embedder>,
    ) -> std::result::Result<Self, IndexError> {
        let dimension = records.first().ok_or(IndexError::Empty)?.embedding.len();
        if let Some((index, record)) = records
            .iter()
            .enumerate()
            .find(|(_, r)| r.embedding.len() != dimension)
        {
            return Err(IndexError::DimensionMismatch {
                index,
                expected: dimension,
                found: record.embedding.len(),
            });
        }

        Ok(Self {
            records: Arc::new(records),
            dimension,
            embedder,
        })
    }

    pub async fn load(
        path: impl AsRef<Path>,
        embedder: Arc<dyn Embedder>,
    ) -> std::result::Result<Self, IndexError> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path).await.map_err(|source| IndexError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let records: Vec<IndexRecord> = serde_json::from_slice(&raw)?;
        Self::from_records(records, embedder)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest(records: &[IndexRecord], query: &[f32], k: usize) -> Vec<RetrievedPassage> {
    let mut scored: Vec<(usize, f32)> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (i, squared_l2(&r.embedding, query)))
        .collect();
    scored.sort_by(|a, b| a.1.total_cmp(&b.1));
    scored
        .into_iter()
        .take(k)
        .map(|(i, score)| {
            let record = &records[i];
            RetrievedPassage::new(record.text.clone(), record.source.clone(), score)
        })
        .collect()
}

#[async_trait]
impl Retriever for VectorIndex {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievedPassage>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(query).await.context("embedding query")?;
        if embedding.len() != self.dimension {
            return Err(AppError::external(format!(
                "Query embedding has dimension {}, index expects {}",
                embedding.len(),
                self.dimension
            )));
        }

        let records = self.records.clone();
        let passages =
            tokio::task::spawn_blocking(move || nearest(&records, &embedding, k)).await?;
        Ok(passages)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    fn record(text: &str, source: &str, embedding: Vec<f32>) -> IndexRecord {
        IndexRecord {
            text: text.to_string(),
            source: source.to_string(),
            embedding,
        }
    }

    fn index(query: Vec<f32>) -> VectorIndex {
        VectorIndex::from_records(
            vec![
                record("far", "a.pdf", vec![10.0, 10.0]),
                record("near", "b.pdf", vec![1.0, 0.0]),
                record("exact", "c.pdf", vec![0.0, 0.0]),
                record("near-tie", "d.pdf", vec![0.0, 1.0]),
            ],
            Arc::new(FixedEmbedder(query)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_search_orders_by_distance() {
        let passages = index(vec![0.0, 0.0]).search("murder", 3).await.unwrap();
        let texts: Vec<_> = passages.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts, ["exact", "near", "near-tie"]);
        assert_eq!(passages[0].score, 0.0);
        assert_eq!(passages[1].score, 1.0);
        assert_eq!(passages[1].source_id, "b.pdf");
    }

    #[tokio::test]
    async fn test_search_is_deterministic() {
        let idx = index(vec![0.5, 0.5]);
        let first = idx.search("q", 4).await.unwrap();
        let second = idx.search("q", 4).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_search_dimension_mismatch() {
        let err = index(vec![0.0, 0.0, 0.0]).search("q", 3).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ExternalServiceError);
    }

    #[test]
    fn test_from_records_validation() {
        let embedder: Arc<dyn Embedder> = Arc::new(FixedEmbedder(vec![]));
        assert!(matches!(
            VectorIndex::from_records(vec![], embedder.clone()),
            Err(IndexError::Empty)
        ));
        let err = VectorIndex::from_records(
            vec![record("a", "x", vec![1.0]), record("b", "x", vec![1.0, 2.0])],
            embedder,
        );
        assert!(matches!(
            err,
            Err(IndexError::DimensionMismatch { index: 1, expected: 1, found: 2 })
        ));
    }

    #[test]
    fn test_record_source_defaults_to_unknown() {
        let record: IndexRecord =
            serde_json::from_str(r#"{"text":"Section 420","embedding":[0.1]}"#).unwrap();
        assert_eq!(record.source, "unknown");
    }

    #[tokio::test]
    async fn test_handle_readiness() {
        let handle = RetrieverHandle::new();
        assert!(!handle.is_ready());
        assert!(handle.get().is_err());

        assert!(handle.install(Arc::new(index(vec![0.0, 0.0]))));
        assert!(handle.is_ready());
        assert!(!handle.install(Arc::new(index(vec![0.0, 0.0]))));
        assert_eq!(handle.get().unwrap().search("q", 1).await.unwrap()[0].text, "exact");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let embedder: Arc<dyn Embedder> = Arc::new(FixedEmbedder(vec![]));
        let err = VectorIndex::load("/nonexistent/index.json", embedder).await;
        assert!(matches!(err, Err(IndexError::Io { .. })));
    }
}
