use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kbase_core::{EntryKey, KbaseError, KbaseResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One stored embedding. A key has at most one row; upsert overwrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub key: EntryKey,
    pub vector: Vec<f32>,
    /// Identifies the model that produced `vector`.
    pub model_version: String,
    pub computed_at: DateTime<Utc>,
}

impl EmbeddingVector {
    /// A row computed now.
    pub fn new(key: EntryKey, vector: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            key,
            vector,
            model_version: model_version.into(),
            computed_at: Utc::now(),
        }
    }
}

/// A nearest-neighbour match.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub key: EntryKey,
    /// Cosine distance, `1 - cos`, in `0.0..=2.0`. Lower is closer.
    pub distance: f32,
}

/// Trait for vector storage backends keyed by entry identity.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Dimension every stored vector must have.
    fn dimension(&self) -> usize;

    /// Insert or overwrite the vector for `row.key`.
    async fn upsert(&self, row: EmbeddingVector) -> KbaseResult<()>;

    /// Delete the vector for a key. Returns whether one existed.
    async fn remove(&self, key: &EntryKey) -> KbaseResult<bool>;

    async fn get(&self, key: &EntryKey) -> KbaseResult<Option<EmbeddingVector>>;

    /// The `k` closest vectors by ascending cosine distance, ties by key.
    async fn knn(&self, query: &[f32], k: usize) -> KbaseResult<Vec<VectorHit>>;

    /// Drop every vector.
    async fn clear(&self) -> KbaseResult<()>;

    async fn count(&self) -> KbaseResult<usize>;
}

fn check_dimension(expected: usize, actual: usize) -> KbaseResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(KbaseError::DimensionMismatch { expected, actual })
    }
}

/// In-memory vector index using brute-force cosine distance.
/// Suitable for small datasets (<100k entries).
pub struct InMemoryVectorIndex {
    dimension: usize,
    rows: RwLock<HashMap<EntryKey, EmbeddingVector>>,
}

impl InMemoryVectorIndex {
    /// Empty index accepting vectors of exactly `dimension` components.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            rows: RwLock::new(HashMap::new()),
        }
    }

    /// All rows in key order.
    pub async fn list(&self) -> Vec<EmbeddingVector> {
        let rows = self.rows.read().await;
        let mut all: Vec<EmbeddingVector> = rows.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, row: EmbeddingVector) -> KbaseResult<()> {
        check_dimension(self.dimension, row.vector.len())?;
        let mut rows = self.rows.write().await;
        rows.insert(row.key.clone(), row);
        Ok(())
    }

    async fn remove(&self, key: &EntryKey) -> KbaseResult<bool> {
        let mut rows = self.rows.write().await;
        Ok(rows.remove(key).is_some())
    }

    async fn get(&self, key: &EntryKey) -> KbaseResult<Option<EmbeddingVector>> {
        let rows = self.rows.read().await;
        Ok(rows.get(key).cloned())
    }

    async fn knn(&self, query: &[f32], k: usize) -> KbaseResult<Vec<VectorHit>> {
        if query.is_empty() {
            return Err(KbaseError::invalid("Empty query embedding"));
        }
        check_dimension(self.dimension, query.len())?;

        let rows = self.rows.read().await;
        let mut hits: Vec<VectorHit> = rows
            .values()
            .map(|row| VectorHit {
                key: row.key.clone(),
                distance: cosine_distance(query, &row.vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn clear(&self) -> KbaseResult<()> {
        self.rows.write().await.clear();
        Ok(())
    }

    async fn count(&self) -> KbaseResult<usize> {
        Ok(self.rows.read().await.len())
    }
}

/// File-backed vector index that persists rows as JSONL on disk.
///
/// Loads all rows into memory on open, with later lines overwriting earlier
/// ones for the same key. Upserts append; removals and [`Self::compact`]
/// rewrite the file with exactly one line per live key.
pub struct FileVectorIndex {
    path: PathBuf,
    inner: InMemoryVectorIndex,
    /// Lines in the file that a later line for the same key has superseded.
    stale_lines: RwLock<usize>,
}

impl FileVectorIndex {
    /// Open the index at `path`, creating parent directories if needed.
    ///
    /// Rows whose dimension differs from `dimension` are an error: the index
    /// was built with another model and must be rebuilt.
    pub async fn open(path: PathBuf, dimension: usize) -> KbaseResult<Self> {
        let inner = InMemoryVectorIndex::new(dimension);
        let mut lines = 0usize;

        if path.exists() {
            let data = tokio::fs::read_to_string(&path).await.map_err(|e| {
                KbaseError::Storage(format!("Failed to read vector index: {e}"))
            })?;
            for (idx, line) in data.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let row: EmbeddingVector = serde_json::from_str(line).map_err(|e| {
                    KbaseError::Storage(format!(
                        "Invalid vector row on line {}: {e}",
                        idx + 1
                    ))
                })?;
                inner.upsert(row).await?;
                lines += 1;
            }
        } else if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KbaseError::Storage(format!("Failed to create dir: {e}")))?;
        }

        let live = inner.count().await?;
        let index = Self {
            path,
            inner,
            stale_lines: RwLock::new(lines.saturating_sub(live)),
        };
        if lines > live {
            index.compact().await?;
        }
        debug!(path = %index.path.display(), rows = live, "Vector index opened");
        Ok(index)
    }

    /// Rewrite the file with one line per live key.
    pub async fn compact(&self) -> KbaseResult<()> {
        let rows = self.inner.list().await;
        let mut data = String::new();
        for row in &rows {
            data.push_str(&serde_json::to_string(row)?);
            data.push('\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, data.as_bytes())
            .await
            .map_err(|e| KbaseError::Storage(format!("Failed to write vector index: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| KbaseError::Storage(format!("Failed to replace vector index: {e}")))?;

        let mut stale = self.stale_lines.write().await;
        if *stale > 0 {
            info!(removed = *stale, rows = rows.len(), "Vector index compacted");
        }
        *stale = 0;
        Ok(())
    }

    /// Append a single row to the JSONL file.
    async fn append_to_file(&self, row: &EmbeddingVector) -> KbaseResult<()> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| KbaseError::Storage(format!("Failed to open vector index: {e}")))?;
        let mut line = serde_json::to_string(row)?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| KbaseError::Storage(format!("Failed to write vector row: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for FileVectorIndex {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn upsert(&self, row: EmbeddingVector) -> KbaseResult<()> {
        check_dimension(self.inner.dimension(), row.vector.len())?;
        let replaced = self.inner.get(&row.key).await?.is_some();
        self.append_to_file(&row).await?;
        self.inner.upsert(row).await?;
        if replaced {
            *self.stale_lines.write().await += 1;
        }
        Ok(())
    }

    async fn remove(&self, key: &EntryKey) -> KbaseResult<bool> {
        let removed = self.inner.remove(key).await?;
        if removed {
            self.compact().await?;
        }
        Ok(removed)
    }

    async fn get(&self, key: &EntryKey) -> KbaseResult<Option<EmbeddingVector>> {
        self.inner.get(key).await
    }

    async fn knn(&self, query: &[f32], k: usize) -> KbaseResult<Vec<VectorHit>> {
        self.inner.knn(query, k).await
    }

    async fn clear(&self) -> KbaseResult<()> {
        self.inner.clear().await?;
        self.compact().await
    }

    async fn count(&self) -> KbaseResult<usize> {
        self.inner.count().await
    }
}

/// Cosine distance `1 - cos(a, b)`, in `0.0..=2.0`.
///
/// Mismatched lengths or a zero vector yield the neutral distance `1.0`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        1.0
    } else {
        (1.0 - dot / (na * nb)).clamp(0.0, 2.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn key(id: &str) -> EntryKey {
        EntryKey::new(id, "docs")
    }

    fn row(id: &str, vector: Vec<f32>) -> EmbeddingVector {
        EmbeddingVector::new(key(id), vector, "test")
    }

    #[tokio::test]
    async fn test_upsert_and_count() {
        let index = InMemoryVectorIndex::new(3);
        assert_eq!(index.count().await.unwrap(), 0);

        index.upsert(row("a", vec![1.0, 0.0, 0.0])).await.unwrap();
        index.upsert(row("a", vec![0.0, 1.0, 0.0])).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1, "upsert must overwrite");
        assert_eq!(
            index.get(&key("a")).await.unwrap().unwrap().vector,
            vec![0.0, 1.0, 0.0]
        );
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let index = InMemoryVectorIndex::new(3);
        let err = index.upsert(row("a", vec![1.0, 0.0])).await.unwrap_err();
        assert!(matches!(
            err,
            KbaseError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert!(index.knn(&[1.0], 5).await.is_err());
    }

    #[tokio::test]
    async fn test_knn_orders_by_distance() {
        let index = InMemoryVectorIndex::new(3);
        index.upsert(row("far", vec![0.0, 0.0, 1.0])).await.unwrap();
        index.upsert(row("close", vec![0.9, 0.1, 0.0])).await.unwrap();
        index.upsert(row("opposite", vec![-1.0, 0.0, 0.0])).await.unwrap();

        let hits = index.knn(&[1.0, 0.0, 0.0], 3).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.key.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["close", "far", "opposite"]);
        assert!((hits[2].distance - 2.0).abs() < 0.001);

        let top1 = index.knn(&[1.0, 0.0, 0.0], 1).await.unwrap();
        assert_eq!(top1.len(), 1);
    }

    #[tokio::test]
    async fn test_knn_ties_broken_by_key() {
        let index = InMemoryVectorIndex::new(2);
        for id in ["c", "a", "b"] {
            index.upsert(row(id, vec![1.0, 0.0])).await.unwrap();
        }
        let hits = index.knn(&[1.0, 0.0], 3).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.key.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_remove() {
        let index = InMemoryVectorIndex::new(1);
        index.upsert(row("a", vec![1.0])).await.unwrap();
        assert!(index.remove(&key("a")).await.unwrap());
        assert!(!index.remove(&key("a")).await.unwrap());
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let index = InMemoryVectorIndex::new(2);
        assert!(index.knn(&[], 5).await.is_err());
    }

    #[test]
    fn test_cosine_distance_range() {
        assert!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).abs() < 0.001);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 0.001);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 0.001);
        assert!((cosine_distance(&[0.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_file_index_persists_last_write() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.jsonl");

        {
            let index = FileVectorIndex::open(path.clone(), 2).await.unwrap();
            index.upsert(row("a", vec![1.0, 0.0])).await.unwrap();
            index.upsert(row("b", vec![0.0, 1.0])).await.unwrap();
            index.upsert(row("a", vec![0.5, 0.5])).await.unwrap();
            assert_eq!(index.count().await.unwrap(), 2);
        }

        let reopened = FileVectorIndex::open(path.clone(), 2).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 2);
        assert_eq!(
            reopened.get(&key("a")).await.unwrap().unwrap().vector,
            vec![0.5, 0.5]
        );

        let data = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(data.lines().count(), 2, "open compacts superseded rows");
    }

    #[tokio::test]
    async fn test_file_index_remove_rewrites() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.jsonl");

        let index = FileVectorIndex::open(path.clone(), 1).await.unwrap();
        index.upsert(row("gone", vec![1.0])).await.unwrap();
        index.upsert(row("keep", vec![0.5])).await.unwrap();
        assert!(index.remove(&key("gone")).await.unwrap());

        let reopened = FileVectorIndex::open(path, 1).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
        assert!(reopened.get(&key("keep")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_index_wrong_dimension_on_open() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.jsonl");
        {
            let index = FileVectorIndex::open(path.clone(), 2).await.unwrap();
            index.upsert(row("a", vec![1.0, 0.0])).await.unwrap();
        }
        let err = FileVectorIndex::open(path, 3).await.err().unwrap();
        assert!(matches!(err, KbaseError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_file_index_clear_truncates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("vectors.jsonl");
        let index = FileVectorIndex::open(path.clone(), 1).await.unwrap();
        index.upsert(row("a", vec![1.0])).await.unwrap();
        index.clear().await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "");
    }
}
