use async_trait::async_trait;
use kbase_core::{KbaseError, KbaseResult};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};

/// Trait for computing text embeddings (vector representations).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Compute embedding vector for a single text.
    async fn embed(&self, text: &str) -> KbaseResult<Vec<f32>>;

    /// Compute embeddings for a batch of texts.
    async fn embed_batch(&self, texts: &[&str]) -> KbaseResult<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Dimension of the embedding vectors produced by this provider.
    fn dimension(&self) -> usize;

    /// Identifier stored next to each vector, so a model change can be detected.
    fn model_version(&self) -> String;
}

/// In-process hashed embedding; no external API needed.
///
/// Features are the lowercased words of the text, adjacent word pairs and the
/// character trigrams of each word. Each feature is hashed onto one component
/// with a sublinear term-frequency weight, and the result is L2-normalized.
/// Components are never negative, so cosine distances stay within `0.0..=1.0`.
pub struct LocalEmbedding {
    dimension: usize,
}

const WORD_WEIGHT: f32 = 1.0;
const PAIR_WEIGHT: f32 = 0.5;
const TRIGRAM_WEIGHT: f32 = 0.25;

impl LocalEmbedding {
    /// Embedding of `dimension` components.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// Feature string to (weight, occurrences).
    fn features(text: &str) -> HashMap<String, (f32, u32)> {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() > 1)
            .collect();

        let mut features: HashMap<String, (f32, u32)> = HashMap::new();
        let mut add = |feature: String, weight: f32| {
            features.entry(feature).or_insert((weight, 0)).1 += 1;
        };

        for word in &words {
            add(format!("w:{word}"), WORD_WEIGHT);
            let padded: Vec<char> = format!("^{word}$").chars().collect();
            for gram in padded.windows(3) {
                add(format!("t:{}", gram.iter().collect::<String>()), TRIGRAM_WEIGHT);
            }
        }
        for pair in words.windows(2) {
            add(format!("p:{} {}", pair[0], pair[1]), PAIR_WEIGHT);
        }
        features
    }
}

impl Default for LocalEmbedding {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedding {
    async fn embed(&self, text: &str) -> KbaseResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(KbaseError::invalid("Cannot embed empty text"));
        }
        if self.dimension == 0 {
            return Err(KbaseError::Config(
                "embedding dimension must be at least 1".to_string(),
            ));
        }

        let mut vector = vec![0.0f32; self.dimension];
        let modulus = self.dimension as u64;
        for (feature, (weight, count)) in Self::features(text) {
            let slot = (fnv1a64(feature.as_bytes()) % modulus) as usize;
            vector[slot] += weight * (1.0 + (count as f32).ln());
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_version(&self) -> String {
        format!("local-hash-{}", self.dimension)
    }
}

/// FNV-1a, 64 bit.
fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Resolve the configured embedding capability once, at startup.
///
/// `None` means semantic search is disabled for this deployment.
pub fn provider_from_config(
    config: &EmbeddingConfig,
) -> KbaseResult<Option<Arc<dyn EmbeddingProvider>>> {
    match config.provider {
        EmbeddingProviderKind::None => Ok(None),
        EmbeddingProviderKind::Local => {
            if config.dimension == 0 {
                return Err(KbaseError::Config(
                    "embedding.dimension must be at least 1".to_string(),
                ));
            }
            Ok(Some(Arc::new(LocalEmbedding::new(config.dimension))))
        }
        #[cfg(feature = "http")]
        EmbeddingProviderKind::Http => {
            let provider = crate::http::HttpEmbedding::from_config(config)?;
            Ok(Some(Arc::new(provider)))
        }
        #[cfg(not(feature = "http"))]
        EmbeddingProviderKind::Http => Err(KbaseError::Config(
            "embedding provider 'http' requires the `http` feature".to_string(),
        )),
    }
}
