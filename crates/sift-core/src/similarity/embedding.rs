//! Embedding providers

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::Transaction;
use crate::patterns::normalize_merchant;

/// Turns text into fixed-dimension vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;

    fn name(&self) -> &str;
}

/// Text a transaction is embedded as: normalized merchant plus description
pub fn transaction_text(transaction: &Transaction) -> String {
    let mut parts = Vec::new();
    if let Some(merchant) = transaction.merchant_text() {
        parts.push(normalize_merchant(merchant));
    }
    if let Some(description) = transaction.description.as_deref().map(str::trim) {
        if !description.is_empty() && transaction.merchant_name.is_some() {
            parts.push(description.to_uppercase());
        }
    }
    parts.retain(|p| !p.is_empty());
    parts.join(" ")
}

/// Local hashed bag-of-words embedder.
///
/// Terms are hashed into buckets with FNV-1a and weighted by term frequency and
/// length; the result is L2 normalized. Deterministic and always available.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(term: &str, dims: usize) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in term.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % dims as u64) as usize
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|s| s.len() >= 2)
            .map(|s| s.to_lowercase())
            .collect()
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let tokens = Self::tokenize(text);
        let mut vec = vec![0.0f32; self.dimensions];
        if tokens.is_empty() {
            return vec;
        }

        let mut tf: HashMap<&str, f32> = HashMap::new();
        for token in &tokens {
            *tf.entry(token.as_str()).or_default() += 1.0;
        }

        let total = tokens.len() as f32;
        for (term, count) in tf {
            let weight = (count / total) * (1.0 + (term.len() as f32).ln());
            vec[Self::bucket(term, self.dimensions)] += weight;
        }

        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "hashing"
    }
}
