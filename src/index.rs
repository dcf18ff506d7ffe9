//! Vector index abstraction.
//!
//! A [`VectorIndex`] stores one vector per chunk together with the chunk's
//! source document, ordinal and text, and answers cosine-similarity
//! nearest-neighbour queries. Two backends exist: Qdrant
//! ([`crate::database::QdrantIndex`]) and the process-local [`MemoryIndex`].

use crate::chunking::TextChunk;
use crate::embeddings::Embedding;
use crate::error::{RagError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;

/// A vector plus the chunk metadata stored next to it
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub vector: Vec<f32>,
    /// File name of the source document
    pub source: String,
    /// Ordinal of the chunk within its document
    pub chunk_id: usize,
    pub text: String,
}

impl IndexEntry {
    pub fn new(chunk: TextChunk, embedding: Embedding) -> Self {
        IndexEntry {
            vector: embedding.values,
            source: chunk.source,
            chunk_id: chunk.chunk_id,
            text: chunk.text,
        }
    }
}

/// One ranked search result
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Cosine similarity to the query vector
    pub score: f32,
    pub source: String,
    pub chunk_id: usize,
    pub text: String,
}

/// Storage and nearest-neighbour search over chunk embeddings.
///
/// Implementations provide per-call atomicity only; callers add no locking.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Vector dimensionality the index was provisioned with
    fn dims(&self) -> usize;

    /// Add a batch of entries.
    ///
    /// Either every entry is stored or none is; a rejected batch is reported
    /// as [`RagError::UpsertRejected`] naming the offending batch positions.
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<usize>;

    /// Return up to `k` entries ranked by descending cosine similarity.
    ///
    /// Equal scores keep insertion order. An empty index yields an empty
    /// vector, while an unreachable one is [`RagError::IndexUnavailable`].
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>>;

    /// Distinct source document names present in the index
    async fn sources(&self) -> Result<Vec<String>>;

    /// Number of stored entries
    async fn count(&self) -> Result<usize>;
}

/// Check a batch before it is written so that nothing is stored on failure
pub(crate) fn validate_entries(entries: &[IndexEntry], dims: usize) -> Result<()> {
    let failed: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.vector.len() != dims || e.vector.iter().any(|v| !v.is_finite()))
        .map(|(i, _)| i)
        .collect();

    if failed.is_empty() {
        return Ok(());
    }
    Err(RagError::UpsertRejected {
        failed,
        total: entries.len(),
        reason: format!("vectors must be {}-dimensional and finite", dims),
    })
}

/// Compute cosine similarity between two vectors.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or
/// zero-magnitude vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Sort descending by score; the sort is stable so ties keep their input order
pub(crate) fn rank_by_score(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}

/// Brute-force in-memory index.
///
/// Used for tests and for `VECTOR_BACKEND=memory`; contents live only as
/// long as the process.
pub struct MemoryIndex {
    dims: usize,
    entries: RwLock<Vec<IndexEntry>>,
}

impl MemoryIndex {
    pub fn new(dims: usize) -> Self {
        MemoryIndex {
            dims,
            entries: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<usize> {
        validate_entries(&entries, self.dims)?;
        let added = entries.len();
        self.entries.write().extend(entries);
        Ok(added)
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dims {
            return Err(RagError::Embedding(anyhow::anyhow!(
                "query vector has {} dimensions, index expects {}",
                query.len(),
                self.dims
            )));
        }

        let mut hits: Vec<SearchHit> = self
            .entries
            .read()
            .iter()
            .map(|entry| SearchHit {
                score: cosine_similarity(query, &entry.vector),
                source: entry.source.clone(),
                chunk_id: entry.chunk_id,
                text: entry.text.clone(),
            })
            .collect();

        rank_by_score(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn sources(&self) -> Result<Vec<String>> {
        let mut sources: Vec<String> = Vec::new();
        for entry in self.entries.read().iter() {
            if !sources.contains(&entry.source) {
                sources.push(entry.source.clone());
            }
        }
        Ok(sources)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().len())
    }
}
