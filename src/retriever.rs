use crate::embeddings::{embed_query, Embedder};
use crate::error::Result;
use crate::index::{SearchHit, VectorIndex};
use log::debug;
use std::sync::Arc;

pub const DEFAULT_TOP_K: usize = 4;

/// Query-time view of the vector index
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    top_k: usize,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, top_k: usize) -> Self {
        Retriever {
            embedder,
            index,
            top_k,
        }
    }

    /// Return the `top_k` chunks most similar to `query`, best first.
    ///
    /// An empty index gives an empty vector; an unreachable one is an error.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<SearchHit>> {
        let query_embedding = embed_query(self.embedder.as_ref(), query).await?;
        let hits = self.index.search(&query_embedding.values, self.top_k).await?;
        debug!("Retrieved {} chunks for query of {} chars", hits.len(), query.len());
        Ok(hits)
    }

    /// Like [`Retriever::retrieve`], keeping only the chunk texts
    pub async fn retrieve_texts(&self, query: &str) -> Result<Vec<String>> {
        Ok(self
            .retrieve(query)
            .await?
            .into_iter()
            .map(|hit| hit.text)
            .collect())
    }
}
