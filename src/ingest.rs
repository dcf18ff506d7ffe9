use crate::chunking::{split_into_chunks, ChunkerConfig};
use crate::document::Document;
use crate::embeddings::{embed_all, Embedder};
use crate::error::{RagError, Result};
use crate::index::{IndexEntry, VectorIndex};
use log::info;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

/// Names of successfully ingested documents, in first-ingest order.
///
/// A name is only recorded after its chunks are indexed, so every listed
/// document has at least one vector.
#[derive(Debug, Default)]
pub struct DocumentRegistry {
    names: RwLock<Vec<String>>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `name`; returns false when it was already known
    pub fn insert(&self, name: &str) -> bool {
        let mut names = self.names.write();
        if names.iter().any(|n| n == name) {
            return false;
        }
        names.push(name.to_string());
        true
    }

    pub fn list(&self) -> Vec<String> {
        self.names.read().clone()
    }
}

/// Outcome of a successful ingest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub file_name: String,
    pub chunks: usize,
    /// False when the name was already registered by an earlier ingest
    pub newly_listed: bool,
}

/// Load → chunk → embed → index for one document at a time
pub struct IngestionPipeline {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    registry: Arc<DocumentRegistry>,
    chunking: ChunkerConfig,
    batch_size: usize,
}

impl IngestionPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        registry: Arc<DocumentRegistry>,
        chunking: ChunkerConfig,
        batch_size: usize,
    ) -> Self {
        IngestionPipeline {
            embedder,
            index,
            registry,
            chunking,
            batch_size,
        }
    }

    /// Ingest the file at `path` under the display name `file_name`.
    ///
    /// Any failing stage aborts the ingest before the name is registered.
    /// Re-ingesting a known name adds a fresh set of vectors but does not
    /// list the name twice. The caller owns `path` and its cleanup.
    pub async fn ingest(&self, path: &Path, file_name: &str) -> Result<IngestReport> {
        // Load the document off the async runtime
        let owned_path = path.to_path_buf();
        let owned_name = file_name.to_string();
        let document = tokio::task::spawn_blocking(move || Document::load(owned_path, &owned_name))
            .await
            .map_err(|e| RagError::load(file_name, anyhow::Error::new(e)))?
            .map_err(|e| RagError::load(file_name, e))?;

        // Split content into chunks
        let chunks = split_into_chunks(&document.content, file_name, &self.chunking);
        if chunks.is_empty() {
            return Err(RagError::EmptyDocument(file_name.to_string()));
        }
        info!("Split {} into {} chunks", file_name, chunks.len());

        // Generate embeddings for every chunk
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let embeddings = embed_all(self.embedder.as_ref(), &texts, self.batch_size).await?;

        // Store chunks with their source metadata
        let entries: Vec<IndexEntry> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexEntry::new(chunk, embedding))
            .collect();
        let stored = self.index.upsert(entries).await?;

        // Register only once the vectors are stored
        let newly_listed = self.registry.insert(file_name);
        info!(
            "Indexed {} chunks from {}{}",
            stored,
            file_name,
            if newly_listed { "" } else { " (re-upload)" }
        );

        Ok(IngestReport {
            file_name: file_name.to_string(),
            chunks: stored,
            newly_listed,
        })
    }

    pub fn documents(&self) -> Vec<String> {
        self.registry.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::testing::{temp_document, BrokenEmbedder, KeywordEmbedder, UnreachableIndex};

    fn pipeline(index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>) -> IngestionPipeline {
        IngestionPipeline::new(
            embedder,
            index,
            Arc::new(DocumentRegistry::new()),
            ChunkerConfig::new(200, 20).unwrap(),
            8,
        )
    }

    fn long_text() -> String {
        (0..40)
            .map(|i| format!("Section {} describes step {} of the installation.", i, i))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[tokio::test]
    async fn test_ingest_indexes_all_chunks_with_metadata() {
        let index = Arc::new(MemoryIndex::new(32));
        let ingestor = pipeline(index.clone(), Arc::new(KeywordEmbedder::new(32)));
        let file = temp_document(&long_text());

        let report = ingestor.ingest(file.path(), "install.txt").await.unwrap();
        assert!(report.chunks > 1);
        assert!(report.newly_listed);
        assert_eq!(index.count().await.unwrap(), report.chunks);

        let hits = index.search(&[1.0; 32], 100).await.unwrap();
        let mut ids: Vec<usize> = hits.iter().map(|h| h.chunk_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..report.chunks).collect::<Vec<_>>());
        assert!(hits.iter().all(|h| h.source == "install.txt"));
    }

    #[tokio::test]
    async fn test_reingest_lists_once_but_adds_vectors() {
        let index = Arc::new(MemoryIndex::new(32));
        let ingestor = pipeline(index.clone(), Arc::new(KeywordEmbedder::new(32)));
        let file = temp_document("Short manual about the inverter.");

        let first = ingestor.ingest(file.path(), "manual.txt").await.unwrap();
        let second = ingestor.ingest(file.path(), "manual.txt").await.unwrap();

        assert!(first.newly_listed);
        assert!(!second.newly_listed);
        assert_eq!(ingestor.documents(), vec!["manual.txt"]);
        assert_eq!(index.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_document_is_not_registered() {
        let ingestor = pipeline(
            Arc::new(MemoryIndex::new(32)),
            Arc::new(KeywordEmbedder::new(32)),
        );
        let file = temp_document("   \n\n  ");

        let err = ingestor.ingest(file.path(), "blank.txt").await.unwrap_err();
        assert!(matches!(err, RagError::EmptyDocument(_)));
        assert!(ingestor.documents().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_document() {
        let ingestor = pipeline(
            Arc::new(MemoryIndex::new(32)),
            Arc::new(KeywordEmbedder::new(32)),
        );
        let err = ingestor
            .ingest(Path::new("/nonexistent/upload.txt"), "upload.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Load { .. }));
        assert!(ingestor.documents().is_empty());
    }

    #[tokio::test]
    async fn test_embedding_outage_registers_nothing() {
        let index = Arc::new(MemoryIndex::new(384));
        let ingestor = pipeline(index.clone(), Arc::new(BrokenEmbedder));
        let file = temp_document(&long_text());

        let err = ingestor.ingest(file.path(), "install.txt").await.unwrap_err();
        assert!(matches!(err, RagError::Embedding(_)));
        assert_eq!(index.count().await.unwrap(), 0);
        assert!(ingestor.documents().is_empty());
    }

    #[tokio::test]
    async fn test_index_outage_registers_nothing() {
        let ingestor = pipeline(
            Arc::new(UnreachableIndex { dims: 32 }),
            Arc::new(KeywordEmbedder::new(32)),
        );
        let file = temp_document(&long_text());

        let err = ingestor.ingest(file.path(), "install.txt").await.unwrap_err();
        assert!(matches!(err, RagError::IndexUnavailable(_)));
        assert!(ingestor.documents().is_empty());
    }

    #[test]
    fn test_registry_insert_is_idempotent() {
        let registry = DocumentRegistry::new();
        assert!(registry.insert("a.pdf"));
        assert!(registry.insert("b.pdf"));
        assert!(!registry.insert("a.pdf"));
        assert_eq!(registry.list(), vec!["a.pdf", "b.pdf"]);
    }
}
