use crate::chunking::ChunkerConfig;
use crate::config::{AppConfig, VectorBackend};
use crate::database::QdrantIndex;
use crate::embeddings::{create_embedder, Embedder};
use crate::error::{RagError, Result};
use crate::index::{MemoryIndex, VectorIndex};
use crate::ingest::{DocumentRegistry, IngestReport, IngestionPipeline};
use crate::llm::{ChatModel, Message, OpenAiClient};
use crate::rag::{EventStream, RagEngine, StreamEvent};
use crate::retriever::Retriever;
use crate::threads::ThreadStore;
use futures_util::StreamExt;
use log::{info, warn};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Everything a request handler needs, built once at startup.
///
/// The vector index and the thread store are the only state shared between
/// requests. Nothing needs tearing down; dropping the state closes the
/// backend connections.
pub struct AppState {
    pipeline: IngestionPipeline,
    engine: RagEngine,
    threads: Arc<ThreadStore>,
}

impl AppState {
    /// Connect to the configured backends and provision the index.
    ///
    /// Fails when the index cannot be reached within its retry budget.
    pub async fn initialize(config: &AppConfig) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        info!(
            "Using embedding model {} ({} dimensions)",
            embedder.model_name(),
            embedder.dims()
        );

        let index: Arc<dyn VectorIndex> = match config.backend {
            VectorBackend::Qdrant => {
                Arc::new(QdrantIndex::connect(&config.qdrant, embedder.dims()).await?)
            }
            VectorBackend::Memory => {
                warn!("Using the in-memory index; ingested documents are lost on exit");
                Arc::new(MemoryIndex::new(embedder.dims()))
            }
        };

        if config.llm.api_key.is_none() {
            warn!("OPENAI_API_KEY is not set; generation requests will fail");
        }
        let llm = OpenAiClient::new(config.llm.clone())
            .map_err(|e| RagError::Config(format!("{:#}", e)))?;

        Self::from_parts(
            embedder,
            index,
            Arc::new(llm),
            config.chunking,
            config.embedding.batch_size,
            config.top_k,
        )
        .await
    }

    /// Assemble the state from already-built components.
    ///
    /// The known-documents list is rebuilt from the sources already stored
    /// in `index`.
    pub async fn from_parts(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        llm: Arc<dyn ChatModel>,
        chunking: ChunkerConfig,
        batch_size: usize,
        top_k: usize,
    ) -> Result<Self> {
        // Rebuild the known-documents list from what the index already holds
        let registry = Arc::new(DocumentRegistry::new());
        for source in index.sources().await? {
            registry.insert(&source);
        }
        let known = registry.list().len();
        if known > 0 {
            info!(
                "Index already holds {} documents ({} chunks)",
                known,
                index.count().await?
            );
        }

        let retriever = Retriever::new(embedder.clone(), index.clone(), top_k);
        Ok(AppState {
            pipeline: IngestionPipeline::new(embedder, index, registry, chunking, batch_size),
            engine: RagEngine::new(retriever, llm),
            threads: Arc::new(ThreadStore::new()),
        })
    }

    /// Ingest a file that already exists on disk
    pub async fn ingest(&self, path: &Path, file_name: &str) -> Result<IngestReport> {
        self.pipeline.ingest(path, file_name).await
    }

    /// Ingest uploaded bytes; the temporary copy is removed however the ingest ends
    pub async fn ingest_bytes(&self, bytes: &[u8], file_name: &str) -> Result<IngestReport> {
        let mut upload = tempfile::NamedTempFile::new()
            .map_err(|e| RagError::load(file_name, anyhow::Error::new(e)))?;
        upload
            .write_all(bytes)
            .and_then(|_| upload.flush())
            .map_err(|e| RagError::load(file_name, anyhow::Error::new(e)))?;

        self.pipeline.ingest(upload.path(), file_name).await
    }

    /// Names of the documents ingested so far
    pub fn documents(&self) -> Vec<String> {
        self.pipeline.documents()
    }

    pub fn create_thread(&self) -> String {
        self.threads.create()
    }

    pub fn history(&self, thread_id: &str) -> Result<Vec<Message>> {
        self.threads.history(thread_id)
    }

    /// Answer `message` within a thread and record the exchange.
    ///
    /// The user message and the answer are appended together once the
    /// answer exists; a failed turn leaves the thread unchanged.
    pub async fn chat(&self, thread_id: &str, message: &str, model: &str) -> Result<String> {
        let history = self.threads.history(thread_id)?;
        let answer = self.engine.generate(message, &history, model).await?;
        self.threads.extend(
            thread_id,
            [
                Message::User(message.to_string()),
                Message::Assistant(answer.clone()),
            ],
        )?;
        Ok(answer)
    }

    /// Streaming counterpart of [`AppState::chat`].
    ///
    /// The exchange is recorded when the `Done` event passes through. A
    /// stream that fails or is dropped early records nothing.
    pub async fn chat_stream(
        &self,
        thread_id: &str,
        message: &str,
        model: &str,
    ) -> Result<EventStream> {
        let history = self.threads.history(thread_id)?;
        let events = self.engine.generate_stream(message, &history, model).await?;

        let threads = self.threads.clone();
        let thread_id = thread_id.to_string();
        let mut user = Some(message.to_string());
        let mut answer = String::new();

        Ok(events
            .map(move |event| -> Result<StreamEvent> {
                match &event {
                    Ok(StreamEvent::Token { delta }) => answer.push_str(delta),
                    Ok(StreamEvent::Done) => {
                        if let Some(user) = user.take() {
                            threads.extend(
                                &thread_id,
                                [
                                    Message::User(user),
                                    Message::Assistant(std::mem::take(&mut answer)),
                                ],
                            )?;
                        }
                    }
                    Err(_) => {}
                }
                event
            })
            .boxed())
    }
}
