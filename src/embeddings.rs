use crate::config::{env_opt, env_or, env_string};
use crate::error::RagError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_EMBEDDING_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_EMBEDDING_DIMS: usize = 384;

/// Representation of a vector embedding
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

/// Where embeddings are computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// OpenAI-compatible `/embeddings` endpoint (e.g. text-embeddings-inference)
    Http,
    /// In-process ONNX model, requires the `local-embeddings` feature
    Local,
}

impl FromStr for EmbeddingProvider {
    type Err = RagError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(EmbeddingProvider::Http),
            "local" => Ok(EmbeddingProvider::Local),
            other => Err(RagError::Config(format!(
                "unknown EMBEDDING_PROVIDER {:?}, expected \"http\" or \"local\"",
                other
            ))),
        }
    }
}

/// Configuration for the embedding backend
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub url: String,
    pub model: String,
    pub dims: usize,
    pub batch_size: usize,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl EmbeddingConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> std::result::Result<Self, RagError> {
        let batch_size = env_or("EMBEDDING_BATCH_SIZE", 32usize)?;
        if batch_size == 0 {
            return Err(RagError::Config("EMBEDDING_BATCH_SIZE must be positive".into()));
        }

        Ok(EmbeddingConfig {
            provider: env_string("EMBEDDING_PROVIDER", "http").parse()?,
            url: env_string("EMBEDDING_URL", "http://localhost:8080/v1/embeddings"),
            model: env_string("EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),
            dims: env_or("EMBEDDING_DIMS", DEFAULT_EMBEDDING_DIMS)?,
            batch_size,
            api_key: env_opt("EMBEDDING_API_KEY"),
            timeout_secs: env_or("EMBEDDING_TIMEOUT_SECS", 60u64)?,
        })
    }
}

/// A sentence-embedding model.
///
/// The same instance embeds chunks at ingestion time and queries at
/// retrieval time, so both land in one vector space.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    /// Dimensionality of every vector this embedder returns
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per text in input order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }
}

/// Embed `texts` in batches of `batch_size`, rejecting short or misshapen responses.
///
/// Any failure aborts the whole call so no chunk is silently left unembedded.
pub async fn embed_all(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
) -> std::result::Result<Vec<Embedding>, RagError> {
    let mut embeddings = Vec::with_capacity(texts.len());

    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = embedder.embed_batch(batch).await.map_err(RagError::Embedding)?;
        if vectors.len() != batch.len() {
            return Err(RagError::Embedding(anyhow::anyhow!(
                "expected {} embeddings from {}, got {}",
                batch.len(),
                embedder.model_name(),
                vectors.len()
            )));
        }
        for vector in &vectors {
            check_dims(embedder, vector)?;
        }
        embeddings.extend(vectors);
    }

    debug!("Embedded {} texts with {}", embeddings.len(), embedder.model_name());
    Ok(embeddings)
}

/// Embed a query through the same model used for indexing
pub async fn embed_query(
    embedder: &dyn Embedder,
    text: &str,
) -> std::result::Result<Embedding, RagError> {
    let embedding = embedder.embed(text).await.map_err(RagError::Embedding)?;
    check_dims(embedder, &embedding)?;
    Ok(embedding)
}

fn check_dims(embedder: &dyn Embedder, embedding: &Embedding) -> std::result::Result<(), RagError> {
    if embedding.values.len() != embedder.dims() {
        return Err(RagError::Embedding(anyhow::anyhow!(
            "{} returned a {}-dimensional vector, expected {}",
            embedder.model_name(),
            embedding.values.len(),
            embedder.dims()
        )));
    }
    Ok(())
}

/// Build the embedder selected by `config`
pub fn create_embedder(config: &EmbeddingConfig) -> std::result::Result<Arc<dyn Embedder>, RagError> {
    match config.provider {
        EmbeddingProvider::Http => Ok(Arc::new(
            HttpEmbedder::new(config.clone()).map_err(RagError::Embedding)?,
        )),
        #[cfg(feature = "local-embeddings")]
        EmbeddingProvider::Local => Ok(Arc::new(
            LocalEmbedder::new(config).map_err(RagError::Embedding)?,
        )),
        #[cfg(not(feature = "local-embeddings"))]
        EmbeddingProvider::Local => Err(RagError::Config(
            "EMBEDDING_PROVIDER=local requires building with --features local-embeddings".into(),
        )),
    }
}

/// Client for an OpenAI-compatible embeddings endpoint
pub struct HttpEmbedder {
    config: EmbeddingConfig,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build embedding HTTP client")?;
        Ok(HttpEmbedder { config, client })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn dims(&self) -> usize {
        self.config.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        #[derive(Serialize)]
        struct EmbeddingRequest<'a> {
            model: &'a str,
            input: &'a [String],
        }

        #[derive(Deserialize)]
        struct EmbeddingResponse {
            data: Vec<EmbeddingData>,
        }

        #[derive(Deserialize)]
        struct EmbeddingData {
            embedding: Vec<f32>,
            #[serde(default)]
            index: usize,
        }

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.config.model,
            input: texts,
        };

        let mut builder = self.client.post(&self.config.url).json(&request);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("Embedding request to {} failed", self.config.url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow::anyhow!(
                "Embedding API request failed: {} {}",
                status,
                error_text
            ));
        }

        let mut response_data: EmbeddingResponse = response
            .json()
            .await
            .context("Malformed embedding response")?;
        response_data.data.sort_by_key(|d| d.index);

        Ok(response_data
            .data
            .into_iter()
            .map(|d| Embedding {
                values: d.embedding,
            })
            .collect())
    }
}

/// Embedder running all-MiniLM-L6-v2 (or a sibling model) in-process via fastembed
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model: Arc<parking_lot::Mutex<fastembed::TextEmbedding>>,
    model_name: String,
    dims: usize,
    batch_size: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = match config.model.to_ascii_lowercase().as_str() {
            "all-minilm-l6-v2" | "sentence-transformers/all-minilm-l6-v2" => {
                fastembed::EmbeddingModel::AllMiniLML6V2
            }
            "bge-small-en-v1.5" | "baai/bge-small-en-v1.5" => fastembed::EmbeddingModel::BGESmallENV15,
            other => anyhow::bail!("Unsupported local embedding model: {}", other),
        };

        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(model).with_show_download_progress(true),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        Ok(LocalEmbedder {
            model: Arc::new(parking_lot::Mutex::new(model)),
            model_name: config.model.clone(),
            dims: config.dims,
            batch_size: config.batch_size,
        })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        let batch_size = self.batch_size;

        let vectors = tokio::task::spawn_blocking(move || {
            let mut model = model.lock();
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
        })
        .await??;

        Ok(vectors
            .into_iter()
            .map(|values| Embedding { values })
            .collect())
    }
}
