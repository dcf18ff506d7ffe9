use crate::chunking::ChunkerConfig;
use crate::database::QdrantConfig;
use crate::embeddings::EmbeddingConfig;
use crate::error::{RagError, Result};
use crate::llm::LlmConfig;
use std::env;
use std::str::FromStr;

/// Which vector index implementation backs the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    Qdrant,
    /// Process-local index; contents vanish on exit
    Memory,
}

impl FromStr for VectorBackend {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "qdrant" => Ok(VectorBackend::Qdrant),
            "memory" => Ok(VectorBackend::Memory),
            other => Err(RagError::Config(format!(
                "unknown VECTOR_BACKEND {:?}, expected \"qdrant\" or \"memory\"",
                other
            ))),
        }
    }
}

/// Configuration for the whole process, read once at startup
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend: VectorBackend,
    pub qdrant: QdrantConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub chunking: ChunkerConfig,
    pub top_k: usize,
}

impl AppConfig {
    /// Create the configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let backend = env_string("VECTOR_BACKEND", "qdrant").parse()?;
        let top_k = env_or("RETRIEVAL_TOP_K", crate::retriever::DEFAULT_TOP_K)?;
        if top_k == 0 {
            return Err(RagError::Config("RETRIEVAL_TOP_K must be positive".into()));
        }

        Ok(AppConfig {
            backend,
            qdrant: QdrantConfig::from_env()?,
            embedding: EmbeddingConfig::from_env()?,
            llm: LlmConfig::from_env()?,
            chunking: ChunkerConfig::from_env()?,
            top_k,
        })
    }
}

/// Read `key` and parse it, falling back to `default` when unset
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => parse_var(key, &raw),
        Err(_) => Ok(default),
    }
}

pub(crate) fn env_string(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

/// Read `key`, treating an empty value as unset
pub(crate) fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| RagError::Config(format!("{} has invalid value {:?}", key, raw)))
}
