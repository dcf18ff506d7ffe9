pub mod chunking;
pub mod config;
pub mod database;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod rag;
pub mod retriever;
pub mod state;
pub mod threads;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{RagError, Result};
pub use state::AppState;
