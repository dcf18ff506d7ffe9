//! Fakes shared by the unit tests. Nothing here talks to a live service.

use crate::embeddings::{Embedder, Embedding};
use crate::error::{RagError, Result};
use crate::index::{IndexEntry, SearchHit, VectorIndex};
use crate::llm::{ChatModel, Message, TokenStream};
use crate::rag::{CONTEXT_PREFIX, NO_CONTEXT_ANSWER};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Deterministic bag-of-words embedder: each word bumps one hashed dimension
pub(crate) struct KeywordEmbedder {
    dims: usize,
    reported_dims: usize,
    calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub(crate) fn new(dims: usize) -> Self {
        KeywordEmbedder {
            dims,
            reported_dims: dims,
            calls: AtomicUsize::new(0),
        }
    }

    /// Claim a different dimensionality than the vectors actually produced
    pub(crate) fn with_reported_dims(mut self, dims: usize) -> Self {
        self.reported_dims = dims;
        self
    }

    /// Number of `embed_batch` calls so far
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut values = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            let hash = word
                .bytes()
                .fold(0xcbf29ce484222325u64, |h, b| {
                    (h ^ b as u64).wrapping_mul(0x100000001b3)
                });
            values[(hash % self.dims as u64) as usize] += 1.0;
        }
        values[self.dims - 1] += 0.01;
        values
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-hash"
    }

    fn dims(&self) -> usize {
        self.reported_dims
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Embedding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| Embedding {
                values: self.vectorize(t),
            })
            .collect())
    }
}

/// Embedder whose backend is always down
pub(crate) struct BrokenEmbedder;

#[async_trait]
impl Embedder for BrokenEmbedder {
    fn model_name(&self) -> &str {
        "broken"
    }

    fn dims(&self) -> usize {
        384
    }

    async fn embed_batch(&self, _texts: &[String]) -> anyhow::Result<Vec<Embedding>> {
        Err(anyhow::anyhow!("embedding service unreachable"))
    }
}

/// Index that cannot be reached
pub(crate) struct UnreachableIndex {
    pub(crate) dims: usize,
}

fn refused() -> RagError {
    RagError::IndexUnavailable(anyhow::anyhow!("connection refused"))
}

#[async_trait]
impl VectorIndex for UnreachableIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn upsert(&self, _entries: Vec<IndexEntry>) -> Result<usize> {
        Err(refused())
    }

    async fn search(&self, _query: &[f32], _k: usize) -> Result<Vec<SearchHit>> {
        Err(refused())
    }

    async fn sources(&self) -> Result<Vec<String>> {
        Err(refused())
    }

    async fn count(&self) -> Result<usize> {
        Err(refused())
    }
}

/// How a [`ScriptedModel`] answers
pub(crate) enum Script {
    /// Reply with every message content joined by newlines
    Echo,
    /// Reply with the no-information sentence when the context block is empty
    RefuseWithoutContext,
    Reply(String),
    /// Stream the reply, then break off before the end-of-stream marker
    CutOff(String),
    Fail,
}

/// Chat model double that records the message sequences it receives
pub(crate) struct ScriptedModel {
    script: Script,
    calls: Mutex<Vec<(String, Vec<Message>)>>,
}

impl ScriptedModel {
    pub(crate) fn new(script: Script) -> Self {
        ScriptedModel {
            script,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Message sequence of the most recent call
    pub(crate) fn last_messages(&self) -> Option<Vec<Message>> {
        self.calls.lock().last().map(|(_, m)| m.clone())
    }

    /// Model names requested, in call order
    pub(crate) fn models(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    fn respond(&self, model: &str, messages: &[Message]) -> anyhow::Result<String> {
        self.calls
            .lock()
            .push((model.to_string(), messages.to_vec()));

        match &self.script {
            Script::Echo => Ok(messages
                .iter()
                .map(|m| m.content())
                .collect::<Vec<_>>()
                .join("\n")),
            Script::RefuseWithoutContext => {
                let context = messages.iter().find_map(|m| match m {
                    Message::Context(text) => Some(text.trim_start_matches(CONTEXT_PREFIX)),
                    _ => None,
                });
                match context {
                    Some(text) if !text.trim().is_empty() => {
                        Ok(format!("According to the documents: {}", text.trim()))
                    }
                    _ => Ok(NO_CONTEXT_ANSWER.to_string()),
                }
            }
            Script::Reply(text) | Script::CutOff(text) => Ok(text.clone()),
            Script::Fail => Err(anyhow::anyhow!("429 Too Many Requests")),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, model: &str, messages: &[Message]) -> anyhow::Result<String> {
        self.respond(model, messages)
    }

    async fn stream(&self, model: &str, messages: &[Message]) -> anyhow::Result<TokenStream> {
        let reply = self.respond(model, messages)?;
        let mut pieces: Vec<anyhow::Result<String>> = reply
            .split_inclusive(' ')
            .map(|piece| Ok(piece.to_string()))
            .collect();
        if matches!(self.script, Script::CutOff(_)) {
            pieces.push(Err(anyhow::anyhow!("Stream ended before [DONE]")));
        }
        Ok(stream::iter(pieces).boxed())
    }
}

/// Write `content` to a temporary file that disappears when dropped
pub(crate) fn temp_document(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp file");
    file.write_all(content.as_bytes()).expect("write temp file");
    file
}
