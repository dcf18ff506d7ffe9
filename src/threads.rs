use crate::error::{RagError, Result};
use crate::llm::Message;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;

/// In-process conversation threads, each an append-only message log.
///
/// Concurrent appends to the same thread are not serialized beyond the
/// individual call.
#[derive(Debug, Default)]
pub struct ThreadStore {
    threads: RwLock<HashMap<String, Vec<Message>>>,
}

impl ThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new empty thread and return its id
    pub fn create(&self) -> String {
        let id = format!("thread_{}", uuid::Uuid::new_v4());
        self.threads.write().insert(id.clone(), Vec::new());
        debug!("Created conversation {}", id);
        id
    }

    /// Snapshot of the messages in `id`, oldest first
    pub fn history(&self, id: &str) -> Result<Vec<Message>> {
        self.threads
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RagError::ThreadNotFound(id.to_string()))
    }

    /// Append several messages under one lock so they stay adjacent
    pub fn extend(&self, id: &str, messages: impl IntoIterator<Item = Message>) -> Result<()> {
        let mut threads = self.threads.write();
        let thread = threads
            .get_mut(id)
            .ok_or_else(|| RagError::ThreadNotFound(id.to_string()))?;
        thread.extend(messages);
        Ok(())
    }
}
