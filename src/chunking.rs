use crate::config::env_or;
use crate::error::{RagError, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

/// Preferred split points, strongest first
const SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// Chunk sizing, in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl ChunkerConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::Config("chunk size must be positive".into()));
        }
        if chunk_overlap >= chunk_size {
            return Err(RagError::Config(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                chunk_overlap, chunk_size
            )));
        }
        Ok(ChunkerConfig {
            chunk_size,
            chunk_overlap,
        })
    }

    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        ChunkerConfig::new(
            env_or("CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            env_or("CHUNK_OVERLAP", DEFAULT_CHUNK_OVERLAP)?,
        )
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        ChunkerConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

/// Represents a text chunk with metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// The actual text content of this chunk
    pub text: String,
    /// Name of the document this chunk was cut from
    pub source: String,
    /// Ordinal position of this chunk within its document
    pub chunk_id: usize,
    /// Character offset of this chunk in the original document
    pub start_position: usize,
}

/// Split text into overlapping chunks of at most `chunk_size` characters.
///
/// Each chunk after the first starts exactly `chunk_overlap` characters before
/// the end of its predecessor. Chunk ends are pulled back to the last
/// paragraph, line, sentence or word boundary inside the window when one
/// exists, otherwise the window is cut at `chunk_size`.
pub fn split_into_chunks(text: &str, file_name: &str, config: &ChunkerConfig) -> Vec<TextChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let separators: Vec<Vec<char>> = SEPARATORS.iter().map(|s| s.chars().collect()).collect();

    let mut chunks = Vec::new();
    let mut start = 0;

    loop {
        let end = if chars.len() - start <= config.chunk_size {
            chars.len()
        } else {
            find_break(&chars, start, config, &separators)
        };

        chunks.push(TextChunk {
            text: chars[start..end].iter().collect(),
            source: file_name.to_string(),
            chunk_id: chunks.len(),
            start_position: start,
        });

        if end == chars.len() {
            break;
        }
        start = end - config.chunk_overlap;
    }

    chunks
}

/// Find where the window starting at `start` should end.
///
/// The result is always greater than `start + chunk_overlap`, so the next
/// window makes progress.
fn find_break(
    chars: &[char],
    start: usize,
    config: &ChunkerConfig,
    separators: &[Vec<char>],
) -> usize {
    let hard_end = start + config.chunk_size;
    let min_end = start + config.chunk_overlap + 1;

    for separator in separators {
        let mut end = hard_end;
        while end >= min_end {
            if end >= separator.len() && chars[end - separator.len()..end] == separator[..] {
                return end;
            }
            end -= 1;
        }
    }

    hard_end
}
