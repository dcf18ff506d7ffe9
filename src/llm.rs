use crate::config::{env_opt, env_or, env_string};
use crate::error::RagError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

/// Generation models a caller can pick per request
pub const AVAILABLE_MODELS: [&str; 2] = ["gpt-4o", "gpt-4o-mini"];
pub const DEFAULT_MODEL: &str = AVAILABLE_MODELS[0];

/// A role-tagged message in a generation call or conversation thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "content", rename_all = "lowercase")]
pub enum Message {
    /// Standing instruction for the model
    System(String),
    /// Retrieved document context, sent to the model as a system message
    Context(String),
    User(String),
    Assistant(String),
}

impl Message {
    /// Role name on the chat-completions wire
    pub fn role(&self) -> &'static str {
        match self {
            Message::System(_) | Message::Context(_) => "system",
            Message::User(_) => "user",
            Message::Assistant(_) => "assistant",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Message::System(text)
            | Message::Context(text)
            | Message::User(text)
            | Message::Assistant(text) => text,
        }
    }
}

/// Incremental text deltas produced by a streaming generation call
pub type TokenStream = BoxStream<'static, Result<String>>;

/// A chat language model; the model variant is chosen per call
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Generate a complete response
    async fn complete(&self, model: &str, messages: &[Message]) -> Result<String>;

    /// Generate a response as a stream of text deltas
    async fn stream(&self, model: &str, messages: &[Message]) -> Result<TokenStream>;
}

/// Configuration for the chat-completions API
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub temperature: f32,
    /// Retries for transient failures (429, 5xx, network) before giving up
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl LlmConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> std::result::Result<Self, RagError> {
        Ok(LlmConfig {
            api_key: env_opt("OPENAI_API_KEY"),
            base_url: env_string("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            temperature: env_or("LLM_TEMPERATURE", 0.0f32)?,
            max_retries: env_or("LLM_MAX_RETRIES", 2u32)?,
            timeout_secs: env_or("LLM_TIMEOUT_SECS", 120u64)?,
        })
    }
}

/// Client for an OpenAI-compatible chat-completions endpoint
#[derive(Clone)]
pub struct OpenAiClient {
    config: LlmConfig,
    client: reqwest::Client,
}

enum AttemptError {
    /// Worth retrying: rate limits, server errors, network failures
    Transient(anyhow::Error),
    Fatal(anyhow::Error),
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize, Debug)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Debug, Default)]
struct ChunkDelta {
    content: Option<String>,
}

impl OpenAiClient {
    /// Create a new chat-completions client
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build chat HTTP client")?;
        Ok(OpenAiClient { config, client })
    }

    async fn post_chat(
        &self,
        model: &str,
        messages: &[Message],
        stream: bool,
    ) -> std::result::Result<reqwest::Response, AttemptError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| AttemptError::Fatal(anyhow::anyhow!("OPENAI_API_KEY not set")))?;

        let request = ChatRequest {
            model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role(),
                    content: m.content(),
                })
                .collect(),
            temperature: self.config.temperature,
            stream,
        };

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                AttemptError::Transient(anyhow::Error::new(e).context("Chat request failed"))
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let err = anyhow::anyhow!("Chat API request failed: {} {}", status, error_text);
        if status.as_u16() == 429 || status.is_server_error() {
            Err(AttemptError::Transient(err))
        } else {
            Err(AttemptError::Fatal(err))
        }
    }

    async fn complete_once(
        &self,
        model: &str,
        messages: &[Message],
    ) -> std::result::Result<String, AttemptError> {
        let response = self.post_chat(model, messages, false).await?;
        let response_data: ChatResponse = response.json().await.map_err(|e| {
            AttemptError::Fatal(anyhow::Error::new(e).context("Malformed chat response"))
        })?;

        response_data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AttemptError::Fatal(anyhow::anyhow!("No response generated")))
    }

    /// Run `operation`, retrying transient failures with exponential backoff
    async fn with_retry<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Transient(e)) if attempt < self.config.max_retries => {
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                    warn!(
                        "Chat request failed (attempt {}/{}), retrying in {:?}: {:#}",
                        attempt + 1,
                        self.config.max_retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(AttemptError::Transient(e)) | Err(AttemptError::Fatal(e)) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, model: &str, messages: &[Message]) -> Result<String> {
        self.with_retry(|| self.complete_once(model, messages)).await
    }

    /// Only establishing the stream is retried; a stream that breaks midway
    /// surfaces the error to the consumer.
    async fn stream(&self, model: &str, messages: &[Message]) -> Result<TokenStream> {
        let response = self
            .with_retry(|| self.post_chat(model, messages, true))
            .await?;
        Ok(sse_tokens(response.bytes_stream()))
    }
}

/// One meaningful line of a chat-completions event stream
#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Delta(String),
    Done,
}

/// Parse a single server-sent-events line.
///
/// Blank lines, comments, non-data fields and deltas without text yield `None`.
fn parse_sse_line(line: &str) -> Result<Option<SseEvent>> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(Some(SseEvent::Done));
    }

    let chunk: ChatChunk = serde_json::from_str(data)
        .with_context(|| format!("Malformed stream chunk: {}", data))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty())
        .map(SseEvent::Delta))
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    finished: bool,
    /// `[DONE]` was received
    completed: bool,
    /// The body ended without `[DONE]`; reported once pending deltas are out
    truncated: bool,
}

impl SseState {
    /// Move every complete line out of the buffer into `pending`
    fn drain_lines(&mut self) -> Result<()> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            match parse_sse_line(line.trim_end())? {
                Some(SseEvent::Delta(text)) => self.pending.push_back(text),
                Some(SseEvent::Done) => {
                    self.finished = true;
                    self.completed = true;
                    self.buffer.clear();
                    break;
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// Turn a streaming chat-completions body into text deltas.
///
/// A body that ends before `data: [DONE]` yields an error after its last delta.
fn sse_tokens<S, B>(body: S) -> TokenStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = SseState {
        body: body.map(|r| r.map(|b| b.as_ref().to_vec())).boxed(),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
        completed: false,
        truncated: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(text) = state.pending.pop_front() {
                return Some((Ok(text), state));
            }
            if state.truncated {
                state.truncated = false;
                return Some((Err(anyhow::anyhow!("Stream ended before [DONE]")), state));
            }
            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(&bytes);
                    if let Err(e) = state.drain_lines() {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(anyhow::Error::new(e).context("Stream interrupted")), state));
                }
                None => {
                    // a final line may arrive without its newline
                    state.buffer.push(b'\n');
                    state.finished = true;
                    if let Err(e) = state.drain_lines() {
                        return Some((Err(e), state));
                    }
                    state.truncated = !state.completed;
                }
            }
        }
    })
    .boxed()
}
