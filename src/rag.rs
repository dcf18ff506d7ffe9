use crate::error::{RagError, Result};
use crate::llm::{ChatModel, Message, TokenStream};
use crate::retriever::Retriever;
use futures_util::stream::{self, BoxStream, StreamExt};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Standing instruction sent first in every generation call
pub const SYSTEM_PROMPT: &str = "You are a professional assistant who answers questions strictly based on the provided document context.
Your goal is to be accurate and faithful to the source material.
If the answer is not in the provided context, you MUST state: 'The provided documents do not contain information on that topic.'
Do not use any of your outside general knowledge to answer questions.";

/// The only answer allowed when the context does not cover the question
pub const NO_CONTEXT_ANSWER: &str = "The provided documents do not contain information on that topic.";

pub const CONTEXT_PREFIX: &str = "Context from documents:\n\n";

/// One event of a streamed answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Token { delta: String },
    /// Terminal; nothing follows it
    Done,
}

impl StreamEvent {
    /// Frame the event as a server-sent-events `data:` record
    pub fn to_sse(&self) -> serde_json::Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// Output of the retrieval stage, ready to be handed to the model.
///
/// Only [`RagEngine::retrieve`] builds one, so generation cannot run on a
/// message sequence that skipped retrieval.
#[derive(Debug, Clone)]
pub struct RetrievedTurn {
    /// System instruction, prior turns, context block, new user message
    messages: Vec<Message>,
}

/// Retrieve-then-generate over the shared index
#[derive(Clone)]
pub struct RagEngine {
    retriever: Retriever,
    llm: Arc<dyn ChatModel>,
}

impl RagEngine {
    pub fn new(retriever: Retriever, llm: Arc<dyn ChatModel>) -> Self {
        RagEngine { retriever, llm }
    }

    /// First stage: look up context for `message` and assemble the model input.
    ///
    /// Only user and assistant turns of `history` are carried over. The
    /// context message is always present, empty when nothing was retrieved.
    pub async fn retrieve(&self, message: &str, history: &[Message]) -> Result<RetrievedTurn> {
        // Retrieve relevant chunks
        let chunks = self.retriever.retrieve_texts(message).await?;

        // Create context from chunks
        let context = chunks.join("\n\n");
        debug!("Context block of {} chars from {} chunks", context.len(), chunks.len());

        let mut messages = Vec::with_capacity(history.len() + 3);
        messages.push(Message::System(SYSTEM_PROMPT.to_string()));
        // prior turns only; stale context blocks are not replayed
        messages.extend(
            history
                .iter()
                .filter(|m| matches!(m, Message::User(_) | Message::Assistant(_)))
                .cloned(),
        );
        messages.push(Message::Context(format!("{}{}", CONTEXT_PREFIX, context)));
        messages.push(Message::User(message.to_string()));

        Ok(RetrievedTurn { messages })
    }

    /// Second stage, synchronous: the full answer for a retrieved turn
    pub async fn generate_from(&self, turn: RetrievedTurn, model: &str) -> Result<String> {
        let answer = self
            .llm
            .complete(model, &turn.messages)
            .await
            .map_err(RagError::Generation)?;
        info!("Generated {} chars with {}", answer.len(), model);
        Ok(answer)
    }

    /// Second stage, streaming: token events followed by a single `Done`.
    ///
    /// A failure after the stream started is yielded as the last item.
    pub async fn stream_from(&self, turn: RetrievedTurn, model: &str) -> Result<EventStream> {
        let tokens = self
            .llm
            .stream(model, &turn.messages)
            .await
            .map_err(RagError::Generation)?;
        info!("Streaming answer from {}", model);
        Ok(token_events(tokens))
    }

    /// Answer `message` given the prior conversation
    pub async fn generate(&self, message: &str, history: &[Message], model: &str) -> Result<String> {
        let turn = self.retrieve(message, history).await?;
        self.generate_from(turn, model).await
    }

    /// Streaming counterpart of [`RagEngine::generate`]
    pub async fn generate_stream(
        &self,
        message: &str,
        history: &[Message],
        model: &str,
    ) -> Result<EventStream> {
        let turn = self.retrieve(message, history).await?;
        self.stream_from(turn, model).await
    }
}

fn token_events(tokens: TokenStream) -> EventStream {
    stream::unfold(Some(tokens), |state| async move {
        let mut tokens = state?;
        match tokens.next().await {
            Some(Ok(delta)) => Some((Ok(StreamEvent::Token { delta }), Some(tokens))),
            Some(Err(e)) => Some((Err(RagError::Generation(e)), None)),
            None => Some((Ok(StreamEvent::Done), None)),
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::Embedder;
    use crate::index::{IndexEntry, MemoryIndex, VectorIndex};
    use crate::retriever::DEFAULT_TOP_K;
    use crate::testing::{KeywordEmbedder, Script, ScriptedModel, UnreachableIndex};

    const DIMS: usize = 128;

    async fn engine_with(texts: &[&str], model: Arc<ScriptedModel>) -> RagEngine {
        let embedder = Arc::new(KeywordEmbedder::new(DIMS));
        let index = Arc::new(MemoryIndex::new(DIMS));
        let mut entries = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            entries.push(IndexEntry {
                vector: embedder.embed(text).await.unwrap().values,
                source: "handbook.txt".to_string(),
                chunk_id: i,
                text: text.to_string(),
            });
        }
        index.upsert(entries).await.unwrap();
        RagEngine::new(Retriever::new(embedder, index, DEFAULT_TOP_K), model)
    }

    async fn collect_text(events: EventStream) -> (String, Vec<StreamEvent>) {
        let events: Vec<StreamEvent> = events.map(|e| e.unwrap()).collect().await;
        let text = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token { delta } => Some(delta.as_str()),
                StreamEvent::Done => None,
            })
            .collect();
        (text, events)
    }

    #[tokio::test]
    async fn test_message_order_with_echo_model() {
        let model = Arc::new(ScriptedModel::new(Script::Echo));
        let engine = engine_with(&["Ping replies are sent every ten seconds."], model.clone()).await;

        let answer = engine.generate("ping", &[], "gpt-4o").await.unwrap();
        assert!(answer.contains("Context from documents:"));
        assert!(answer.contains("every ten seconds"));

        let messages = model.last_messages().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], Message::System(SYSTEM_PROMPT.to_string()));
        assert!(matches!(&messages[1], Message::Context(c) if c.starts_with(CONTEXT_PREFIX)));
        assert_eq!(messages[2], Message::User("ping".to_string()));
    }

    #[tokio::test]
    async fn test_empty_index_gets_refusal() {
        let model = Arc::new(ScriptedModel::new(Script::RefuseWithoutContext));
        let engine = engine_with(&[], model.clone()).await;

        let answer = engine
            .generate("Who founded the company?", &[], "gpt-4o")
            .await
            .unwrap();
        assert_eq!(answer, NO_CONTEXT_ANSWER);

        let messages = model.last_messages().unwrap();
        assert_eq!(messages[1], Message::Context(CONTEXT_PREFIX.to_string()));
    }

    #[tokio::test]
    async fn test_stream_matches_sync() {
        let model = Arc::new(ScriptedModel::new(Script::Echo));
        let engine = engine_with(
            &["The office opens at nine.", "Lunch is served at noon."],
            model,
        )
        .await;

        let sync = engine.generate("When does the office open?", &[], "gpt-4o").await.unwrap();
        let stream = engine
            .generate_stream("When does the office open?", &[], "gpt-4o")
            .await
            .unwrap();
        let (streamed, events) = collect_text(stream).await;

        assert_eq!(streamed, sync);
        assert!(events.len() > 2);
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        assert_eq!(
            events.iter().filter(|e| **e == StreamEvent::Done).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_model_is_chosen_per_call() {
        let model = Arc::new(ScriptedModel::new(Script::Reply("ok".to_string())));
        let engine = engine_with(&["anything"], model.clone()).await;

        engine.generate("a", &[], "gpt-4o").await.unwrap();
        engine.generate("b", &[], "gpt-4o-mini").await.unwrap();
        assert_eq!(model.models(), vec!["gpt-4o", "gpt-4o-mini"]);
    }

    #[tokio::test]
    async fn test_history_precedes_context() {
        let model = Arc::new(ScriptedModel::new(Script::Reply("ok".to_string())));
        let engine = engine_with(&["The office opens at nine."], model.clone()).await;
        let history = vec![
            Message::User("Hi".to_string()),
            Message::Assistant("Hello!".to_string()),
            Message::Context("stale context".to_string()),
        ];

        engine.generate("When does it open?", &history, "gpt-4o").await.unwrap();

        let messages = model.last_messages().unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[1], history[0]);
        assert_eq!(messages[2], history[1]);
        assert!(matches!(&messages[3], Message::Context(c) if c.contains("nine")));
        assert_eq!(messages[4], Message::User("When does it open?".to_string()));
    }

    #[tokio::test]
    async fn test_generation_failure_is_an_error() {
        let model = Arc::new(ScriptedModel::new(Script::Fail));
        let engine = engine_with(&["anything"], model).await;

        let err = engine.generate("q", &[], "gpt-4o").await.unwrap_err();
        assert!(matches!(err, RagError::Generation(_)));
        assert!(engine.generate_stream("q", &[], "gpt-4o").await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_index_aborts_before_generation() {
        let model = Arc::new(ScriptedModel::new(Script::Echo));
        let engine = RagEngine::new(
            Retriever::new(
                Arc::new(KeywordEmbedder::new(DIMS)),
                Arc::new(UnreachableIndex { dims: DIMS }),
                DEFAULT_TOP_K,
            ),
            model.clone(),
        );

        let err = engine.generate("q", &[], "gpt-4o").await.unwrap_err();
        assert!(matches!(err, RagError::IndexUnavailable(_)));
        assert!(model.last_messages().is_none());
    }

    #[tokio::test]
    async fn test_stream_error_ends_stream() {
        let tokens: TokenStream = stream::iter(vec![
            Ok("partial ".to_string()),
            Err(anyhow::anyhow!("connection reset")),
            Ok("never".to_string()),
        ])
        .boxed();

        let events: Vec<Result<StreamEvent>> = token_events(tokens).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Ok(StreamEvent::Token { delta }) if delta == "partial "));
        assert!(matches!(&events[1], Err(RagError::Generation(_))));
    }

    #[test]
    fn test_stream_event_wire_format() {
        let token = StreamEvent::Token {
            delta: "Hel".to_string(),
        };
        assert_eq!(token.to_sse().unwrap(), "data: {\"type\":\"token\",\"delta\":\"Hel\"}\n\n");
        assert_eq!(StreamEvent::Done.to_sse().unwrap(), "data: {\"type\":\"done\"}\n\n");
    }
}
