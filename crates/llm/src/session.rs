//! Stateful chat sessions on top of an [`LlmProvider`].
//!
//! A session owns the system instruction, the sampling knobs, and the
//! multi-turn history. Each call to [`ModelSession::send_message_stream`]
//! yields a lazy stream of text chunks; history only grows when a turn
//! finishes cleanly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::task::JoinHandle;

use super::model::SamplingParams;
use super::provider::{
    LlmProvider, ProviderError, ProviderEventStream, ProviderMessage, ProviderResult, Role,
    StreamEventPayload, StreamRequest, TurnId,
};

/// One incremental piece of a streamed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
}

impl TextChunk {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Finite, in-order chunk sequence. An `Err` item ends the turn.
pub type TextChunkStream = BoxStream<'static, ProviderResult<TextChunk>>;

/// Capability the conversation layer talks to; decoupled from any vendor SDK.
pub trait ModelSession: Send + Sync {
    fn send_message_stream(&self, prompt: &str) -> ProviderResult<TextChunkStream>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub model_id: String,
    pub system_instruction: Option<String>,
    pub sampling: SamplingParams,
}

impl SessionConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            system_instruction: None,
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }
}

type SharedHistory = Arc<Mutex<Vec<ProviderMessage>>>;

pub struct ChatSession {
    provider: Arc<dyn LlmProvider>,
    config: SessionConfig,
    history: SharedHistory,
    next_turn: AtomicU64,
}

impl ChatSession {
    pub fn new(provider: Arc<dyn LlmProvider>, config: SessionConfig) -> Self {
        Self {
            provider,
            config,
            history: Arc::new(Mutex::new(Vec::new())),
            next_turn: AtomicU64::new(1),
        }
    }

    /// Completed turns, oldest first.
    pub fn history(&self) -> Vec<ProviderMessage> {
        lock_history(&self.history).clone()
    }

    fn alloc_turn(&self) -> TurnId {
        TurnId::new(self.next_turn.fetch_add(1, Ordering::Relaxed))
    }

    fn build_request(&self, turn: TurnId, prompt: &str) -> StreamRequest {
        let mut messages = self.history();
        messages.push(ProviderMessage::new(Role::User, prompt));

        let mut request = StreamRequest::new(turn, self.config.model_id.clone(), messages)
            .with_sampling(self.config.sampling);
        if let Some(instruction) = &self.config.system_instruction {
            request = request.with_preamble(instruction.clone());
        }
        request
    }
}

impl ModelSession for ChatSession {
    fn send_message_stream(&self, prompt: &str) -> ProviderResult<TextChunkStream> {
        let turn = self.alloc_turn();
        let request = self.build_request(turn, prompt);
        let handle = self.provider.stream_chat(request)?;

        tracing::debug!(
            turn = ?turn,
            provider_id = %self.provider.id(),
            model_id = %self.config.model_id,
            "opening model stream"
        );

        let state = TurnState {
            prompt: prompt.to_string(),
            reply: String::new(),
            events: handle.stream,
            history: Arc::clone(&self.history),
            _worker: WorkerGuard(tokio::spawn(handle.worker)),
            finished: false,
        };

        Ok(stream::unfold(state, next_chunk).boxed())
    }
}

/// Aborts the provider worker once the chunk stream is dropped.
struct WorkerGuard(JoinHandle<()>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct TurnState {
    prompt: String,
    reply: String,
    events: ProviderEventStream,
    history: SharedHistory,
    _worker: WorkerGuard,
    finished: bool,
}

impl TurnState {
    fn commit(&mut self) {
        let mut history = lock_history(&self.history);
        history.push(ProviderMessage::new(Role::User, std::mem::take(&mut self.prompt)));
        history.push(ProviderMessage::new(Role::Model, std::mem::take(&mut self.reply)));
    }
}

async fn next_chunk(mut state: TurnState) -> Option<(ProviderResult<TextChunk>, TurnState)> {
    if state.finished {
        return None;
    }

    loop {
        let Some(event) = state.events.recv().await else {
            state.finished = true;
            let error = ProviderError::StreamClosed {
                stage: "session-recv",
                turn: state.events.turn(),
            };
            return Some((Err(error), state));
        };

        if event.turn != state.events.turn() {
            tracing::debug!(expected = ?state.events.turn(), received = ?event.turn, "dropping stale stream event");
            continue;
        }

        match event.payload {
            StreamEventPayload::Delta(text) => {
                state.reply.push_str(&text);
                return Some((Ok(TextChunk { text }), state));
            }
            StreamEventPayload::Done => {
                state.finished = true;
                state.commit();
                return None;
            }
            StreamEventPayload::Error(message) => {
                state.finished = true;
                let error = ProviderError::StreamFailed {
                    stage: "session-stream-event",
                    turn: state.events.turn(),
                    message,
                };
                return Some((Err(error), state));
            }
        }
    }
}

fn lock_history(history: &SharedHistory) -> std::sync::MutexGuard<'_, Vec<ProviderMessage>> {
    history.lock().unwrap_or_else(PoisonError::into_inner)
}
