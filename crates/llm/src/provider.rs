use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::model::SamplingParams;

/// Identifier for one streamed prompt/reply exchange.
///
/// Every send allocates a new turn so events from an abandoned stream can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub turn: TurnId,
    pub model_id: String,
    /// Prior turns followed by the prompt as the final user message.
    pub messages: Vec<ProviderMessage>,
    pub preamble: Option<String>,
    pub sampling: SamplingParams,
}

impl StreamRequest {
    pub fn new(turn: TurnId, model_id: impl Into<String>, messages: Vec<ProviderMessage>) -> Self {
        Self {
            turn,
            model_id: model_id.into(),
            messages,
            preamble: None,
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }
}

/// Provider-agnostic stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub turn: TurnId,
    pub payload: StreamEventPayload,
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for {turn:?} has no user prompt"))]
    EmptyPrompt { stage: &'static str, turn: TurnId },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("model stream for {turn:?} failed: {message}"))]
    StreamFailed {
        stage: &'static str,
        turn: TurnId,
        message: String,
    },
    #[snafu(display("model stream for {turn:?} ended before a terminal event"))]
    StreamClosed { stage: &'static str, turn: TurnId },
}

pub struct ProviderEventStream {
    turn: TurnId,
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        turn: TurnId,
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            turn,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn turn(&self) -> TurnId {
        self.turn
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

pub fn make_event_stream(
    turn: TurnId,
) -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(turn, event_rx, cancel_tx),
        cancel_rx,
    )
}
