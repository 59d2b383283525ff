use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::{gemini, openai};
use rig::streaming::StreamedAssistantContent;
use serde_json::Value;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    EmptyPromptSnafu, HttpClientSnafu, LlmProvider, MissingApiKeySnafu, ProviderConfig,
    ProviderError, ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, Role,
    StreamEventMapped, StreamEventPayload, StreamRequest, TurnId, make_event_stream,
};

pub const GEMINI_PROVIDER_ID: &str = "gemini";
pub const OPENAI_PROVIDER_ID: &str = "openai";

/// Vendor API reached through rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigBackend {
    Gemini,
    OpenAi,
}

impl RigBackend {
    pub fn provider_id(&self) -> &'static str {
        match self {
            Self::Gemini => GEMINI_PROVIDER_ID,
            Self::OpenAi => OPENAI_PROVIDER_ID,
        }
    }
}

pub struct RigProviderAdapter {
    config: ProviderConfig,
    backend: RigBackend,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig, backend: RigBackend) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config, backend })
    }

    pub fn backend(&self) -> RigBackend {
        self.backend
    }

    fn build_gemini_client(config: &ProviderConfig) -> ProviderResult<gemini::Client> {
        let mut builder = gemini::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-gemini-client",
        })
    }

    fn build_openai_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-openai-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.content.clone()),
            Role::Model => RigMessage::assistant(message.content.clone()),
        }
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        turn: TurnId,
        error: ProviderError,
    ) {
        let _ = event_tx.send(StreamEventMapped {
            turn,
            payload: StreamEventPayload::Error(error.to_string()),
        });
    }

    fn map_stream_item<R>(turn: TurnId, item: StreamedAssistantContent<R>) -> Option<StreamEventMapped>
    where
        R: Clone + Unpin,
    {
        let payload = match item {
            StreamedAssistantContent::Text(text) => {
                if text.text.is_empty() {
                    return None;
                }
                StreamEventPayload::Delta(text.text)
            }
            // Thinking output is not part of the visible reply.
            StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => return None,
        };

        Some(StreamEventMapped { turn, payload })
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        backend: RigBackend,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        cancel_rx: oneshot::Receiver<()>,
    ) {
        let turn = request.turn;
        match backend {
            RigBackend::Gemini => match Self::build_gemini_client(&config) {
                Ok(client) => {
                    let model = client.completion_model(request.model_id.clone());
                    let params = request.sampling.gemini_additional_params();
                    Self::drive_stream(model, request, params, event_tx, cancel_rx).await;
                }
                Err(error) => Self::emit_error_event(&event_tx, turn, error),
            },
            RigBackend::OpenAi => match Self::build_openai_client(&config) {
                Ok(client) => {
                    let model = client.completion_model(request.model_id.clone());
                    let params = request.sampling.openai_additional_params();
                    Self::drive_stream(model, request, params, event_tx, cancel_rx).await;
                }
                Err(error) => Self::emit_error_event(&event_tx, turn, error),
            },
        }
    }

    async fn drive_stream<M>(
        model: M,
        request: StreamRequest,
        additional_params: Option<Value>,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) where
        M: CompletionModel + 'static,
    {
        let turn = request.turn;
        let mut history = request
            .messages
            .iter()
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = history.pop() else {
            tracing::error!(turn = ?turn, "message list empty before prompt extraction");
            Self::emit_error_event(
                &event_tx,
                turn,
                ProviderError::EmptyPrompt {
                    stage: "drive-stream-pop-prompt",
                    turn,
                },
            );
            return;
        };

        let mut builder = model.completion_request(prompt).messages(history);
        if let Some(preamble) = request.preamble.as_ref()
            && !preamble.trim().is_empty()
        {
            builder = builder.preamble(preamble.clone());
        }
        if let Some(temperature) = request.sampling.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(params) = additional_params {
            builder = builder.additional_params(params);
        }

        let mut stream = match builder.stream().await {
            Ok(stream) => stream,
            Err(source) => {
                tracing::error!(
                    turn = ?turn,
                    model_id = %request.model_id,
                    error = %source,
                    "failed to open provider stream"
                );
                let error = ProviderError::CompletionsFailed {
                    stage: "open-stream",
                    source,
                };
                Self::emit_error_event(&event_tx, turn, error);
                return;
            }
        };

        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    tracing::debug!(turn = ?turn, "provider stream cancelled");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(turn, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                turn = ?turn,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, turn, error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            let _ = event_tx.send(StreamEventMapped {
                turn,
                payload: StreamEventPayload::Done,
            });
        }
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        match self.backend {
            RigBackend::Gemini => "Rig Gemini",
            RigBackend::OpenAi => "Rig OpenAI",
        }
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            request
                .messages
                .last()
                .is_some_and(|message| message.role == Role::User),
            EmptyPromptSnafu {
                stage: "stream-chat",
                turn: request.turn,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.turn);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            self.backend,
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}
