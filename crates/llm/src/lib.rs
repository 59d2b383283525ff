use std::sync::Arc;

mod model;
mod provider;
mod rig_adapter;
mod session;

pub use model::{DEFAULT_GEMINI_MODEL, DEFAULT_OPENAI_MODEL, SamplingParams};
pub use provider::{
    LlmProvider, ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamEventMapped,
    StreamEventPayload, StreamRequest, TurnId, make_event_stream,
};
pub use rig_adapter::{GEMINI_PROVIDER_ID, OPENAI_PROVIDER_ID, RigBackend, RigProviderAdapter};
pub use session::{ChatSession, ModelSession, SessionConfig, TextChunk, TextChunkStream};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = GEMINI_PROVIDER_ID.to_string();
    }

    let backend = match config.provider_id.as_str() {
        "gemini" | "google" | "rig-gemini" => RigBackend::Gemini,
        "openai" | "rig-openai" => RigBackend::OpenAi,
        _ => {
            return Err(ProviderError::UnsupportedProvider {
                stage: "create-provider",
                provider_id: config.provider_id,
            });
        }
    };

    config.provider_id = backend.provider_id().to_string();
    Ok(Arc::new(RigProviderAdapter::new(config, backend)?))
}

/// Default model for a provider id accepted by [`create_provider`].
pub fn default_model_for(provider_id: &str) -> &'static str {
    match provider_id.trim() {
        "openai" | "rig-openai" => DEFAULT_OPENAI_MODEL,
        _ => DEFAULT_GEMINI_MODEL,
    }
}
