use snafu::Snafu;

use crate::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to save settings: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display(
        "no API key configured; pass --api-key or set SAHAI_API_KEY or GEMINI_API_KEY"
    ))]
    MissingApiKey { stage: &'static str },
    #[snafu(display("failed to create model provider: {source}"))]
    Provider {
        stage: &'static str,
        source: sahai_llm::ProviderError,
    },
    #[snafu(display("failed to open chat history at {path}: {source}"))]
    OpenHistory {
        stage: &'static str,
        path: String,
        source: sahai_storage::StorageError,
    },
    #[snafu(display("failed to reset chat history: {source}"))]
    ResetHistory {
        stage: &'static str,
        source: sahai_chat::HistoryError,
    },
    #[snafu(display("terminal I/O failed: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;
