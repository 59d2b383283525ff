mod cli;
mod error;
mod persona;
mod settings;
mod terminal;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sahai_chat::{ConnectivityGate, ConnectivityProbe, ConversationStore, PersistedHistory};
use sahai_llm::ChatSession;
use sahai_storage::SqliteStorage;
use snafu::{OptionExt, ResultExt};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use error::{
    AppResult, MissingApiKeySnafu, OpenHistorySnafu, ProviderSnafu, ResetHistorySnafu,
    SettingsSnafu, TerminalSnafu,
};
use settings::{API_KEY_FALLBACK_ENV, SettingsStore};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.log_filter() {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    // Logs go to stderr so the transcript on stdout stays readable.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "sahai stopped");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> AppResult<()> {
    let config_path = cli
        .settings
        .clone()
        .unwrap_or_else(SettingsStore::default_config_path);
    let settings_store = SettingsStore::open(config_path, &cli.overrides());
    let settings = settings_store
        .settings()
        .as_ref()
        .clone()
        .with_api_key_fallback(std::env::var(API_KEY_FALLBACK_ENV).ok());

    if cli.save_settings {
        settings_store
            .update(settings.clone())
            .context(SettingsSnafu {
                stage: "save-settings",
            })?;
    }

    let provider_config = settings.to_provider_config().context(MissingApiKeySnafu {
        stage: "resolve-api-key",
    })?;
    let provider = sahai_llm::create_provider(provider_config).context(ProviderSnafu {
        stage: "create-provider",
    })?;
    tracing::info!(
        provider_id = %provider.id(),
        model = %settings.model,
        "model provider ready"
    );
    let session = Arc::new(ChatSession::new(
        provider,
        persona::session_config(&settings.model),
    ));

    let storage = SqliteStorage::open(&settings.history_db)
        .await
        .context(OpenHistorySnafu {
            stage: "open-history-db",
            path: settings.history_db.clone(),
        })?;
    let history = PersistedHistory::new(Arc::new(storage));
    if cli.reset_history {
        history.clear().context(ResetHistorySnafu {
            stage: "reset-history",
        })?;
        tracing::info!("chat history cleared");
    }

    let probe = ConnectivityProbe::new(settings.probe_addr.clone())
        .with_interval(Duration::from_secs(settings.probe_interval_secs));
    let gate = ConnectivityGate::new(probe.probe_once().await);
    let probe_task = probe.spawn(gate.clone());

    let conversation = Arc::new(ConversationStore::new(session, history, gate));

    println!("Sah.ai Doubt Engine: clear your doubts, instantly!");
    println!("Sah.ai is an AI and can make mistakes. Type {} to exit.\n", terminal::QUIT_COMMAND);

    let (shutdown, shutdown_signal) = oneshot::channel();
    let renderer = terminal::spawn_renderer(conversation.subscribe(), shutdown_signal);

    let outcome = conversation.initialize().await;
    tracing::info!(?outcome, "conversation initialized");
    let auto_retry = conversation.spawn_auto_retry();

    let input = terminal::run_input_loop(Arc::clone(&conversation)).await;

    auto_retry.abort();
    probe_task.abort();
    let _ = shutdown.send(());
    if let Err(error) = renderer.await {
        tracing::warn!(error = %error, "transcript renderer stopped abnormally");
    }

    input.context(TerminalSnafu {
        stage: "read-input",
    })
}
