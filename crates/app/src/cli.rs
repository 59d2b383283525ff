use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::settings::SettingsOverrides;

#[derive(Debug, Parser)]
#[command(
    name = "sahai",
    version,
    about = "Sah.ai doubt engine: ask a tutor anything from your terminal"
)]
pub struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, value_name = "PATH")]
    pub settings: Option<PathBuf>,

    /// Model provider: gemini or openai
    #[arg(long, value_name = "ID")]
    pub provider: Option<String>,

    #[arg(long, value_name = "KEY")]
    pub api_key: Option<String>,

    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Override the provider base URL
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// SQLite file holding the saved conversation
    #[arg(long, value_name = "PATH")]
    pub history_db: Option<String>,

    /// host:port used to detect connectivity
    #[arg(long, value_name = "HOST:PORT")]
    pub probe_addr: Option<String>,

    #[arg(long, value_name = "SECONDS")]
    pub probe_interval_secs: Option<u64>,

    /// Forget the saved conversation before starting
    #[arg(long)]
    pub reset_history: bool,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    pub save_settings: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            provider_id: self.provider.clone(),
            api_key: self.api_key.clone(),
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            history_db: self.history_db.clone(),
            probe_addr: self.probe_addr.clone(),
            probe_interval_secs: self.probe_interval_secs,
        }
    }

    pub fn log_filter(&self) -> Option<&'static str> {
        match self.verbose {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        }
    }
}
