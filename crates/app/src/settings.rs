use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use sahai_chat::{DEFAULT_PROBE_ADDR, DEFAULT_PROBE_INTERVAL};
use sahai_llm::{GEMINI_PROVIDER_ID, ProviderConfig, default_model_for};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "sahai";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const HISTORY_FILE_NAME: &str = "history.sqlite3";
pub const ENV_PREFIX: &str = "SAHAI_";
pub const API_KEY_FALLBACK_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    /// Blank means the provider's public endpoint.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_history_db")]
    pub history_db: String,
    #[serde(default = "default_probe_addr")]
    pub probe_addr: String,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: String::new(),
            model: default_model_for(GEMINI_PROVIDER_ID).to_string(),
            history_db: default_history_db(),
            probe_addr: default_probe_addr(),
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

impl AppSettings {
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.trim().is_empty() {
            return None;
        }

        Some(ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
        ))
    }

    pub fn with_api_key_fallback(mut self, fallback: Option<String>) -> Self {
        if self.api_key.trim().is_empty()
            && let Some(key) = fallback
        {
            self.api_key = key.trim().to_string();
        }
        self
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = self.endpoint.trim().to_string();
        let provider_id = self.provider_id.clone();
        self.model = non_blank_or(self.model, || default_model_for(&provider_id).to_string());
        self.history_db = non_blank_or(self.history_db, default_history_db);
        self.probe_addr = non_blank_or(self.probe_addr, default_probe_addr);
        if self.probe_interval_secs == 0 {
            self.probe_interval_secs = default_probe_interval_secs();
        }
        self
    }
}

/// Values given on the command line; unset fields leave lower layers alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SettingsOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_db: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_interval_secs: Option<u64>,
}

pub struct SettingsStore {
    settings: ArcSwap<AppSettings>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".sahai"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Layers defaults, the JSON file, `SAHAI_*` variables and `overrides`.
    pub fn open(config_path: PathBuf, overrides: &SettingsOverrides) -> Self {
        let figment = Self::figment(&config_path)
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(overrides));
        let settings = Self::extract(figment, &config_path);
        Self {
            settings: ArcSwap::from_pointee(settings),
            config_path,
        }
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn figment(path: &Path) -> Figment {
        // Model stays blank at the base layer so `normalized` picks it per provider.
        let base = AppSettings {
            model: String::new(),
            ..AppSettings::default()
        };
        let figment = Figment::from(Serialized::defaults(base));
        if path.exists() {
            figment.merge(Json::file(path))
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
            figment
        }
    }

    fn extract(figment: Figment, path: &Path) -> AppSettings {
        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: String, fallback: impl FnOnce() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    GEMINI_PROVIDER_ID.to_string()
}

fn default_history_db() -> String {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".sahai"))
        .join(HISTORY_FILE_NAME)
        .to_string_lossy()
        .into_owned()
}

fn default_probe_addr() -> String {
    DEFAULT_PROBE_ADDR.to_string()
}

fn default_probe_interval_secs() -> u64 {
    DEFAULT_PROBE_INTERVAL.as_secs()
}
