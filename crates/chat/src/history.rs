use std::sync::Arc;

use sahai_storage::{KeyValueStore, StorageError};
use snafu::{ResultExt, Snafu};

use super::message::Message;

pub const CHAT_HISTORY_KEY: &str = "sahAiChatHistory";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HistoryError {
    #[snafu(display("history storage failed on `{stage}`, {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to encode chat history"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("persisted chat history is malformed: {source}"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
}

pub type HistoryResult<T> = Result<T, HistoryError>;

/// JSON codec for the conversation over a single storage key.
#[derive(Clone)]
pub struct PersistedHistory {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl PersistedHistory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            key: CHAT_HISTORY_KEY.to_string(),
        }
    }

    /// Reads the saved conversation. Missing or empty arrays yield `None`.
    pub fn load(&self) -> HistoryResult<Option<Vec<Message>>> {
        let Some(raw) = self.store.get(&self.key).context(StorageSnafu {
            stage: "history-load-get",
        })?
        else {
            return Ok(None);
        };

        let messages: Vec<Message> = serde_json::from_str(&raw).context(DecodeSnafu {
            stage: "history-load-decode",
        })?;
        let messages: Vec<Message> = messages
            .into_iter()
            .filter(Message::is_persistable)
            .collect();

        if messages.is_empty() {
            return Ok(None);
        }
        Ok(Some(messages))
    }

    /// Writes the persistable subset. Returns `false` when nothing qualified
    /// and storage was left untouched.
    pub fn save(&self, messages: &[Message]) -> HistoryResult<bool> {
        let persistable: Vec<&Message> = messages
            .iter()
            .filter(|message| message.is_persistable())
            .collect();
        if persistable.is_empty() {
            return Ok(false);
        }

        let encoded = serde_json::to_string(&persistable).context(EncodeSnafu {
            stage: "history-save-encode",
        })?;
        self.store
            .set(&self.key, &encoded)
            .context(StorageSnafu {
                stage: "history-save-set",
            })?;
        Ok(true)
    }

    pub fn clear(&self) -> HistoryResult<()> {
        self.store.remove(&self.key).context(StorageSnafu {
            stage: "history-clear",
        })
    }
}
