mod connectivity;
mod history;
mod message;
mod store;

pub use connectivity::{
    ConnectivityGate, ConnectivityProbe, DEFAULT_PROBE_ADDR, DEFAULT_PROBE_INTERVAL,
    DEFAULT_PROBE_TIMEOUT,
};
pub use history::{CHAT_HISTORY_KEY, HistoryError, HistoryResult, PersistedHistory};
pub use message::{Message, MessageId, Role};
pub use store::{
    ConversationSnapshot, ConversationStore, GREETING_FAILED_TEXT, GREETING_PROMPT,
    GreetingOutcome, InitOutcome, OFFLINE_SEND_TEXT, OFFLINE_WELCOME_TEXT, SEND_FAILED_TEXT,
    SendOutcome,
};
