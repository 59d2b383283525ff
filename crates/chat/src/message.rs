use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque message identifier.
///
/// Fresh ids are UUIDv7 strings, so they sort by creation time. Ids read back
/// from persisted history are kept verbatim even when they are not UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_v7(),
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Empty MODEL message that streamed text is written into.
    pub fn model_placeholder() -> Self {
        Self::new(Role::Model, String::new())
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(Role::Error, content)
    }

    pub fn is_error(&self) -> bool {
        self.role == Role::Error
    }

    /// ERROR messages and empty content never reach durable storage.
    pub fn is_persistable(&self) -> bool {
        !self.is_error() && !self.content.is_empty()
    }

    /// An empty MODEL message is a placeholder and has nothing to show.
    pub fn is_renderable(&self) -> bool {
        !(self.role == Role::Model && self.content.is_empty())
    }
}
