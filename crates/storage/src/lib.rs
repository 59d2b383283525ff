pub mod error;
pub mod memory;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Flat string key-value storage with last-write-wins semantics.
///
/// No transactions and no expiry; a `set` overwrites any prior value and
/// `remove` on a missing key succeeds.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
}

pub(crate) fn ensure_key(key: &str, stage: &'static str) -> StorageResult<()> {
    snafu::ensure!(!key.trim().is_empty(), error::EmptyKeySnafu { stage });
    Ok(())
}
