//! Key-value persistence for conversation nodes and user settings.
//!
//! Every piece of durable state is a JSON document under a string key.
//! Conversation nodes live under `<namespace>/<NodeId>`; settings use flat
//! keys such as `openaiSecretKey`. Each key is written atomically, so a reader
//! never observes a half-written document.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageResult;

/// Durable mapping from string key to JSON document.
///
/// This is the only capability the conversation tree and the settings service
/// require from their backing store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the document stored under `key`, if any.
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;
    /// Store `value` under `key`, replacing any previous document.
    async fn set(&self, key: &str, value: &Value) -> StorageResult<()>;
    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;
}
