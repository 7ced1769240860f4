//! # ThreadGPT
//!
//! Branching conversations with a chat-completion API. Every message is a
//! node in a tree; replying, regenerating, tweaking and pruning produce
//! alternative conversation paths instead of a single linear chat log.
//!
//! ## Features
//!
//! - **Conversation tree**: nodes persisted one JSON document per key, with
//!   cascading subtree deletion and non-destructive "tweak" copies
//! - **Reply generation**: one node per returned choice, raw response kept for display
//! - **Offline credential**: the `cat` key answers locally, no network needed
//! - **Settings**: model, temperature, top_p and secret key with cache-and-invalidate
//! - **JSON-RPC over stdio** and a one-shot CLI
//!
//! ## Architecture
//!
//! ```text
//! Client → JSON-RPC / CLI → ThreadController → TreeStore → KvStore (SQLite / memory)
//!                                   ↓
//!                         CompletionGateway (HTTP)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use threadgpt::{Config, AppState, RpcServer};
//! use threadgpt::gateway::OpenAiClient;
//! use threadgpt::settings::SettingsService;
//! use threadgpt::storage::SqliteStore;
//! use threadgpt::tree::TreeStore;
//! use threadgpt::view::{StaticPrompt, ThreadController};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let kv = Arc::new(SqliteStore::new(&config.database).await?);
//!     let store = TreeStore::new(kv.clone(), &config.tree);
//!     let gateway = OpenAiClient::new(&config.openai, config.request.clone())?;
//!     let controller = ThreadController::new(
//!         store,
//!         Arc::new(gateway),
//!         SettingsService::new(kv),
//!         Arc::new(StaticPrompt::declining()),
//!     );
//!     let server = RpcServer::new(Arc::new(AppState::new(config, controller)));
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

/// Command-line interface.
pub mod cli;
/// Configuration management.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Chat-completion gateway: HTTP client, offline double and wire types.
pub mod gateway;
/// JSON-RPC server and request handling.
pub mod server;
/// User settings stored next to the tree.
pub mod settings;
/// Key-value adapters the tree and settings persist through.
pub mod storage;
/// Conversation tree: nodes, ids, store and walker.
pub mod tree;
/// Per-node view state and the mutation controller.
pub mod view;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::{AppState, RpcServer, SharedState};
