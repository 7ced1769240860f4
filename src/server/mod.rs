//! JSON-RPC server exposing the conversation tree.
//!
//! This module provides:
//! - JSON-RPC 2.0 over line-delimited stdio
//! - Method handlers mapping requests onto [`ThreadController`] operations
//! - Shared application state

mod handlers;
mod rpc;

pub use handlers::*;
pub use rpc::*;

use std::sync::Arc;

use crate::config::Config;
use crate::view::ThreadController;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Runs every tree mutation and owns the in-flight registry.
    pub controller: ThreadController,
}

impl AppState {
    pub fn new(config: Config, controller: ThreadController) -> Self {
        tracing::info!(
            namespace = %config.tree.namespace,
            root_id = %config.tree.root_id,
            "AppState initialized"
        );
        Self { config, controller }
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;
