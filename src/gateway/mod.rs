//! Chat-completion gateway.
//!
//! [`CompletionGateway`] is the seam between the conversation tree and the
//! model API. [`OpenAiClient`] talks to an OpenAI-compatible endpoint and
//! answers locally when given the [`OFFLINE_CREDENTIAL`].

mod client;
mod offline;
mod types;

pub use client::OpenAiClient;
pub use offline::{meowify, offline_completion, OFFLINE_CREDENTIAL, OFFLINE_MODEL};
pub use types::{ChatCompletion, ChatCompletionRequest, Choice, ModelList, Usage};

use async_trait::async_trait;

use crate::error::GatewayResult;
use crate::tree::Message;

/// Model used until the user picks one.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Sampling settings sent with every completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionParams {
    pub model: String,
    /// In `[0, 1]`.
    pub temperature: f64,
    /// In `[0, 1]`.
    pub top_p: f64,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: 1.0,
            top_p: 1.0,
        }
    }
}

/// Produces candidate assistant replies for a conversation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    /// Request completions for `messages`, oldest first.
    async fn create_chat_completion(
        &self,
        messages: &[Message],
        params: &CompletionParams,
        credential: &str,
    ) -> GatewayResult<ChatCompletion>;

    /// List the chat models `credential` may use, sorted.
    async fn list_models(&self, credential: &str) -> GatewayResult<Vec<String>>;
}
