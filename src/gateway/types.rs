use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use super::CompletionParams;
use crate::error::{GatewayError, GatewayResult};
use crate::tree::{Message, Role};

/// Body of `POST /v1/chat/completions`
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f64,
    pub top_p: f64,
}

impl ChatCompletionRequest {
    /// Build a request from a conversation and sampling settings
    pub fn new(messages: &[Message], params: &CompletionParams) -> Self {
        Self {
            model: params.model.clone(),
            messages: messages.to_vec(),
            temperature: params.temperature,
            top_p: params.top_p,
        }
    }
}

/// Response of `POST /v1/chat/completions`.
///
/// Only the fields the tree consumes are typed; anything else the API sends is
/// kept in `extra` so the stored payload stays complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub choices: Vec<Choice>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One candidate reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(deserialize_with = "lenient_message")]
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Response of `GET /v1/models`
#[derive(Debug, Clone, Deserialize)]
pub struct ModelList {
    pub data: Vec<ModelEntry>,
}

/// One entry of [`ModelList`]
#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub id: String,
}

/// Read a choice's message without rejecting the whole response: missing or
/// `null` content is empty text, content parts are joined, and a missing or
/// unknown role counts as assistant.
fn lenient_message<'de, D>(deserializer: D) -> Result<Message, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct RawMessage {
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        content: Option<Value>,
    }

    let raw = RawMessage::deserialize(deserializer)?;
    let role = raw
        .role
        .as_deref()
        .and_then(|r| r.parse::<Role>().ok())
        .unwrap_or(Role::Assistant);
    let content = match raw.content {
        Some(Value::String(text)) => text,
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    };

    Ok(Message::new(role, content))
}

impl ChatCompletion {
    /// The payload stored on the node created from choice `index`:
    /// `{"data": <this response>, "index": index}`.
    pub fn attachment(&self, index: usize) -> GatewayResult<Value> {
        let data = serde_json::to_value(self).map_err(|e| GatewayError::InvalidResponse {
            message: format!("Failed to serialize response: {}", e),
        })?;
        Ok(json!({ "data": data, "index": index }))
    }
}

impl ModelList {
    /// Chat model ids (`gpt-3.5*`, `gpt-4*`), sorted
    pub fn chat_models(self) -> Vec<String> {
        let mut models: Vec<String> = self
            .data
            .into_iter()
            .map(|m| m.id)
            .filter(|id| id.starts_with("gpt-3.5") || id.starts_with("gpt-4"))
            .collect();
        models.sort();
        models
    }
}
