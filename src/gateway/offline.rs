use chrono::Utc;
use serde_json::Map;

use super::types::{ChatCompletion, Choice, Usage};
use crate::error::{GatewayError, GatewayResult};
use crate::tree::{generate_node_id, Message};

/// Credential that makes the gateway answer locally instead of calling the API.
pub const OFFLINE_CREDENTIAL: &str = "cat";

/// Model name reported by offline completions.
pub const OFFLINE_MODEL: &str = "cat";

/// Replace every word (`[A-Za-z0-9_]+`) with `meow`, or `Meow` when the word
/// starts with an uppercase letter. Everything between words is kept.
pub fn meowify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;

    for c in text.chars() {
        let is_word = c.is_ascii_alphanumeric() || c == '_';
        if is_word {
            if !in_word {
                out.push_str(if c.is_ascii_uppercase() { "Meow" } else { "meow" });
            }
        } else {
            out.push(c);
        }
        in_word = is_word;
    }

    out
}

/// Answer the last message of `messages` with its meowified text.
pub fn offline_completion(messages: &[Message]) -> GatewayResult<ChatCompletion> {
    let last = messages.last().ok_or(GatewayError::EmptyHistory)?;

    Ok(ChatCompletion {
        id: format!("cat{}", generate_node_id()),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: OFFLINE_MODEL.to_string(),
        usage: Some(Usage::default()),
        choices: vec![Choice {
            message: Message::assistant(meowify(&last.content)),
            finish_reason: Some("stop".to_string()),
            index: 0,
            extra: Map::new(),
        }],
        extra: Map::new(),
    })
}
