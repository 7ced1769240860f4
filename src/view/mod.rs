//! Per-node view state and the controller that drives tree mutations from it.
//!
//! A [`ThreadView`] is what one rendered message knows: its record, the
//! messages above it, and the [`ParentLink`] its parent handed down. The
//! [`ThreadController`] performs mutations on behalf of a view and writes
//! their outcome (inline error, form reset, re-read) back into it.

mod controller;
mod prompt;

#[cfg(test)]
#[path = "controller_tests.rs"]
mod controller_tests;

pub use controller::{Action, FormSubmission, SecretKeyReset, ThreadController};
pub use prompt::{CredentialPrompt, StaticPrompt};

#[cfg(test)]
pub use prompt::MockCredentialPrompt;

use serde_json::Value;
use std::sync::Arc;

use crate::error::TreeResult;
use crate::gateway::Usage;
use crate::tree::{effective_history, Message, Node, NodeId, ParentLink, Role, TreeStore, WalkEntry};

/// Entries of a node's menu, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeAction {
    TweakMessage,
    CustomReply,
    CopyMessageContent,
    CopyConversation,
    CopyResponse,
    Remove,
    RemoveAllReplies,
    ResetSecretKey,
}

impl NodeAction {
    pub fn label(&self) -> &'static str {
        match self {
            NodeAction::TweakMessage => "Tweak message",
            NodeAction::CustomReply => "Custom reply",
            NodeAction::CopyMessageContent => "Copy message content",
            NodeAction::CopyConversation => "Copy conversation as JSON",
            NodeAction::CopyResponse => "Copy OpenAI API response as JSON",
            NodeAction::Remove => "Remove",
            NodeAction::RemoveAllReplies => "Remove all replies",
            NodeAction::ResetSecretKey => "Reset OpenAI secret key",
        }
    }

    pub fn tooltip(&self) -> Option<&'static str> {
        match self {
            NodeAction::TweakMessage => Some("Creates a copy of this message and lets you edit it"),
            NodeAction::CustomReply => Some(
                "Add a reply to this message with your own text, can be used to help steer the assistant in the right direction",
            ),
            _ => None,
        }
    }
}

/// Usage and model of the completion a node was generated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    pub usage: Usage,
    pub model: String,
}

impl ResponseMeta {
    /// Read `data.usage` and `data.model` from a stored response payload.
    /// `None` when the payload carries no usage.
    pub fn from_response(response: &Value) -> Option<Self> {
        let data = response.get("data")?;
        let usage: Usage = serde_json::from_value(data.get("usage")?.clone()).ok()?;
        let model = data
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(Self { usage, model })
    }

    /// `", <total> tokens, <model>"`
    pub fn line(&self) -> String {
        format!(", {} tokens, {}", self.usage.total_tokens, self.model)
    }

    pub fn tooltip(&self) -> String {
        format!(
            "{} prompt, {} completion",
            self.usage.prompt_tokens, self.usage.completion_tokens
        )
    }
}

/// Text reported after a remove.
pub fn deletion_report(deleted: usize) -> String {
    format!("Deleted {} messages", deleted)
}

/// UI state of one rendered node.
#[derive(Debug, Clone)]
pub struct ThreadView {
    pub node_id: NodeId,
    pub node: Node,
    pub previous_messages: Arc<Vec<Message>>,
    /// Present for every node reached through its parent; grants remove and tweak.
    pub parent: Option<ParentLink>,
    /// Error of the last reply or generate attempt, shown under the node.
    pub reply_error: Option<String>,
    /// Error of the last tweak attempt, shown above the tweak form.
    pub tweak_error: Option<String>,
    /// Error of the last menu action (remove, remove all, key reset).
    pub action_error: Option<String>,
    show_reply_form: Option<bool>,
    show_tweak_form: bool,
}

impl ThreadView {
    pub fn new(
        node_id: impl Into<NodeId>,
        node: Node,
        previous_messages: Vec<Message>,
        parent: Option<ParentLink>,
    ) -> Self {
        Self::with_shared_history(node_id.into(), node, Arc::new(previous_messages), parent)
    }

    fn with_shared_history(
        node_id: NodeId,
        node: Node,
        previous_messages: Arc<Vec<Message>>,
        parent: Option<ParentLink>,
    ) -> Self {
        Self {
            node_id,
            node,
            previous_messages,
            parent,
            reply_error: None,
            tweak_error: None,
            action_error: None,
            show_reply_form: None,
            show_tweak_form: false,
        }
    }

    /// Messages sent downstream when generating a reply from this node
    pub fn effective_history(&self) -> Vec<Message> {
        effective_history(&self.previous_messages, &self.node)
    }

    /// Show the reply form when nothing was chosen explicitly: a leaf that is
    /// not a user message prompts for input.
    pub fn default_show_reply_form(&self) -> bool {
        !self.node.has_children() && self.node.role() != Some(Role::User)
    }

    pub fn show_reply_form(&self) -> bool {
        self.show_reply_form
            .unwrap_or_else(|| self.default_show_reply_form())
    }

    /// `None` returns to the computed default.
    pub fn set_show_reply_form(&mut self, show: Option<bool>) {
        self.show_reply_form = show;
    }

    /// Only meaningful for nodes with a message.
    pub fn show_tweak_form(&self) -> bool {
        self.show_tweak_form && self.node.message.is_some()
    }

    pub fn set_show_tweak_form(&mut self, show: bool) {
        self.show_tweak_form = show;
    }

    pub fn reply_verb(&self) -> &'static str {
        if self.node.depth == 0 {
            "Start a thread"
        } else {
            "Reply"
        }
    }

    /// Label of the generate button shown under user messages.
    pub fn generate_label(&self, pending: bool) -> &'static str {
        if pending {
            "Please wait…"
        } else if self.node.has_children() {
            "Generate another reply"
        } else {
            "Generate a reply"
        }
    }

    /// Role preselected in the reply form
    pub fn default_form_role(&self) -> Role {
        match self.node.role() {
            Some(Role::User) => Role::Assistant,
            _ => Role::User,
        }
    }

    /// Initial content of the tweak form: the original message.
    pub fn tweak_defaults(&self) -> Option<&Message> {
        self.node.message.as_ref()
    }

    pub fn available_actions(&self) -> Vec<NodeAction> {
        let message = self.node.message.as_ref();
        let has_content = message.map_or(false, |m| !m.content.is_empty());
        let mut actions = Vec::new();

        if has_content && self.parent.is_some() {
            actions.push(NodeAction::TweakMessage);
        }
        if message.map(|m| m.role) == Some(Role::User) {
            actions.push(NodeAction::CustomReply);
        }
        if has_content {
            actions.push(NodeAction::CopyMessageContent);
        }
        actions.push(NodeAction::CopyConversation);
        if self.node.response.is_some() {
            actions.push(NodeAction::CopyResponse);
        }
        if self.parent.is_some() {
            actions.push(NodeAction::Remove);
        }
        if self.node.has_children() {
            actions.push(NodeAction::RemoveAllReplies);
        }
        if self.node.depth == 0 {
            actions.push(NodeAction::ResetSecretKey);
        }

        actions
    }

    pub fn copy_message_content(&self) -> Option<String> {
        self.node
            .message
            .as_ref()
            .filter(|m| !m.content.is_empty())
            .map(|m| m.content.clone())
    }

    /// Effective history as pretty-printed JSON
    pub fn conversation_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.effective_history())
    }

    /// The `data` part of the stored completion as pretty-printed JSON
    pub fn response_json(&self) -> serde_json::Result<Option<String>> {
        self.node
            .response
            .as_ref()
            .map(|r| serde_json::to_string_pretty(r.get("data").unwrap_or(&Value::Null)))
            .transpose()
    }

    pub fn meta(&self) -> Option<ResponseMeta> {
        self.node.response.as_ref().and_then(ResponseMeta::from_response)
    }

    /// Metadata suffix shown after the role, empty without usage
    pub fn meta_line(&self) -> String {
        self.meta().map(|m| m.line()).unwrap_or_default()
    }

    /// Re-read the node record
    pub async fn refresh(&mut self, store: &TreeStore) -> TreeResult<()> {
        self.node = store.load_node(&self.node_id).await?;
        Ok(())
    }
}

impl From<WalkEntry> for ThreadView {
    fn from(entry: WalkEntry) -> Self {
        Self::with_shared_history(entry.node_id, entry.node, entry.previous_messages, entry.parent)
    }
}
