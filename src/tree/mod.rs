//! Conversation tree: node records and their persistence.
//!
//! A conversation is a rooted tree of [`Node`]s. Every node except the root
//! carries a [`Message`]; the root is an empty depth-0 node from which threads
//! are started. Edges are stored one way only, as the ordered `children` list
//! of the parent, most recently created first.

mod id;
mod store;
mod walker;


pub use id::{generate_node_id, NodeIdGenerator};
pub use store::{TreeEvent, TreeStore};
pub use walker::{effective_history, NodeLocation, ParentLink, TreeWalker, WalkEntry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque node identifier. Never reused or mutated once assigned.
pub type NodeId = String;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions steering the assistant.
    System,
    /// Text written by the person chatting.
    User,
    /// Text produced by the model (or written on its behalf).
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a message with an explicit role
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// One entry of the conversation tree, stored as a single JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Distance from the root; fixed at creation to `parent.depth + 1`.
    pub depth: u32,
    /// Replies in display order, newest first.
    #[serde(default)]
    pub children: Vec<NodeId>,
    /// Creation time, present whenever `message` is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Absent only on the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    /// Raw gateway payload for generated messages: `{"data": .., "index": ..}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl Node {
    /// The empty depth-0 node a conversation starts from
    pub fn root() -> Self {
        Self {
            depth: 0,
            children: Vec::new(),
            timestamp: None,
            message: None,
            response: None,
        }
    }

    /// A fresh reply to `parent`, timestamped now
    pub fn reply_to(parent: &Node, message: Message, response: Option<Value>) -> Self {
        Self {
            depth: parent.depth + 1,
            children: Vec::new(),
            timestamp: Some(Utc::now()),
            message: Some(message),
            response,
        }
    }

    /// Whether this node has no message
    pub fn is_root(&self) -> bool {
        self.message.is_none()
    }

    /// Whether this node has replies
    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Index of `child_id` in the display order
    pub fn position_of(&self, child_id: &str) -> Option<usize> {
        self.children.iter().position(|id| id == child_id)
    }

    /// Role of the message, if any
    pub fn role(&self) -> Option<Role> {
        self.message.as_ref().map(|m| m.role)
    }
}
