use std::sync::Arc;
use tracing::warn;

use super::{Message, Node, NodeId, TreeStore};
use crate::error::TreeResult;

/// Context a parent hands to one of its children while walking the tree.
///
/// Holding it is what lets a node be removed or tweaked: both operations
/// rewrite the parent's `children`, and nodes do not know their parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub parent_id: NodeId,
    pub child_id: NodeId,
}

/// One visited node, in depth-first display order.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub node_id: NodeId,
    pub node: Node,
    /// Messages of every ancestor, root first.
    pub previous_messages: Arc<Vec<Message>>,
    pub parent: Option<ParentLink>,
}

impl WalkEntry {
    /// Ancestor messages followed by this node's own message
    pub fn effective_history(&self) -> Vec<Message> {
        effective_history(&self.previous_messages, &self.node)
    }
}

/// Where a node sits in the tree.
#[derive(Debug, Clone)]
pub struct NodeLocation {
    pub node_id: NodeId,
    /// Ids from the root down to and including the node.
    pub path: Vec<NodeId>,
    /// Messages of every ancestor, root first.
    pub previous_messages: Vec<Message>,
    pub parent: Option<ParentLink>,
}

/// Append `node`'s message (if any) to `previous`.
pub fn effective_history(previous: &[Message], node: &Node) -> Vec<Message> {
    let mut history = Vec::with_capacity(previous.len() + 1);
    history.extend_from_slice(previous);
    if let Some(message) = &node.message {
        history.push(message.clone());
    }
    history
}

/// Depth-first traversal that carries parent context downwards.
#[derive(Clone)]
pub struct TreeWalker {
    store: TreeStore,
}

impl TreeWalker {
    pub fn new(store: TreeStore) -> Self {
        Self { store }
    }

    /// Visit every node reachable from the root.
    pub async fn walk(&self) -> TreeResult<Vec<WalkEntry>> {
        let root_id = self.store.root_id().to_string();
        self.walk_from(&root_id, Vec::new(), None).await
    }

    /// Visit `start` and its descendants. `previous_messages` and `parent`
    /// describe `start`'s position, as obtained from [`TreeWalker::locate`].
    pub async fn walk_from(
        &self,
        start: &str,
        previous_messages: Vec<Message>,
        parent: Option<ParentLink>,
    ) -> TreeResult<Vec<WalkEntry>> {
        let node = self.store.load_node(start).await?;
        let mut entries = Vec::new();
        let mut stack = vec![(start.to_string(), node, Arc::new(previous_messages), parent)];

        while let Some((node_id, node, previous_messages, parent)) = stack.pop() {
            let next_previous = Arc::new(effective_history(&previous_messages, &node));

            // Reverse so the first child is visited first.
            for child_id in node.children.iter().rev() {
                match self.store.get_node(child_id).await? {
                    Some(child) => stack.push((
                        child_id.clone(),
                        child,
                        Arc::clone(&next_previous),
                        Some(ParentLink {
                            parent_id: node_id.clone(),
                            child_id: child_id.clone(),
                        }),
                    )),
                    None => warn!(
                        parent_id = %node_id,
                        child_id = %child_id,
                        "Skipping dangling child reference"
                    ),
                }
            }

            entries.push(WalkEntry {
                node_id,
                node,
                previous_messages,
                parent,
            });
        }

        Ok(entries)
    }

    /// Find the ancestor chain of `target` by searching down from the root.
    pub async fn locate(&self, target: &str) -> TreeResult<Option<NodeLocation>> {
        let root_id = self.store.root_id().to_string();
        let root = self.store.load_node(&root_id).await?;
        let mut stack: Vec<(NodeId, Node, Vec<NodeId>, Vec<Message>)> =
            vec![(root_id.clone(), root, vec![root_id], Vec::new())];

        while let Some((node_id, node, path, previous_messages)) = stack.pop() {
            if node_id == target {
                let parent = path.len().checked_sub(2).map(|i| ParentLink {
                    parent_id: path[i].clone(),
                    child_id: node_id.clone(),
                });
                return Ok(Some(NodeLocation {
                    node_id,
                    path,
                    previous_messages,
                    parent,
                }));
            }

            let next_previous = effective_history(&previous_messages, &node);
            for child_id in node.children.iter().rev() {
                if let Some(child) = self.store.get_node(child_id).await? {
                    let mut child_path = path.clone();
                    child_path.push(child_id.clone());
                    stack.push((child_id.clone(), child, child_path, next_previous.clone()));
                }
            }
        }

        Ok(None)
    }
}
