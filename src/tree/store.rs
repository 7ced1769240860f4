use futures::future::{try_join_all, BoxFuture, FutureExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{generate_node_id, Message, Node, NodeId};
use crate::config::TreeConfig;
use crate::error::{StorageError, TreeError, TreeResult};
use crate::storage::KvStore;

const EVENT_CAPACITY: usize = 256;

/// Refresh signal emitted after a mutation so dependent views re-read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    /// The node's record (typically its `children`) was rewritten.
    NodeChanged { node_id: NodeId },
    /// A subtree rooted at `node_id` was removed from the store.
    SubtreeDeleted { node_id: NodeId, deleted: usize },
}

/// Conversation tree persisted through a [`KvStore`].
///
/// Parent records are updated with a plain read-modify-write: two mutations
/// of the same parent that interleave at an await point can lose one of the
/// `children` updates. Mutations of disjoint nodes never interfere, since each
/// node is a separate key.
#[derive(Clone)]
pub struct TreeStore {
    kv: Arc<dyn KvStore>,
    namespace: String,
    root_id: NodeId,
    events: broadcast::Sender<TreeEvent>,
}

impl TreeStore {
    /// Create a tree store over `kv` using the key layout in `config`
    pub fn new(kv: Arc<dyn KvStore>, config: &TreeConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            kv,
            namespace: config.namespace.clone(),
            root_id: config.root_id.clone(),
            events,
        }
    }

    /// Id of the designated root node
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Key a node is stored under
    pub fn storage_key(&self, node_id: &str) -> String {
        format!("{}/{}", self.namespace, node_id)
    }

    /// Receive a [`TreeEvent`] for every subsequent mutation
    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    /// Read a node, returning `None` when its key is absent
    pub async fn get_node(&self, node_id: &str) -> TreeResult<Option<Node>> {
        let key = self.storage_key(node_id);
        match self.kv.get(&key).await? {
            Some(value) => {
                let node = serde_json::from_value(value).map_err(StorageError::from)?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// Load a node. The root is created on first read; any other missing id is
    /// [`TreeError::NotFound`].
    pub async fn load_node(&self, node_id: &str) -> TreeResult<Node> {
        if let Some(node) = self.get_node(node_id).await? {
            debug!(node_id = %node_id, children = node.children.len(), "Loaded node");
            return Ok(node);
        }

        if node_id == self.root_id {
            let root = Node::root();
            self.put_node(node_id, &root).await?;
            info!(node_id = %node_id, "Created root node");
            return Ok(root);
        }

        Err(TreeError::NotFound {
            node_id: node_id.to_string(),
        })
    }

    /// Append a reply at the front of `parent_id`'s children and return its id
    pub async fn create_reply(
        &self,
        parent_id: &str,
        message: Message,
        response: Option<Value>,
    ) -> TreeResult<NodeId> {
        let mut parent = self.require_node(parent_id).await?;

        let id = generate_node_id();
        let node = Node::reply_to(&parent, message, response);
        self.put_node(&id, &node).await?;

        parent.children.insert(0, id.clone());
        self.put_node(parent_id, &parent).await?;

        info!(
            parent_id = %parent_id,
            node_id = %id,
            depth = node.depth,
            role = ?node.role(),
            "Created reply"
        );
        self.notify(TreeEvent::NodeChanged {
            node_id: parent_id.to_string(),
        });
        Ok(id)
    }

    /// Insert a new reply of `parent_id` at the index `reference_child_id`
    /// currently occupies, shifting the reference one place later.
    pub async fn insert_sibling(
        &self,
        parent_id: &str,
        reference_child_id: &str,
        message: Message,
    ) -> TreeResult<NodeId> {
        let mut parent = self.require_node(parent_id).await?;
        let index = parent
            .position_of(reference_child_id)
            .ok_or_else(|| TreeError::ChildNotFound {
                parent_id: parent_id.to_string(),
                child_id: reference_child_id.to_string(),
            })?;

        let id = generate_node_id();
        let node = Node::reply_to(&parent, message, None);
        self.put_node(&id, &node).await?;

        parent.children.insert(index, id.clone());
        self.put_node(parent_id, &parent).await?;

        info!(
            parent_id = %parent_id,
            node_id = %id,
            index,
            "Inserted sibling"
        );
        self.notify(TreeEvent::NodeChanged {
            node_id: parent_id.to_string(),
        });
        Ok(id)
    }

    /// Delete `node_id` and every descendant. Returns how many nodes were
    /// removed; an absent id removes nothing.
    pub async fn delete_subtree(&self, node_id: &str) -> TreeResult<usize> {
        let deleted = self.delete_recursive(node_id.to_string()).await?;
        if deleted > 0 {
            info!(node_id = %node_id, deleted, "Deleted subtree");
            self.notify(TreeEvent::SubtreeDeleted {
                node_id: node_id.to_string(),
                deleted,
            });
        }
        Ok(deleted)
    }

    /// Unlink `child_id` from `parent_id` and delete its subtree
    pub async fn remove_child(&self, parent_id: &str, child_id: &str) -> TreeResult<usize> {
        let mut parent = self.require_node(parent_id).await?;
        parent.children.retain(|id| id != child_id);
        self.put_node(parent_id, &parent).await?;
        self.notify(TreeEvent::NodeChanged {
            node_id: parent_id.to_string(),
        });

        self.delete_subtree(child_id).await
    }

    /// Clear `parent_id`'s children and delete each of their subtrees
    pub async fn remove_all_children(&self, parent_id: &str) -> TreeResult<usize> {
        let mut parent = self.require_node(parent_id).await?;
        let children = std::mem::take(&mut parent.children);
        self.put_node(parent_id, &parent).await?;
        self.notify(TreeEvent::NodeChanged {
            node_id: parent_id.to_string(),
        });

        // Each child reports its own SubtreeDeleted event.
        let counts = try_join_all(children.iter().map(|id| self.delete_subtree(id))).await?;
        let deleted = counts.into_iter().sum();

        info!(parent_id = %parent_id, deleted, "Removed all replies");
        Ok(deleted)
    }

    async fn require_node(&self, node_id: &str) -> TreeResult<Node> {
        self.get_node(node_id)
            .await?
            .ok_or_else(|| TreeError::NotFound {
                node_id: node_id.to_string(),
            })
    }

    async fn put_node(&self, node_id: &str, node: &Node) -> TreeResult<()> {
        let value = serde_json::to_value(node).map_err(StorageError::from)?;
        self.kv.set(&self.storage_key(node_id), &value).await?;
        Ok(())
    }

    // Children are independent keys, so they are removed concurrently.
    fn delete_recursive(&self, node_id: NodeId) -> BoxFuture<'_, TreeResult<usize>> {
        async move {
            let Some(node) = self.get_node(&node_id).await? else {
                return Ok(0);
            };

            let own = async move {
                self.kv.delete(&self.storage_key(&node_id)).await?;
                Ok::<usize, TreeError>(1)
            }
            .boxed();

            let counts = try_join_all(
                node.children
                    .into_iter()
                    .map(|child| self.delete_recursive(child))
                    .chain(std::iter::once(own)),
            )
            .await?;

            Ok(counts.into_iter().sum())
        }
        .boxed()
    }

    fn notify(&self, event: TreeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
