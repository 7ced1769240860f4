use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info};

use super::{CredentialPrompt, ThreadView};
use crate::error::{TreeError, TreeResult};
use crate::gateway::CompletionGateway;
use crate::settings::SettingsService;
use crate::tree::{Message, NodeId, Role, TreeStore, TreeWalker};

/// Mutations that can be in flight for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Reply form submission or generate; they share one button state.
    Reply,
    Tweak,
    Remove,
    RemoveAll,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Reply => write!(f, "reply"),
            Action::Tweak => write!(f, "tweak"),
            Action::Remove => write!(f, "remove"),
            Action::RemoveAll => write!(f, "remove all replies"),
        }
    }
}

/// Text and role entered in a reply or tweak form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormSubmission {
    pub text: String,
    pub role: Role,
}

impl FormSubmission {
    pub fn new(text: impl Into<String>, role: Role) -> Self {
        Self {
            text: text.into(),
            role,
        }
    }
}

/// Outcome of the reset-secret-key menu entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKeyReset {
    /// The prompt was dismissed.
    Cancelled,
    /// A different key was entered but replacing the stored one was declined.
    Declined,
    Stored,
}

type InFlightKey = (NodeId, Action);

/// Removes its entry from the in-flight registry when dropped.
struct InFlightGuard {
    registry: Arc<Mutex<HashSet<InFlightKey>>>,
    key: InFlightKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.key);
    }
}

fn lock(registry: &Mutex<HashSet<InFlightKey>>) -> MutexGuard<'_, HashSet<InFlightKey>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs tree mutations for views.
///
/// Every public mutation catches its error at the boundary, records it on the
/// view next to the triggering control, and still returns it to the caller.
/// A second run of the same action on the same node while the first is in
/// flight is refused with [`TreeError::InFlight`].
#[derive(Clone)]
pub struct ThreadController {
    store: TreeStore,
    gateway: Arc<dyn CompletionGateway>,
    settings: SettingsService,
    prompt: Arc<dyn CredentialPrompt>,
    in_flight: Arc<Mutex<HashSet<InFlightKey>>>,
}

impl ThreadController {
    pub fn new(
        store: TreeStore,
        gateway: Arc<dyn CompletionGateway>,
        settings: SettingsService,
        prompt: Arc<dyn CredentialPrompt>,
    ) -> Self {
        Self {
            store,
            gateway,
            settings,
            prompt,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Same controller (and in-flight registry) answering prompts with `prompt`.
    pub fn with_prompt(&self, prompt: Arc<dyn CredentialPrompt>) -> Self {
        Self {
            prompt,
            ..self.clone()
        }
    }

    pub fn store(&self) -> &TreeStore {
        &self.store
    }

    pub fn settings(&self) -> &SettingsService {
        &self.settings
    }

    pub fn gateway(&self) -> &dyn CompletionGateway {
        self.gateway.as_ref()
    }

    /// Whether `action` is running for `node_id`; used to disable its control.
    pub fn is_pending(&self, node_id: &str, action: Action) -> bool {
        lock(&self.in_flight).contains(&(node_id.to_string(), action))
    }

    fn begin(&self, node_id: &str, action: Action) -> TreeResult<InFlightGuard> {
        let key = (node_id.to_string(), action);
        if !lock(&self.in_flight).insert(key.clone()) {
            return Err(TreeError::InFlight {
                node_id: node_id.to_string(),
                action: action.to_string(),
            });
        }
        Ok(InFlightGuard {
            registry: Arc::clone(&self.in_flight),
            key,
        })
    }

    /// Views for the whole tree in display order.
    pub async fn views(&self) -> TreeResult<Vec<ThreadView>> {
        let walker = TreeWalker::new(self.store.clone());
        Ok(walker.walk().await?.into_iter().map(ThreadView::from).collect())
    }

    /// View of a single node, with the history and parent link its position implies.
    pub async fn view(&self, node_id: &str) -> TreeResult<ThreadView> {
        let walker = TreeWalker::new(self.store.clone());
        let location = walker
            .locate(node_id)
            .await?
            .ok_or_else(|| TreeError::NotFound {
                node_id: node_id.to_string(),
            })?;
        let node = self.store.load_node(&location.node_id).await?;
        Ok(ThreadView::new(
            location.node_id,
            node,
            location.previous_messages,
            location.parent,
        ))
    }

    /// Submit the reply form (`Some`) or generate completions (`None`).
    ///
    /// Returns the ids of the created nodes, in creation order.
    pub async fn reply(
        &self,
        view: &mut ThreadView,
        submission: Option<FormSubmission>,
    ) -> TreeResult<Vec<NodeId>> {
        let from_form = submission.is_some();
        match self.run_reply(view, submission).await {
            Ok(ids) => {
                view.reply_error = None;
                if from_form {
                    view.set_show_reply_form(Some(false));
                }
                view.refresh(&self.store).await?;
                Ok(ids)
            }
            Err(e) => {
                error!(node_id = %view.node_id, error = %e, "Reply failed");
                view.reply_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Generate completions for the view's effective history.
    pub async fn generate(&self, view: &mut ThreadView) -> TreeResult<Vec<NodeId>> {
        self.reply(view, None).await
    }

    async fn run_reply(
        &self,
        view: &ThreadView,
        submission: Option<FormSubmission>,
    ) -> TreeResult<Vec<NodeId>> {
        let _guard = self.begin(&view.node_id, Action::Reply)?;

        let Some(submission) = submission else {
            return self.run_generate(view).await;
        };

        if submission.text.trim().is_empty() {
            return Err(TreeError::EmptyMessage);
        }
        let message = Message::new(submission.role, submission.text);
        let id = self.store.create_reply(&view.node_id, message, None).await?;
        Ok(vec![id])
    }

    async fn run_generate(&self, view: &ThreadView) -> TreeResult<Vec<NodeId>> {
        let credential = self.ensure_credential().await?;
        let params = self.settings.completion_params().await?;
        let history = view.effective_history();

        let completion = self
            .gateway
            .create_chat_completion(&history, &params, &credential)
            .await?;

        // Choices already persisted stay when a later one fails.
        let mut ids = Vec::with_capacity(completion.choices.len());
        for (index, choice) in completion.choices.iter().enumerate() {
            let attachment = completion.attachment(index)?;
            let id = self
                .store
                .create_reply(&view.node_id, choice.message.clone(), Some(attachment))
                .await?;
            ids.push(id);
        }

        info!(
            node_id = %view.node_id,
            model = %completion.model,
            replies = ids.len(),
            "Generated replies"
        );
        Ok(ids)
    }

    async fn ensure_credential(&self) -> TreeResult<String> {
        if let Some(key) = self.settings.secret_key().await? {
            return Ok(key);
        }

        let key = self
            .prompt
            .request_secret_key(None)
            .await
            .filter(|k| !k.is_empty())
            .ok_or(TreeError::MissingCredential)?;
        self.settings.set_secret_key(&key).await?;
        Ok(key)
    }

    /// Insert an edited copy of the view's message next to it.
    pub async fn tweak(
        &self,
        view: &mut ThreadView,
        submission: FormSubmission,
    ) -> TreeResult<NodeId> {
        match self.run_tweak(view, submission).await {
            Ok(id) => {
                view.tweak_error = None;
                view.set_show_tweak_form(false);
                view.refresh(&self.store).await?;
                Ok(id)
            }
            Err(e) => {
                error!(node_id = %view.node_id, error = %e, "Tweak failed");
                view.tweak_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_tweak(&self, view: &ThreadView, submission: FormSubmission) -> TreeResult<NodeId> {
        let _guard = self.begin(&view.node_id, Action::Tweak)?;

        let parent = match (&view.node.message, &view.parent) {
            (Some(_), Some(parent)) => parent,
            _ => return Err(TreeError::UnsupportedAtRoot),
        };

        let message = Message::new(submission.role, submission.text);
        self.store
            .insert_sibling(&parent.parent_id, &parent.child_id, message)
            .await
    }

    /// Remove the view's node and its replies from its parent.
    pub async fn remove(&self, view: &mut ThreadView) -> TreeResult<usize> {
        let result = async {
            let _guard = self.begin(&view.node_id, Action::Remove)?;
            let parent = view.parent.as_ref().ok_or(TreeError::RootRemoval)?;
            self.store
                .remove_child(&parent.parent_id, &parent.child_id)
                .await
        }
        .await;

        self.record_action(view, result)
    }

    /// Remove every reply below the view's node; the node itself stays.
    pub async fn remove_all_replies(&self, view: &mut ThreadView) -> TreeResult<usize> {
        let result = async {
            let _guard = self.begin(&view.node_id, Action::RemoveAll)?;
            self.store.remove_all_children(&view.node_id).await
        }
        .await;

        let deleted = self.record_action(view, result)?;
        view.refresh(&self.store).await?;
        Ok(deleted)
    }

    fn record_action(&self, view: &mut ThreadView, result: TreeResult<usize>) -> TreeResult<usize> {
        match result {
            Ok(deleted) => {
                view.action_error = None;
                Ok(deleted)
            }
            Err(e) => {
                error!(node_id = %view.node_id, error = %e, "Remove failed");
                view.action_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Replace the stored secret key through the prompt.
    pub async fn reset_secret_key(&self) -> TreeResult<SecretKeyReset> {
        let current = self.settings.secret_key().await?;

        let Some(entered) = self.prompt.request_secret_key(current.clone()).await else {
            return Ok(SecretKeyReset::Cancelled);
        };

        if current.as_deref().unwrap_or_default() != entered
            && !self.prompt.confirm("This will replace your stored key").await
        {
            return Ok(SecretKeyReset::Declined);
        }

        self.settings.set_secret_key(&entered).await?;
        Ok(SecretKeyReset::Stored)
    }
}
