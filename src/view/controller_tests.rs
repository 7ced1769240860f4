use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::*;
use crate::config::TreeConfig;
use crate::error::{GatewayError, GatewayResult, StorageError, StorageResult, TreeError};
use crate::gateway::{
    offline_completion, ChatCompletion, CompletionGateway, CompletionParams,
    MockCompletionGateway, OFFLINE_CREDENTIAL,
};
use crate::settings::SettingsService;
use crate::storage::{KvStore, MemoryStore};
use crate::tree::{Message, Role, TreeStore};

struct Fixture {
    controller: ThreadController,
    store: TreeStore,
    settings: SettingsService,
}

fn fixture(gateway: impl CompletionGateway + 'static, prompt: MockCredentialPrompt) -> Fixture {
    fixture_on(Arc::new(MemoryStore::new()), gateway, prompt)
}

fn fixture_on(
    kv: Arc<dyn KvStore>,
    gateway: impl CompletionGateway + 'static,
    prompt: MockCredentialPrompt,
) -> Fixture {
    let store = TreeStore::new(Arc::clone(&kv), &TreeConfig::default());
    let settings = SettingsService::new(kv);
    let controller = ThreadController::new(
        store.clone(),
        Arc::new(gateway),
        settings.clone(),
        Arc::new(prompt),
    );
    Fixture {
        controller,
        store,
        settings,
    }
}

fn offline_gateway() -> MockCompletionGateway {
    let mut gateway = MockCompletionGateway::new();
    gateway
        .expect_create_chat_completion()
        .returning(|messages, _, _| offline_completion(messages));
    gateway
}

fn silent_prompt() -> MockCredentialPrompt {
    let mut prompt = MockCredentialPrompt::new();
    prompt.expect_request_secret_key().never();
    prompt.expect_confirm().never();
    prompt
}

fn two_choices(model: &str) -> ChatCompletion {
    serde_json::from_value(serde_json::json!({
        "id": "chatcmpl-2",
        "object": "chat.completion",
        "created": 1700000000,
        "model": model,
        "usage": {"prompt_tokens": 5, "completion_tokens": 6, "total_tokens": 11},
        "choices": [
            {"index": 0, "message": {"role": "assistant", "content": "first"}, "finish_reason": "stop"},
            {"index": 1, "message": {"role": "assistant", "content": "second"}, "finish_reason": "stop"}
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn test_text_reply_creates_node_and_closes_form() {
    let f = fixture(MockCompletionGateway::new(), silent_prompt());
    let mut root = f.controller.view("root").await.unwrap();
    assert!(root.show_reply_form());

    let ids = f
        .controller
        .reply(&mut root, Some(FormSubmission::new("hello", Role::User)))
        .await
        .unwrap();

    assert_eq!(ids.len(), 1);
    assert_eq!(root.node.children, ids);
    assert!(!root.show_reply_form());
    assert_eq!(root.reply_error, None);

    let child = f.store.load_node(&ids[0]).await.unwrap();
    assert_eq!(child.message, Some(Message::user("hello")));
    assert_eq!(child.response, None);
}

#[tokio::test]
async fn test_blank_text_is_rejected_inline() {
    let f = fixture(MockCompletionGateway::new(), silent_prompt());
    let mut root = f.controller.view("root").await.unwrap();

    let err = f
        .controller
        .reply(&mut root, Some(FormSubmission::new("  \n", Role::User)))
        .await
        .unwrap_err();

    assert!(matches!(err, TreeError::EmptyMessage));
    assert_eq!(root.reply_error.as_deref(), Some("Message cannot be empty"));
    assert!(root.show_reply_form());
    assert!(f.store.load_node("root").await.unwrap().children.is_empty());
}

#[tokio::test]
async fn test_generate_sends_effective_history() {
    let mut gateway = MockCompletionGateway::new();
    gateway
        .expect_create_chat_completion()
        .withf(|messages, params, credential| {
            messages.to_vec() == vec![Message::user("hi")]
                && params == &CompletionParams::default()
                && credential == "sk-1"
        })
        .times(1)
        .returning(|messages, _, _| offline_completion(messages));
    let f = fixture(gateway, silent_prompt());
    f.settings.set_secret_key("sk-1").await.unwrap();

    let mut root = f.controller.view("root").await.unwrap();
    let ids = f
        .controller
        .reply(&mut root, Some(FormSubmission::new("hi", Role::User)))
        .await
        .unwrap();
    let mut user = f.controller.view(&ids[0]).await.unwrap();

    let generated = f.controller.generate(&mut user).await.unwrap();

    assert_eq!(user.node.children, generated);
    let reply = f.store.load_node(&generated[0]).await.unwrap();
    assert_eq!(reply.depth, 2);
    assert_eq!(reply.message, Some(Message::assistant("meow")));
    let response = reply.response.unwrap();
    assert_eq!(response["index"], 0);
    assert_eq!(response["data"]["model"], "cat");
}

#[tokio::test]
async fn test_generate_creates_one_node_per_choice() {
    let mut gateway = MockCompletionGateway::new();
    gateway
        .expect_create_chat_completion()
        .returning(|_, _, _| Ok(two_choices("gpt-4")));
    let f = fixture(gateway, silent_prompt());
    f.settings.set_secret_key("sk-1").await.unwrap();
    let mut root = f.controller.view("root").await.unwrap();

    let ids = f.controller.generate(&mut root).await.unwrap();

    assert_eq!(ids.len(), 2);
    // Each choice is unshifted, so the last one ends up first.
    assert_eq!(root.node.children, vec![ids[1].clone(), ids[0].clone()]);

    let second = f.store.load_node(&ids[1]).await.unwrap();
    assert_eq!(second.message.unwrap().content, "second");
    assert_eq!(second.response.unwrap()["index"], 1);
}

/// Memory store that refuses to create node records once its allowance is spent.
struct LimitedStore {
    inner: MemoryStore,
    new_nodes_left: AtomicUsize,
}

impl LimitedStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            new_nodes_left: AtomicUsize::new(usize::MAX),
        }
    }

    fn allow_new_nodes(&self, count: usize) {
        self.new_nodes_left.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvStore for LimitedStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &Value) -> StorageResult<()> {
        let creates_node = key.starts_with("threadgpt/") && self.inner.get(key).await?.is_none();
        if creates_node
            && self
                .new_nodes_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        {
            return Err(StorageError::Connection {
                message: "disk full".to_string(),
            });
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }
}

#[tokio::test]
async fn test_failed_choice_keeps_earlier_choices() {
    let mut gateway = MockCompletionGateway::new();
    gateway
        .expect_create_chat_completion()
        .returning(|_, _, _| Ok(two_choices("gpt-4")));
    let kv = Arc::new(LimitedStore::new());
    let f = fixture_on(kv.clone(), gateway, silent_prompt());
    f.settings.set_secret_key("sk-1").await.unwrap();
    let ids = seed(&f.store, &["hi"]).await;
    let mut user = f.controller.view(&ids[0]).await.unwrap();

    kv.allow_new_nodes(1);
    let err = f.controller.generate(&mut user).await.unwrap_err();

    assert!(matches!(err, TreeError::Storage(_)));
    assert_eq!(
        user.reply_error.as_deref(),
        Some("Storage error: Database connection failed: disk full")
    );
    assert!(!f.controller.is_pending(&ids[0], Action::Reply));

    let children = f.store.load_node(&ids[0]).await.unwrap().children;
    assert_eq!(children.len(), 1);
    let first = f.store.load_node(&children[0]).await.unwrap();
    assert_eq!(first.message, Some(Message::assistant("first")));
    assert_eq!(first.response.unwrap()["index"], 0);
}

#[tokio::test]
async fn test_generate_prompts_for_missing_credential() {
    let mut prompt = MockCredentialPrompt::new();
    prompt
        .expect_request_secret_key()
        .times(1)
        .returning(|_| Some(OFFLINE_CREDENTIAL.to_string()));
    let f = fixture(offline_gateway(), prompt);
    let mut root = f.controller.view("root").await.unwrap();
    f.controller
        .reply(&mut root, Some(FormSubmission::new("hello, world!", Role::User)))
        .await
        .unwrap();
    let mut user = f.controller.view(&root.node.children[0]).await.unwrap();

    let ids = f.controller.generate(&mut user).await.unwrap();

    assert_eq!(
        f.settings.secret_key().await.unwrap().as_deref(),
        Some(OFFLINE_CREDENTIAL)
    );
    let reply = f.store.load_node(&ids[0]).await.unwrap();
    assert_eq!(reply.message.unwrap().content, "meow, meow!");
}

#[tokio::test]
async fn test_declined_credential_leaves_tree_untouched() {
    let mut gateway = MockCompletionGateway::new();
    gateway.expect_create_chat_completion().never();
    let mut prompt = MockCredentialPrompt::new();
    prompt.expect_request_secret_key().times(1).returning(|_| None);
    let f = fixture(gateway, prompt);
    let mut root = f.controller.view("root").await.unwrap();

    let err = f.controller.generate(&mut root).await.unwrap_err();

    assert!(matches!(err, TreeError::MissingCredential));
    assert_eq!(root.reply_error.as_deref(), Some("OpenAI secret key is required"));
    assert!(f.store.load_node("root").await.unwrap().children.is_empty());
    assert!(!f.controller.is_pending("root", Action::Reply));
}

#[tokio::test]
async fn test_gateway_failure_is_surfaced_verbatim() {
    let mut gateway = MockCompletionGateway::new();
    gateway.expect_create_chat_completion().returning(|_, _, _| {
        Err(GatewayError::Api {
            status: 429,
            message: "Rate limit reached".to_string(),
        })
    });
    let f = fixture(gateway, silent_prompt());
    f.settings.set_secret_key("sk-1").await.unwrap();
    let mut root = f.controller.view("root").await.unwrap();

    let err = f.controller.generate(&mut root).await.unwrap_err();

    assert!(matches!(err, TreeError::Gateway(_)));
    assert_eq!(
        root.reply_error.as_deref(),
        Some("API error: 429 - Rate limit reached")
    );
    assert!(f.store.load_node("root").await.unwrap().children.is_empty());
}

async fn seed(store: &TreeStore, texts: &[&str]) -> Vec<String> {
    store.load_node("root").await.unwrap();
    let mut ids = Vec::new();
    for text in texts {
        ids.push(store.create_reply("root", Message::user(*text), None).await.unwrap());
    }
    ids
}

#[tokio::test]
async fn test_tweak_inserts_copy_before_original() {
    let f = fixture(MockCompletionGateway::new(), silent_prompt());
    let ids = seed(&f.store, &["a", "b"]).await;
    let mut a = f.controller.view(&ids[0]).await.unwrap();
    a.set_show_tweak_form(true);

    let tweaked = f
        .controller
        .tweak(&mut a, FormSubmission::new("a, but better", Role::User))
        .await
        .unwrap();

    let root = f.store.load_node("root").await.unwrap();
    assert_eq!(root.children, vec![ids[1].clone(), tweaked.clone(), ids[0].clone()]);
    assert!(!a.show_tweak_form());
    assert_eq!(
        f.store.load_node(&ids[0]).await.unwrap().message,
        Some(Message::user("a"))
    );
    let copy = f.store.load_node(&tweaked).await.unwrap();
    assert_eq!(copy.message, Some(Message::user("a, but better")));
    assert_eq!(copy.response, None);
}

#[tokio::test]
async fn test_tweak_rereads_the_view() {
    let f = fixture(MockCompletionGateway::new(), silent_prompt());
    let ids = seed(&f.store, &["a"]).await;
    let mut a = f.controller.view(&ids[0]).await.unwrap();
    // Written behind the view's back, e.g. by another client
    let answer = f
        .store
        .create_reply(&ids[0], Message::assistant("late answer"), None)
        .await
        .unwrap();
    assert!(a.node.children.is_empty());

    f.controller
        .tweak(&mut a, FormSubmission::new("a2", Role::User))
        .await
        .unwrap();

    assert_eq!(a.node.children, vec![answer]);
    assert_eq!(a.node.message, Some(Message::user("a")));
}

#[tokio::test]
async fn test_tweak_needs_parent_link() {
    let f = fixture(MockCompletionGateway::new(), silent_prompt());
    let ids = seed(&f.store, &["a"]).await;

    let mut root = f.controller.view("root").await.unwrap();
    let err = f
        .controller
        .tweak(&mut root, FormSubmission::new("x", Role::User))
        .await
        .unwrap_err();
    assert!(matches!(err, TreeError::UnsupportedAtRoot));
    assert_eq!(
        root.tweak_error.as_deref(),
        Some("Cannot insert message at root level")
    );

    let mut detached = f.controller.view(&ids[0]).await.unwrap();
    detached.parent = None;
    assert!(matches!(
        f.controller
            .tweak(&mut detached, FormSubmission::new("x", Role::User))
            .await,
        Err(TreeError::UnsupportedAtRoot)
    ));
}

#[tokio::test]
async fn test_tweak_after_concurrent_removal() {
    let f = fixture(MockCompletionGateway::new(), silent_prompt());
    let ids = seed(&f.store, &["a"]).await;
    let mut stale = f.controller.view(&ids[0]).await.unwrap();
    f.store.remove_child("root", &ids[0]).await.unwrap();

    let err = f
        .controller
        .tweak(&mut stale, FormSubmission::new("x", Role::User))
        .await
        .unwrap_err();

    assert!(matches!(err, TreeError::ChildNotFound { .. }));
    assert!(stale.tweak_error.is_some());
}

#[tokio::test]
async fn test_remove_and_remove_all() {
    let f = fixture(MockCompletionGateway::new(), silent_prompt());
    let ids = seed(&f.store, &["a", "b"]).await;
    f.store
        .create_reply(&ids[0], Message::assistant("a1"), None)
        .await
        .unwrap();

    let mut a = f.controller.view(&ids[0]).await.unwrap();
    assert_eq!(f.controller.remove(&mut a).await.unwrap(), 2);
    assert_eq!(f.store.load_node("root").await.unwrap().children, vec![ids[1].clone()]);

    let mut root = f.controller.view("root").await.unwrap();
    assert_eq!(f.controller.remove_all_replies(&mut root).await.unwrap(), 1);
    assert!(root.node.children.is_empty());
    assert!(root.show_reply_form());

    let err = f.controller.remove(&mut root).await.unwrap_err();
    assert!(matches!(err, TreeError::RootRemoval));
    assert_eq!(
        root.action_error.as_deref(),
        Some("Cannot remove the root message")
    );
}

#[tokio::test]
async fn test_view_of_unknown_node() {
    let f = fixture(MockCompletionGateway::new(), silent_prompt());
    assert!(matches!(
        f.controller.view("nope").await,
        Err(TreeError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_views_follow_display_order() {
    let f = fixture(MockCompletionGateway::new(), silent_prompt());
    let ids = seed(&f.store, &["a", "b"]).await;

    let views = f.controller.views().await.unwrap();
    let order: Vec<_> = views.iter().map(|v| v.node_id.clone()).collect();
    assert_eq!(order, vec!["root".to_string(), ids[1].clone(), ids[0].clone()]);
    assert_eq!(views[1].parent.as_ref().unwrap().parent_id, "root");
}

/// Holds every completion until released.
struct GatedGateway {
    release: Arc<Notify>,
}

#[async_trait]
impl CompletionGateway for GatedGateway {
    async fn create_chat_completion(
        &self,
        messages: &[Message],
        _params: &CompletionParams,
        _credential: &str,
    ) -> GatewayResult<ChatCompletion> {
        self.release.notified().await;
        offline_completion(messages)
    }

    async fn list_models(&self, _credential: &str) -> GatewayResult<Vec<String>> {
        Ok(vec![])
    }
}

#[tokio::test]
async fn test_duplicate_generate_is_refused_while_pending() {
    let release = Arc::new(Notify::new());
    let f = fixture(
        GatedGateway {
            release: Arc::clone(&release),
        },
        silent_prompt(),
    );
    f.settings.set_secret_key(OFFLINE_CREDENTIAL).await.unwrap();
    let ids = seed(&f.store, &["hi", "other"]).await;
    f.store
        .create_reply(&ids[1], Message::assistant("x"), None)
        .await
        .unwrap();
    let mut first = f.controller.view(&ids[0]).await.unwrap();
    let mut second = first.clone();
    let mut sibling = f.controller.view(&ids[1]).await.unwrap();

    let (first_result, second_result, sibling_result) = tokio::join!(
        f.controller.generate(&mut first),
        f.controller.generate(&mut second),
        async {
            let result = f.controller.remove_all_replies(&mut sibling).await;
            release.notify_one();
            result
        }
    );

    assert!(matches!(second_result, Err(TreeError::InFlight { .. })));
    assert_eq!(first_result.unwrap().len(), 1);
    // A different action on another node is not blocked.
    assert_eq!(sibling_result.unwrap(), 1);
    assert!(!f.controller.is_pending(&ids[0], Action::Reply));
}

#[tokio::test]
async fn test_reset_secret_key_flow() {
    let mut prompt = MockCredentialPrompt::new();
    let mut answers = vec![
        Some("sk-new".to_string()),
        Some("sk-other".to_string()),
        None,
    ]
    .into_iter();
    prompt
        .expect_request_secret_key()
        .times(3)
        .returning(move |_| answers.next().flatten());
    let mut confirmations = vec![true, false].into_iter();
    prompt
        .expect_confirm()
        .withf(|message| message == "This will replace your stored key")
        .times(2)
        .returning(move |_| confirmations.next().unwrap_or(false));
    let f = fixture(MockCompletionGateway::new(), prompt);

    assert_eq!(
        f.controller.reset_secret_key().await.unwrap(),
        SecretKeyReset::Stored
    );
    assert_eq!(
        f.controller.reset_secret_key().await.unwrap(),
        SecretKeyReset::Declined
    );
    assert_eq!(
        f.controller.reset_secret_key().await.unwrap(),
        SecretKeyReset::Cancelled
    );
    assert_eq!(f.settings.secret_key().await.unwrap().as_deref(), Some("sk-new"));
}

#[tokio::test]
async fn test_reset_with_same_key_skips_confirmation() {
    let mut prompt = MockCredentialPrompt::new();
    prompt
        .expect_request_secret_key()
        .withf(|current| current.as_deref() == Some("sk-1"))
        .returning(|current| current);
    prompt.expect_confirm().never();
    let f = fixture(MockCompletionGateway::new(), prompt);
    f.settings.set_secret_key("sk-1").await.unwrap();

    assert_eq!(
        f.controller.reset_secret_key().await.unwrap(),
        SecretKeyReset::Stored
    );
}
