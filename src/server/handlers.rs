use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use super::SharedState;
use crate::error::{RpcError, RpcResult, SettingsResult};
use crate::settings::parse_parameter;
use crate::tree::{Message, NodeId, Role};
use crate::view::{deletion_report, Action, FormSubmission, StaticPrompt, ThreadView};

/// Methods answered by the server, in addition to `initialize` and `ping`.
pub const METHODS: &[&str] = &[
    "initialize",
    "ping",
    "thread/node",
    "thread/tree",
    "thread/reply",
    "thread/generate",
    "thread/tweak",
    "thread/remove",
    "thread/remove_all",
    "settings/get",
    "settings/set",
    "models/list",
];

/// Everything a client needs to render one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub parent_id: Option<NodeId>,
    pub depth: u32,
    pub children: Vec<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    pub meta: String,
    pub reply_verb: &'static str,
    pub show_reply_form: bool,
    pub default_form_role: Role,
    /// Only set for user messages, which get a generate button.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generate_label: Option<&'static str>,
    pub actions: Vec<&'static str>,
}

impl NodeSnapshot {
    pub fn new(view: &ThreadView, generating: bool) -> Self {
        let generate_label =
            (view.node.role() == Some(Role::User)).then(|| view.generate_label(generating));
        Self {
            node_id: view.node_id.clone(),
            parent_id: view.parent.as_ref().map(|p| p.parent_id.clone()),
            depth: view.node.depth,
            children: view.node.children.clone(),
            message: view.node.message.clone(),
            timestamp: view.node.timestamp,
            response: view.node.response.clone(),
            meta: view.meta_line(),
            reply_verb: view.reply_verb(),
            show_reply_form: view.show_reply_form(),
            default_form_role: view.default_form_role(),
            generate_label,
            actions: view.available_actions().iter().map(|a| a.label()).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Created {
    created: Vec<NodeId>,
}

#[derive(Debug, Serialize)]
struct Deleted {
    deleted: usize,
    message: String,
}

impl Deleted {
    fn new(deleted: usize) -> Self {
        Self {
            deleted,
            message: deletion_report(deleted),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NodeParams {
    node_id: NodeId,
}

#[derive(Debug, Deserialize)]
struct ReplyParams {
    node_id: NodeId,
    text: String,
    #[serde(default)]
    role: Option<Role>,
}

#[derive(Debug, Deserialize)]
struct GenerateParams {
    node_id: NodeId,
    /// Used (and stored) when no secret key is stored yet.
    #[serde(default)]
    secret_key: Option<String>,
}

/// A sampling parameter given as a number or as typed text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ParameterInput {
    Number(f64),
    Text(String),
}

impl ParameterInput {
    fn value(&self) -> SettingsResult<f64> {
        match self {
            ParameterInput::Number(n) => Ok(*n),
            ParameterInput::Text(s) => parse_parameter(s),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsParams {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<ParameterInput>,
    #[serde(default)]
    top_p: Option<ParameterInput>,
    #[serde(default)]
    secret_key: Option<String>,
}

/// Route a method call to its handler
pub async fn handle_method(
    state: &SharedState,
    method: &str,
    params: Option<Value>,
) -> RpcResult<Value> {
    info!(method = %method, "Routing method call");

    match method {
        "thread/node" => handle_node(state, params).await,
        "thread/tree" => handle_tree(state).await,
        "thread/reply" => handle_reply(state, params).await,
        "thread/generate" => handle_generate(state, params).await,
        "thread/tweak" => handle_tweak(state, params).await,
        "thread/remove" => handle_remove(state, params).await,
        "thread/remove_all" => handle_remove_all(state, params).await,
        "settings/get" => handle_settings_get(state).await,
        "settings/set" => handle_settings_set(state, params).await,
        "models/list" => handle_models_list(state).await,
        _ => Err(RpcError::UnknownMethod {
            method: method.to_string(),
        }),
    }
}

fn snapshot(state: &SharedState, view: &ThreadView) -> NodeSnapshot {
    let generating = state.controller.is_pending(&view.node_id, Action::Reply);
    NodeSnapshot::new(view, generating)
}

async fn handle_node(state: &SharedState, params: Option<Value>) -> RpcResult<Value> {
    let params: NodeParams = parse_arguments("thread/node", params)?;
    let view = state.controller.view(&params.node_id).await?;
    serde_json::to_value(snapshot(state, &view)).map_err(RpcError::Json)
}

async fn handle_tree(state: &SharedState) -> RpcResult<Value> {
    let views = state.controller.views().await?;
    let nodes: Vec<NodeSnapshot> = views.iter().map(|v| snapshot(state, v)).collect();
    serde_json::to_value(nodes).map_err(RpcError::Json)
}

async fn handle_reply(state: &SharedState, params: Option<Value>) -> RpcResult<Value> {
    execute_handler("thread/reply", params, |params: ReplyParams| async move {
        let mut view = state.controller.view(&params.node_id).await?;
        let role = params.role.unwrap_or_else(|| view.default_form_role());
        let submission = FormSubmission::new(params.text, role);
        let created = state.controller.reply(&mut view, Some(submission)).await?;
        Ok::<_, RpcError>(Created { created })
    })
    .await
}

async fn handle_generate(state: &SharedState, params: Option<Value>) -> RpcResult<Value> {
    execute_handler("thread/generate", params, |params: GenerateParams| async move {
        let controller = state
            .controller
            .with_prompt(Arc::new(StaticPrompt::new(params.secret_key)));
        let mut view = controller.view(&params.node_id).await?;
        let created = controller.generate(&mut view).await?;
        Ok::<_, RpcError>(Created { created })
    })
    .await
}

async fn handle_tweak(state: &SharedState, params: Option<Value>) -> RpcResult<Value> {
    execute_handler("thread/tweak", params, |params: ReplyParams| async move {
        let mut view = state.controller.view(&params.node_id).await?;
        let role = params
            .role
            .or_else(|| view.tweak_defaults().map(|m| m.role))
            .unwrap_or(Role::User);
        let id = state
            .controller
            .tweak(&mut view, FormSubmission::new(params.text, role))
            .await?;
        Ok::<_, RpcError>(Created { created: vec![id] })
    })
    .await
}

async fn handle_remove(state: &SharedState, params: Option<Value>) -> RpcResult<Value> {
    execute_handler("thread/remove", params, |params: NodeParams| async move {
        let mut view = state.controller.view(&params.node_id).await?;
        let deleted = state.controller.remove(&mut view).await?;
        Ok::<_, RpcError>(Deleted::new(deleted))
    })
    .await
}

async fn handle_remove_all(state: &SharedState, params: Option<Value>) -> RpcResult<Value> {
    execute_handler("thread/remove_all", params, |params: NodeParams| async move {
        let mut view = state.controller.view(&params.node_id).await?;
        let deleted = state.controller.remove_all_replies(&mut view).await?;
        Ok::<_, RpcError>(Deleted::new(deleted))
    })
    .await
}

async fn handle_settings_get(state: &SharedState) -> RpcResult<Value> {
    let snapshot = state.controller.settings().snapshot().await?;
    serde_json::to_value(snapshot).map_err(RpcError::Json)
}

async fn handle_settings_set(state: &SharedState, params: Option<Value>) -> RpcResult<Value> {
    let params: SettingsParams = match params {
        Some(p) => parse_arguments("settings/set", Some(p))?,
        None => SettingsParams::default(),
    };
    let settings = state.controller.settings();

    // Validate everything before writing anything.
    let temperature = params.temperature.as_ref().map(|t| t.value()).transpose()?;
    let top_p = params.top_p.as_ref().map(|t| t.value()).transpose()?;

    if let Some(model) = &params.model {
        settings.set_model(model).await?;
    }
    if let Some(value) = temperature {
        settings.set_temperature(value).await?;
    }
    if let Some(value) = top_p {
        settings.set_top_p(value).await?;
    }
    if let Some(key) = &params.secret_key {
        settings.set_secret_key(key).await?;
    }

    handle_settings_get(state).await
}

async fn handle_models_list(state: &SharedState) -> RpcResult<Value> {
    let controller = &state.controller;
    let models = controller
        .settings()
        .available_models(controller.gateway())
        .await?;
    Ok(serde_json::json!({ "models": models }))
}

/// Deserialize method parameters, reporting failures as invalid params.
fn parse_arguments<T: serde::de::DeserializeOwned>(
    method: &str,
    params: Option<Value>,
) -> RpcResult<T> {
    match params {
        Some(args) => serde_json::from_value(args).map_err(|e| RpcError::InvalidParameters {
            method: method.to_string(),
            message: e.to_string(),
        }),
        None => Err(RpcError::InvalidParameters {
            method: method.to_string(),
            message: "Missing params".to_string(),
        }),
    }
}

/// Parse `params` as `P`, run `operation`, and serialize its result.
async fn execute_handler<P, R, E, F, Fut>(
    method: &str,
    params: Option<Value>,
    operation: F,
) -> RpcResult<Value>
where
    P: serde::de::DeserializeOwned,
    R: Serialize,
    E: std::fmt::Display,
    F: FnOnce(P) -> Fut,
    Fut: std::future::Future<Output = Result<R, E>>,
{
    let params: P = parse_arguments(method, params)?;

    let result = operation(params)
        .await
        .map_err(|e| RpcError::ExecutionFailed {
            message: e.to_string(),
        })?;

    serde_json::to_value(result).map_err(RpcError::Json)
}
