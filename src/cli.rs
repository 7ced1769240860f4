//! Command-line interface.
//!
//! `serve` (the default) runs the JSON-RPC server; every other subcommand
//! performs one tree or settings operation and prints its outcome.

use clap::{Parser, Subcommand};
use std::sync::Arc;

use crate::settings::parse_parameter;
use crate::tree::Role;
use crate::view::{deletion_report, FormSubmission, StaticPrompt, ThreadController, ThreadView};

/// Branching conversations with a chat-completion API.
#[derive(Parser, Debug)]
#[command(name = "threadgpt", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve JSON-RPC on stdin/stdout
    Serve,

    /// Print the whole conversation tree
    Tree,

    /// Add a reply with your own text
    Reply {
        node_id: String,
        text: String,
        /// system, user or assistant; defaults to the form default for the node
        #[arg(long)]
        role: Option<Role>,
    },

    /// Ask the model for replies to a node's conversation
    Generate {
        node_id: String,
        /// Stored for later runs when no key is stored yet
        #[arg(long)]
        secret_key: Option<String>,
    },

    /// Insert an edited copy of a message next to it
    Tweak {
        node_id: String,
        text: String,
        #[arg(long)]
        role: Option<Role>,
    },

    /// Remove a message and its replies
    Remove {
        node_id: String,
        /// Keep the message, remove only its replies
        #[arg(long)]
        all_replies: bool,
    },

    /// Print the conversation leading to a node as JSON
    Export {
        node_id: String,
        /// Print the stored API response instead
        #[arg(long)]
        response: bool,
    },

    /// Show or change settings
    Settings {
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<String>,
        #[arg(long)]
        top_p: Option<String>,
        #[arg(long)]
        secret_key: Option<String>,
    },
}

/// Result of CLI command execution.
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

impl<E: std::fmt::Display> From<Result<String, E>> for CliResult {
    fn from(result: Result<String, E>) -> Self {
        match result {
            Ok(message) => CliResult::success(message),
            Err(e) => CliResult::error(format!("Error: {}", e)),
        }
    }
}

/// Execute a one-shot command. `Serve` is handled by the binary.
pub async fn execute_command(command: Commands, controller: &ThreadController) -> CliResult {
    match command {
        Commands::Serve => CliResult::error("serve runs the server; nothing to execute"),
        Commands::Tree => execute_tree(controller).await,
        Commands::Reply {
            node_id,
            text,
            role,
        } => execute_reply(controller, &node_id, text, role).await,
        Commands::Generate {
            node_id,
            secret_key,
        } => execute_generate(controller, &node_id, secret_key).await,
        Commands::Tweak {
            node_id,
            text,
            role,
        } => execute_tweak(controller, &node_id, text, role).await,
        Commands::Remove {
            node_id,
            all_replies,
        } => execute_remove(controller, &node_id, all_replies).await,
        Commands::Export { node_id, response } => {
            execute_export(controller, &node_id, response).await
        }
        Commands::Settings {
            model,
            temperature,
            top_p,
            secret_key,
        } => execute_settings(controller, model, temperature, top_p, secret_key).await,
    }
}

/// Indented outline of `views`, one message per line.
pub fn render_tree(views: &[ThreadView]) -> String {
    let mut output = String::new();

    for view in views {
        let indent = "  ".repeat(view.node.depth as usize);
        match &view.node.message {
            Some(message) => {
                let first_line = message.content.lines().next().unwrap_or_default();
                output.push_str(&format!(
                    "{}[{}{}] {} ({})\n",
                    indent,
                    message.role,
                    view.meta_line(),
                    first_line,
                    view.node_id
                ));
            }
            None => output.push_str(&format!("{}{} ({})\n", indent, view.reply_verb(), view.node_id)),
        }
    }

    output
}

async fn execute_tree(controller: &ThreadController) -> CliResult {
    controller
        .views()
        .await
        .map(|views| render_tree(&views))
        .into()
}

async fn execute_reply(
    controller: &ThreadController,
    node_id: &str,
    text: String,
    role: Option<Role>,
) -> CliResult {
    let result = async {
        let mut view = controller.view(node_id).await?;
        let role = role.unwrap_or_else(|| view.default_form_role());
        let ids = controller
            .reply(&mut view, Some(FormSubmission::new(text, role)))
            .await?;
        Ok::<_, crate::error::TreeError>(ids.join("\n"))
    }
    .await;
    result.into()
}

async fn execute_generate(
    controller: &ThreadController,
    node_id: &str,
    secret_key: Option<String>,
) -> CliResult {
    let controller = controller.with_prompt(Arc::new(StaticPrompt::new(secret_key)));
    let result = async {
        let mut view = controller.view(node_id).await?;
        let ids = controller.generate(&mut view).await?;
        let mut lines = Vec::with_capacity(ids.len());
        for id in ids {
            let reply = controller.view(&id).await?;
            let content = reply
                .node
                .message
                .as_ref()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            lines.push(format!("{}{}\n{}", id, reply.meta_line(), content));
        }
        Ok::<_, crate::error::TreeError>(lines.join("\n\n"))
    }
    .await;
    result.into()
}

async fn execute_tweak(
    controller: &ThreadController,
    node_id: &str,
    text: String,
    role: Option<Role>,
) -> CliResult {
    let result = async {
        let mut view = controller.view(node_id).await?;
        let role = role
            .or_else(|| view.tweak_defaults().map(|m| m.role))
            .unwrap_or(Role::User);
        controller
            .tweak(&mut view, FormSubmission::new(text, role))
            .await
    }
    .await;
    result.into()
}

async fn execute_remove(controller: &ThreadController, node_id: &str, all_replies: bool) -> CliResult {
    let result = async {
        let mut view = controller.view(node_id).await?;
        let deleted = if all_replies {
            controller.remove_all_replies(&mut view).await?
        } else {
            controller.remove(&mut view).await?
        };
        Ok::<_, crate::error::TreeError>(deletion_report(deleted))
    }
    .await;
    result.into()
}

async fn execute_export(controller: &ThreadController, node_id: &str, response: bool) -> CliResult {
    let view = match controller.view(node_id).await {
        Ok(view) => view,
        Err(e) => return CliResult::error(format!("Error: {}", e)),
    };

    if response {
        match view.response_json() {
            Ok(Some(json)) => CliResult::success(json),
            Ok(None) => CliResult::error(format!("{} has no stored response", node_id)),
            Err(e) => CliResult::error(format!("Error: {}", e)),
        }
    } else {
        view.conversation_json().into()
    }
}

async fn execute_settings(
    controller: &ThreadController,
    model: Option<String>,
    temperature: Option<String>,
    top_p: Option<String>,
    secret_key: Option<String>,
) -> CliResult {
    let settings = controller.settings();
    let result = async {
        let temperature = temperature.as_deref().map(parse_parameter).transpose()?;
        let top_p = top_p.as_deref().map(parse_parameter).transpose()?;

        if let Some(model) = &model {
            settings.set_model(model).await?;
        }
        if let Some(value) = temperature {
            settings.set_temperature(value).await?;
        }
        if let Some(value) = top_p {
            settings.set_top_p(value).await?;
        }
        if let Some(key) = &secret_key {
            settings.set_secret_key(key).await?;
        }

        let snapshot = settings.snapshot().await?;
        Ok::<_, crate::error::SettingsError>(format!(
            "model: {}\ntemperature: {}\ntop_p: {}\nsecret key: {}",
            snapshot.model,
            snapshot.temperature,
            snapshot.top_p,
            if snapshot.has_secret_key { "set" } else { "not set" }
        ))
    }
    .await;
    result.into()
}
