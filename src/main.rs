use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use threadgpt::{
    cli::{execute_command, Cli, Commands},
    config::{Config, LogFormat},
    gateway::OpenAiClient,
    server::{AppState, RpcServer},
    settings::SettingsService,
    storage::{KvStore, SqliteStore},
    tree::TreeStore,
    view::{StaticPrompt, ThreadController},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "ThreadGPT starting...");

    // Initialize storage
    let kv: Arc<dyn KvStore> = match SqliteStore::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            Arc::new(s)
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    // Initialize completion client
    let gateway = match OpenAiClient::new(&config.openai, config.request.clone()) {
        Ok(c) => {
            info!(base_url = %config.openai.base_url, "Completion client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize completion client");
            return Err(e.into());
        }
    };

    let controller = ThreadController::new(
        TreeStore::new(Arc::clone(&kv), &config.tree),
        Arc::new(gateway),
        SettingsService::new(kv),
        Arc::new(StaticPrompt::declining()),
    );

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let server = RpcServer::new(Arc::new(AppState::new(config, controller)));

            info!("Server ready, waiting for requests on stdin...");

            if let Err(e) = server.run().await {
                error!(error = %e, "Server error");
                return Err(e.into());
            }

            info!("Server shutdown complete");
        }
        command => {
            let result = execute_command(command, &controller).await;
            if result.exit_code == 0 {
                println!("{}", result.message);
            } else {
                eprintln!("{}", result.message);
                std::process::exit(result.exit_code);
            }
        }
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
