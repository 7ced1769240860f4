use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub openai: OpenAiConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub tree: TreeConfig,
}

/// Chat-completion API configuration
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
}

/// Conversation tree key layout
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Prefix of every node key: `<namespace>/<NodeId>`.
    pub namespace: String,
    /// Id of the node lazily created on first read.
    pub root_id: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let openai = OpenAiConfig {
            base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/threadgpt.db".to_string()),
            ),
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60000),
        };

        let tree = TreeConfig {
            namespace: env::var("THREAD_NAMESPACE").unwrap_or_else(|_| "threadgpt".to_string()),
            root_id: env::var("THREAD_ROOT_ID").unwrap_or_else(|_| "root".to_string()),
        };

        if tree.namespace.is_empty() || tree.root_id.is_empty() {
            return Err(AppError::Config {
                message: "THREAD_NAMESPACE and THREAD_ROOT_ID must not be empty".to_string(),
            });
        }

        Ok(Config {
            openai,
            database,
            logging,
            request,
            tree,
        })
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self { timeout_ms: 60000 }
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            namespace: "threadgpt".to_string(),
            root_id: "root".to_string(),
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
        }
    }
}
