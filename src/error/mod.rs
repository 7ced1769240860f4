use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Tree(#[from] TreeError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("JSON-RPC error: {0}")]
    Rpc(#[from] RpcError),
}

/// Key-value adapter errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Stored value is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Conversation tree errors, surfaced next to the control that triggered them
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Message not found: {node_id}")]
    NotFound { node_id: String },

    #[error("Child message not found: {child_id} is no longer a reply of {parent_id}")]
    ChildNotFound { parent_id: String, child_id: String },

    #[error("Message cannot be empty")]
    EmptyMessage,

    #[error("OpenAI secret key is required")]
    MissingCredential,

    #[error("Cannot insert message at root level")]
    UnsupportedAtRoot,

    #[error("Cannot remove the root message")]
    RootRemoval,

    #[error("{action} is already running for {node_id}")]
    InFlight { node_id: String, action: String },

    #[error("{0}")]
    Gateway(#[from] GatewayError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Settings(#[from] SettingsError),
}

/// Completion gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Cannot generate a reply from an empty conversation")]
    EmptyHistory,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// User settings errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{input} is not a valid number")]
    InvalidNumber { input: String },

    #[error("{key} must be between 0 and 1, got {value}")]
    OutOfRange { key: String, value: f64 },

    #[error("Set your OpenAI secret key to select a model.")]
    NoSecretKey,

    #[error("{0}")]
    Gateway(#[from] GatewayError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// JSON-RPC protocol errors
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Method not found: {method}")]
    UnknownMethod { method: String },

    #[error("Invalid parameters for {method}: {message}")]
    InvalidParameters { method: String, message: String },

    #[error("{message}")]
    ExecutionFailed { message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<TreeError> for RpcError {
    fn from(err: TreeError) -> Self {
        RpcError::ExecutionFailed {
            message: err.to_string(),
        }
    }
}

impl From<SettingsError> for RpcError {
    fn from(err: SettingsError) -> Self {
        RpcError::ExecutionFailed {
            message: err.to_string(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for key-value adapter operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for tree operations
pub type TreeResult<T> = Result<T, TreeError>;

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Result type alias for settings operations
pub type SettingsResult<T> = Result<T, SettingsError>;

/// Result type alias for JSON-RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "bad log format".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: bad log format");
    }

    #[test]
    fn test_tree_error_display() {
        let err = TreeError::NotFound {
            node_id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "Message not found: abc");

        assert_eq!(TreeError::EmptyMessage.to_string(), "Message cannot be empty");
        assert_eq!(
            TreeError::MissingCredential.to_string(),
            "OpenAI secret key is required"
        );
        assert_eq!(
            TreeError::UnsupportedAtRoot.to_string(),
            "Cannot insert message at root level"
        );

        let err = TreeError::ChildNotFound {
            parent_id: "p".to_string(),
            child_id: "c".to_string(),
        };
        assert!(err.to_string().starts_with("Child message not found"));
    }

    #[test]
    fn test_gateway_error_is_shown_verbatim_by_tree_error() {
        let err: TreeError = GatewayError::Api {
            status: 401,
            message: "Incorrect API key provided".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "API error: 401 - Incorrect API key provided");
    }

    #[test]
    fn test_settings_error_display() {
        let err = SettingsError::InvalidNumber {
            input: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "abc is not a valid number");

        let err = SettingsError::OutOfRange {
            key: "temperature".to_string(),
            value: 1.5,
        };
        assert_eq!(err.to_string(), "temperature must be between 0 and 1, got 1.5");
    }

    #[test]
    fn test_rpc_error_display() {
        let err = RpcError::UnknownMethod {
            method: "thread/explode".to_string(),
        };
        assert_eq!(err.to_string(), "Method not found: thread/explode");

        let err = RpcError::InvalidParameters {
            method: "thread/reply".to_string(),
            message: "missing field `text`".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid parameters for thread/reply: missing field `text`"
        );
    }

    #[test]
    fn test_tree_error_conversion_to_rpc_error() {
        let rpc: RpcError = TreeError::EmptyMessage.into();
        assert!(matches!(rpc, RpcError::ExecutionFailed { .. }));
        assert_eq!(rpc.to_string(), "Message cannot be empty");
    }

    #[test]
    fn test_storage_error_conversion_to_tree_error() {
        let err: TreeError = StorageError::Connection {
            message: "disk I/O error".to_string(),
        }
        .into();
        assert!(matches!(err, TreeError::Storage(_)));
        assert_eq!(
            err.to_string(),
            "Storage error: Database connection failed: disk I/O error"
        );
    }

    #[test]
    fn test_errors_convert_to_app_error() {
        let app: AppError = TreeError::MissingCredential.into();
        assert!(matches!(app, AppError::Tree(_)));

        let app: AppError = GatewayError::Timeout { timeout_ms: 1000 }.into();
        assert!(matches!(app, AppError::Gateway(_)));

        let app: AppError = SettingsError::NoSecretKey.into();
        assert!(matches!(app, AppError::Settings(_)));
    }
}
