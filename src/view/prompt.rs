use async_trait::async_trait;

/// Asks the person at the keyboard for input the controller cannot derive.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialPrompt: Send + Sync {
    /// Ask for the API secret key, prefilled with `current`. `None` when cancelled.
    async fn request_secret_key(&self, current: Option<String>) -> Option<String>;

    /// Ask a yes/no question.
    async fn confirm(&self, message: &str) -> bool;
}

/// Non-interactive prompt answering with fixed values.
///
/// Used where no person is attached (JSON-RPC, CLI): the key comes from a
/// request parameter or flag instead of a dialog.
#[derive(Debug, Clone, Default)]
pub struct StaticPrompt {
    secret_key: Option<String>,
    confirm: bool,
}

impl StaticPrompt {
    /// Answer every key request with `secret_key` and confirm everything.
    pub fn new(secret_key: Option<String>) -> Self {
        Self {
            secret_key,
            confirm: true,
        }
    }

    /// Cancel every key request and decline every question.
    pub fn declining() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialPrompt for StaticPrompt {
    async fn request_secret_key(&self, _current: Option<String>) -> Option<String> {
        self.secret_key.clone()
    }

    async fn confirm(&self, _message: &str) -> bool {
        self.confirm
    }
}
