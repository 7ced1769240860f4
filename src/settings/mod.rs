//! User settings kept in the key-value adapter next to the conversation tree.
//!
//! Values are read through a small in-process cache. Every write goes to the
//! adapter first and then refreshes the cached entry, so readers of the same
//! [`SettingsService`] never observe a stale value after a local write. The
//! model catalog is cached separately and dropped whenever the secret key
//! changes.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{SettingsError, SettingsResult};
use crate::gateway::{CompletionGateway, CompletionParams, DEFAULT_MODEL};
use crate::storage::KvStore;

/// Key of the API credential.
pub const SECRET_KEY: &str = "openaiSecretKey";
/// Key of the selected model id.
pub const SELECTED_MODEL: &str = "selectedModel";
/// Key of the sampling temperature.
pub const TEMPERATURE: &str = "temperature";
/// Key of the nucleus sampling parameter.
pub const TOP_P: &str = "top_p";

pub const DEFAULT_TEMPERATURE: f64 = 1.0;
pub const DEFAULT_TOP_P: f64 = 1.0;

/// Everything a settings panel shows. The secret key itself is never echoed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingsSnapshot {
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub has_secret_key: bool,
}

/// Cache-and-invalidate accessors for the flat settings keys.
#[derive(Clone)]
pub struct SettingsService {
    kv: Arc<dyn KvStore>,
    values: Arc<RwLock<HashMap<&'static str, Option<Value>>>>,
    models: Arc<RwLock<Option<Vec<String>>>>,
}

impl SettingsService {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            values: Arc::new(RwLock::new(HashMap::new())),
            models: Arc::new(RwLock::new(None)),
        }
    }

    async fn read(&self, key: &'static str) -> SettingsResult<Option<Value>> {
        if let Some(cached) = self.values.read().await.get(key) {
            return Ok(cached.clone());
        }

        let value = self.kv.get(key).await?;
        debug!(key = key, present = value.is_some(), "Loaded setting");
        self.values.write().await.insert(key, value.clone());
        Ok(value)
    }

    async fn write(&self, key: &'static str, value: Option<Value>) -> SettingsResult<()> {
        match &value {
            Some(v) => self.kv.set(key, v).await?,
            None => self.kv.delete(key).await?,
        }
        self.values.write().await.insert(key, value);
        Ok(())
    }

    async fn read_number(&self, key: &'static str, default: f64) -> SettingsResult<f64> {
        match self.read(key).await? {
            None => Ok(default),
            Some(Value::Number(n)) => Ok(n.as_f64().unwrap_or(default)),
            Some(Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(v) => Ok(v),
                Err(_) => {
                    warn!(key = key, value = %s, "Ignoring unparsable setting");
                    Ok(default)
                }
            },
            Some(other) => {
                warn!(key = key, value = %other, "Ignoring unparsable setting");
                Ok(default)
            }
        }
    }

    async fn write_number(&self, key: &'static str, value: f64) -> SettingsResult<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(SettingsError::OutOfRange {
                key: key.to_string(),
                value,
            });
        }
        let number = serde_json::Number::from_f64(value).ok_or_else(|| {
            SettingsError::InvalidNumber {
                input: value.to_string(),
            }
        })?;
        self.write(key, Some(Value::Number(number))).await
    }

    /// Forget every cached value; the next read goes to the adapter.
    pub async fn invalidate(&self) {
        self.values.write().await.clear();
        self.models.write().await.take();
    }

    /// Stored credential. An empty string counts as absent.
    pub async fn secret_key(&self) -> SettingsResult<Option<String>> {
        Ok(self
            .read(SECRET_KEY)
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|k| !k.is_empty()))
    }

    /// Store a new credential and drop the model catalog fetched with the old one.
    pub async fn set_secret_key(&self, key: &str) -> SettingsResult<()> {
        let value = (!key.is_empty()).then(|| Value::String(key.to_string()));
        self.write(SECRET_KEY, value).await?;
        self.models.write().await.take();
        info!("Secret key updated");
        Ok(())
    }

    pub async fn model(&self) -> SettingsResult<String> {
        Ok(self
            .read(SELECTED_MODEL)
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()))
    }

    pub async fn set_model(&self, model: &str) -> SettingsResult<()> {
        self.write(SELECTED_MODEL, Some(Value::String(model.to_string())))
            .await?;
        info!(model = %model, "Model selected");
        Ok(())
    }

    pub async fn temperature(&self) -> SettingsResult<f64> {
        self.read_number(TEMPERATURE, DEFAULT_TEMPERATURE).await
    }

    /// Set the temperature; must lie in `[0, 1]`.
    pub async fn set_temperature(&self, value: f64) -> SettingsResult<()> {
        self.write_number(TEMPERATURE, value).await
    }

    pub async fn top_p(&self) -> SettingsResult<f64> {
        self.read_number(TOP_P, DEFAULT_TOP_P).await
    }

    /// Set top_p; must lie in `[0, 1]`.
    pub async fn set_top_p(&self, value: f64) -> SettingsResult<()> {
        self.write_number(TOP_P, value).await
    }

    /// Model and sampling parameters for the next completion request
    pub async fn completion_params(&self) -> SettingsResult<CompletionParams> {
        Ok(CompletionParams {
            model: self.model().await?,
            temperature: self.temperature().await?,
            top_p: self.top_p().await?,
        })
    }

    pub async fn snapshot(&self) -> SettingsResult<SettingsSnapshot> {
        Ok(SettingsSnapshot {
            model: self.model().await?,
            temperature: self.temperature().await?,
            top_p: self.top_p().await?,
            has_secret_key: self.secret_key().await?.is_some(),
        })
    }

    /// Chat models the stored credential may use. Fetched once per credential.
    pub async fn available_models(
        &self,
        gateway: &dyn CompletionGateway,
    ) -> SettingsResult<Vec<String>> {
        if let Some(models) = self.models.read().await.as_ref() {
            return Ok(models.clone());
        }

        let key = self.secret_key().await?.ok_or(SettingsError::NoSecretKey)?;
        let models = gateway.list_models(&key).await?;
        *self.models.write().await = Some(models.clone());
        Ok(models)
    }
}

/// Parse a sampling parameter typed by the user.
pub fn parse_parameter(input: &str) -> SettingsResult<f64> {
    input
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| SettingsError::InvalidNumber {
            input: input.to_string(),
        })
}
