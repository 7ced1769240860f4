use async_trait::async_trait;
use reqwest::{Client, Response};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::offline::{offline_completion, OFFLINE_CREDENTIAL};
use super::types::{ChatCompletion, ChatCompletionRequest, ModelList};
use super::{CompletionGateway, CompletionParams, DEFAULT_MODEL};
use crate::config::{OpenAiConfig, RequestConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::tree::Message;

/// Client for an OpenAI-compatible chat-completion API.
///
/// Requests are sent once; failures are reported to the caller, never retried.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    request_config: RequestConfig,
}

impl OpenAiClient {
    /// Create a new client
    pub fn new(config: &OpenAiConfig, request_config: RequestConfig) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(GatewayError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_config,
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout {
                timeout_ms: self.request_config.timeout_ms,
            }
        } else {
            GatewayError::Http(e)
        }
    }

    async fn ensure_success(response: Response) -> GatewayResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Api {
            status: status.as_u16(),
            message: api_error_message(&body),
        })
    }
}

#[async_trait]
impl CompletionGateway for OpenAiClient {
    async fn create_chat_completion(
        &self,
        messages: &[Message],
        params: &CompletionParams,
        credential: &str,
    ) -> GatewayResult<ChatCompletion> {
        if credential == OFFLINE_CREDENTIAL {
            debug!(messages = messages.len(), "Answering with offline completion");
            return offline_completion(messages);
        }
        if messages.is_empty() {
            return Err(GatewayError::EmptyHistory);
        }

        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = ChatCompletionRequest::new(messages, params);

        debug!(
            model = %params.model,
            messages = messages.len(),
            "Requesting chat completion"
        );

        let start = Instant::now();
        let result = async {
            let response = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", credential))
                .header("Content-Type", "application/json")
                .json(&request)
                .send()
                .await
                .map_err(|e| self.map_send_error(e))?;

            let response = Self::ensure_success(response).await?;

            response
                .json::<ChatCompletion>()
                .await
                .map_err(|e| GatewayError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })
        }
        .await;

        let latency = start.elapsed();
        match &result {
            Ok(completion) => info!(
                model = %completion.model,
                choices = completion.choices.len(),
                latency_ms = latency.as_millis(),
                "Chat completion succeeded"
            ),
            Err(e) => error!(
                model = %params.model,
                error = %e,
                latency_ms = latency.as_millis(),
                "Chat completion failed"
            ),
        }

        result
    }

    async fn list_models(&self, credential: &str) -> GatewayResult<Vec<String>> {
        if credential == OFFLINE_CREDENTIAL {
            return Ok(vec![DEFAULT_MODEL.to_string()]);
        }

        let url = format!("{}/v1/models", self.base_url);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", credential))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let response = Self::ensure_success(response).await?;

        let list: ModelList = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse {
                message: format!("Failed to parse model list: {}", e),
            })?;

        let models = list.chat_models();
        info!(count = models.len(), "Listed chat models");
        Ok(models)
    }
}

/// Pull `error.message` out of an API error body, falling back to the raw body.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}
