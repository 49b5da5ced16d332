// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Chat-completions client for the model under evaluation

use async_trait::async_trait;
use mcqbench_core::{BenchConfig, ModelConfig, TokenUsage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Trait for clients that can answer a chat prompt
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send one request. Implementations make exactly one network call.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ModelConfig,
    ) -> Result<ModelResponse, RequestError>;

    /// Get model name
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Response from the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Errors from model clients, tagged by whether a retry may help
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("retriable request error{}: {message}", status_suffix(.status))]
    Retriable { status: Option<u16>, message: String },

    #[error("fatal request error{}: {message}", status_suffix(.status))]
    Fatal { status: Option<u16>, message: String },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl RequestError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self::Retriable {
            status: None,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            status: None,
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        if is_retriable_status(status) {
            Self::Retriable {
                status: Some(status),
                message,
            }
        } else {
            Self::Fatal {
                status: Some(status),
                message,
            }
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retriable { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Retriable { status, .. } | Self::Fatal { status, .. } => *status,
        }
    }
}

/// 408, 409, 429 and every 5xx are transient
pub fn is_retriable_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 429 | 500..=599)
}

impl From<reqwest::Error> for RequestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return Self::fatal(err.to_string());
        }
        match err.status() {
            Some(status) => Self::from_status(status.as_u16(), err.to_string()),
            // Timeouts, connection failures and undecodable bodies
            None => Self::retriable(err.to_string()),
        }
    }
}

/// OpenAI-compatible client implementation
pub struct OpenAIClient {
    api_key: Option<String>,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    pub fn new(api_key: Option<String>, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Client for the endpoint and model named in the configuration
    pub fn from_config(config: &BenchConfig) -> Result<Self, RequestError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.llm_api.disable_ssl_verify)
            .build()
            .map_err(|e| RequestError::fatal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_key: config.llm_api.api_key.clone(),
            model: config.model.name.clone(),
            base_url: String::new(),
            client,
        }
        .with_base_url(config.llm_api.base_url.clone()))
    }

    fn request_body(&self, messages: &[ChatMessage], params: &ModelConfig) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "max_tokens": params.max_tokens,
            "frequency_penalty": params.frequency_penalty,
            "presence_penalty": params.presence_penalty,
        });

        if let Some(object) = body.as_object_mut() {
            for (key, value) in &params.extra_body {
                object.insert(key.clone(), value.clone());
            }
        }
        body
    }
}

#[async_trait]
impl ModelClient for OpenAIClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ModelConfig,
    ) -> Result<ModelResponse, RequestError> {
        let request = self.request_body(messages, params);

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(RequestError::from_status(status, error_text));
        }

        let response_data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RequestError::retriable(format!("malformed response body: {}", e)))?;

        let message = response_data["choices"]
            .get(0)
            .and_then(|choice| choice.get("message"))
            .ok_or_else(|| RequestError::retriable("malformed response body: missing choices"))?;

        // Some servers send `content: null` for empty completions
        let content = message["content"].as_str().unwrap_or_default().to_string();

        let usage_data = &response_data["usage"];
        let usage = TokenUsage {
            prompt_tokens: usage_data["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: usage_data["completion_tokens"].as_u64().unwrap_or(0) as u32,
            total_tokens: usage_data["total_tokens"].as_u64().unwrap_or(0) as u32,
        };

        Ok(ModelResponse {
            content,
            usage,
            model: response_data["model"]
                .as_str()
                .unwrap_or(&self.model)
                .to_string(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
