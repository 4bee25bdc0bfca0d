//! LLM provider abstraction and trait definitions
//!
//! Agents talk to language models through [`LlmProvider`], so the pipeline
//! can run against any backend, or a mock in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system<S: Into<String>>(content: S) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user<S: Into<String>>(content: S) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant<S: Into<String>>(content: S) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Message roles in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// LLM completion request parameters
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub response_format: Option<ResponseFormat>,
    pub metadata: HashMap<String, String>,
}

/// LLM completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// Token usage statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Reason why completion finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

impl FinishReason {
    pub fn from_provider(reason: Option<&str>) -> Self {
        match reason {
            Some("stop") | Some("end_turn") | Some("stop_sequence") | None => FinishReason::Stop,
            Some("length") | Some("max_tokens") => FinishReason::Length,
            Some("content_filter") | Some("refusal") => FinishReason::ContentFilter,
            Some(_) => FinishReason::Error,
        }
    }
}

/// Response format for structured outputs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Plain text response
    #[default]
    Text,
    /// JSON object without schema validation
    Json,
    /// JSON with strict schema validation
    JsonSchema { json_schema: JsonSchemaDefinition },
}

/// JSON Schema definition for structured outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSchemaDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
    pub schema: serde_json::Value,
}

/// LLM provider trait for dependency injection and testing
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g. "openai", "anthropic")
    fn name(&self) -> &str;

    fn available_models(&self) -> Vec<String>;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    async fn health_check(&self) -> Result<(), LlmError>;
}

/// LLM provider errors
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("API error: {0}")]
    ApiError(String),
}

impl LlmError {
    /// Map an HTTP error status from a provider API
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => LlmError::AuthenticationFailed(body),
            404 => LlmError::ModelNotFound(body),
            400 | 413 | 422 => LlmError::InvalidRequest(body),
            429 => LlmError::RateLimitExceeded(body),
            500..=599 => LlmError::ApiError(format!("server error {status}: {body}")),
            _ => LlmError::RequestFailed(format!("status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::system("s").role, MessageRole::System);
        assert_eq!(Message::user("u").role, MessageRole::User);
        assert_eq!(Message::assistant("a").content, "a");
    }

    #[test]
    fn test_message_role_serialization() {
        assert_eq!(serde_json::to_string(&MessageRole::System).unwrap(), "\"system\"");
        assert_eq!(serde_json::to_string(&MessageRole::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            LlmError::from_status(401, String::new()),
            LlmError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            LlmError::from_status(429, String::new()),
            LlmError::RateLimitExceeded(_)
        ));
        assert!(matches!(
            LlmError::from_status(400, String::new()),
            LlmError::InvalidRequest(_)
        ));
        assert!(matches!(
            LlmError::from_status(503, String::new()),
            LlmError::ApiError(_)
        ));
        assert!(matches!(
            LlmError::from_status(418, String::new()),
            LlmError::RequestFailed(_)
        ));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(FinishReason::from_provider(Some("stop")), FinishReason::Stop);
        assert_eq!(FinishReason::from_provider(Some("max_tokens")), FinishReason::Length);
        assert_eq!(FinishReason::from_provider(Some("weird")), FinishReason::Error);
    }
}
