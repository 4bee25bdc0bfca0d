//! OpenAI-compatible chat completions provider
//!
//! Works against any endpoint that speaks the `/chat/completions` API.
//! Retries are not done here: the agent invoker owns the retry budget and
//! needs every failure surfaced with its HTTP classification intact.

use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, Message,
    MessageRole, ResponseFormat, TokenUsage,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// OpenAI provider configuration
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::NotConfigured(
                "OpenAI API key is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn convert_message(message: &Message) -> OpenAiMessage {
        OpenAiMessage {
            role: match message.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            }
            .to_string(),
            content: Some(message.content.clone()),
        }
    }

    fn convert_request(request: &CompletionRequest) -> OpenAiCompletionRequest {
        let response_format = request.response_format.as_ref().map(|rf| match rf {
            ResponseFormat::Text => OpenAiResponseFormat::Simple {
                format_type: "text".to_string(),
            },
            ResponseFormat::Json => OpenAiResponseFormat::Simple {
                format_type: "json_object".to_string(),
            },
            ResponseFormat::JsonSchema { json_schema } => OpenAiResponseFormat::JsonSchema {
                format_type: "json_schema".to_string(),
                json_schema: OpenAiJsonSchema {
                    name: json_schema.name.clone(),
                    strict: json_schema.strict,
                    schema: json_schema.schema.clone(),
                },
            },
        });

        OpenAiCompletionRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format,
        }
    }

    fn parse_response(response: OpenAiCompletionResponse) -> Result<CompletionResponse, LlmError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("No choices returned".to_string()))?;

        let usage = response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            model: response.model,
            usage,
            finish_reason: FinishReason::from_provider(choice.finish_reason.as_deref()),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn available_models(&self) -> Vec<String> {
        vec![
            "gpt-4o".to_string(),
            "gpt-4o-mini".to_string(),
            "gpt-4-turbo".to_string(),
        ]
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = Self::convert_request(&request);
        debug!(
            model = %body.model,
            messages = body.messages.len(),
            "Sending chat completion request"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(is_timeout = e.is_timeout(), is_connect = e.is_connect(), "Chat completion request failed");
                LlmError::NetworkError(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Chat completion returned error status");
            return Err(LlmError::from_status(status.as_u16(), text));
        }

        let parsed: OpenAiCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let completion = Self::parse_response(parsed)?;
        debug!(
            total_tokens = completion.usage.total_tokens,
            finish_reason = ?completion.finish_reason,
            "Chat completion finished"
        );
        Ok(completion)
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        let response = self
            .client
            .get(format!("{}/models", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(LlmError::from_status(
                status.as_u16(),
                "health check failed".to_string(),
            ))
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiCompletionRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAiResponseFormat>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompletionResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiResponseFormat {
    Simple {
        #[serde(rename = "type")]
        format_type: String,
    },
    JsonSchema {
        #[serde(rename = "type")]
        format_type: String,
        json_schema: OpenAiJsonSchema,
    },
}

#[derive(Debug, Serialize)]
struct OpenAiJsonSchema {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    strict: Option<bool>,
    schema: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_openai_config_default() {
        let config = OpenAiConfig::default();
        assert_eq!(config.base_url, "https://api.openai.com/v1");
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert!(config.api_key.is_empty());
    }

    #[test]
    fn test_provider_requires_api_key() {
        let result = OpenAiProvider::new(OpenAiConfig::default());
        assert!(matches!(result, Err(LlmError::NotConfigured(_))));
    }

    #[test]
    fn test_request_serialization_with_json_format() {
        let request = CompletionRequest {
            messages: vec![Message::user("Hello")],
            model: "gpt-4o".to_string(),
            max_tokens: Some(100),
            temperature: None,
            response_format: Some(ResponseFormat::Json),
            metadata: HashMap::new(),
        };

        let json = serde_json::to_string(&OpenAiProvider::convert_request(&request)).unwrap();
        assert!(json.contains("\"model\":\"gpt-4o\""));
        assert!(json.contains("\"max_tokens\":100"));
        assert!(json.contains("\"type\":\"json_object\""));
        assert!(!json.contains("temperature"));
    }

    #[test]
    fn test_parse_response_without_choices() {
        let response = OpenAiCompletionResponse {
            model: "gpt-4o".to_string(),
            choices: vec![],
            usage: None,
        };
        assert!(matches!(
            OpenAiProvider::parse_response(response),
            Err(LlmError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_response_missing_usage_defaults_to_zero() {
        let response = OpenAiCompletionResponse {
            model: "gpt-4o".to_string(),
            choices: vec![OpenAiChoice {
                message: OpenAiMessage {
                    role: "assistant".to_string(),
                    content: Some("{}".to_string()),
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
        };
        let parsed = OpenAiProvider::parse_response(response).unwrap();
        assert_eq!(parsed.usage.total_tokens, 0);
        assert_eq!(parsed.finish_reason, FinishReason::Stop);
        assert_eq!(parsed.content, "{}");
    }
}
