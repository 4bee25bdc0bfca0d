//! The external agent capability
//!
//! From the pipeline's point of view an agent is opaque: it takes a JSON
//! input and returns raw text, or fails. The only thing the core needs to
//! know about a failure is whether retrying could help.

use crate::context::ConversationTurn;
use crate::steps::Step;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Whether a failure may succeed on retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Fatal,
    Transient,
}

#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    #[error("Malformed request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Agent unavailable: {0}")]
    Unavailable(String),

    #[error("Agent failed: {0}")]
    Other(String),
}

impl CapabilityError {
    pub fn class(&self) -> FailureClass {
        match self {
            CapabilityError::InvalidRequest(_)
            | CapabilityError::Unauthorized(_)
            | CapabilityError::PolicyViolation(_) => FailureClass::Fatal,
            CapabilityError::RateLimited(_)
            | CapabilityError::Timeout(_)
            | CapabilityError::Unavailable(_)
            | CapabilityError::Other(_) => FailureClass::Transient,
        }
    }
}

/// What the agent sees besides its input
#[derive(Debug, Clone)]
pub struct AgentCallContext {
    pub process_id: String,
    pub step: Step,
    /// 1-based attempt number
    pub attempt: u32,
    /// Recent conversation turns, oldest first
    pub history: Vec<ConversationTurn>,
    /// Schema the answer must satisfy
    pub output_schema: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawAgentOutput {
    pub content: String,
    pub tokens: u64,
    pub cost_micros: u64,
}

impl RawAgentOutput {
    pub fn new<S: Into<String>>(content: S) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait AgentCapability: Send + Sync {
    async fn invoke(
        &self,
        agent_id: &str,
        input: &Value,
        context: &AgentCallContext,
    ) -> Result<RawAgentOutput, CapabilityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert_eq!(
            CapabilityError::InvalidRequest("x".into()).class(),
            FailureClass::Fatal
        );
        assert_eq!(
            CapabilityError::Unauthorized("x".into()).class(),
            FailureClass::Fatal
        );
        assert_eq!(
            CapabilityError::PolicyViolation("x".into()).class(),
            FailureClass::Fatal
        );
    }

    #[test]
    fn test_everything_else_is_transient() {
        for err in [
            CapabilityError::RateLimited("x".into()),
            CapabilityError::Timeout("x".into()),
            CapabilityError::Unavailable("x".into()),
            CapabilityError::Other("x".into()),
        ] {
            assert_eq!(err.class(), FailureClass::Transient, "{err}");
        }
    }
}
