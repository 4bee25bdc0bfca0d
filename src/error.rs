//! Error types for pipeline orchestration
//!
//! Module errors (steps, agent invocation, persistence, gate, config) all
//! converge on [`OrchestratorError`] at the scheduler boundary, where each
//! one is classified with an [`ErrorKind`] and recorded on the context in
//! sanitized form.

use crate::agent::invoker::InvokeError;
use crate::persistence::PersistenceError;
use crate::steps::{Step, StepError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for orchestration operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Agent {agent_id} failed: {message}")]
    FatalAgent { agent_id: String, message: String },

    #[error("Agent {agent_id} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        agent_id: String,
        attempts: u32,
        message: String,
    },

    #[error("{failed} of {total} fan-out tasks failed at step {step}")]
    FanOutFailed {
        step: Step,
        failed: usize,
        total: usize,
    },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Process {process_id} is already running")]
    AlreadyRunning { process_id: String },

    #[error("Process {process_id} is not awaiting input")]
    NotAwaitingInput { process_id: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Classification recorded with a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FatalAgent,
    TransientExhausted,
    FanOut,
    Persistence,
    UnknownStep,
    /// Inconsistent step catalog or a transition it does not define
    Catalog,
    InvalidInput,
    Configuration,
    Cancelled,
    Internal,
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::FatalAgent { .. } => ErrorKind::FatalAgent,
            OrchestratorError::RetriesExhausted { .. } => ErrorKind::TransientExhausted,
            OrchestratorError::FanOutFailed { .. } => ErrorKind::FanOut,
            OrchestratorError::Persistence(PersistenceError::Step(inner))
            | OrchestratorError::Step(inner) => step_error_kind(inner),
            OrchestratorError::Persistence(_) => ErrorKind::Persistence,
            OrchestratorError::InvalidInput { .. }
            | OrchestratorError::NotAwaitingInput { .. } => ErrorKind::InvalidInput,
            OrchestratorError::Config(_) => ErrorKind::Configuration,
            OrchestratorError::Cancelled => ErrorKind::Cancelled,
            OrchestratorError::AlreadyRunning { .. } | OrchestratorError::Internal { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Message safe to store on the context and publish to the operator
    pub fn sanitized_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

fn step_error_kind(err: &StepError) -> ErrorKind {
    match err {
        StepError::Unknown { .. } => ErrorKind::UnknownStep,
        StepError::NoSuccessor { .. } | StepError::InvalidCatalog { .. } => ErrorKind::Catalog,
    }
}

impl From<InvokeError> for OrchestratorError {
    fn from(err: InvokeError) -> Self {
        match err {
            InvokeError::Fatal { agent_id, message } => Self::FatalAgent { agent_id, message },
            InvokeError::Exhausted {
                agent_id,
                attempts,
                message,
            } => Self::RetriesExhausted {
                agent_id,
                attempts,
                message,
            },
            InvokeError::Cancelled { .. } => Self::Cancelled,
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact secrets and sensitive paths, then cap the length
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(suffix);
    }

    sanitized
}

/// Result type for orchestration operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_errors_map_to_kinds() {
        let fatal: OrchestratorError = InvokeError::Fatal {
            agent_id: "writer".into(),
            message: "401 unauthorized".into(),
        }
        .into();
        assert_eq!(fatal.kind(), ErrorKind::FatalAgent);

        let exhausted: OrchestratorError = InvokeError::Exhausted {
            agent_id: "writer".into(),
            attempts: 3,
            message: "timeout".into(),
        }
        .into();
        assert_eq!(exhausted.kind(), ErrorKind::TransientExhausted);
        assert!(exhausted.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_step_error_is_unknown_step_kind() {
        let err: OrchestratorError = StepError::Unknown {
            name: "bogus".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::UnknownStep);
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_step_errors_classified_by_variant() {
        let stored: OrchestratorError = PersistenceError::Step(StepError::Unknown {
            name: "legacy_review".into(),
        })
        .into();
        assert_eq!(stored.kind(), ErrorKind::UnknownStep);

        let no_successor: OrchestratorError = StepError::NoSuccessor {
            step: Step::SelectTopic,
            kind: crate::steps::StepKind::UserInputRequired,
        }
        .into();
        assert_eq!(no_successor.kind(), ErrorKind::Catalog);

        let catalog: OrchestratorError = StepError::InvalidCatalog {
            reason: "missing handler".into(),
        }
        .into();
        assert_eq!(catalog.kind(), ErrorKind::Catalog);

        let missing: OrchestratorError = PersistenceError::ProcessNotFound {
            process_id: "p-1".into(),
        }
        .into();
        assert_eq!(missing.kind(), ErrorKind::Persistence);
    }

    #[test]
    fn test_fan_out_failure_message() {
        let err = OrchestratorError::FanOutFailed {
            step: Step::Research,
            failed: 4,
            total: 4,
        };
        assert_eq!(err.kind(), ErrorKind::FanOut);
        assert_eq!(err.to_string(), "4 of 4 fan-out tasks failed at step research");
    }

    // ========== Tests for Sanitization ==========

    #[test]
    fn test_error_message_sanitization() {
        let error = OrchestratorError::internal(
            "Failed to authenticate: password=secret123 token=abc456",
        );
        let message = error.sanitized_message();

        assert!(!message.contains("secret123"));
        assert!(!message.contains("abc456"));
        assert!(message.contains("password=***"));
        assert!(message.contains("token=***"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_file_path_redaction() {
        let message = "Failed to read /home/user/.ssh/id_rsa and /etc/secrets/api.key";
        let sanitized = sanitize_error_message(message);

        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("/home/user/.ssh/id_rsa"));
    }

    #[test]
    fn test_sanitize_case_insensitive() {
        let sanitized = sanitize_error_message("API_KEY: sk-live-123 Secret=hunter2");
        assert!(!sanitized.contains("sk-live-123"));
        assert!(!sanitized.contains("hunter2"));
    }

    #[test]
    fn test_sanitize_empty_message() {
        assert_eq!(sanitize_error_message(""), "");
    }
}
