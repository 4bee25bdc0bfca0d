//! Per-invocation telemetry
//!
//! Telemetry is best-effort. The invoker reports every invocation to a
//! [`TelemetrySink`] and logs, but otherwise ignores, sink failures.

use super::capability::FailureClass;
use crate::steps::Step;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One call attempt made by the invoker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub latency_ms: u64,
    /// `None` when the attempt succeeded
    pub failure: Option<FailureClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationTelemetry {
    pub invocation_id: String,
    pub process_id: String,
    pub step: Step,
    pub agent_id: String,
    pub outcome: InvocationOutcome,
    pub attempts: Vec<RetryAttempt>,
    pub total_latency_ms: u64,
    pub tokens: u64,
    pub cost_micros: u64,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error)]
#[error("Telemetry write failed: {message}")]
pub struct TelemetryError {
    pub message: String,
}

impl TelemetryError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record(&self, telemetry: &InvocationTelemetry) -> Result<(), TelemetryError>;
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

#[async_trait]
impl TelemetrySink for NoopTelemetry {
    async fn record(&self, _telemetry: &InvocationTelemetry) -> Result<(), TelemetryError> {
        Ok(())
    }
}
