//! Agent invocation with retries and output validation
//!
//! [`AgentInvoker::invoke`] calls the agent capability, validates the raw
//! answer against the step's [`ExpectedShape`], and retries transient
//! failures with exponential backoff. Shape mismatches get one best-effort
//! reparse before counting as a transient failure. Fatal failures are never
//! retried. Backoff sleeps and in-flight calls stop as soon as the run is
//! cancelled.

use super::capability::{AgentCallContext, AgentCapability, CapabilityError, FailureClass};
use super::output::{self, AgentOutput, ExpectedShape};
use super::retry::RetryPolicy;
use super::telemetry::{
    InvocationOutcome, InvocationTelemetry, NoopTelemetry, RetryAttempt, TelemetrySink,
};
use crate::context::ConversationTurn;
use crate::observability::metrics::metrics;
use crate::steps::Step;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    #[error("Agent {agent_id} failed: {message}")]
    Fatal { agent_id: String, message: String },

    #[error("Agent {agent_id} failed after {attempts} attempts: {message}")]
    Exhausted {
        agent_id: String,
        attempts: u32,
        message: String,
    },

    #[error("Agent {agent_id} invocation cancelled")]
    Cancelled { agent_id: String },
}

/// One request to an agent
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub process_id: String,
    pub step: Step,
    pub agent_id: String,
    pub input: Value,
    pub history: Vec<ConversationTurn>,
    pub expected: ExpectedShape,
}

/// A validated answer plus what it took to get it
#[derive(Debug, Clone)]
pub struct Invocation {
    pub output: AgentOutput,
    /// Raw text of the accepted answer
    pub raw: String,
    pub attempts: Vec<RetryAttempt>,
    pub tokens: u64,
    pub cost_micros: u64,
}

impl Invocation {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

enum AttemptError {
    Capability(CapabilityError),
    Shape(String),
}

impl AttemptError {
    fn class(&self) -> FailureClass {
        match self {
            AttemptError::Capability(e) => e.class(),
            AttemptError::Shape(_) => FailureClass::Transient,
        }
    }

    fn message(&self) -> String {
        match self {
            AttemptError::Capability(e) => e.to_string(),
            AttemptError::Shape(m) => m.clone(),
        }
    }
}

pub struct AgentInvoker {
    capability: Arc<dyn AgentCapability>,
    policy: RetryPolicy,
    telemetry: Arc<dyn TelemetrySink>,
}

impl AgentInvoker {
    pub fn new(capability: Arc<dyn AgentCapability>, policy: RetryPolicy) -> Self {
        Self {
            capability,
            policy,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn invoke(
        &self,
        call: AgentCall,
        cancel: &CancellationToken,
    ) -> Result<Invocation, InvokeError> {
        let span = crate::agent_span!(
            process_id = %call.process_id,
            step = %call.step,
            agent_id = %call.agent_id
        );
        self.invoke_inner(call, cancel).instrument(span).await
    }

    async fn invoke_inner(
        &self,
        call: AgentCall,
        cancel: &CancellationToken,
    ) -> Result<Invocation, InvokeError> {
        let started = Instant::now();
        let schema = call.expected.schema();
        let mut attempts = Vec::new();
        let mut tokens = 0u64;
        let mut cost_micros = 0u64;
        let mut attempt = 0u32;

        let result = loop {
            attempt += 1;
            if cancel.is_cancelled() {
                break Err(InvokeError::Cancelled {
                    agent_id: call.agent_id.clone(),
                });
            }

            let context = AgentCallContext {
                process_id: call.process_id.clone(),
                step: call.step,
                attempt,
                history: call.history.clone(),
                output_schema: schema.clone(),
            };

            let attempt_started = Instant::now();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                r = self.capability.invoke(&call.agent_id, &call.input, &context) => Some(r),
            };
            let Some(outcome) = outcome else {
                break Err(InvokeError::Cancelled {
                    agent_id: call.agent_id.clone(),
                });
            };
            let latency_ms = attempt_started.elapsed().as_millis() as u64;

            let checked = match outcome {
                Ok(raw) => {
                    tokens += raw.tokens;
                    cost_micros += raw.cost_micros;
                    interpret(&raw.content, call.expected)
                        .map(|output| (output, raw.content))
                        .map_err(AttemptError::Shape)
                }
                Err(e) => Err(AttemptError::Capability(e)),
            };

            match checked {
                Ok((output, raw)) => {
                    attempts.push(RetryAttempt {
                        attempt,
                        latency_ms,
                        failure: None,
                        message: None,
                    });
                    break Ok((output, raw));
                }
                Err(err) => {
                    let class = err.class();
                    let message = err.message();
                    attempts.push(RetryAttempt {
                        attempt,
                        latency_ms,
                        failure: Some(class),
                        message: Some(message.clone()),
                    });
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        class = ?class,
                        error = %message,
                        "Agent attempt failed"
                    );

                    if class == FailureClass::Fatal {
                        break Err(InvokeError::Fatal {
                            agent_id: call.agent_id.clone(),
                            message,
                        });
                    }
                    if !self.policy.should_retry(attempt) {
                        break Err(InvokeError::Exhausted {
                            agent_id: call.agent_id.clone(),
                            attempts: attempt,
                            message,
                        });
                    }

                    metrics().agent_retry();
                    let delay = self.policy.calculate_delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                    if !sleep_unless_cancelled(delay, cancel).await {
                        break Err(InvokeError::Cancelled {
                            agent_id: call.agent_id.clone(),
                        });
                    }
                }
            }
        };

        let total_latency = started.elapsed();
        let outcome = match &result {
            Ok(_) => InvocationOutcome::Succeeded,
            Err(InvokeError::Cancelled { .. }) => InvocationOutcome::Cancelled,
            Err(_) => InvocationOutcome::Failed,
        };
        metrics().agent_invocation(&call.agent_id, total_latency, outcome == InvocationOutcome::Succeeded);
        self.report(&call, outcome, &attempts, total_latency, tokens, cost_micros)
            .await;

        let (output, raw) = result?;
        info!(
            attempts = attempts.len(),
            latency_ms = total_latency.as_millis() as u64,
            tokens,
            "Agent invocation succeeded"
        );
        Ok(Invocation {
            output,
            raw,
            attempts,
            tokens,
            cost_micros,
        })
    }

    async fn report(
        &self,
        call: &AgentCall,
        outcome: InvocationOutcome,
        attempts: &[RetryAttempt],
        latency: Duration,
        tokens: u64,
        cost_micros: u64,
    ) {
        let telemetry = InvocationTelemetry {
            invocation_id: Uuid::new_v4().to_string(),
            process_id: call.process_id.clone(),
            step: call.step,
            agent_id: call.agent_id.clone(),
            outcome,
            attempts: attempts.to_vec(),
            total_latency_ms: latency.as_millis() as u64,
            tokens,
            cost_micros,
            finished_at: Utc::now(),
        };
        if let Err(e) = self.telemetry.record(&telemetry).await {
            warn!(error = %e, "Dropping invocation telemetry");
        }
    }
}

/// Validate raw agent text against `shape`, reparsing once on mismatch
fn interpret(raw: &str, shape: ExpectedShape) -> Result<AgentOutput, String> {
    let first = match output::parse_strict(raw) {
        Some(value) => match shape.validate(&value) {
            Ok(()) => return decode_checked(value, shape),
            Err(e) => e,
        },
        None => "output is not valid JSON".to_string(),
    };

    debug!(shape = shape.status(), error = %first, "Output mismatch, attempting reparse");
    let value = output::reparse(raw, shape)
        .ok_or_else(|| format!("Output did not match {} shape: {first}", shape.status()))?;
    shape
        .validate(&value)
        .map_err(|e| format!("Output did not match {} shape: {e}", shape.status()))?;
    decode_checked(value, shape)
}

fn decode_checked(value: Value, shape: ExpectedShape) -> Result<AgentOutput, String> {
    let output = AgentOutput::decode(value);
    if output.matches(shape) {
        Ok(output)
    } else {
        Err(format!(
            "Expected {} output, got {:?}",
            shape.status(),
            output.status()
        ))
    }
}

async fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interpret_accepts_valid_json() {
        let raw = json!({"status": "draft", "content": "Hello"}).to_string();
        let output = interpret(&raw, ExpectedShape::Draft).unwrap();
        assert!(matches!(output, AgentOutput::Draft(_)));
    }

    #[test]
    fn test_interpret_reparses_fenced_output() {
        let raw = "```json\n{\"summary\": \"merged\"}\n```";
        let output = interpret(raw, ExpectedShape::Synthesis).unwrap();
        match output {
            AgentOutput::Synthesis(p) => assert_eq!(p.summary, "merged"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_interpret_rejects_wrong_status() {
        let raw = json!({"status": "draft", "content": "x"}).to_string();
        let err = interpret(&raw, ExpectedShape::Outline).unwrap_err();
        assert!(err.contains("outline"));
    }

    #[test]
    fn test_interpret_rejects_prose() {
        assert!(interpret("I could not do it", ExpectedShape::Draft).is_err());
    }
}
