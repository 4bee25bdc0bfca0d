//! Agent invocation
//!
//! The pipeline reaches agents only through [`AgentCapability`]. The
//! [`AgentInvoker`] wraps a capability with retries, output validation and
//! telemetry; [`LlmAgent`] is the capability backed by an LLM provider.

pub mod capability;
pub mod invoker;
pub mod llm_agent;
pub mod output;
pub mod retry;
pub mod telemetry;

pub use capability::{
    AgentCallContext, AgentCapability, CapabilityError, FailureClass, RawAgentOutput,
};
pub use invoker::{AgentCall, AgentInvoker, Invocation, InvokeError};
pub use llm_agent::{default_profile, AgentProfile, LlmAgent};
pub use output::{AgentOutput, ExpectedShape};
pub use retry::RetryPolicy;
pub use telemetry::{
    InvocationOutcome, InvocationTelemetry, NoopTelemetry, RetryAttempt, TelemetryError, TelemetrySink,
};
