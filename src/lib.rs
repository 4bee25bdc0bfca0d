//! draftflow - orchestration for long-form content pipelines
//!
//! Drives a fixed catalog of steps from a brief to a finished article:
//! topic generation, research fanned out over several queries, synthesis,
//! outlining, drafting and finalization, with the operator approving or
//! redirecting the work at three pause points.
//!
//! # Overview
//!
//! - [`steps`]: the step catalog and its pure transition functions
//! - [`agent`]: agent invocation with retries, output validation and telemetry
//! - [`scheduler`]: the per-process run loop and its step handlers
//! - [`gate`]: operator input requests, validation and waiting
//! - [`persistence`]: contexts, snapshot chains and restore
//! - [`resilience`]: keepalive, background continuation and reattachment
//! - [`orchestrator`]: the facade tying these together
//!
//! # Quick Start
//!
//! ```rust
//! use draftflow::agent::{AgentInvoker, RetryPolicy};
//! use draftflow::context::PipelineInputs;
//! use draftflow::orchestrator::Orchestrator;
//! use draftflow::persistence::{InMemoryDocumentStore, PersistenceGateway};
//! use draftflow::resilience::ResilienceSettings;
//! use draftflow::scheduler::{HandlerTable, SchedulerSettings};
//! use draftflow::testing::ScriptedAgent;
//! use draftflow::transport::MemoryChannel;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let gateway = PersistenceGateway::new(Arc::new(InMemoryDocumentStore::new()));
//! let invoker = AgentInvoker::new(Arc::new(ScriptedAgent::happy_path()), RetryPolicy::immediate(3));
//! let orchestrator = Orchestrator::new(
//!     gateway,
//!     invoker,
//!     HandlerTable::standard(),
//!     SchedulerSettings::default(),
//!     ResilienceSettings::default(),
//! )
//! .unwrap();
//!
//! let channel = Arc::new(MemoryChannel::new("docs"));
//! let process_id = orchestrator
//!     .start("alice", PipelineInputs::new("Why Rust for services"), Some(channel))
//!     .await
//!     .unwrap();
//! assert!(!process_id.is_empty());
//! # });
//! ```

pub mod agent;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod llm;
pub mod observability;
pub mod orchestrator;
pub mod persistence;
pub mod resilience;
pub mod scheduler;
pub mod session;
pub mod steps;
pub mod testing;
pub mod transport;

pub use config::DraftflowConfig;
pub use context::{ExecutionContext, PipelineInputs, ProcessStatus};
pub use error::{ErrorKind, OrchestratorError, OrchestratorResult};
pub use orchestrator::Orchestrator;
pub use steps::{Step, StepKind};
