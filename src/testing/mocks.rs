//! Mock implementations for testing
//!
//! Scripted agents, a canned LLM provider, a store that fails on demand and
//! telemetry sinks, so the orchestrator can be exercised without a model,
//! a broker or a disk.

use crate::agent::capability::{AgentCallContext, AgentCapability, CapabilityError, RawAgentOutput};
use crate::agent::telemetry::{InvocationTelemetry, TelemetryError, TelemetrySink};
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, TokenUsage,
};
use crate::persistence::store::{DocumentFilter, DocumentStore, InMemoryDocumentStore, StoreError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// One scripted agent answer
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Serialized as the raw answer
    Json(Value),
    /// Returned verbatim, e.g. prose or a fenced block
    Raw(String),
    Fatal(String),
    Transient(String),
}

impl Scripted {
    fn into_result(self) -> Result<RawAgentOutput, CapabilityError> {
        let content = match self {
            Scripted::Json(value) => value.to_string(),
            Scripted::Raw(text) => text,
            Scripted::Fatal(message) => return Err(CapabilityError::PolicyViolation(message)),
            Scripted::Transient(message) => return Err(CapabilityError::Unavailable(message)),
        };
        Ok(RawAgentOutput {
            content,
            tokens: 15,
            cost_micros: 30,
        })
    }
}

/// Agent capability answering from a script
///
/// For each call the first matching source wins: the agent's queue, then
/// an input match, then the agent's default. Agents without any script
/// fail fatally.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    queues: Mutex<HashMap<String, VecDeque<Scripted>>>,
    by_input: Vec<(String, String, Scripted)>,
    defaults: HashMap<String, Scripted>,
    holds: HashMap<String, Arc<Semaphore>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Well-formed answers for every pipeline agent
    pub fn happy_path() -> Self {
        Self::new()
            .with_response(
                "topic_generator",
                json!({"status": "candidates", "candidates": [
                    {"title": "Async Rust in practice", "angle": "field notes"},
                    {"title": "Ownership for managers", "angle": "explainer"},
                    {"title": "Rust at the edge", "angle": "case study"}
                ]}),
            )
            .with_response(
                "research_planner",
                json!({"status": "queries", "queries": ["runtime choices", "cancellation", "backpressure"]}),
            )
            .with_response(
                "researcher",
                json!({"status": "findings", "summary": "Notes on the query", "sources": ["https://example.com"]}),
            )
            .with_response(
                "synthesizer",
                json!({"status": "synthesis", "summary": "Combined research summary"}),
            )
            .with_response(
                "outliner",
                json!({"status": "outline", "title": "Async Rust in practice", "sections": [
                    {"heading": "Why async", "points": ["throughput"]},
                    {"heading": "Pitfalls", "points": ["blocking", "cancellation"]}
                ]}),
            )
            .with_response(
                "writer",
                json!({"status": "draft", "content": "Async Rust lets one thread juggle many tasks."}),
            )
            .with_response(
                "finalizer",
                json!({"status": "final", "title": "Async Rust in practice", "content": "Polished article."}),
            )
    }

    /// Default answer for every call to `agent_id`
    pub fn with_response<S: Into<String>>(self, agent_id: S, value: Value) -> Self {
        self.with_default(agent_id, Scripted::Json(value))
    }

    pub fn with_default<S: Into<String>>(mut self, agent_id: S, scripted: Scripted) -> Self {
        self.defaults.insert(agent_id.into(), scripted);
        self
    }

    pub fn with_transient<S: Into<String>, M: Into<String>>(self, agent_id: S, message: M) -> Self {
        self.with_default(agent_id, Scripted::Transient(message.into()))
    }

    pub fn with_fatal<S: Into<String>, M: Into<String>>(self, agent_id: S, message: M) -> Self {
        self.with_default(agent_id, Scripted::Fatal(message.into()))
    }

    /// Answers consumed in order before any other source
    pub fn with_sequence<S: Into<String>>(self, agent_id: S, answers: Vec<Scripted>) -> Self {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(agent_id.into()).or_default().extend(answers);
        }
        self
    }

    /// Answer calls whose serialized input contains `needle`
    pub fn with_response_for_input<S: Into<String>, N: Into<String>>(
        self,
        agent_id: S,
        needle: N,
        value: Value,
    ) -> Self {
        self.with_input_match(agent_id, needle, Scripted::Json(value))
    }

    pub fn with_fatal_for_input<S: Into<String>, N: Into<String>, M: Into<String>>(
        self,
        agent_id: S,
        needle: N,
        message: M,
    ) -> Self {
        self.with_input_match(agent_id, needle, Scripted::Fatal(message.into()))
    }

    pub fn with_input_match<S: Into<String>, N: Into<String>>(
        mut self,
        agent_id: S,
        needle: N,
        scripted: Scripted,
    ) -> Self {
        self.by_input.push((agent_id.into(), needle.into(), scripted));
        self
    }

    /// Calls to `agent_id` block until [`Self::release`] hands out permits
    pub fn with_hold<S: Into<String>>(mut self, agent_id: S) -> Self {
        self.holds
            .insert(agent_id.into(), Arc::new(Semaphore::new(0)));
        self
    }

    pub fn release(&self, agent_id: &str, calls: usize) {
        if let Some(hold) = self.holds.get(agent_id) {
            hold.add_permits(calls);
        }
    }

    pub fn calls(&self, agent_id: &str) -> usize {
        self.inputs(agent_id).len()
    }

    pub fn inputs(&self, agent_id: &str) -> Vec<Value> {
        self.calls
            .lock()
            .map(|calls| {
                calls
                    .iter()
                    .filter(|(id, _)| id == agent_id)
                    .map(|(_, input)| input.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn next_answer(&self, agent_id: &str, input: &Value) -> Scripted {
        if let Ok(mut queues) = self.queues.lock() {
            if let Some(answer) = queues.get_mut(agent_id).and_then(VecDeque::pop_front) {
                return answer;
            }
        }
        let serialized = input.to_string();
        if let Some((_, _, answer)) = self
            .by_input
            .iter()
            .find(|(id, needle, _)| id == agent_id && serialized.contains(needle.as_str()))
        {
            return answer.clone();
        }
        self.defaults
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| Scripted::Fatal(format!("no script for agent {agent_id}")))
    }
}

#[async_trait]
impl AgentCapability for ScriptedAgent {
    async fn invoke(
        &self,
        agent_id: &str,
        input: &Value,
        _context: &AgentCallContext,
    ) -> Result<RawAgentOutput, CapabilityError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((agent_id.to_string(), input.clone()));
        }
        if let Some(hold) = self.holds.get(agent_id) {
            match hold.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(CapabilityError::Unavailable("hold closed".to_string())),
            }
        }
        self.next_answer(agent_id, input).into_result()
    }
}

/// Mock LLM provider cycling through canned responses
#[derive(Debug)]
pub struct MockLlmProvider {
    pub responses: Vec<String>,
    pub current_response: Arc<tokio::sync::Mutex<usize>>,
    pub should_fail: bool,
}

impl MockLlmProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            current_response: Arc::new(tokio::sync::Mutex::new(0)),
            should_fail: false,
        }
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Self::new(vec![])
        }
    }

    pub fn single_response(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn available_models(&self) -> Vec<String> {
        vec!["mock-model".to_string()]
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if self.should_fail {
            return Err(LlmError::RequestFailed("Mock LLM failure".to_string()));
        }

        let mut current = self.current_response.lock().await;
        let index = *current % self.responses.len().max(1);
        *current += 1;

        let content = self
            .responses
            .get(index)
            .cloned()
            .unwrap_or_else(|| "Mock response".to_string());

        Ok(CompletionResponse {
            content,
            model: "mock-model".to_string(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            finish_reason: FinishReason::Stop,
        })
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        if self.should_fail {
            Err(LlmError::RequestFailed("Mock health check failure".to_string()))
        } else {
            Ok(())
        }
    }
}

/// In-memory store whose writes fail on demand
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryDocumentStore,
    failures_remaining: AtomicUsize,
    failing_tables: Mutex<HashSet<String>>,
    upserts: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` upserts to any table
    pub fn fail_next_upserts(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Fail every upsert to `table`
    pub fn fail_table(&self, table: &str) {
        if let Ok(mut tables) = self.failing_tables.lock() {
            tables.insert(table.to_string());
        }
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryDocumentStore {
        &self.inner
    }

    fn should_fail(&self, table: &str) -> bool {
        let table_down = self
            .failing_tables
            .lock()
            .map(|t| t.contains(table))
            .unwrap_or(false);
        if table_down {
            return true;
        }
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn upsert(&self, table: &str, key: &str, document: Value) -> Result<(), StoreError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail(table) {
            return Err(StoreError::Unavailable {
                message: format!("injected failure writing {table}/{key}"),
            });
        }
        self.inner.upsert(table, key, document).await
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(table, key).await
    }

    async fn query(&self, table: &str, filter: &DocumentFilter) -> Result<Vec<Value>, StoreError> {
        self.inner.query(table, filter).await
    }
}

/// Telemetry sink that keeps everything it is given
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    records: Mutex<Vec<InvocationTelemetry>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<InvocationTelemetry> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TelemetrySink for RecordingTelemetry {
    async fn record(&self, telemetry: &InvocationTelemetry) -> Result<(), TelemetryError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(telemetry.clone());
        }
        Ok(())
    }
}

/// Telemetry sink that always fails
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingTelemetry;

#[async_trait]
impl TelemetrySink for FailingTelemetry {
    async fn record(&self, _telemetry: &InvocationTelemetry) -> Result<(), TelemetryError> {
        Err(TelemetryError::new("telemetry backend down"))
    }
}
