//! Step handlers
//!
//! Each autonomous and transition step has one [`StepHandler`] in the
//! [`HandlerTable`]. A handler reads what it needs from the context, calls
//! its agent through the [`StepRuntime`] if it has one, and writes the
//! result back. Advancing, persisting and snapshotting are left to the
//! scheduler.

use super::SchedulerSettings;
use crate::agent::invoker::{AgentCall, AgentInvoker, Invocation, InvokeError};
use crate::agent::output::{AgentOutput, ExpectedShape};
use crate::concurrency::ConcurrentTaskRunner;
use crate::context::{DraftOrigin, ExecutionContext, ResearchFinding, TurnRole};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::observability::metrics::metrics;
use crate::session::SessionHandle;
use crate::steps::{Step, StepError, StepKind};
use crate::transport::ProcessEvent;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What a handler may use besides the context
pub struct StepRuntime<'a> {
    pub invoker: &'a AgentInvoker,
    pub runner: ConcurrentTaskRunner,
    pub session: &'a SessionHandle,
    pub settings: &'a SchedulerSettings,
}

impl StepRuntime<'_> {
    pub fn cancel_token(&self) -> &CancellationToken {
        self.session.cancel_token()
    }

    pub async fn progress<S: Into<String>>(&self, step: Step, message: S) {
        self.session
            .send(&ProcessEvent::Progress {
                step,
                message: message.into(),
            })
            .await;
    }

    /// Build the agent call for the context's current step
    pub fn call_for(&self, ctx: &ExecutionContext, input: Value) -> OrchestratorResult<AgentCall> {
        let step = ctx.current_step;
        let agent_id = step
            .agent_id()
            .ok_or_else(|| OrchestratorError::internal(format!("step {step} has no agent")))?;
        let expected = ExpectedShape::for_step(step)
            .ok_or_else(|| OrchestratorError::internal(format!("step {step} has no output shape")))?;
        let window = self.settings.history_window;
        let history = ctx.conversation[ctx.conversation.len().saturating_sub(window)..].to_vec();

        Ok(AgentCall {
            process_id: ctx.process_id.clone(),
            step,
            agent_id: agent_id.to_string(),
            input,
            history,
            expected,
        })
    }

    /// Invoke the current step's agent and fold usage and the answer into
    /// the context
    pub async fn invoke(
        &self,
        ctx: &mut ExecutionContext,
        input: Value,
    ) -> OrchestratorResult<AgentOutput> {
        let call = self.call_for(ctx, input)?;
        let agent_id = call.agent_id.clone();
        let invocation = self.invoker.invoke(call, self.cancel_token()).await?;
        record_invocation(ctx, &agent_id, &invocation);
        Ok(invocation.output)
    }
}

fn record_invocation(ctx: &mut ExecutionContext, agent_id: &str, invocation: &Invocation) {
    ctx.add_usage(
        invocation.attempt_count(),
        invocation.tokens,
        invocation.cost_micros,
    );
    ctx.record_turn(TurnRole::Agent, Some(agent_id), invocation.raw.clone());
}

fn unexpected(step: Step, output: &AgentOutput) -> OrchestratorError {
    OrchestratorError::internal(format!(
        "step {step} received {} output",
        output.status().unwrap_or("unrecognized")
    ))
}

fn empty_output(step: Step, what: &str) -> OrchestratorError {
    OrchestratorError::FatalAgent {
        agent_id: step.agent_id().unwrap_or("unknown").to_string(),
        message: format!("returned no {what}"),
    }
}

fn topic_title(ctx: &ExecutionContext) -> OrchestratorResult<String> {
    ctx.artifacts
        .selected_topic
        .as_ref()
        .map(|t| t.title.clone())
        .ok_or_else(|| OrchestratorError::internal("no topic selected"))
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        runtime: &StepRuntime<'_>,
    ) -> OrchestratorResult<()>;
}

pub struct StartHandler;

#[async_trait]
impl StepHandler for StartHandler {
    async fn execute(&self, ctx: &mut ExecutionContext, _runtime: &StepRuntime<'_>) -> OrchestratorResult<()> {
        if ctx.inputs.brief.trim().is_empty() {
            return Err(OrchestratorError::invalid_input("brief must not be empty"));
        }
        let brief = ctx.inputs.brief.clone();
        ctx.record_turn(TurnRole::Pipeline, None, format!("Brief: {brief}"));
        Ok(())
    }
}

pub struct GenerateTopicsHandler;

#[async_trait]
impl StepHandler for GenerateTopicsHandler {
    async fn execute(&self, ctx: &mut ExecutionContext, rt: &StepRuntime<'_>) -> OrchestratorResult<()> {
        let input = json!({
            "brief": ctx.inputs.brief,
            "audience": ctx.inputs.audience,
            "tone": ctx.inputs.tone,
            "rejected": ctx.artifacts.rejected_topics,
        });
        match rt.invoke(ctx, input).await? {
            AgentOutput::Candidates(payload) if payload.candidates.is_empty() => {
                Err(empty_output(Step::GenerateTopics, "topic candidates"))
            }
            AgentOutput::Candidates(payload) => {
                ctx.artifacts.topic_candidates = payload.candidates;
                ctx.artifacts.selected_topic = None;
                Ok(())
            }
            other => Err(unexpected(Step::GenerateTopics, &other)),
        }
    }
}

pub struct PlanResearchHandler;

#[async_trait]
impl StepHandler for PlanResearchHandler {
    async fn execute(&self, ctx: &mut ExecutionContext, rt: &StepRuntime<'_>) -> OrchestratorResult<()> {
        let input = json!({
            "topic": ctx.artifacts.selected_topic,
            "brief": ctx.inputs.brief,
            "max_queries": rt.settings.max_research_queries,
        });
        match rt.invoke(ctx, input).await? {
            AgentOutput::Queries(payload) => {
                let mut queries: Vec<String> = payload
                    .queries
                    .into_iter()
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .collect();
                if queries.is_empty() {
                    return Err(empty_output(Step::PlanResearch, "research queries"));
                }
                queries.truncate(rt.settings.max_research_queries);
                ctx.artifacts.research_queries = queries;
                Ok(())
            }
            other => Err(unexpected(Step::PlanResearch, &other)),
        }
    }
}

/// Fans the planned queries out to the researcher agent
pub struct ResearchHandler;

#[async_trait]
impl StepHandler for ResearchHandler {
    async fn execute(&self, ctx: &mut ExecutionContext, rt: &StepRuntime<'_>) -> OrchestratorResult<()> {
        let queries = ctx.artifacts.research_queries.clone();
        let total = queries.len();
        if total == 0 {
            return Err(OrchestratorError::FanOutFailed {
                step: Step::Research,
                failed: 0,
                total: 0,
            });
        }

        let topic = topic_title(ctx)?;
        let template = rt.call_for(ctx, Value::Null)?;
        rt.progress(
            Step::Research,
            format!("Researching {total} queries, {} at a time", rt.runner.limit()),
        )
        .await;

        let cancel = rt.cancel_token();
        let invoker = rt.invoker;
        let report = rt
            .runner
            .run_bounded(
                queries.clone(),
                |_, query| {
                    let mut call = template.clone();
                    call.input = json!({ "topic": topic, "query": query });
                    async move { invoker.invoke(call, cancel).await }
                },
                cancel,
            )
            .await
            .map_err(|_| OrchestratorError::Cancelled)?;

        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let failed = report.failure_count();
        metrics().fanout(total, failed);
        for (index, error) in report.failures() {
            warn!(query_index = index, error = %error, "Research query failed");
        }
        if failed == total {
            let fatal = report
                .failures()
                .map(|(_, e)| e)
                .find(|e| matches!(e, InvokeError::Fatal { .. }));
            if let Some(InvokeError::Fatal { agent_id, message }) = fatal {
                return Err(OrchestratorError::FatalAgent {
                    agent_id: agent_id.clone(),
                    message: message.clone(),
                });
            }
        }
        if !report.succeeded(rt.settings.research_criterion) {
            return Err(OrchestratorError::FanOutFailed {
                step: Step::Research,
                failed,
                total,
            });
        }

        let mut findings = Vec::with_capacity(total - failed);
        for (index, invocation) in report.into_successes() {
            record_invocation(ctx, &template.agent_id, &invocation);
            match invocation.output {
                AgentOutput::Findings(payload) => findings.push(ResearchFinding {
                    query_index: index,
                    query: queries[index].clone(),
                    summary: payload.summary,
                    sources: payload.sources,
                }),
                other => return Err(unexpected(Step::Research, &other)),
            }
        }

        info!(succeeded = findings.len(), failed, total, "Research fan-out finished");
        ctx.artifacts.research_results = findings;
        ctx.artifacts.research_failures = failed;
        Ok(())
    }
}

pub struct SynthesisHandler;

#[async_trait]
impl StepHandler for SynthesisHandler {
    async fn execute(&self, ctx: &mut ExecutionContext, rt: &StepRuntime<'_>) -> OrchestratorResult<()> {
        let input = json!({
            "topic": topic_title(ctx)?,
            "findings": ctx.artifacts.research_results,
            "failed_queries": ctx.artifacts.research_failures,
        });
        match rt.invoke(ctx, input).await? {
            AgentOutput::Synthesis(payload) => {
                ctx.artifacts.synthesis = Some(payload.summary);
                Ok(())
            }
            other => Err(unexpected(Step::Synthesis, &other)),
        }
    }
}

pub struct GenerateOutlineHandler;

#[async_trait]
impl StepHandler for GenerateOutlineHandler {
    async fn execute(&self, ctx: &mut ExecutionContext, rt: &StepRuntime<'_>) -> OrchestratorResult<()> {
        let input = json!({
            "topic": ctx.artifacts.selected_topic,
            "synthesis": ctx.artifacts.synthesis,
            "audience": ctx.inputs.audience,
            "target_words": ctx.inputs.target_words,
        });
        match rt.invoke(ctx, input).await? {
            AgentOutput::Outline(outline) if outline.sections.is_empty() => {
                Err(empty_output(Step::GenerateOutline, "outline sections"))
            }
            AgentOutput::Outline(outline) => {
                ctx.artifacts.outline = Some(outline);
                Ok(())
            }
            other => Err(unexpected(Step::GenerateOutline, &other)),
        }
    }
}

pub struct WriteDraftHandler;

#[async_trait]
impl StepHandler for WriteDraftHandler {
    async fn execute(&self, ctx: &mut ExecutionContext, rt: &StepRuntime<'_>) -> OrchestratorResult<()> {
        let outline = ctx
            .artifacts
            .outline
            .clone()
            .ok_or_else(|| OrchestratorError::internal("no outline to write from"))?;
        let input = json!({
            "outline": outline,
            "synthesis": ctx.artifacts.synthesis,
            "tone": ctx.inputs.tone,
            "target_words": ctx.inputs.target_words,
            "previous_draft": ctx.artifacts.latest_draft().map(|d| &d.content),
        });
        match rt.invoke(ctx, input).await? {
            AgentOutput::Draft(payload) if payload.content.trim().is_empty() => {
                Err(empty_output(Step::WriteDraft, "draft content"))
            }
            AgentOutput::Draft(payload) => {
                let revision = ctx
                    .artifacts
                    .push_draft(DraftOrigin::Generated, payload.content);
                info!(revision, "Draft written");
                Ok(())
            }
            other => Err(unexpected(Step::WriteDraft, &other)),
        }
    }
}

/// Merges title and approved draft into the manuscript, locally
pub struct AssembleHandler;

#[async_trait]
impl StepHandler for AssembleHandler {
    async fn execute(&self, ctx: &mut ExecutionContext, _runtime: &StepRuntime<'_>) -> OrchestratorResult<()> {
        let draft = ctx
            .artifacts
            .latest_draft()
            .ok_or_else(|| OrchestratorError::internal("no approved draft to assemble"))?;
        let title = match &ctx.artifacts.outline {
            Some(outline) => outline.title.clone(),
            None => topic_title(ctx)?,
        };
        let manuscript = format!("# {title}\n\n{}", draft.content.trim());
        ctx.artifacts.manuscript = Some(manuscript);
        Ok(())
    }
}

pub struct FinalizeHandler;

#[async_trait]
impl StepHandler for FinalizeHandler {
    async fn execute(&self, ctx: &mut ExecutionContext, rt: &StepRuntime<'_>) -> OrchestratorResult<()> {
        let manuscript = ctx
            .artifacts
            .manuscript
            .clone()
            .ok_or_else(|| OrchestratorError::internal("no manuscript to finalize"))?;
        let input = json!({
            "manuscript": manuscript,
            "audience": ctx.inputs.audience,
            "tone": ctx.inputs.tone,
        });
        match rt.invoke(ctx, input).await? {
            AgentOutput::Final(article) => {
                ctx.artifacts.final_article = Some(article);
                Ok(())
            }
            other => Err(unexpected(Step::Finalize, &other)),
        }
    }
}

/// Handlers keyed by step
pub struct HandlerTable {
    handlers: HashMap<Step, Box<dyn StepHandler>>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl HandlerTable {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// One handler for every autonomous and transition step
    pub fn standard() -> Self {
        Self::empty()
            .with_handler(Step::Start, StartHandler)
            .with_handler(Step::GenerateTopics, GenerateTopicsHandler)
            .with_handler(Step::PlanResearch, PlanResearchHandler)
            .with_handler(Step::Research, ResearchHandler)
            .with_handler(Step::Synthesis, SynthesisHandler)
            .with_handler(Step::GenerateOutline, GenerateOutlineHandler)
            .with_handler(Step::WriteDraft, WriteDraftHandler)
            .with_handler(Step::Assemble, AssembleHandler)
            .with_handler(Step::Finalize, FinalizeHandler)
    }

    pub fn with_handler<H: StepHandler + 'static>(mut self, step: Step, handler: H) -> Self {
        self.handlers.insert(step, Box::new(handler));
        self
    }

    pub fn get(&self, step: Step) -> Option<&dyn StepHandler> {
        self.handlers.get(&step).map(|h| h.as_ref())
    }

    /// Every executable step has a handler and nothing else does
    pub fn validate(&self) -> Result<(), StepError> {
        for step in Step::ALL {
            let executable = matches!(step.kind(), StepKind::Autonomous | StepKind::Transition);
            match (executable, self.handlers.contains_key(&step)) {
                (true, false) => {
                    return Err(StepError::InvalidCatalog {
                        reason: format!("no handler for {} step {step}", step.kind()),
                    })
                }
                (false, true) => {
                    return Err(StepError::InvalidCatalog {
                        reason: format!("handler registered for {} step {step}", step.kind()),
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::retry::RetryPolicy;
    use crate::context::{Outline, OutlineSection, PipelineInputs, TopicCandidate};
    use crate::testing::mocks::ScriptedAgent;
    use std::sync::Arc;

    fn settings() -> SchedulerSettings {
        SchedulerSettings::default()
    }

    fn context_at(step: Step) -> ExecutionContext {
        let mut ctx = ExecutionContext::new("owner", PipelineInputs::new("Rust in production"));
        ctx.artifacts.selected_topic = Some(TopicCandidate {
            title: "Rust at scale".into(),
            angle: String::new(),
        });
        ctx.advance_to(step);
        ctx
    }

    #[test]
    fn test_standard_table_is_complete() {
        HandlerTable::standard().validate().unwrap();
    }

    #[test]
    fn test_missing_handler_detected() {
        let table = HandlerTable::empty().with_handler(Step::Start, StartHandler);
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_handler_on_pause_point_rejected() {
        let table = HandlerTable::standard().with_handler(Step::SelectTopic, StartHandler);
        assert!(table.validate().is_err());
    }

    #[tokio::test]
    async fn test_plan_research_truncates_queries() {
        let agent = Arc::new(ScriptedAgent::new().with_response(
            "research_planner",
            json!({"status": "queries", "queries": ["a", "b", " ", "c", "d"]}),
        ));
        let invoker = AgentInvoker::new(agent, RetryPolicy::immediate(1));
        let session = SessionHandle::new("p-1");
        let mut settings = settings();
        settings.max_research_queries = 3;
        let rt = StepRuntime {
            invoker: &invoker,
            runner: ConcurrentTaskRunner::new(2),
            session: &session,
            settings: &settings,
        };

        let mut ctx = context_at(Step::PlanResearch);
        PlanResearchHandler.execute(&mut ctx, &rt).await.unwrap();
        assert_eq!(ctx.artifacts.research_queries, vec!["a", "b", "c"]);
        assert_eq!(ctx.usage.invocations, 1);
    }

    #[tokio::test]
    async fn test_research_keeps_partial_results_in_order() {
        let agent = Arc::new(
            ScriptedAgent::new()
                .with_response_for_input("researcher", "q0", json!({"status": "findings", "summary": "zero"}))
                .with_fatal_for_input("researcher", "q1", "blocked by policy")
                .with_response_for_input("researcher", "q2", json!({"status": "findings", "summary": "two"})),
        );
        let invoker = AgentInvoker::new(agent, RetryPolicy::immediate(1));
        let session = SessionHandle::new("p-1");
        let settings = settings();
        let rt = StepRuntime {
            invoker: &invoker,
            runner: ConcurrentTaskRunner::new(3),
            session: &session,
            settings: &settings,
        };

        let mut ctx = context_at(Step::Research);
        ctx.artifacts.research_queries = vec!["q0".into(), "q1".into(), "q2".into()];
        ResearchHandler.execute(&mut ctx, &rt).await.unwrap();

        let indexes: Vec<usize> = ctx
            .artifacts
            .research_results
            .iter()
            .map(|f| f.query_index)
            .collect();
        assert_eq!(indexes, vec![0, 2]);
        assert_eq!(ctx.artifacts.research_failures, 1);
    }

    #[tokio::test]
    async fn test_research_all_failed_is_fan_out_error() {
        let agent = Arc::new(ScriptedAgent::new().with_transient("researcher", "unavailable"));
        let invoker = AgentInvoker::new(agent, RetryPolicy::immediate(1));
        let session = SessionHandle::new("p-1");
        let settings = settings();
        let rt = StepRuntime {
            invoker: &invoker,
            runner: ConcurrentTaskRunner::new(2),
            session: &session,
            settings: &settings,
        };

        let mut ctx = context_at(Step::Research);
        ctx.artifacts.research_queries = vec!["q0".into(), "q1".into()];
        let err = ResearchHandler.execute(&mut ctx, &rt).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::FanOutFailed {
                failed: 2,
                total: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_assemble_uses_outline_title_and_latest_draft() {
        let agent = Arc::new(ScriptedAgent::new());
        let invoker = AgentInvoker::new(agent, RetryPolicy::immediate(1));
        let session = SessionHandle::new("p-1");
        let settings = settings();
        let rt = StepRuntime {
            invoker: &invoker,
            runner: ConcurrentTaskRunner::default(),
            session: &session,
            settings: &settings,
        };

        let mut ctx = context_at(Step::Assemble);
        ctx.artifacts.outline = Some(Outline {
            title: "Shipping Rust".into(),
            sections: vec![OutlineSection {
                heading: "Why".into(),
                points: vec![],
            }],
        });
        ctx.artifacts.push_draft(DraftOrigin::Generated, "old".into());
        ctx.artifacts
            .push_draft(DraftOrigin::OperatorEdit, "Body text\n".into());

        AssembleHandler.execute(&mut ctx, &rt).await.unwrap();
        assert_eq!(
            ctx.artifacts.manuscript.as_deref(),
            Some("# Shipping Rust\n\nBody text")
        );
    }
}
