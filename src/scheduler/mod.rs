//! Pipeline scheduler
//!
//! Drives one process from its current step until it reaches a terminal
//! step or suspends at a pause point. Every step boundary is persisted, so
//! a run can be picked up from storage by a later call to
//! [`PipelineScheduler::run`], possibly in another process.
//!
//! Errors never escape a step: whatever a handler, the gate or storage
//! reports is classified, recorded on the context and turned into the
//! `error` terminal step, which then goes through the same finishing path
//! as a completed or cancelled run.

pub mod handlers;
pub mod pause;

pub use handlers::{HandlerTable, StepHandler, StepRuntime};

use crate::agent::AgentInvoker;
use crate::concurrency::{ConcurrentTaskRunner, SuccessCriterion};
use crate::config::DraftflowConfig;
use crate::context::{ExecutionContext, TurnRole};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::gate::{GateDecision, GateOutcome, UserInputGate};
use crate::observability::metrics::metrics;
use crate::persistence::PersistenceGateway;
use crate::session::SessionHandle;
use crate::steps::{self, Step, StepKind};
use crate::transport::ProcessEvent;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

/// Tunables for a scheduler
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub input_timeout: Duration,
    pub fanout_limit: usize,
    pub research_criterion: SuccessCriterion,
    pub max_research_queries: usize,
    /// Conversation turns handed to each agent call
    pub history_window: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            input_timeout: Duration::from_secs(600),
            fanout_limit: 5,
            research_criterion: SuccessCriterion::AnySucceeds,
            max_research_queries: 8,
            history_window: 6,
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &DraftflowConfig) -> Self {
        Self {
            input_timeout: config.orchestrator.input_timeout(),
            fanout_limit: config.orchestrator.fanout_limit,
            research_criterion: config.orchestrator.research_success,
            max_research_queries: config.orchestrator.max_research_queries,
            history_window: config.llm.history_window,
        }
    }
}

/// How a call to [`PipelineScheduler::run`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Reached a terminal step
    Finished { step: Step },
    /// Stopped at a pause point with the request persisted
    Suspended { step: Step },
}

pub struct PipelineScheduler {
    gateway: PersistenceGateway,
    invoker: Arc<AgentInvoker>,
    gate: Arc<UserInputGate>,
    handlers: HandlerTable,
    settings: SchedulerSettings,
}

impl PipelineScheduler {
    /// Build a scheduler after checking the step catalog and that the
    /// handler table covers it
    pub fn new(
        gateway: PersistenceGateway,
        invoker: Arc<AgentInvoker>,
        gate: Arc<UserInputGate>,
        handlers: HandlerTable,
        settings: SchedulerSettings,
    ) -> OrchestratorResult<Self> {
        steps::validate()?;
        handlers.validate()?;
        Ok(Self {
            gateway,
            invoker,
            gate,
            handlers,
            settings,
        })
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Drive `ctx` until it finishes or suspends.
    ///
    /// `resume` carries a decision that was validated against the stored
    /// pending request while no run was waiting for it; it is applied at
    /// the pause point the context is parked on.
    pub async fn run(
        &self,
        session: &SessionHandle,
        mut ctx: ExecutionContext,
        resume: Option<GateDecision>,
    ) -> OrchestratorResult<RunOutcome> {
        let span = crate::process_span!(
            process_id = %ctx.process_id,
            owner_id = %ctx.owner_id
        );
        self.drive(session, &mut ctx, resume).instrument(span).await
    }

    async fn drive(
        &self,
        session: &SessionHandle,
        ctx: &mut ExecutionContext,
        mut resume: Option<GateDecision>,
    ) -> OrchestratorResult<RunOutcome> {
        info!(step = %ctx.current_step, resumed = resume.is_some(), "Run started");

        loop {
            let step = ctx.current_step;
            session.set_step(step);

            if step.is_terminal() {
                return self.finish(session, ctx).await;
            }
            if session.is_cancelled() {
                info!(step = %step, "Run cancelled");
                ctx.advance_to(Step::Cancelled);
                continue;
            }

            let result = match step.kind() {
                StepKind::UserInputRequired => self.pause(session, ctx, step, resume.take()).await,
                _ => self.execute(session, ctx, step).await.map(|_| None),
            };

            match result {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {}
                Err(OrchestratorError::Cancelled) => {
                    info!(step = %step, "Run cancelled");
                    ctx.advance_to(Step::Cancelled);
                }
                Err(e) => {
                    error!(step = %step, kind = ?e.kind(), error = %e, "Step failed");
                    ctx.record_error(e.kind(), step, e.sanitized_message());
                    ctx.advance_to(Step::Error);
                }
            }
        }
    }

    async fn execute(
        &self,
        session: &SessionHandle,
        ctx: &mut ExecutionContext,
        step: Step,
    ) -> OrchestratorResult<()> {
        session.send(&ProcessEvent::StepStarted { step }).await;
        let handler = self
            .handlers
            .get(step)
            .ok_or_else(|| OrchestratorError::internal(format!("no handler for step {step}")))?;
        let runtime = StepRuntime {
            invoker: &self.invoker,
            runner: ConcurrentTaskRunner::new(self.settings.fanout_limit),
            session,
            settings: &self.settings,
        };

        handler
            .execute(ctx, &runtime)
            .instrument(crate::step_span!(step = %step, kind = %step.kind()))
            .await?;
        if session.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let next = steps::require_next(step)?;
        ctx.advance_to(next);
        let snapshot_id = if step.kind() == StepKind::Autonomous {
            Some(self.gateway.create_snapshot(ctx, step).await?.snapshot_id)
        } else {
            self.gateway.save(ctx).await?;
            None
        };
        metrics().step_executed();
        debug!(step = %step, next = %next, "Step completed");
        session
            .send(&ProcessEvent::StepCompleted {
                step,
                next,
                snapshot_id,
            })
            .await;
        Ok(())
    }

    /// Wait at a pause point. `Ok(Some(_))` ends the run without
    /// finishing it.
    async fn pause(
        &self,
        session: &SessionHandle,
        ctx: &mut ExecutionContext,
        step: Step,
        resume: Option<GateDecision>,
    ) -> OrchestratorResult<Option<RunOutcome>> {
        let decision = match resume {
            Some(decision) => decision,
            None => {
                let request = match &ctx.pending_input {
                    Some(pending) if pending.step == step => pending.clone(),
                    _ => pause::build_request(ctx, step)?,
                };
                ctx.set_pending_input(request.clone());
                self.gateway.save(ctx).await?;

                let request_id = request.request_id.clone();
                match self
                    .gate
                    .request(session, request, self.settings.input_timeout)
                    .await
                {
                    GateOutcome::Decided(decision) => decision,
                    GateOutcome::TimedOut => {
                        warn!(step = %step, request_id = %request_id, "Operator input timed out");
                        session
                            .send(&ProcessEvent::InputTimedOut { request_id, step })
                            .await;
                        return Ok(Some(RunOutcome::Suspended { step }));
                    }
                    GateOutcome::Released => {
                        info!(step = %step, "Input wait released");
                        return Ok(Some(RunOutcome::Suspended { step }));
                    }
                    GateOutcome::Cancelled => return Err(OrchestratorError::Cancelled),
                }
            }
        };

        let request_id = ctx
            .pending_input
            .as_ref()
            .map(|r| r.request_id.clone())
            .unwrap_or_default();
        info!(step = %step, action = decision.action(), "Operator input accepted");
        session
            .send(&ProcessEvent::InputAccepted {
                request_id,
                action: decision.action().to_string(),
            })
            .await;

        ctx.record_turn(TurnRole::Operator, None, decision.summary());
        let target = pause::apply_decision(ctx, step, decision)?;
        ctx.advance_to(target);
        let snapshot = self.gateway.create_snapshot(ctx, step).await?;
        session
            .send(&ProcessEvent::StepCompleted {
                step,
                next: target,
                snapshot_id: Some(snapshot.snapshot_id),
            })
            .await;
        Ok(None)
    }

    /// Persist the terminal context, archive it and tell the operator
    async fn finish(
        &self,
        session: &SessionHandle,
        ctx: &mut ExecutionContext,
    ) -> OrchestratorResult<RunOutcome> {
        let step = ctx.current_step;
        let saved = self.gateway.save(ctx).await;
        if let Err(e) = &saved {
            metrics().persistence_failure();
            error!(step = %step, error = %e, "Failed to persist terminal context");
        }
        if let Err(e) = self.gateway.archive(ctx).await {
            warn!(error = %e, "Failed to archive finished process");
        }
        if let Some(event) = ProcessEvent::terminal_for(ctx) {
            session.send(&event).await;
        }

        info!(
            step = %step,
            invocations = ctx.usage.invocations,
            tokens = ctx.usage.tokens,
            "Run finished"
        );
        saved?;
        Ok(RunOutcome::Finished { step })
    }
}
