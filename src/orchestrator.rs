//! Orchestrator facade
//!
//! Wires the scheduler, the input gate, the session registry and the
//! resilience supervisor together and exposes the operations a front end
//! needs: start, attach, respond, cancel, restore and the status reads.
//! Each run executes on its own task while holding its session's run lock,
//! so at most one scheduler ever writes a given process.

use crate::agent::{AgentCapability, AgentInvoker, RetryPolicy, TelemetrySink};
use crate::config::DraftflowConfig;
use crate::context::{ExecutionContext, PipelineInputs, ProcessId, ProcessStatus};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::gate::{validate, GateDecision, GateError, OperatorReply, UserInputGate};
use crate::observability::metrics::metrics;
use crate::persistence::{PersistenceGateway, ProcessStatusView, SnapshotSummary};
use crate::resilience::{
    AttachOutcome, BackgroundTask, BackgroundTasks, ConnectionResilienceSupervisor,
    DisconnectOutcome, ResilienceSettings,
};
use crate::scheduler::{HandlerTable, PipelineScheduler, RunOutcome, SchedulerSettings};
use crate::session::{SessionHandle, SessionRegistry};
use crate::steps::Step;
use crate::transport::{NotificationChannel, ProcessEvent};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

struct Inner {
    gateway: PersistenceGateway,
    scheduler: PipelineScheduler,
    registry: Arc<SessionRegistry>,
    gate: Arc<UserInputGate>,
    supervisor: Arc<ConnectionResilienceSupervisor>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Assemble an orchestrator. Fails if the step catalog or the handler
    /// table is inconsistent.
    pub fn new(
        gateway: PersistenceGateway,
        invoker: AgentInvoker,
        handlers: HandlerTable,
        settings: SchedulerSettings,
        resilience: ResilienceSettings,
    ) -> OrchestratorResult<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let gate = Arc::new(UserInputGate::new());
        let scheduler = PipelineScheduler::new(
            gateway.clone(),
            Arc::new(invoker),
            gate.clone(),
            handlers,
            settings,
        )?;
        let supervisor = Arc::new(ConnectionResilienceSupervisor::new(
            registry.clone(),
            gate.clone(),
            Arc::new(BackgroundTasks::with_history(resilience.finished_task_history)),
            resilience,
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                gateway,
                scheduler,
                registry,
                gate,
                supervisor,
            }),
        })
    }

    /// Build from configuration around the given agent capability.
    /// Invocation telemetry is written through the persistence gateway.
    pub fn from_config(
        config: &DraftflowConfig,
        capability: Arc<dyn AgentCapability>,
    ) -> OrchestratorResult<Self> {
        let gateway = PersistenceGateway::from_config(&config.storage)?;
        let telemetry: Arc<dyn TelemetrySink> = Arc::new(gateway.clone());
        let invoker = AgentInvoker::new(capability, RetryPolicy::from(&config.retry))
            .with_telemetry(telemetry);

        Self::new(
            gateway,
            invoker,
            HandlerTable::standard(),
            SchedulerSettings::from_config(config),
            ResilienceSettings::from(&config.resilience),
        )
    }

    pub fn gateway(&self) -> &PersistenceGateway {
        &self.inner.gateway
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Store a new process without running it. Attaching a channel or
    /// calling [`Self::resume`] starts it.
    pub async fn create<S: Into<String>>(
        &self,
        owner_id: S,
        inputs: PipelineInputs,
    ) -> OrchestratorResult<ExecutionContext> {
        let ctx = ExecutionContext::new(owner_id, inputs);
        self.inner.gateway.save(&ctx).await?;
        info!(process_id = %ctx.process_id, owner_id = %ctx.owner_id, "Process created");
        Ok(ctx)
    }

    /// Create a process and start driving it. Events go to `channel` from
    /// the first step on.
    pub async fn start<S: Into<String>>(
        &self,
        owner_id: S,
        inputs: PipelineInputs,
        channel: Option<Arc<dyn NotificationChannel>>,
    ) -> OrchestratorResult<ProcessId> {
        let ctx = self.create(owner_id, inputs).await?;
        let process_id = ctx.process_id.clone();

        let session = self.inner.registry.open(&process_id);
        if let Some(channel) = channel {
            self.inner.supervisor.attach(&session, channel.clone()).await;
            self.serve_channel(&session, channel).await;
        }
        self.spawn_run(session, ctx, None).await?;
        Ok(process_id)
    }

    /// Continue a stored process that has no live run, e.g. after a
    /// restart or a restore. A process parked at a pause point publishes
    /// its stored request again.
    pub async fn resume(&self, process_id: &str) -> OrchestratorResult<()> {
        let ctx = self.inner.gateway.load(process_id).await?;
        if ctx.is_terminal() {
            return Err(OrchestratorError::invalid_input(format!(
                "process {process_id} already finished at {}",
                ctx.current_step
            )));
        }
        let session = self.inner.registry.open(process_id);
        self.spawn_run(session, ctx, None).await
    }

    async fn spawn_run(
        &self,
        session: Arc<SessionHandle>,
        ctx: ExecutionContext,
        resume: Option<GateDecision>,
    ) -> OrchestratorResult<()> {
        let guard = session
            .try_begin_run()
            .ok_or_else(|| OrchestratorError::AlreadyRunning {
                process_id: ctx.process_id.clone(),
            })?;
        let lease = self
            .inner
            .gateway
            .acquire_run_lease(&ctx.process_id)
            .await?
            .ok_or_else(|| OrchestratorError::AlreadyRunning {
                process_id: ctx.process_id.clone(),
            })?;
        session.set_step(ctx.current_step);

        let inner = self.inner.clone();
        let run_session = session.clone();
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            metrics().process_started();
            let result = inner.scheduler.run(&run_session, ctx, resume).await;

            let status = match &result {
                Ok(RunOutcome::Finished { step: Step::Completed }) => {
                    metrics().process_completed(started.elapsed());
                    ProcessStatus::Completed
                }
                Ok(RunOutcome::Finished { step: Step::Cancelled }) => {
                    metrics().process_cancelled(started.elapsed());
                    ProcessStatus::Cancelled
                }
                Ok(RunOutcome::Finished { .. }) => {
                    metrics().process_failed(started.elapsed());
                    ProcessStatus::Failed
                }
                Ok(RunOutcome::Suspended { .. }) => {
                    metrics().process_suspended(started.elapsed());
                    ProcessStatus::AwaitingInput
                }
                Err(e) => {
                    error!(error = %e, "Run ended without persisting its final state");
                    metrics().process_failed(started.elapsed());
                    ProcessStatus::Failed
                }
            };
            inner.supervisor.run_finished(&run_session, status).await;
            drop(lease);
            drop(guard);

            let keep_session = matches!(result, Ok(RunOutcome::Suspended { .. }))
                && run_session.channel().await.is_some();
            if !keep_session {
                inner
                    .registry
                    .teardown_if_current(&run_session, "run ended")
                    .await;
            }
        });
        session.set_run_handle(handle).await;
        Ok(())
    }

    /// Apply an operator reply.
    ///
    /// A live wait receives it directly. Otherwise the reply is checked
    /// against the persisted pending request and, if it fits, the run is
    /// resumed from storage with it. Rejected replies leave the wait or the
    /// stored request untouched.
    pub async fn respond(
        &self,
        process_id: &str,
        reply: OperatorReply,
    ) -> OrchestratorResult<GateDecision> {
        if self.inner.gate.is_waiting(process_id) {
            match self.inner.gate.deliver(process_id, &reply) {
                Ok(decision) => {
                    debug!(process_id, action = decision.action(), "Reply delivered to live wait");
                    return Ok(decision);
                }
                Err(GateError::NoPendingRequest { .. }) => {}
                Err(e) => return Err(self.reject(process_id, &reply, e).await),
            }
        }

        let ctx = self.inner.gateway.load(process_id).await?;
        let Some(request) = ctx.pending_input.clone() else {
            return Err(OrchestratorError::NotAwaitingInput {
                process_id: process_id.to_string(),
            });
        };
        let decision = match validate(&request, &reply) {
            Ok(decision) => decision,
            Err(e) => return Err(self.reject(process_id, &reply, e).await),
        };

        info!(process_id, request_id = %request.request_id, "Resuming process from stored request");
        let session = self.inner.registry.open(process_id);
        self.spawn_run(session, ctx, Some(decision.clone())).await?;
        Ok(decision)
    }

    async fn reject(
        &self,
        process_id: &str,
        reply: &OperatorReply,
        reason: GateError,
    ) -> OrchestratorError {
        metrics().input_rejected();
        warn!(process_id, action = reply.response.name(), reason = %reason, "Operator reply rejected");
        if let Some(session) = self.inner.registry.get(process_id) {
            session
                .send(&ProcessEvent::InputRejected {
                    request_id: reply.request_id.clone(),
                    reason: reason.to_string(),
                })
                .await;
        }
        OrchestratorError::invalid_input(reason.to_string())
    }

    /// Stop a process. A live run is interrupted wherever it is; a stored
    /// one is moved straight to `cancelled`.
    pub async fn cancel(&self, process_id: &str) -> OrchestratorResult<()> {
        if let Some(session) = self.inner.registry.get(process_id) {
            if session.is_running() {
                info!(process_id, "Cancelling live run");
                session.cancel();
                return Ok(());
            }
        }

        let ctx = self.inner.gateway.cancel_stored(process_id).await?;
        if let Some(session) = self.inner.registry.get(process_id) {
            if let Some(event) = ProcessEvent::terminal_for(&ctx) {
                session.send(&event).await;
            }
            self.inner
                .registry
                .teardown_if_current(&session, "process cancelled")
                .await;
        }
        Ok(())
    }

    /// Check out `snapshot_id` as the live state of `process_id`.
    ///
    /// A run waiting for input is released first; a run doing work is
    /// left alone and the restore refused. Call [`Self::resume`] to
    /// continue from the restored step.
    pub async fn restore(
        &self,
        process_id: &str,
        snapshot_id: &str,
        owner_id: &str,
    ) -> OrchestratorResult<ExecutionContext> {
        if let Some(session) = self.inner.registry.get(process_id) {
            if session.is_running() {
                if !self.inner.gate.release(process_id) {
                    return Err(OrchestratorError::AlreadyRunning {
                        process_id: process_id.to_string(),
                    });
                }
                if let Some(handle) = session.take_run_handle().await {
                    if let Err(e) = handle.await {
                        warn!(process_id, error = %e, "Released run did not shut down cleanly");
                    }
                }
            }
        }

        let ctx = self
            .inner
            .gateway
            .restore(process_id, snapshot_id, owner_id)
            .await?;
        Ok(ctx)
    }

    /// Connect an operator channel to a process.
    ///
    /// The channel replaces any previous one. A live run is caught up by
    /// the supervisor; otherwise the stored state decides: a finished
    /// process reports how it ended, anything else is resumed.
    pub async fn attach(
        &self,
        process_id: &str,
        channel: Arc<dyn NotificationChannel>,
    ) -> OrchestratorResult<AttachOutcome> {
        let ctx = self.inner.gateway.load(process_id).await?;

        let session = self.inner.registry.open(process_id);
        let outcome = self.inner.supervisor.attach(&session, channel.clone()).await;
        if outcome != AttachOutcome::Dormant {
            self.serve_channel(&session, channel).await;
            return Ok(outcome);
        }

        if ctx.is_terminal() {
            info!(process_id, step = %ctx.current_step, "Attached to finished process");
            if let Some(event) = ProcessEvent::terminal_for(&ctx) {
                session.send(&event).await;
            }
            self.inner
                .registry
                .teardown_if_current(&session, "process already finished")
                .await;
            return Ok(outcome);
        }

        self.serve_channel(&session, channel).await;
        info!(process_id, step = %ctx.current_step, "Resuming dormant process on attach");
        match self.spawn_run(session, ctx, None).await {
            Ok(()) | Err(OrchestratorError::AlreadyRunning { .. }) => Ok(outcome),
            Err(e) => Err(e),
        }
    }

    /// Start the keepalive monitor and the reply pump for `channel`
    async fn serve_channel(&self, session: &Arc<SessionHandle>, channel: Arc<dyn NotificationChannel>) {
        let monitor = self
            .inner
            .supervisor
            .spawn_monitor(session.clone(), channel.clone());

        let orchestrator = self.clone();
        let process_id = session.process_id().to_string();
        let span = crate::channel_span!(process_id = %process_id, channel_id = %channel.channel_id());
        let pump = tokio::spawn(
            async move {
                while let Some(reply) = channel.receive(&process_id).await {
                    if let Err(e) = orchestrator.respond(&process_id, reply).await {
                        debug!(error = %e, "Reply not applied");
                    }
                }
                debug!("Reply stream ended");
            }
            .instrument(span),
        );

        session.replace_attachments(vec![monitor, pump]).await;
    }

    /// Explicit disconnect of `channel_id`
    pub async fn disconnect(&self, process_id: &str, channel_id: &str) -> DisconnectOutcome {
        match self.inner.registry.get(process_id) {
            Some(session) => {
                self.inner
                    .supervisor
                    .on_disconnect(&session, channel_id, "operator disconnected")
                    .await
            }
            None => DisconnectOutcome::Stale,
        }
    }

    /// Storage-backed status plus the live connection state; the stored
    /// part may trail a live run slightly
    pub async fn status(&self, process_id: &str) -> OrchestratorResult<ProcessStatusView> {
        let mut view = self.inner.gateway.status(process_id).await?;
        view.connection = self.inner.registry.connection_of(process_id);
        Ok(view)
    }

    pub async fn snapshots(&self, process_id: &str) -> OrchestratorResult<Vec<SnapshotSummary>> {
        Ok(self.inner.gateway.list_snapshots(process_id).await?)
    }

    /// Processes parked at a pause point
    pub async fn awaiting_input(&self) -> OrchestratorResult<Vec<ProcessStatusView>> {
        let mut views = self.inner.gateway.awaiting_input().await?;
        for view in &mut views {
            view.connection = self.inner.registry.connection_of(&view.process_id);
        }
        Ok(views)
    }

    pub fn background_tasks(&self, process_id: &str) -> Vec<BackgroundTask> {
        self.inner.supervisor.background().for_process(process_id)
    }

    pub fn is_running(&self, process_id: &str) -> bool {
        self.inner
            .registry
            .get(process_id)
            .map(|s| s.is_running())
            .unwrap_or(false)
    }

    /// Wait for the current run of `process_id`, if any, to end and return
    /// the stored status
    pub async fn wait(&self, process_id: &str) -> OrchestratorResult<ProcessStatusView> {
        if let Some(session) = self.inner.registry.get(process_id) {
            if let Some(handle) = session.take_run_handle().await {
                handle
                    .await
                    .map_err(|e| OrchestratorError::internal(format!("run task failed: {e}")))?;
            }
        }
        self.status(process_id).await
    }
}
