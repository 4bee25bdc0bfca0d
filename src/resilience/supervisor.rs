//! Connection resilience supervisor
//!
//! Owns what happens when a channel comes and goes. On loss the current
//! step decides the outcome: resilient steps keep running as a background
//! task, pause points stay paused until someone reconnects. On attach the
//! newest channel always wins and the previous one is closed.

use super::background::{BackgroundStatus, BackgroundTasks};
use super::keepalive::{self, MonitorExit};
use crate::context::ProcessStatus;
use crate::gate::UserInputGate;
use crate::observability::metrics::metrics;
use crate::session::{ConnectionState, SessionHandle, SessionRegistry};
use crate::transport::{NotificationChannel, ProcessEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

#[derive(Debug, Clone, Copy)]
pub struct ResilienceSettings {
    pub keepalive_interval: Duration,
    pub max_missed_keepalives: u32,
    /// Finished background task records kept for status queries
    pub finished_task_history: usize,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(15),
            max_missed_keepalives: 3,
            finished_task_history: super::background::DEFAULT_FINISHED_HISTORY,
        }
    }
}

impl From<&crate::config::ResilienceSection> for ResilienceSettings {
    fn from(section: &crate::config::ResilienceSection) -> Self {
        Self {
            keepalive_interval: Duration::from_secs(section.keepalive_interval_secs),
            max_missed_keepalives: section.max_missed_keepalives,
            finished_task_history: section.finished_task_history,
        }
    }
}

/// What attaching a channel found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    /// A run is live for the process
    Live {
        /// A background continuation was picked back up
        reattached: bool,
        /// The pending input request was re-published
        replayed: bool,
    },
    /// No run is live; the caller decides from storage
    Dormant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The channel was already replaced
    Stale,
    Detached { task_id: String },
    AwaitingReconnection,
    /// No live run; the session was torn down
    Released,
}

pub struct ConnectionResilienceSupervisor {
    registry: Arc<SessionRegistry>,
    gate: Arc<UserInputGate>,
    background: Arc<BackgroundTasks>,
    settings: ResilienceSettings,
}

impl ConnectionResilienceSupervisor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        gate: Arc<UserInputGate>,
        background: Arc<BackgroundTasks>,
        settings: ResilienceSettings,
    ) -> Self {
        Self {
            registry,
            gate,
            background,
            settings,
        }
    }

    pub fn background(&self) -> &Arc<BackgroundTasks> {
        &self.background
    }

    /// Install `channel` as the session's only writer and catch it up
    pub async fn attach(
        &self,
        session: &SessionHandle,
        channel: Arc<dyn NotificationChannel>,
    ) -> AttachOutcome {
        let channel_id = channel.channel_id().to_string();
        if let Some(previous) = session.swap_channel(channel).await {
            if previous.channel_id() != channel_id {
                info!(
                    process_id = %session.process_id(),
                    previous = previous.channel_id(),
                    channel_id = %channel_id,
                    "New connection supersedes existing channel"
                );
                previous.close("superseded by a new connection").await;
            }
        }
        session.set_connection(ConnectionState::Connected);

        if !session.is_running() {
            return AttachOutcome::Dormant;
        }

        let mut reattached = false;
        if let Some(task_id) = session.background_task().await {
            if self.background.reattach(&task_id) {
                reattached = true;
                metrics().reattach();
                info!(process_id = %session.process_id(), task_id = %task_id, "Reattached to background run");
                session
                    .send(&ProcessEvent::Reattached {
                        step: session.step(),
                        status: ProcessStatus::Running,
                    })
                    .await;
            }
        }
        let replayed = self.gate.replay(session).await;
        AttachOutcome::Live {
            reattached,
            replayed,
        }
    }

    /// React to losing `channel_id`
    pub async fn on_disconnect(
        &self,
        session: &Arc<SessionHandle>,
        channel_id: &str,
        reason: &str,
    ) -> DisconnectOutcome {
        let Some(channel) = session.take_channel_if(channel_id).await else {
            return DisconnectOutcome::Stale;
        };
        channel.close(reason).await;
        metrics().disconnect();

        let process_id = session.process_id();
        let step = session.step();
        if !session.is_running() {
            self.registry.teardown_if_current(session, reason).await;
            return DisconnectOutcome::Released;
        }

        if step.is_resilient() {
            let existing = session.background_task().await;
            let task_id = self
                .background
                .detach(process_id, step, existing.as_deref());
            session.set_background_task(Some(task_id.clone())).await;
            session.set_connection(ConnectionState::Detached);
            metrics().detach();
            DisconnectOutcome::Detached { task_id }
        } else {
            info!(process_id, step = %step, "Channel lost at pause point, awaiting reconnection");
            session.set_connection(ConnectionState::AwaitingReconnection);
            DisconnectOutcome::AwaitingReconnection
        }
    }

    /// Watch `channel` and hand a loss to [`Self::on_disconnect`]
    pub fn spawn_monitor(
        self: &Arc<Self>,
        session: Arc<SessionHandle>,
        channel: Arc<dyn NotificationChannel>,
    ) -> JoinHandle<()> {
        let supervisor = self.clone();
        let span = crate::channel_span!(
            process_id = %session.process_id(),
            channel_id = %channel.channel_id()
        );
        tokio::spawn(
            async move {
                let exit = keepalive::monitor(
                    channel.as_ref(),
                    supervisor.settings.keepalive_interval,
                    supervisor.settings.max_missed_keepalives,
                    session.cancel_token(),
                )
                .await;
                if exit == MonitorExit::Lost {
                    warn!("Operator channel lost");
                    supervisor
                        .on_disconnect(&session, channel.channel_id(), "keepalive lost")
                        .await;
                }
            }
            .instrument(span),
        )
    }

    /// Close out the background record of a finished run
    pub async fn run_finished(&self, session: &SessionHandle, status: ProcessStatus) {
        if let Some(task_id) = session.background_task().await {
            self.background
                .finish(&task_id, BackgroundStatus::from_process(status));
        }
    }
}
