//! Per-process sessions
//!
//! A [`SessionHandle`] ties together everything that lives only while a
//! process is being driven or watched: the run lock that makes the
//! scheduler the single writer of its context, the cancellation token, the
//! currently attached notification channel and the tasks serving it.
//! Sessions are created and torn down explicitly through a
//! [`SessionRegistry`]; nothing here is global.

use crate::context::ProcessId;
use crate::steps::Step;
use crate::transport::{NotificationChannel, ProcessEvent};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// State of the operator connection for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No channel has attached yet
    Unattached,
    Connected,
    /// Channel lost while the run continues as a background task
    Detached,
    /// Channel lost at a pause point; waiting for a reconnect
    AwaitingReconnection,
}

pub struct SessionHandle {
    process_id: ProcessId,
    cancel: CancellationToken,
    run_lock: Arc<Mutex<()>>,
    channel: RwLock<Option<Arc<dyn NotificationChannel>>>,
    step: watch::Sender<Step>,
    connection: watch::Sender<ConnectionState>,
    background_task: RwLock<Option<String>>,
    attachments: Mutex<Vec<JoinHandle<()>>>,
    run: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn new<S: Into<ProcessId>>(process_id: S) -> Self {
        let (step, _) = watch::channel(Step::Start);
        let (connection, _) = watch::channel(ConnectionState::Unattached);
        Self {
            process_id: process_id.into(),
            cancel: CancellationToken::new(),
            run_lock: Arc::new(Mutex::new(())),
            channel: RwLock::new(None),
            step,
            connection,
            background_task: RwLock::new(None),
            attachments: Mutex::new(Vec::new()),
            run: Mutex::new(None),
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Claim the right to drive this process. `None` if a run holds it.
    pub fn try_begin_run(&self) -> Option<OwnedMutexGuard<()>> {
        self.run_lock.clone().try_lock_owned().ok()
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub fn set_step(&self, step: Step) {
        self.step.send_replace(step);
    }

    pub fn step(&self) -> Step {
        *self.step.borrow()
    }

    pub fn set_connection(&self, state: ConnectionState) {
        let previous = self.connection.send_replace(state);
        if previous != state {
            debug!(process_id = %self.process_id, from = ?previous, to = ?state, "Connection state changed");
        }
    }

    pub fn connection(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Publish an event through the attached channel, if any
    pub async fn send(&self, event: &ProcessEvent) {
        let channel = self.channel.read().await.clone();
        match channel {
            Some(channel) => channel.send(&self.process_id, event).await,
            None => debug!(
                process_id = %self.process_id,
                event = event.name(),
                "No channel attached, event not delivered"
            ),
        }
    }

    pub async fn channel(&self) -> Option<Arc<dyn NotificationChannel>> {
        self.channel.read().await.clone()
    }

    /// Install `channel`, returning the one it replaces
    pub async fn swap_channel(
        &self,
        channel: Arc<dyn NotificationChannel>,
    ) -> Option<Arc<dyn NotificationChannel>> {
        self.channel.write().await.replace(channel)
    }

    /// Detach the current channel if it is `channel_id`
    pub async fn take_channel_if(&self, channel_id: &str) -> Option<Arc<dyn NotificationChannel>> {
        let mut slot = self.channel.write().await;
        if slot.as_ref().map(|c| c.channel_id()) == Some(channel_id) {
            slot.take()
        } else {
            None
        }
    }

    pub async fn set_background_task(&self, task_id: Option<String>) {
        *self.background_task.write().await = task_id;
    }

    pub async fn background_task(&self) -> Option<String> {
        self.background_task.read().await.clone()
    }

    /// Replace the tasks serving the current channel, aborting the old ones
    pub async fn replace_attachments(&self, handles: Vec<JoinHandle<()>>) {
        let old = std::mem::replace(&mut *self.attachments.lock().await, handles);
        for handle in old {
            handle.abort();
        }
    }

    pub async fn set_run_handle(&self, handle: JoinHandle<()>) {
        *self.run.lock().await = Some(handle);
    }

    pub async fn take_run_handle(&self) -> Option<JoinHandle<()>> {
        self.run.lock().await.take()
    }

    /// Close the channel and stop the tasks serving it. The caller may be
    /// one of those tasks, so aborting comes last.
    async fn shutdown(&self, reason: &str) {
        let channel = self.channel.write().await.take();
        if let Some(channel) = channel {
            channel.close(reason).await;
        }
        let handles = std::mem::take(&mut *self.attachments.lock().await);
        for handle in handles {
            handle.abort();
        }
    }
}

/// Explicitly managed set of live sessions
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ProcessId, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live session for `process_id`, creating one if needed. A
    /// cancelled session is replaced since its token cannot be reused.
    pub fn open(&self, process_id: &str) -> Arc<SessionHandle> {
        let mut entry = self
            .sessions
            .entry(process_id.to_string())
            .or_insert_with(|| Arc::new(SessionHandle::new(process_id)));
        if entry.is_cancelled() && !entry.is_running() {
            *entry = Arc::new(SessionHandle::new(process_id));
        }
        entry.clone()
    }

    pub fn get(&self, process_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(process_id).map(|s| s.clone())
    }

    /// Connection state of the live session for `process_id`, if any
    pub fn connection_of(&self, process_id: &str) -> Option<ConnectionState> {
        self.sessions.get(process_id).map(|s| s.connection())
    }

    /// Remove the session and release what it holds
    pub async fn teardown(&self, process_id: &str, reason: &str) -> bool {
        match self.sessions.remove(process_id) {
            Some((_, session)) => {
                session.shutdown(reason).await;
                info!(process_id = %process_id, reason, "Session torn down");
                true
            }
            None => false,
        }
    }

    /// Tear down `session` only if it is still the registered one
    pub async fn teardown_if_current(&self, session: &Arc<SessionHandle>, reason: &str) -> bool {
        let removed = self
            .sessions
            .remove_if(session.process_id(), |_, s| Arc::ptr_eq(s, session));
        match removed {
            Some(_) => {
                session.shutdown(reason).await;
                info!(process_id = %session.process_id(), reason, "Session torn down");
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Vec<ProcessId> {
        let mut ids: Vec<ProcessId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
