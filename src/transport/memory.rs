//! In-process notification channel
//!
//! Records every event it is sent and queues operator replies pushed from
//! the outside. Liveness can be toggled to simulate a stalled or dropped
//! connection.

use super::{NotificationChannel, ProcessEvent};
use crate::gate::OperatorReply;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct MemoryChannel {
    channel_id: String,
    events: StdMutex<Vec<(String, ProcessEvent)>>,
    event_added: Notify,
    reply_tx: mpsc::UnboundedSender<OperatorReply>,
    reply_rx: Mutex<mpsc::UnboundedReceiver<OperatorReply>>,
    responsive: AtomicBool,
    closed: CancellationToken,
    close_reason: StdMutex<Option<String>>,
}

impl MemoryChannel {
    pub fn new<S: Into<String>>(channel_id: S) -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Self {
            channel_id: channel_id.into(),
            events: StdMutex::new(Vec::new()),
            event_added: Notify::new(),
            reply_tx,
            reply_rx: Mutex::new(reply_rx),
            responsive: AtomicBool::new(true),
            closed: CancellationToken::new(),
            close_reason: StdMutex::new(None),
        }
    }

    /// Queue a reply as if the operator had sent it
    pub fn push_reply(&self, reply: OperatorReply) -> bool {
        !self.closed.is_cancelled() && self.reply_tx.send(reply).is_ok()
    }

    pub fn events(&self) -> Vec<ProcessEvent> {
        self.lock_events().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn events_named(&self, name: &str) -> Vec<ProcessEvent> {
        self.lock_events()
            .iter()
            .filter(|(_, e)| e.name() == name)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn last_event(&self) -> Option<ProcessEvent> {
        self.lock_events().last().map(|(_, e)| e.clone())
    }

    /// Wait until an event named `name` has been recorded
    pub async fn wait_for_event(&self, name: &str, timeout: Duration) -> Option<ProcessEvent> {
        let found = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.event_added.notified();
                if let Some(event) = self.events_named(name).into_iter().last() {
                    return event;
                }
                notified.await;
            }
        })
        .await;
        found.ok()
    }

    /// Wait until at least `count` events named `name` have been recorded
    /// and return the newest
    pub async fn wait_for_nth(
        &self,
        name: &str,
        count: usize,
        timeout: Duration,
    ) -> Option<ProcessEvent> {
        let found = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.event_added.notified();
                let events = self.events_named(name);
                if events.len() >= count {
                    if let Some(event) = events.into_iter().last() {
                        return event;
                    }
                }
                notified.await;
            }
        })
        .await;
        found.ok()
    }

    /// Stop answering keepalives while staying nominally open
    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
    }

    /// The remote end went away
    pub fn simulate_drop(&self) {
        self.set_responsive(false);
        self.closed.cancel();
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_events(&self) -> std::sync::MutexGuard<'_, Vec<(String, ProcessEvent)>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl NotificationChannel for MemoryChannel {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    async fn send(&self, process_id: &str, event: &ProcessEvent) {
        if self.closed.is_cancelled() {
            debug!(channel_id = %self.channel_id, event = event.name(), "Channel closed, dropping event");
            return;
        }
        self.lock_events()
            .push((process_id.to_string(), event.clone()));
        self.event_added.notify_waiters();
    }

    async fn receive(&self, _process_id: &str) -> Option<OperatorReply> {
        let mut rx = self.reply_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => None,
            reply = rx.recv() => reply,
        }
    }

    async fn keepalive(&self) -> bool {
        !self.closed.is_cancelled() && self.responsive.load(Ordering::SeqCst)
    }

    async fn close(&self, reason: &str) {
        if self.closed.is_cancelled() {
            return;
        }
        *self.close_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.to_string());
        self.closed.cancel();
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::OperatorResponse;
    use crate::steps::Step;

    #[tokio::test]
    async fn test_records_events_and_replies() {
        let channel = MemoryChannel::new("c-1");
        channel
            .send("p-1", &ProcessEvent::StepStarted { step: Step::Start })
            .await;
        assert_eq!(channel.events_named("step_started").len(), 1);

        assert!(channel.push_reply(OperatorReply::new(OperatorResponse::Approve)));
        let reply = channel.receive("p-1").await.unwrap();
        assert_eq!(reply.response, OperatorResponse::Approve);
    }

    #[tokio::test]
    async fn test_drop_ends_receive_and_keepalive() {
        let channel = MemoryChannel::new("c-1");
        channel.simulate_drop();
        assert!(!channel.keepalive().await);
        assert!(channel.receive("p-1").await.is_none());
        channel
            .send("p-1", &ProcessEvent::StepStarted { step: Step::Start })
            .await;
        assert!(channel.events().is_empty());
    }

    #[tokio::test]
    async fn test_close_records_reason() {
        let channel = MemoryChannel::new("c-1");
        channel.close("superseded").await;
        assert!(!channel.is_open());
        assert_eq!(channel.close_reason().as_deref(), Some("superseded"));
    }

    #[tokio::test]
    async fn test_wait_for_event() {
        let channel = std::sync::Arc::new(MemoryChannel::new("c-1"));
        let sender = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sender
                .send("p-1", &ProcessEvent::Completed { title: None })
                .await;
        });
        let event = channel
            .wait_for_event("completed", Duration::from_secs(1))
            .await;
        assert!(matches!(event, Some(ProcessEvent::Completed { .. })));
    }
}
