//! User input gate
//!
//! A pause point publishes an [`InputRequest`] and waits, bounded by a
//! timeout and the run's cancellation token, for a reply that passes
//! [`validate`]. Invalid replies are rejected without ending the wait.
//! The pending request stays queryable so a reconnecting channel can have
//! it replayed.

pub mod request;

pub use request::{
    validate, GateDecision, GateError, InputKind, InputRequest, OperatorReply, OperatorResponse,
};

use crate::context::ProcessId;
use crate::observability::metrics::metrics;
use crate::session::SessionHandle;
use crate::transport::ProcessEvent;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// How a wait at a pause point ended
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Decided(GateDecision),
    TimedOut,
    /// The wait was released from outside, e.g. by a restore
    Released,
    Cancelled,
}

struct Waiter {
    request: InputRequest,
    responder: oneshot::Sender<GateDecision>,
}

/// Waits for operator replies, at most one per process
#[derive(Default)]
pub struct UserInputGate {
    waiters: DashMap<ProcessId, Waiter>,
}

impl UserInputGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `request` through the session's channel and wait for a
    /// valid reply
    pub async fn request(
        &self,
        session: &SessionHandle,
        request: InputRequest,
        timeout: Duration,
    ) -> GateOutcome {
        let process_id = session.process_id().to_string();
        let request_id = request.request_id.clone();
        let (tx, rx) = oneshot::channel();

        self.waiters.insert(
            process_id.clone(),
            Waiter {
                request: request.clone(),
                responder: tx,
            },
        );
        metrics().input_requested();
        info!(
            process_id = %process_id,
            request_id = %request_id,
            kind = ?request.kind,
            timeout_secs = timeout.as_secs(),
            "Waiting for operator input"
        );
        session.send(&ProcessEvent::InputRequested { request }).await;

        let cancel = session.cancel_token();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => GateOutcome::Cancelled,
            _ = tokio::time::sleep(timeout) => GateOutcome::TimedOut,
            reply = rx => match reply {
                Ok(decision) => GateOutcome::Decided(decision),
                Err(_) => GateOutcome::Released,
            },
        };

        self.waiters
            .remove_if(&process_id, |_, w| w.request.request_id == request_id);
        if outcome == GateOutcome::TimedOut {
            metrics().input_timeout();
        }
        debug!(process_id = %process_id, outcome = ?outcome, "Input wait ended");
        outcome
    }

    /// Hand `reply` to the waiting pause point. An invalid reply leaves the
    /// wait in place.
    pub fn deliver(&self, process_id: &str, reply: &OperatorReply) -> Result<GateDecision, GateError> {
        let no_pending = || GateError::NoPendingRequest {
            process_id: process_id.to_string(),
        };

        let (decision, request_id) = {
            let waiter = self.waiters.get(process_id).ok_or_else(no_pending)?;
            (validate(&waiter.request, reply)?, waiter.request.request_id.clone())
        };

        let (_, waiter) = self
            .waiters
            .remove_if(process_id, |_, w| w.request.request_id == request_id)
            .ok_or_else(no_pending)?;
        waiter
            .responder
            .send(decision.clone())
            .map_err(|_| no_pending())?;
        Ok(decision)
    }

    pub fn pending(&self, process_id: &str) -> Option<InputRequest> {
        self.waiters.get(process_id).map(|w| w.request.clone())
    }

    pub fn is_waiting(&self, process_id: &str) -> bool {
        self.waiters.contains_key(process_id)
    }

    /// Re-publish the pending request, if any, through the session's
    /// current channel
    pub async fn replay(&self, session: &SessionHandle) -> bool {
        match self.pending(session.process_id()) {
            Some(request) => {
                info!(
                    process_id = %session.process_id(),
                    request_id = %request.request_id,
                    "Replaying pending input request"
                );
                session.send(&ProcessEvent::InputRequested { request }).await;
                true
            }
            None => false,
        }
    }

    /// End a wait without a decision
    pub fn release(&self, process_id: &str) -> bool {
        self.waiters.remove(process_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::Step;
    use crate::transport::MemoryChannel;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn draft_request(process_id: &str) -> InputRequest {
        InputRequest {
            request_id: "req-1".to_string(),
            process_id: process_id.to_string(),
            step: Step::ReviewDraft,
            kind: InputKind::ApproveDraft,
            prompt: "Review".to_string(),
            option_count: None,
            payload: json!({"draft": "text"}),
            issued_at: Utc::now(),
        }
    }

    async fn session_with_channel() -> (Arc<SessionHandle>, Arc<MemoryChannel>) {
        let session = Arc::new(SessionHandle::new("p-1"));
        let channel = Arc::new(MemoryChannel::new("c-1"));
        session.swap_channel(channel.clone()).await;
        (session, channel)
    }

    #[tokio::test]
    async fn test_invalid_reply_keeps_waiting() {
        let gate = Arc::new(UserInputGate::new());
        let (session, channel) = session_with_channel().await;

        let waiter = {
            let gate = gate.clone();
            let session = session.clone();
            tokio::spawn(async move {
                gate.request(&session, draft_request("p-1"), Duration::from_secs(5))
                    .await
            })
        };
        while !gate.is_waiting("p-1") {
            tokio::task::yield_now().await;
        }

        let rejected = gate.deliver(
            "p-1",
            &OperatorReply::new(OperatorResponse::SelectCandidate { index: 0 }),
        );
        assert!(rejected.is_err());
        assert!(gate.is_waiting("p-1"));

        let accepted = gate.deliver("p-1", &OperatorReply::new(OperatorResponse::Approve));
        assert_eq!(accepted, Ok(GateDecision::Approve));
        assert_eq!(waiter.await.unwrap(), GateOutcome::Decided(GateDecision::Approve));
        assert!(!gate.is_waiting("p-1"));
        assert_eq!(channel.events_named("input_requested").len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_ends_wait() {
        let gate = UserInputGate::new();
        let (session, _channel) = session_with_channel().await;
        let outcome = gate
            .request(&session, draft_request("p-1"), Duration::from_millis(20))
            .await;
        assert_eq!(outcome, GateOutcome::TimedOut);
        assert!(gate.pending("p-1").is_none());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let gate = UserInputGate::new();
        let (session, _channel) = session_with_channel().await;
        session.cancel();
        let outcome = gate
            .request(&session, draft_request("p-1"), Duration::from_secs(30))
            .await;
        assert_eq!(outcome, GateOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_release_and_replay() {
        let gate = Arc::new(UserInputGate::new());
        let (session, channel) = session_with_channel().await;

        let waiter = {
            let gate = gate.clone();
            let session = session.clone();
            tokio::spawn(async move {
                gate.request(&session, draft_request("p-1"), Duration::from_secs(5))
                    .await
            })
        };
        while !gate.is_waiting("p-1") {
            tokio::task::yield_now().await;
        }

        assert!(gate.replay(&session).await);
        assert_eq!(channel.events_named("input_requested").len(), 2);

        assert!(gate.release("p-1"));
        assert_eq!(waiter.await.unwrap(), GateOutcome::Released);
        assert!(!gate.replay(&session).await);
    }

    #[test]
    fn test_deliver_without_wait() {
        let gate = UserInputGate::new();
        let err = gate
            .deliver("nope", &OperatorReply::new(OperatorResponse::Approve))
            .unwrap_err();
        assert!(matches!(err, GateError::NoPendingRequest { .. }));
    }
}
