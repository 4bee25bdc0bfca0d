//! Operator input at pause points
//!
//! Rejected replies, stale request ids, timeouts followed by late replies,
//! and replies that resume a process from storage after a restart.


use draftflow::context::ProcessStatus;
use draftflow::error::OrchestratorError;
use draftflow::gate::{OperatorReply, OperatorResponse};
use draftflow::persistence::InMemoryDocumentStore;
use draftflow::scheduler::SchedulerSettings;
use draftflow::steps::Step;
use draftflow::testing::ScriptedAgent;
use draftflow::transport::ProcessEvent;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

fn short_timeout() -> SchedulerSettings {
    SchedulerSettings {
        input_timeout: Duration::from_millis(100),
        ..settings()
    }
}

#[tokio::test]
async fn test_wrong_action_rejected_and_gate_keeps_waiting() {
    let rig = rig(ScriptedAgent::happy_path());
    let channel = channel("op");
    let process_id = rig
        .orchestrator
        .start("alice", inputs(), Some(channel.clone()))
        .await
        .unwrap();
    channel.wait_for_nth("input_requested", 1, WAIT).await.unwrap();

    let err = rig
        .orchestrator
        .respond(&process_id, reply(OperatorResponse::Approve))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidInput { .. }));
    let rejected = channel.wait_for_event("input_rejected", WAIT).await.unwrap();
    assert!(matches!(rejected, ProcessEvent::InputRejected { .. }));

    let err = rig
        .orchestrator
        .respond(&process_id, reply(OperatorResponse::SelectCandidate { index: 7 }))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Candidate 7 does not exist"));

    // still waiting on the same request
    assert!(rig.orchestrator.is_running(&process_id));
    assert_eq!(channel.events_named("input_requested").len(), 1);
    rig.orchestrator
        .respond(&process_id, reply(OperatorResponse::SelectCandidate { index: 1 }))
        .await
        .unwrap();
    channel.wait_for_nth("input_requested", 2, WAIT).await.unwrap();
    rig.orchestrator.cancel(&process_id).await.unwrap();
}

#[tokio::test]
async fn test_stale_request_id_rejected() {
    let rig = rig(ScriptedAgent::happy_path());
    let channel = channel("op");
    let process_id = rig
        .orchestrator
        .start("alice", inputs(), Some(channel.clone()))
        .await
        .unwrap();
    channel.wait_for_nth("input_requested", 1, WAIT).await.unwrap();

    let stale = OperatorReply::for_request("not-the-request", OperatorResponse::Regenerate);
    let err = rig.orchestrator.respond(&process_id, stale).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidInput { .. }));
    assert_eq!(rig.agent.calls("topic_generator"), 1);
    rig.orchestrator.cancel(&process_id).await.unwrap();
}

#[tokio::test]
async fn test_replies_arriving_on_the_channel_are_applied() {
    let rig = rig(ScriptedAgent::happy_path());
    let channel = channel("op");
    let process_id = rig
        .orchestrator
        .start("alice", inputs(), Some(channel.clone()))
        .await
        .unwrap();

    channel.wait_for_nth("input_requested", 1, WAIT).await.unwrap();
    assert!(channel.push_reply(reply(OperatorResponse::SelectCandidate { index: 0 })));
    let accepted = channel.wait_for_event("input_accepted", WAIT).await.unwrap();
    let ProcessEvent::InputAccepted { action, .. } = accepted else {
        panic!("expected input_accepted");
    };
    assert_eq!(action, "select_candidate");
    channel.wait_for_nth("input_requested", 2, WAIT).await.unwrap();
    rig.orchestrator.cancel(&process_id).await.unwrap();
}

#[tokio::test]
async fn test_timeout_keeps_process_awaiting_and_late_reply_resumes() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let rig = rig_with(ScriptedAgent::happy_path(), short_timeout(), store, None);
    let channel = channel("op");
    let process_id = rig
        .orchestrator
        .start("alice", inputs(), Some(channel.clone()))
        .await
        .unwrap();

    let timed_out = channel.wait_for_event("input_timed_out", WAIT).await.unwrap();
    assert!(matches!(
        timed_out,
        ProcessEvent::InputTimedOut {
            step: Step::SelectTopic,
            ..
        }
    ));
    let view = rig.orchestrator.wait(&process_id).await.unwrap();
    assert_eq!(view.status, ProcessStatus::AwaitingInput);
    assert_eq!(view.current_step, Step::SelectTopic);
    assert!(!rig.orchestrator.is_running(&process_id));

    let pending = rig
        .gateway
        .load(&process_id)
        .await
        .unwrap()
        .pending_input
        .unwrap();
    let late = OperatorReply::for_request(
        pending.request_id,
        OperatorResponse::SelectCandidate { index: 1 },
    );
    rig.orchestrator.respond(&process_id, late).await.unwrap();

    // the resumed run reaches the outline and times out there
    let view = rig.orchestrator.wait(&process_id).await.unwrap();
    assert_eq!(view.current_step, Step::ApproveOutline);
    assert_eq!(view.status, ProcessStatus::AwaitingInput);
    assert_eq!(channel.events_named("input_timed_out").len(), 2);
}

#[tokio::test]
async fn test_dormant_reply_resumes_after_restart() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let first = rig_with(ScriptedAgent::happy_path(), short_timeout(), store.clone(), None);
    let process_id = first.orchestrator.start("alice", inputs(), None).await.unwrap();
    let view = first.orchestrator.wait(&process_id).await.unwrap();
    assert_eq!(view.status, ProcessStatus::AwaitingInput);
    drop(first);

    let second = rig_with(ScriptedAgent::happy_path(), short_timeout(), store, None);
    let awaiting = second.orchestrator.awaiting_input().await.unwrap();
    assert!(awaiting.iter().any(|v| v.process_id == process_id));

    let bad = second
        .orchestrator
        .respond(&process_id, reply(OperatorResponse::Approve))
        .await;
    assert!(matches!(bad, Err(OrchestratorError::InvalidInput { .. })));

    second
        .orchestrator
        .respond(&process_id, reply(OperatorResponse::SelectCandidate { index: 2 }))
        .await
        .unwrap();
    let view = second.orchestrator.wait(&process_id).await.unwrap();
    assert_eq!(view.current_step, Step::ApproveOutline);

    let ctx = second.gateway.load(&process_id).await.unwrap();
    assert_eq!(ctx.artifacts.selected_topic.unwrap().title, "Rust at the edge");
    assert_eq!(second.agent.calls("topic_generator"), 0);
}

#[tokio::test]
async fn test_reply_to_process_not_waiting_is_refused() {
    let rig = rig(ScriptedAgent::happy_path());
    let mut inputs = inputs();
    inputs.brief = String::new();
    let process_id = rig.orchestrator.start("alice", inputs, None).await.unwrap();
    rig.orchestrator.wait(&process_id).await.unwrap();

    let err = rig
        .orchestrator
        .respond(&process_id, reply(OperatorResponse::Approve))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotAwaitingInput { .. }));
}
