//! Snapshot chains, restore as checkout and storage failures


use draftflow::agent::TelemetrySink;
use draftflow::context::ProcessStatus;
use draftflow::error::OrchestratorError;
use draftflow::gate::OperatorResponse;
use draftflow::persistence::{FileDocumentStore, PersistenceError, PersistenceGateway};
use draftflow::steps::Step;
use draftflow::testing::{FlakyStore, ScriptedAgent};
use std::sync::Arc;
use test_helpers::*;

/// Drive a process to the outline approval and return its id
async fn run_to_outline(rig: &TestRig, channel: &Arc<draftflow::transport::MemoryChannel>) -> String {
    let process_id = rig
        .orchestrator
        .start("alice", inputs(), Some(channel.clone()))
        .await
        .unwrap();
    answer_nth(rig, channel, &process_id, 1, OperatorResponse::SelectCandidate { index: 0 }).await;
    channel.wait_for_nth("input_requested", 2, WAIT).await.unwrap();
    process_id
}

#[tokio::test]
async fn test_snapshots_chain_through_parents() {
    let rig = rig(ScriptedAgent::happy_path());
    let channel = channel("op");
    let process_id = run_to_outline(&rig, &channel).await;

    let snapshots = rig.orchestrator.snapshots(&process_id).await.unwrap();
    let steps: Vec<Step> = snapshots.iter().map(|s| s.step).collect();
    assert_eq!(
        steps,
        vec![
            Step::GenerateTopics,
            Step::SelectTopic,
            Step::PlanResearch,
            Step::Research,
            Step::Synthesis,
            Step::GenerateOutline,
        ]
    );
    assert!(snapshots[0].parent_id.is_none());
    for pair in snapshots.windows(2) {
        assert_eq!(pair[1].parent_id.as_deref(), Some(pair[0].snapshot_id.as_str()));
    }
    let heads: Vec<_> = snapshots.iter().filter(|s| s.is_head).collect();
    assert_eq!(heads.len(), 1);
    assert_eq!(heads[0].step, Step::GenerateOutline);
    assert_eq!(heads[0].resumes_at, Step::ApproveOutline);

    rig.orchestrator.cancel(&process_id).await.unwrap();
}

#[tokio::test]
async fn test_restore_while_waiting_releases_and_branches() {
    let rig = rig(ScriptedAgent::happy_path());
    let channel = channel("op");
    let process_id = run_to_outline(&rig, &channel).await;

    let before = rig.orchestrator.snapshots(&process_id).await.unwrap();
    let old_head = before.iter().find(|s| s.is_head).unwrap().snapshot_id.clone();
    let topics = before
        .iter()
        .find(|s| s.step == Step::GenerateTopics)
        .unwrap()
        .snapshot_id
        .clone();

    let restored = rig
        .orchestrator
        .restore(&process_id, &topics, "alice")
        .await
        .unwrap();
    assert_eq!(restored.current_step, Step::SelectTopic);
    assert!(restored.artifacts.selected_topic.is_none());
    assert!(!rig.orchestrator.is_running(&process_id));

    rig.orchestrator.resume(&process_id).await.unwrap();
    answer_nth(&rig, &channel, &process_id, 3, OperatorResponse::SelectCandidate { index: 1 }).await;
    channel.wait_for_nth("input_requested", 4, WAIT).await.unwrap();

    let ctx = rig.gateway.load(&process_id).await.unwrap();
    assert_eq!(ctx.artifacts.selected_topic.unwrap().title, "Ownership for managers");

    // the abandoned branch is still stored but no longer reachable from HEAD
    let head = ctx.head_snapshot_id.unwrap();
    let lineage = rig.gateway.lineage(&head).await.unwrap();
    assert!(lineage.iter().all(|s| s.snapshot_id != old_head));
    assert_eq!(lineage.last().unwrap().snapshot_id, topics);
    assert!(rig.gateway.get_snapshot(&old_head).await.is_ok());

    let select = lineage.iter().find(|s| s.step == Step::SelectTopic).unwrap();
    assert_eq!(select.parent_id.as_deref(), Some(topics.as_str()));

    rig.orchestrator.cancel(&process_id).await.unwrap();
}

#[tokio::test]
async fn test_restore_by_another_owner_is_refused() {
    let rig = rig(ScriptedAgent::happy_path());
    let channel = channel("op");
    let process_id = rig
        .orchestrator
        .start("alice", inputs(), Some(channel.clone()))
        .await
        .unwrap();
    channel.wait_for_nth("input_requested", 1, WAIT).await.unwrap();
    let snapshot = rig.orchestrator.snapshots(&process_id).await.unwrap()[0]
        .snapshot_id
        .clone();
    rig.orchestrator.cancel(&process_id).await.unwrap();
    rig.orchestrator.wait(&process_id).await.unwrap();

    let err = rig
        .orchestrator
        .restore(&process_id, &snapshot, "mallory")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Persistence(PersistenceError::ProcessNotFound { .. })
    ));

    let err = rig
        .orchestrator
        .restore(&process_id, "no-such-snapshot", "alice")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Persistence(PersistenceError::SnapshotNotFound { .. })
    ));

    // restoring a cancelled process brings it back to life
    let ctx = rig
        .orchestrator
        .restore(&process_id, &snapshot, "alice")
        .await
        .unwrap();
    assert_eq!(ctx.current_step, Step::SelectTopic);
    assert_ne!(ctx.status, ProcessStatus::Cancelled);
}

#[tokio::test]
async fn test_restore_during_autonomous_work_is_refused() {
    let rig = rig(ScriptedAgent::happy_path().with_hold("researcher"));
    let channel = channel("op");
    let process_id = rig
        .orchestrator
        .start("alice", inputs(), Some(channel.clone()))
        .await
        .unwrap();
    answer_nth(&rig, &channel, &process_id, 1, OperatorResponse::SelectCandidate { index: 0 }).await;
    let snapshot = rig.orchestrator.snapshots(&process_id).await.unwrap()[0]
        .snapshot_id
        .clone();

    let err = rig
        .orchestrator
        .restore(&process_id, &snapshot, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyRunning { .. }));

    rig.agent.release("researcher", 3);
    channel.wait_for_nth("input_requested", 2, WAIT).await.unwrap();
    rig.orchestrator.cancel(&process_id).await.unwrap();
}

#[tokio::test]
async fn test_save_survives_a_single_write_failure() {
    let store = Arc::new(FlakyStore::new());
    let rig = rig_with(ScriptedAgent::happy_path(), settings(), store.clone(), None);

    store.fail_next_upserts(1);
    let ctx = rig.orchestrator.create("alice", inputs()).await.unwrap();
    let loaded = rig.gateway.load(&ctx.process_id).await.unwrap();
    assert_eq!(loaded.process_id, ctx.process_id);
    assert_eq!(store.upserts(), 2);
}

#[tokio::test]
async fn test_telemetry_failures_do_not_fail_the_run() {
    let store = Arc::new(FlakyStore::new());
    store.fail_table("telemetry");
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(PersistenceGateway::new(store.clone()));
    let rig = rig_with(ScriptedAgent::happy_path(), settings(), store, Some(telemetry));
    let channel = channel("op");

    let process_id = rig
        .orchestrator
        .start("alice", inputs(), Some(channel.clone()))
        .await
        .unwrap();
    channel.wait_for_nth("input_requested", 1, WAIT).await.unwrap();

    let view = rig.orchestrator.status(&process_id).await.unwrap();
    assert_eq!(view.status, ProcessStatus::AwaitingInput);
    assert!(rig.gateway.telemetry_for(&process_id).await.unwrap().is_empty());
    rig.orchestrator.cancel(&process_id).await.unwrap();
}

#[tokio::test]
async fn test_telemetry_is_stored_per_invocation() {
    let store = Arc::new(FlakyStore::new());
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(PersistenceGateway::new(store.clone()));
    let rig = rig_with(ScriptedAgent::happy_path(), settings(), store, Some(telemetry));
    let channel = channel("op");

    let process_id = rig
        .orchestrator
        .start("alice", inputs(), Some(channel.clone()))
        .await
        .unwrap();
    channel.wait_for_nth("input_requested", 1, WAIT).await.unwrap();

    let records = rig.gateway.telemetry_for(&process_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].agent_id, "topic_generator");
    rig.orchestrator.cancel(&process_id).await.unwrap();
}

#[tokio::test]
async fn test_file_store_keeps_processes_across_orchestrators() {
    let dir = tempfile::tempdir().unwrap();
    let first = rig_with(
        ScriptedAgent::happy_path(),
        settings(),
        Arc::new(FileDocumentStore::new(dir.path())),
        None,
    );
    let channel = channel("op");
    let process_id = first
        .orchestrator
        .start("alice", inputs(), Some(channel.clone()))
        .await
        .unwrap();
    channel.wait_for_nth("input_requested", 1, WAIT).await.unwrap();
    first.orchestrator.cancel(&process_id).await.unwrap();
    first.orchestrator.wait(&process_id).await.unwrap();

    let second = rig_with(
        ScriptedAgent::happy_path(),
        settings(),
        Arc::new(FileDocumentStore::new(dir.path())),
        None,
    );
    let view = second.orchestrator.status(&process_id).await.unwrap();
    assert_eq!(view.status, ProcessStatus::Cancelled);
    assert_eq!(second.orchestrator.snapshots(&process_id).await.unwrap().len(), 1);
    assert!(second.gateway.archived(&process_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_second_orchestrator_cannot_drive_a_running_process() {
    let dir = tempfile::tempdir().unwrap();
    let first = rig_with(
        ScriptedAgent::happy_path().with_hold("researcher"),
        settings(),
        Arc::new(FileDocumentStore::new(dir.path())),
        None,
    );
    let channel = channel("op");
    let process_id = first
        .orchestrator
        .start("alice", inputs(), Some(channel.clone()))
        .await
        .unwrap();
    answer_nth(&first, &channel, &process_id, 1, OperatorResponse::SelectCandidate { index: 0 }).await;

    let second = rig_with(
        ScriptedAgent::happy_path(),
        settings(),
        Arc::new(FileDocumentStore::new(dir.path())),
        None,
    );
    let err = second.orchestrator.resume(&process_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyRunning { .. }));
    assert_eq!(second.agent.calls("researcher"), 0);

    first.agent.release("researcher", 3);
    channel.wait_for_nth("input_requested", 2, WAIT).await.unwrap();
    first.orchestrator.cancel(&process_id).await.unwrap();
    first.orchestrator.wait(&process_id).await.unwrap();

    assert!(!dir.path().join("leases").join(format!("{process_id}.lock")).exists());
}
