//! Pause point requests and the effect of operator decisions

use crate::context::{DraftOrigin, ExecutionContext};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::gate::{GateDecision, InputKind, InputRequest};
use crate::steps::{self, Step, StepError};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

/// Assemble the request a pause point publishes from what the context holds
pub fn build_request(ctx: &ExecutionContext, step: Step) -> OrchestratorResult<InputRequest> {
    let kind = InputKind::for_step(step)
        .ok_or_else(|| OrchestratorError::internal(format!("{step} is not a pause point")))?;
    let artifacts = &ctx.artifacts;

    let (prompt, option_count, payload) = match kind {
        InputKind::SelectTopic => {
            if artifacts.topic_candidates.is_empty() {
                return Err(OrchestratorError::internal("no topic candidates to select from"));
            }
            (
                "Select a topic, supply your own, or ask for new candidates",
                Some(artifacts.topic_candidates.len()),
                json!({ "candidates": artifacts.topic_candidates }),
            )
        }
        InputKind::ApproveOutline => {
            let outline = artifacts
                .outline
                .as_ref()
                .ok_or_else(|| OrchestratorError::internal("no outline to approve"))?;
            (
                "Approve the outline, edit it, or ask for a new one",
                None,
                json!({ "outline": outline }),
            )
        }
        InputKind::ApproveDraft => {
            let draft = artifacts
                .latest_draft()
                .ok_or_else(|| OrchestratorError::internal("no draft to review"))?;
            (
                "Approve the draft, edit it, or ask for a rewrite",
                None,
                json!({ "revision": draft.revision, "draft": draft.content }),
            )
        }
    };

    Ok(InputRequest {
        request_id: Uuid::new_v4().to_string(),
        process_id: ctx.process_id.clone(),
        step,
        kind,
        prompt: prompt.to_string(),
        option_count,
        payload,
        issued_at: Utc::now(),
    })
}

/// Apply an accepted decision at pause point `step` and return the step to
/// continue from. The pending request is cleared either way.
pub fn apply_decision(
    ctx: &mut ExecutionContext,
    step: Step,
    decision: GateDecision,
) -> OrchestratorResult<Step> {
    let mismatch = |decision: &GateDecision| {
        OrchestratorError::invalid_input(format!(
            "{} cannot be applied at {step}",
            decision.summary()
        ))
    };

    match (&decision, step) {
        (GateDecision::Regenerate, _) => {
            let producer = steps::producing_step(step).ok_or_else(|| mismatch(&decision))?;
            ctx.artifacts.discard_output_of(producer);
            ctx.clear_pending_input();
            return Ok(producer);
        }
        (GateDecision::SelectTopic(index), Step::SelectTopic) => {
            let topic = ctx
                .artifacts
                .topic_candidates
                .get(*index)
                .cloned()
                .ok_or_else(|| {
                    OrchestratorError::invalid_input(format!("candidate {index} does not exist"))
                })?;
            ctx.artifacts.selected_topic = Some(topic);
        }
        (GateDecision::EditTopic(topic), Step::SelectTopic) => {
            ctx.artifacts.selected_topic = Some(topic.clone());
        }
        (GateDecision::Approve, Step::ApproveOutline | Step::ReviewDraft) => {}
        (GateDecision::EditOutline(outline), Step::ApproveOutline) => {
            ctx.artifacts.outline = Some(outline.clone());
        }
        (GateDecision::EditDraft(content), Step::ReviewDraft) => {
            ctx.artifacts
                .push_draft(DraftOrigin::OperatorEdit, content.clone());
        }
        _ => return Err(mismatch(&decision)),
    }

    ctx.clear_pending_input();
    let target = steps::resume_target(step).ok_or(StepError::NoSuccessor {
        step,
        kind: step.kind(),
    })?;
    Ok(target)
}
