//! Events published to the operator

use crate::context::{ExecutionContext, ProcessStatus};
use crate::error::ErrorKind;
use crate::gate::InputRequest;
use crate::steps::Step;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProcessEvent {
    StepStarted {
        step: Step,
    },
    StepCompleted {
        step: Step,
        next: Step,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot_id: Option<String>,
    },
    Progress {
        step: Step,
        message: String,
    },
    InputRequested {
        request: InputRequest,
    },
    InputAccepted {
        request_id: String,
        action: String,
    },
    InputRejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        reason: String,
    },
    InputTimedOut {
        request_id: String,
        step: Step,
    },
    /// Progress surfaced to a channel that reattached to a running process
    Reattached {
        step: Step,
        status: ProcessStatus,
    },
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Failed {
        step: Step,
        kind: ErrorKind,
        message: String,
    },
    Cancelled {
        step: Step,
    },
}

impl ProcessEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessEvent::StepStarted { .. } => "step_started",
            ProcessEvent::StepCompleted { .. } => "step_completed",
            ProcessEvent::Progress { .. } => "progress",
            ProcessEvent::InputRequested { .. } => "input_requested",
            ProcessEvent::InputAccepted { .. } => "input_accepted",
            ProcessEvent::InputRejected { .. } => "input_rejected",
            ProcessEvent::InputTimedOut { .. } => "input_timed_out",
            ProcessEvent::Reattached { .. } => "reattached",
            ProcessEvent::Completed { .. } => "completed",
            ProcessEvent::Failed { .. } => "failed",
            ProcessEvent::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessEvent::Completed { .. } | ProcessEvent::Failed { .. } | ProcessEvent::Cancelled { .. }
        )
    }

    /// The terminal event describing a finished context, if it is finished
    pub fn terminal_for(ctx: &ExecutionContext) -> Option<Self> {
        match ctx.current_step {
            Step::Completed => Some(ProcessEvent::Completed {
                title: ctx.artifacts.final_article.as_ref().map(|a| a.title.clone()),
            }),
            Step::Error => {
                let (kind, message) = ctx
                    .last_error
                    .as_ref()
                    .map(|e| (e.kind, e.message.clone()))
                    .unwrap_or((ErrorKind::Internal, "unknown error".to_string()));
                let step = ctx.last_error.as_ref().map(|e| e.step).unwrap_or(Step::Error);
                Some(ProcessEvent::Failed { step, kind, message })
            }
            Step::Cancelled => Some(ProcessEvent::Cancelled {
                step: Step::Cancelled,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PipelineInputs;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ProcessEvent::StepStarted {
            step: Step::Research,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "step_started");
        assert_eq!(json["step"], "research");
        assert_eq!(event.name(), "step_started");
    }

    #[test]
    fn test_terminal_for_failed_context() {
        let mut ctx = ExecutionContext::new("o", PipelineInputs::new("b"));
        ctx.record_error(ErrorKind::FatalAgent, Step::WriteDraft, "auth");
        ctx.advance_to(Step::Error);

        match ProcessEvent::terminal_for(&ctx).unwrap() {
            ProcessEvent::Failed { step, kind, message } => {
                assert_eq!(step, Step::WriteDraft);
                assert_eq!(kind, ErrorKind::FatalAgent);
                assert_eq!(message, "auth");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_terminal_for_running_context_is_none() {
        let ctx = ExecutionContext::new("o", PipelineInputs::new("b"));
        assert!(ProcessEvent::terminal_for(&ctx).is_none());
    }
}
