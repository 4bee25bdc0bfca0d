//! Operator requests, replies and their validation
//!
//! Every pause point accepts its own response type plus two universal
//! controls: regenerate the reviewed output, or replace it with edited
//! content and proceed. [`validate`] is the single place that decides
//! whether a reply fits the pending request, for live waits and for
//! replies that arrive after a timeout or restart alike.

use crate::context::{Outline, TopicCandidate};
use crate::steps::Step;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// What the operator is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    SelectTopic,
    ApproveOutline,
    ApproveDraft,
}

impl InputKind {
    pub fn for_step(step: Step) -> Option<Self> {
        match step {
            Step::SelectTopic => Some(InputKind::SelectTopic),
            Step::ApproveOutline => Some(InputKind::ApproveOutline),
            Step::ReviewDraft => Some(InputKind::ApproveDraft),
            _ => None,
        }
    }

    /// Name of the response this kind expects besides the universal controls
    pub fn expected_action(&self) -> &'static str {
        match self {
            InputKind::SelectTopic => "select_candidate",
            InputKind::ApproveOutline | InputKind::ApproveDraft => "approve",
        }
    }
}

/// A structured request published at a pause point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    pub request_id: String,
    pub process_id: String,
    pub step: Step,
    pub kind: InputKind,
    pub prompt: String,
    /// Number of selectable options, for selection requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_count: Option<usize>,
    pub payload: Value,
    pub issued_at: DateTime<Utc>,
}

/// Operator action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OperatorResponse {
    SelectCandidate { index: usize },
    Approve,
    Regenerate,
    EditAndProceed { content: Value },
}

impl OperatorResponse {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorResponse::SelectCandidate { .. } => "select_candidate",
            OperatorResponse::Approve => "approve",
            OperatorResponse::Regenerate => "regenerate",
            OperatorResponse::EditAndProceed { .. } => "edit_and_proceed",
        }
    }
}

/// An operator action, optionally pinned to the request it answers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub response: OperatorResponse,
}

impl OperatorReply {
    pub fn new(response: OperatorResponse) -> Self {
        Self {
            request_id: None,
            response,
        }
    }

    pub fn for_request<S: Into<String>>(request_id: S, response: OperatorResponse) -> Self {
        Self {
            request_id: Some(request_id.into()),
            response,
        }
    }
}

/// A reply that passed validation, ready to apply to the context
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    SelectTopic(usize),
    EditTopic(TopicCandidate),
    Approve,
    EditOutline(Outline),
    EditDraft(String),
    Regenerate,
}

impl GateDecision {
    /// Name of the operator action this decision came from
    pub fn action(&self) -> &'static str {
        match self {
            GateDecision::SelectTopic(_) => "select_candidate",
            GateDecision::Approve => "approve",
            GateDecision::Regenerate => "regenerate",
            GateDecision::EditTopic(_) | GateDecision::EditOutline(_) | GateDecision::EditDraft(_) => {
                "edit_and_proceed"
            }
        }
    }

    pub fn summary(&self) -> String {
        match self {
            GateDecision::SelectTopic(i) => format!("selected candidate {i}"),
            GateDecision::EditTopic(t) => format!("supplied topic '{}'", t.title),
            GateDecision::Approve => "approved".to_string(),
            GateDecision::EditOutline(o) => format!("edited outline '{}'", o.title),
            GateDecision::EditDraft(d) => format!("edited draft ({} chars)", d.len()),
            GateDecision::Regenerate => "requested regeneration".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("No pending input request for process {process_id}")]
    NoPendingRequest { process_id: String },

    #[error("Reply targets request {got}, but {expected} is pending")]
    StaleRequest { expected: String, got: String },

    #[error("{action} is not accepted here; expected {expected}, regenerate or edit_and_proceed")]
    UnexpectedAction {
        action: &'static str,
        expected: &'static str,
    },

    #[error("Candidate {index} does not exist ({available} available)")]
    OptionOutOfRange { index: usize, available: usize },

    #[error("Edited content is invalid: {reason}")]
    InvalidEdit { reason: String },
}

/// Check `reply` against the pending `request`
pub fn validate(request: &InputRequest, reply: &OperatorReply) -> Result<GateDecision, GateError> {
    if let Some(got) = &reply.request_id {
        if got != &request.request_id {
            return Err(GateError::StaleRequest {
                expected: request.request_id.clone(),
                got: got.clone(),
            });
        }
    }

    let unexpected = || GateError::UnexpectedAction {
        action: reply.response.name(),
        expected: request.kind.expected_action(),
    };

    match (&reply.response, request.kind) {
        (OperatorResponse::Regenerate, _) => Ok(GateDecision::Regenerate),

        (OperatorResponse::SelectCandidate { index }, InputKind::SelectTopic) => {
            let available = request.option_count.unwrap_or(0);
            if *index < available {
                Ok(GateDecision::SelectTopic(*index))
            } else {
                Err(GateError::OptionOutOfRange {
                    index: *index,
                    available,
                })
            }
        }
        (OperatorResponse::SelectCandidate { .. }, _) => Err(unexpected()),

        (OperatorResponse::Approve, InputKind::ApproveOutline | InputKind::ApproveDraft) => {
            Ok(GateDecision::Approve)
        }
        (OperatorResponse::Approve, InputKind::SelectTopic) => Err(unexpected()),

        (OperatorResponse::EditAndProceed { content }, kind) => edit_decision(kind, content),
    }
}

fn edit_decision(kind: InputKind, content: &Value) -> Result<GateDecision, GateError> {
    let invalid = |reason: &str| GateError::InvalidEdit {
        reason: reason.to_string(),
    };

    match kind {
        InputKind::SelectTopic => {
            let topic = match content {
                Value::String(title) => TopicCandidate {
                    title: title.clone(),
                    angle: String::new(),
                },
                other => serde_json::from_value(other.clone())
                    .map_err(|e| invalid(&format!("expected a topic title or object: {e}")))?,
            };
            if topic.title.trim().is_empty() {
                return Err(invalid("topic title is empty"));
            }
            Ok(GateDecision::EditTopic(topic))
        }
        InputKind::ApproveOutline => {
            let outline: Outline = serde_json::from_value(content.clone())
                .map_err(|e| invalid(&format!("expected an outline: {e}")))?;
            if outline.sections.is_empty() {
                return Err(invalid("outline has no sections"));
            }
            Ok(GateDecision::EditOutline(outline))
        }
        InputKind::ApproveDraft => match content.as_str() {
            Some(text) if !text.trim().is_empty() => Ok(GateDecision::EditDraft(text.to_string())),
            Some(_) => Err(invalid("draft is empty")),
            None => Err(invalid("expected draft text")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(kind: InputKind, options: Option<usize>) -> InputRequest {
        InputRequest {
            request_id: "req-1".to_string(),
            process_id: "p-1".to_string(),
            step: Step::SelectTopic,
            kind,
            prompt: "pick".to_string(),
            option_count: options,
            payload: json!({}),
            issued_at: Utc::now(),
        }
    }

    #[test]
    fn test_reply_wire_format() {
        let reply: OperatorReply =
            serde_json::from_value(json!({"action": "select_candidate", "index": 2})).unwrap();
        assert_eq!(reply.response, OperatorResponse::SelectCandidate { index: 2 });
        assert_eq!(reply.request_id, None);

        let reply: OperatorReply =
            serde_json::from_value(json!({"request_id": "r", "action": "regenerate"})).unwrap();
        assert_eq!(reply.request_id.as_deref(), Some("r"));
        assert_eq!(reply.response, OperatorResponse::Regenerate);
    }

    #[test]
    fn test_selection_within_range() {
        let req = request(InputKind::SelectTopic, Some(3));
        let decision = validate(&req, &OperatorReply::new(OperatorResponse::SelectCandidate { index: 2 }));
        assert_eq!(decision, Ok(GateDecision::SelectTopic(2)));
    }

    #[test]
    fn test_selection_out_of_range_rejected() {
        let req = request(InputKind::SelectTopic, Some(3));
        let err = validate(&req, &OperatorReply::new(OperatorResponse::SelectCandidate { index: 3 }))
            .unwrap_err();
        assert_eq!(err, GateError::OptionOutOfRange { index: 3, available: 3 });
    }

    #[test]
    fn test_wrong_action_rejected() {
        let req = request(InputKind::SelectTopic, Some(3));
        let err = validate(&req, &OperatorReply::new(OperatorResponse::Approve)).unwrap_err();
        assert!(matches!(err, GateError::UnexpectedAction { action: "approve", .. }));

        let req = request(InputKind::ApproveDraft, None);
        let err = validate(&req, &OperatorReply::new(OperatorResponse::SelectCandidate { index: 0 }))
            .unwrap_err();
        assert!(matches!(err, GateError::UnexpectedAction { .. }));
    }

    #[test]
    fn test_universal_controls_accepted_everywhere() {
        for kind in [InputKind::SelectTopic, InputKind::ApproveOutline, InputKind::ApproveDraft] {
            let req = request(kind, Some(1));
            assert_eq!(
                validate(&req, &OperatorReply::new(OperatorResponse::Regenerate)),
                Ok(GateDecision::Regenerate)
            );
        }
    }

    #[test]
    fn test_stale_request_id_rejected() {
        let req = request(InputKind::ApproveDraft, None);
        let err = validate(&req, &OperatorReply::for_request("old", OperatorResponse::Approve))
            .unwrap_err();
        assert!(matches!(err, GateError::StaleRequest { .. }));
    }

    #[test]
    fn test_edit_topic_from_string_or_object() {
        let req = request(InputKind::SelectTopic, Some(2));
        let from_string = validate(
            &req,
            &OperatorReply::new(OperatorResponse::EditAndProceed {
                content: json!("My own topic"),
            }),
        )
        .unwrap();
        assert!(matches!(from_string, GateDecision::EditTopic(t) if t.title == "My own topic"));

        let from_object = validate(
            &req,
            &OperatorReply::new(OperatorResponse::EditAndProceed {
                content: json!({"title": "T", "angle": "A"}),
            }),
        )
        .unwrap();
        assert!(matches!(from_object, GateDecision::EditTopic(t) if t.angle == "A"));
    }

    #[test]
    fn test_edit_outline_requires_sections() {
        let req = request(InputKind::ApproveOutline, None);
        let err = validate(
            &req,
            &OperatorReply::new(OperatorResponse::EditAndProceed {
                content: json!({"title": "T", "sections": []}),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, GateError::InvalidEdit { .. }));
    }

    #[test]
    fn test_edit_draft_requires_text() {
        let req = request(InputKind::ApproveDraft, None);
        assert!(validate(
            &req,
            &OperatorReply::new(OperatorResponse::EditAndProceed { content: json!(42) })
        )
        .is_err());
        assert_eq!(
            validate(
                &req,
                &OperatorReply::new(OperatorResponse::EditAndProceed {
                    content: json!("Final words")
                })
            ),
            Ok(GateDecision::EditDraft("Final words".to_string()))
        );
    }
}
