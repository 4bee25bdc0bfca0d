//! Execution context for one pipeline run
//!
//! The context is the full mutable state of a process. It is owned by the
//! single active scheduler for its process id and is what the persistence
//! gateway stores, snapshots and restores.

use crate::error::ErrorKind;
use crate::gate::InputRequest;
use crate::steps::{Step, StepKind};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ProcessId = String;

/// Operator-supplied parameters for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineInputs {
    pub brief: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_words: Option<u32>,
}

impl PipelineInputs {
    pub fn new<S: Into<String>>(brief: S) -> Self {
        Self {
            brief: brief.into(),
            audience: None,
            tone: None,
            target_words: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    AwaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::Failed | ProcessStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TopicCandidate {
    pub title: String,
    #[serde(default)]
    pub angle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchFinding {
    /// Position of the query in the planned list
    pub query_index: usize,
    pub query: String,
    pub summary: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OutlineSection {
    pub heading: String,
    #[serde(default)]
    pub points: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Outline {
    pub title: String,
    pub sections: Vec<OutlineSection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftOrigin {
    Generated,
    OperatorEdit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftRevision {
    pub revision: u32,
    pub origin: DraftOrigin,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FinalArticle {
    pub title: String,
    pub content: String,
}

/// Everything the pipeline has produced so far
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default)]
    pub topic_candidates: Vec<TopicCandidate>,
    /// Titles the operator sent back for regeneration
    #[serde(default)]
    pub rejected_topics: Vec<String>,
    #[serde(default)]
    pub selected_topic: Option<TopicCandidate>,
    #[serde(default)]
    pub research_queries: Vec<String>,
    #[serde(default)]
    pub research_results: Vec<ResearchFinding>,
    #[serde(default)]
    pub research_failures: usize,
    #[serde(default)]
    pub synthesis: Option<String>,
    #[serde(default)]
    pub outline: Option<Outline>,
    #[serde(default)]
    pub drafts: Vec<DraftRevision>,
    #[serde(default)]
    pub manuscript: Option<String>,
    #[serde(default)]
    pub final_article: Option<FinalArticle>,
}

impl Artifacts {
    pub fn latest_draft(&self) -> Option<&DraftRevision> {
        self.drafts.last()
    }

    pub fn push_draft(&mut self, origin: DraftOrigin, content: String) -> u32 {
        let revision = self.drafts.last().map(|d| d.revision + 1).unwrap_or(1);
        self.drafts.push(DraftRevision {
            revision,
            origin,
            content,
        });
        revision
    }

    /// Discard what `producer` generated so it can run again
    pub fn discard_output_of(&mut self, producer: Step) {
        match producer {
            Step::GenerateTopics => {
                self.rejected_topics
                    .extend(self.topic_candidates.drain(..).map(|c| c.title));
                self.selected_topic = None;
            }
            Step::GenerateOutline => self.outline = None,
            Step::WriteDraft => {
                if matches!(
                    self.drafts.last(),
                    Some(DraftRevision {
                        origin: DraftOrigin::Generated,
                        ..
                    })
                ) {
                    self.drafts.pop();
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    Pipeline,
    Agent,
    Operator,
}

/// One exchange in the multi-turn history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub step: Step,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// Error recorded on the context before a run ends in `error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub step: Step,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Running totals across all agent invocations of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub invocations: u64,
    pub attempts: u64,
    pub tokens: u64,
    /// Cost in millionths of a dollar
    pub cost_micros: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub process_id: ProcessId,
    pub owner_id: String,
    pub inputs: PipelineInputs,
    pub current_step: Step,
    pub status: ProcessStatus,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default)]
    pub pending_input: Option<InputRequest>,
    #[serde(default)]
    pub conversation: Vec<ConversationTurn>,
    #[serde(default)]
    pub last_error: Option<ErrorRecord>,
    #[serde(default)]
    pub head_snapshot_id: Option<String>,
    #[serde(default)]
    pub usage: UsageTotals,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new<S: Into<String>>(owner_id: S, inputs: PipelineInputs) -> Self {
        let now = Utc::now();
        Self {
            process_id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            inputs,
            current_step: Step::Start,
            status: ProcessStatus::Running,
            artifacts: Artifacts::default(),
            pending_input: None,
            conversation: Vec::new(),
            last_error: None,
            head_snapshot_id: None,
            usage: UsageTotals::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `step` and derive the status from its classification
    pub fn advance_to(&mut self, step: Step) {
        self.current_step = step;
        self.status = match step {
            Step::Completed => ProcessStatus::Completed,
            Step::Error => ProcessStatus::Failed,
            Step::Cancelled => ProcessStatus::Cancelled,
            _ if step.kind() == StepKind::UserInputRequired && self.pending_input.is_some() => {
                ProcessStatus::AwaitingInput
            }
            _ => ProcessStatus::Running,
        };
        if step.kind() != StepKind::UserInputRequired {
            self.pending_input = None;
        }
        self.touch();
    }

    pub fn set_pending_input(&mut self, request: InputRequest) {
        self.pending_input = Some(request);
        self.status = ProcessStatus::AwaitingInput;
        self.touch();
    }

    pub fn clear_pending_input(&mut self) {
        self.pending_input = None;
        if self.status == ProcessStatus::AwaitingInput {
            self.status = ProcessStatus::Running;
        }
        self.touch();
    }

    pub fn record_turn<S: Into<String>>(
        &mut self,
        role: TurnRole,
        agent_id: Option<&str>,
        content: S,
    ) {
        self.conversation.push(ConversationTurn {
            role,
            step: self.current_step,
            agent_id: agent_id.map(str::to_string),
            content: content.into(),
            at: Utc::now(),
        });
        self.touch();
    }

    pub fn record_error<S: Into<String>>(&mut self, kind: ErrorKind, step: Step, message: S) {
        self.last_error = Some(ErrorRecord {
            kind,
            step,
            message: message.into(),
            at: Utc::now(),
        });
        self.touch();
    }

    pub fn add_usage(&mut self, attempts: u32, tokens: u64, cost_micros: u64) {
        self.usage.invocations += 1;
        self.usage.attempts += u64::from(attempts);
        self.usage.tokens += tokens;
        self.usage.cost_micros += cost_micros;
    }

    pub fn is_terminal(&self) -> bool {
        self.current_step.is_terminal()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ExecutionContext {
        ExecutionContext::new("owner-1", PipelineInputs::new("Rust async runtimes"))
    }

    #[test]
    fn test_new_context_starts_running_at_start() {
        let ctx = context();
        assert_eq!(ctx.current_step, Step::Start);
        assert_eq!(ctx.status, ProcessStatus::Running);
        assert!(ctx.pending_input.is_none());
    }

    #[test]
    fn test_advance_to_terminal_sets_status() {
        let mut ctx = context();
        ctx.advance_to(Step::Completed);
        assert_eq!(ctx.status, ProcessStatus::Completed);
        ctx.advance_to(Step::Error);
        assert_eq!(ctx.status, ProcessStatus::Failed);
        ctx.advance_to(Step::Cancelled);
        assert_eq!(ctx.status, ProcessStatus::Cancelled);
        assert!(ctx.is_terminal());
    }

    #[test]
    fn test_push_draft_numbers_revisions() {
        let mut artifacts = Artifacts::default();
        assert_eq!(artifacts.push_draft(DraftOrigin::Generated, "a".into()), 1);
        assert_eq!(artifacts.push_draft(DraftOrigin::OperatorEdit, "b".into()), 2);
        assert_eq!(artifacts.latest_draft().unwrap().content, "b");
    }

    #[test]
    fn test_discard_output_of_topics_clears_selection() {
        let mut artifacts = Artifacts::default();
        artifacts.topic_candidates.push(TopicCandidate {
            title: "t".into(),
            angle: "a".into(),
        });
        artifacts.selected_topic = artifacts.topic_candidates.first().cloned();

        artifacts.discard_output_of(Step::GenerateTopics);

        assert!(artifacts.topic_candidates.is_empty());
        assert!(artifacts.selected_topic.is_none());
        assert_eq!(artifacts.rejected_topics, vec!["t".to_string()]);
    }

    #[test]
    fn test_discard_draft_keeps_operator_edits() {
        let mut artifacts = Artifacts::default();
        artifacts.push_draft(DraftOrigin::OperatorEdit, "edited".into());
        artifacts.discard_output_of(Step::WriteDraft);
        assert_eq!(artifacts.drafts.len(), 1);

        artifacts.push_draft(DraftOrigin::Generated, "generated".into());
        artifacts.discard_output_of(Step::WriteDraft);
        assert_eq!(artifacts.latest_draft().unwrap().content, "edited");
    }

    #[test]
    fn test_context_round_trips_through_json() {
        let mut ctx = context();
        ctx.record_turn(TurnRole::Operator, None, "hello");
        ctx.add_usage(2, 150, 1200);

        let json = serde_json::to_string(&ctx).unwrap();
        let back: ExecutionContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn test_unknown_stored_step_fails_to_load() {
        let ctx = context();
        let mut value = serde_json::to_value(&ctx).unwrap();
        value["current_step"] = serde_json::json!("legacy_step");
        let result: Result<ExecutionContext, _> = serde_json::from_value(value);
        assert!(result.is_err());
    }
}
