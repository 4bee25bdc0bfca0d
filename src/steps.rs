//! Step catalog and state machine
//!
//! The pipeline is a closed set of named steps. Each step has exactly one
//! [`StepKind`] and a deterministic successor. All of it lives in one table,
//! [`CATALOG`], which is the only place step behavior is declared. Everything
//! else (scheduler dispatch, resilience decisions, persistence validation)
//! reads from it.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised by step lookup and catalog validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("Unknown step: {name}")]
    Unknown { name: String },

    #[error("Step {step} has no successor ({kind})")]
    NoSuccessor { step: Step, kind: StepKind },

    #[error("Step catalog is invalid: {reason}")]
    InvalidCatalog { reason: String },
}

/// Classification of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Machine-only work through the agent capability
    Autonomous,
    /// Pause point waiting on the operator
    UserInputRequired,
    /// Single local hop with no external call
    Transition,
    /// End of the run
    Terminal,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepKind::Autonomous => "autonomous",
            StepKind::UserInputRequired => "user_input_required",
            StepKind::Transition => "transition",
            StepKind::Terminal => "terminal",
        };
        f.write_str(s)
    }
}

/// Every stage of the content pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Step {
    Start,
    GenerateTopics,
    SelectTopic,
    PlanResearch,
    Research,
    Synthesis,
    GenerateOutline,
    ApproveOutline,
    WriteDraft,
    ReviewDraft,
    Assemble,
    Finalize,
    Completed,
    Error,
    Cancelled,
}

impl Step {
    pub const ALL: [Step; 15] = [
        Step::Start,
        Step::GenerateTopics,
        Step::SelectTopic,
        Step::PlanResearch,
        Step::Research,
        Step::Synthesis,
        Step::GenerateOutline,
        Step::ApproveOutline,
        Step::WriteDraft,
        Step::ReviewDraft,
        Step::Assemble,
        Step::Finalize,
        Step::Completed,
        Step::Error,
        Step::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Start => "start",
            Step::GenerateTopics => "generate_topics",
            Step::SelectTopic => "select_topic",
            Step::PlanResearch => "plan_research",
            Step::Research => "research",
            Step::Synthesis => "synthesis",
            Step::GenerateOutline => "generate_outline",
            Step::ApproveOutline => "approve_outline",
            Step::WriteDraft => "write_draft",
            Step::ReviewDraft => "review_draft",
            Step::Assemble => "assemble",
            Step::Finalize => "finalize",
            Step::Completed => "completed",
            Step::Error => "error",
            Step::Cancelled => "cancelled",
        }
    }

    /// Classification from the catalog
    pub fn kind(&self) -> StepKind {
        spec_for(*self).kind
    }

    pub fn is_terminal(&self) -> bool {
        self.kind() == StepKind::Terminal
    }

    pub fn is_pause_point(&self) -> bool {
        self.kind() == StepKind::UserInputRequired
    }

    /// Whether the run may continue at this step with no operator channel
    pub fn is_resilient(&self) -> bool {
        spec_for(*self).resilient
    }

    /// Agent bound to an autonomous step
    pub fn agent_id(&self) -> Option<&'static str> {
        spec_for(*self).agent
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .iter()
            .copied()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| StepError::Unknown {
                name: s.to_string(),
            })
    }
}

impl TryFrom<String> for Step {
    type Error = StepError;

    fn try_from(value: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        value.parse()
    }
}

impl From<Step> for String {
    fn from(step: Step) -> Self {
        step.as_str().to_string()
    }
}

/// One row of the catalog
#[derive(Debug, Clone, Copy)]
pub struct StepSpec {
    pub step: Step,
    pub kind: StepKind,
    /// Successor for autonomous and transition steps, or the step an accepted
    /// operator response moves to for pause points
    pub next: Option<Step>,
    /// For pause points: the autonomous step whose output the operator reviews
    pub producer: Option<Step>,
    pub resilient: bool,
    pub agent: Option<&'static str>,
}

const fn row(
    step: Step,
    kind: StepKind,
    next: Option<Step>,
    producer: Option<Step>,
    resilient: bool,
    agent: Option<&'static str>,
) -> StepSpec {
    StepSpec {
        step,
        kind,
        next,
        producer,
        resilient,
        agent,
    }
}

use StepKind::{Autonomous, Terminal, Transition, UserInputRequired};

/// The authoritative step table. Resilient steps are exactly the autonomous
/// and transition steps, which never hold a pending operator decision.
pub static CATALOG: [StepSpec; 15] = [
    row(Step::Start, Transition, Some(Step::GenerateTopics), None, true, None),
    row(
        Step::GenerateTopics,
        Autonomous,
        Some(Step::SelectTopic),
        None,
        true,
        Some("topic_generator"),
    ),
    row(
        Step::SelectTopic,
        UserInputRequired,
        Some(Step::PlanResearch),
        Some(Step::GenerateTopics),
        false,
        None,
    ),
    row(
        Step::PlanResearch,
        Autonomous,
        Some(Step::Research),
        None,
        true,
        Some("research_planner"),
    ),
    row(
        Step::Research,
        Autonomous,
        Some(Step::Synthesis),
        None,
        true,
        Some("researcher"),
    ),
    row(
        Step::Synthesis,
        Autonomous,
        Some(Step::GenerateOutline),
        None,
        true,
        Some("synthesizer"),
    ),
    row(
        Step::GenerateOutline,
        Autonomous,
        Some(Step::ApproveOutline),
        None,
        true,
        Some("outliner"),
    ),
    row(
        Step::ApproveOutline,
        UserInputRequired,
        Some(Step::WriteDraft),
        Some(Step::GenerateOutline),
        false,
        None,
    ),
    row(
        Step::WriteDraft,
        Autonomous,
        Some(Step::ReviewDraft),
        None,
        true,
        Some("writer"),
    ),
    row(
        Step::ReviewDraft,
        UserInputRequired,
        Some(Step::Assemble),
        Some(Step::WriteDraft),
        false,
        None,
    ),
    row(Step::Assemble, Transition, Some(Step::Finalize), None, true, None),
    row(
        Step::Finalize,
        Autonomous,
        Some(Step::Completed),
        None,
        true,
        Some("finalizer"),
    ),
    row(Step::Completed, Terminal, None, None, false, None),
    row(Step::Error, Terminal, None, None, false, None),
    row(Step::Cancelled, Terminal, None, None, false, None),
];

fn spec_for(step: Step) -> &'static StepSpec {
    // Rows are declared in the same order as Step::ALL
    &CATALOG[step as usize]
}

/// Look up a step by name. Unknown names are always an error.
pub fn resolve(name: &str) -> Result<Step, StepError> {
    name.parse()
}

pub fn classify(step: Step) -> StepKind {
    step.kind()
}

/// Successor of an autonomous or transition step
pub fn next(step: Step) -> Option<Step> {
    let spec = spec_for(step);
    match spec.kind {
        Autonomous | Transition => spec.next,
        UserInputRequired | Terminal => None,
    }
}

/// Like [`next`], but an error where the loop expects a successor
pub fn require_next(step: Step) -> Result<Step, StepError> {
    next(step).ok_or(StepError::NoSuccessor {
        step,
        kind: step.kind(),
    })
}

/// Where an accepted operator response at a pause point leads
pub fn resume_target(step: Step) -> Option<Step> {
    let spec = spec_for(step);
    match spec.kind {
        UserInputRequired => spec.next,
        _ => None,
    }
}

/// The autonomous step a pause point returns to on regenerate
pub fn producing_step(step: Step) -> Option<Step> {
    spec_for(step).producer
}

/// Every step reachable from `from` through successors, resume targets
/// and regenerate loops, plus the error and cancelled terminals which any
/// step can reach
pub fn reachable_from(from: Step) -> Vec<Step> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut queue = VecDeque::from([from, Step::Error, Step::Cancelled]);

    while let Some(step) = queue.pop_front() {
        if !seen.insert(step) {
            continue;
        }
        order.push(step);
        let spec = spec_for(step);
        for candidate in [spec.next, spec.producer].into_iter().flatten() {
            queue.push_back(candidate);
        }
    }

    order
}

/// Check the catalog exhaustively
pub fn validate() -> Result<(), StepError> {
    let invalid = |reason: String| Err(StepError::InvalidCatalog { reason });

    for (index, step) in Step::ALL.iter().enumerate() {
        if CATALOG[index].step != *step {
            return invalid(format!(
                "row {index} declares {} but {} was expected",
                CATALOG[index].step, step
            ));
        }
    }

    for spec in CATALOG.iter() {
        match spec.kind {
            Autonomous => {
                if spec.next.is_none() {
                    return invalid(format!("autonomous step {} has no successor", spec.step));
                }
                if spec.agent.is_none() {
                    return invalid(format!("autonomous step {} has no agent", spec.step));
                }
            }
            Transition => {
                if spec.next.is_none() {
                    return invalid(format!("transition step {} has no successor", spec.step));
                }
                if spec.agent.is_some() {
                    return invalid(format!("transition step {} binds an agent", spec.step));
                }
            }
            UserInputRequired => {
                if spec.agent.is_some() {
                    return invalid(format!("pause point {} binds an agent", spec.step));
                }
                if spec.next.is_none() {
                    return invalid(format!("pause point {} has no resume target", spec.step));
                }
                match spec.producer {
                    Some(producer) if producer.kind() == Autonomous => {}
                    _ => {
                        return invalid(format!(
                            "pause point {} has no autonomous producing step",
                            spec.step
                        ))
                    }
                }
            }
            Terminal => {
                if spec.next.is_some() || spec.producer.is_some() {
                    return invalid(format!("terminal step {} has an outgoing edge", spec.step));
                }
            }
        }

        if spec.resilient && !matches!(spec.kind, Autonomous | Transition) {
            return invalid(format!(
                "step {} is marked resilient but is {}",
                spec.step, spec.kind
            ));
        }
    }

    let reachable: HashSet<Step> = reachable_from(Step::Start).into_iter().collect();
    if !reachable.contains(&Step::Completed) {
        return invalid("completed is unreachable from start".to_string());
    }
    for step in Step::ALL {
        if !reachable.contains(&step) {
            return invalid(format!("step {step} is unreachable from start"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_valid() {
        validate().unwrap();
    }

    #[test]
    fn test_names_round_trip_through_from_str() {
        for step in Step::ALL {
            assert_eq!(step.as_str().parse::<Step>().unwrap(), step);
        }
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let err = resolve("publish_to_blog").unwrap_err();
        assert_eq!(
            err,
            StepError::Unknown {
                name: "publish_to_blog".to_string()
            }
        );
    }

    #[test]
    fn test_serde_rejects_unknown_step() {
        let result: Result<Step, _> = serde_json::from_str("\"mystery\"");
        assert!(result.is_err());

        let step: Step = serde_json::from_str("\"write_draft\"").unwrap();
        assert_eq!(step, Step::WriteDraft);
        assert_eq!(serde_json::to_string(&step).unwrap(), "\"write_draft\"");
    }

    #[test]
    fn test_next_is_none_for_pause_and_terminal() {
        assert_eq!(next(Step::SelectTopic), None);
        assert_eq!(next(Step::Completed), None);
        assert_eq!(next(Step::Start), Some(Step::GenerateTopics));
        assert_eq!(next(Step::Research), Some(Step::Synthesis));
    }

    #[test]
    fn test_require_next_fails_on_pause_point() {
        let err = require_next(Step::ReviewDraft).unwrap_err();
        assert!(matches!(err, StepError::NoSuccessor { .. }));
    }

    #[test]
    fn test_pause_points_resume_and_produce() {
        assert_eq!(resume_target(Step::SelectTopic), Some(Step::PlanResearch));
        assert_eq!(producing_step(Step::SelectTopic), Some(Step::GenerateTopics));
        assert_eq!(producing_step(Step::ApproveOutline), Some(Step::GenerateOutline));
        assert_eq!(producing_step(Step::ReviewDraft), Some(Step::WriteDraft));
        assert_eq!(resume_target(Step::Research), None);
    }

    #[test]
    fn test_resilient_set_matches_machine_steps() {
        for step in Step::ALL {
            let machine = matches!(step.kind(), Autonomous | Transition);
            assert_eq!(step.is_resilient(), machine, "{step}");
        }
    }

    #[test]
    fn test_every_step_is_reachable() {
        let reachable = reachable_from(Step::Start);
        assert_eq!(reachable.len(), Step::ALL.len());
    }

    #[test]
    fn test_autonomous_steps_have_agents() {
        assert_eq!(Step::Research.agent_id(), Some("researcher"));
        assert_eq!(Step::Assemble.agent_id(), None);
        assert_eq!(Step::SelectTopic.agent_id(), None);
    }
}
