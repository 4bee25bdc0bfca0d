//! Typed agent output
//!
//! Agents answer with a JSON object whose `status` field names the kind of
//! payload. [`AgentOutput::decode`] matches on that discriminant explicitly;
//! anything it does not know becomes [`AgentOutput::Unrecognized`] instead
//! of an untyped map. Each autonomous step declares the [`ExpectedShape`]
//! its agent must produce, with a JSON schema derived from the payload type.

use crate::context::{FinalArticle, Outline, TopicCandidate};
use crate::steps::Step;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CandidatesPayload {
    pub candidates: Vec<TopicCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QueriesPayload {
    pub queries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FindingsPayload {
    pub summary: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SynthesisPayload {
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DraftPayload {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    Candidates(CandidatesPayload),
    Queries(QueriesPayload),
    Findings(FindingsPayload),
    Synthesis(SynthesisPayload),
    Outline(Outline),
    Draft(DraftPayload),
    Final(FinalArticle),
    Unrecognized { status: Option<String>, raw: Value },
}

impl AgentOutput {
    /// Decode by the `status` discriminant. A known status whose payload
    /// does not deserialize is also reported as unrecognized.
    pub fn decode(value: Value) -> Self {
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string);

        fn payload<T: serde::de::DeserializeOwned>(value: &Value) -> Option<T> {
            serde_json::from_value(value.clone()).ok()
        }

        let decoded = match status.as_deref() {
            Some("candidates") => payload(&value).map(AgentOutput::Candidates),
            Some("queries") => payload(&value).map(AgentOutput::Queries),
            Some("findings") => payload(&value).map(AgentOutput::Findings),
            Some("synthesis") => payload(&value).map(AgentOutput::Synthesis),
            Some("outline") => payload(&value).map(AgentOutput::Outline),
            Some("draft") => payload(&value).map(AgentOutput::Draft),
            Some("final") => payload(&value).map(AgentOutput::Final),
            _ => None,
        };

        decoded.unwrap_or(AgentOutput::Unrecognized { status, raw: value })
    }

    pub fn status(&self) -> Option<&str> {
        match self {
            AgentOutput::Candidates(_) => Some("candidates"),
            AgentOutput::Queries(_) => Some("queries"),
            AgentOutput::Findings(_) => Some("findings"),
            AgentOutput::Synthesis(_) => Some("synthesis"),
            AgentOutput::Outline(_) => Some("outline"),
            AgentOutput::Draft(_) => Some("draft"),
            AgentOutput::Final(_) => Some("final"),
            AgentOutput::Unrecognized { status, .. } => status.as_deref(),
        }
    }

    pub fn matches(&self, shape: ExpectedShape) -> bool {
        !matches!(self, AgentOutput::Unrecognized { .. }) && self.status() == Some(shape.status())
    }
}

/// Output shape an autonomous step requires from its agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedShape {
    Candidates,
    Queries,
    Findings,
    Synthesis,
    Outline,
    Draft,
    Final,
}

impl ExpectedShape {
    pub fn for_step(step: Step) -> Option<Self> {
        match step {
            Step::GenerateTopics => Some(ExpectedShape::Candidates),
            Step::PlanResearch => Some(ExpectedShape::Queries),
            Step::Research => Some(ExpectedShape::Findings),
            Step::Synthesis => Some(ExpectedShape::Synthesis),
            Step::GenerateOutline => Some(ExpectedShape::Outline),
            Step::WriteDraft => Some(ExpectedShape::Draft),
            Step::Finalize => Some(ExpectedShape::Final),
            _ => None,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            ExpectedShape::Candidates => "candidates",
            ExpectedShape::Queries => "queries",
            ExpectedShape::Findings => "findings",
            ExpectedShape::Synthesis => "synthesis",
            ExpectedShape::Outline => "outline",
            ExpectedShape::Draft => "draft",
            ExpectedShape::Final => "final",
        }
    }

    /// JSON schema of the payload with the `status` discriminant pinned
    pub fn schema(&self) -> Value {
        let root = match self {
            ExpectedShape::Candidates => schema_for!(CandidatesPayload),
            ExpectedShape::Queries => schema_for!(QueriesPayload),
            ExpectedShape::Findings => schema_for!(FindingsPayload),
            ExpectedShape::Synthesis => schema_for!(SynthesisPayload),
            ExpectedShape::Outline => schema_for!(Outline),
            ExpectedShape::Draft => schema_for!(DraftPayload),
            ExpectedShape::Final => schema_for!(FinalArticle),
        };

        let mut schema = serde_json::to_value(root).unwrap_or_else(|_| json!({}));
        if let Some(properties) = schema.get_mut("properties").and_then(Value::as_object_mut) {
            properties.insert("status".to_string(), json!({ "const": self.status() }));
        }
        if let Some(required) = schema.get_mut("required").and_then(Value::as_array_mut) {
            required.push(json!("status"));
        } else if let Some(object) = schema.as_object_mut() {
            object.insert("required".to_string(), json!(["status"]));
        }
        schema
    }

    /// Validate a parsed value against [`Self::schema`]
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let schema = self.schema();
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| format!("Invalid output schema for {}: {e}", self.status()))?;
        validator.validate(value).map_err(|errors| {
            errors
                .map(|e| format!("At '{}': {}", e.instance_path, e))
                .collect::<Vec<_>>()
                .join("; ")
        })
    }
}

/// Parse raw agent text as-is
pub fn parse_strict(raw: &str) -> Option<Value> {
    serde_json::from_str(raw.trim()).ok()
}

/// Best-effort recovery of a JSON object from chatty output: a fenced code
/// block first, then the first balanced object in the text. A missing
/// `status` field is filled in with the expected one.
pub fn reparse(raw: &str, shape: ExpectedShape) -> Option<Value> {
    let mut value = extract_json_from_markdown(raw)
        .and_then(|s| serde_json::from_str::<Value>(&s).ok())
        .or_else(|| find_json_object(raw).and_then(|s| serde_json::from_str(&s).ok()))
        .or_else(|| parse_strict(raw))?;

    let object = value.as_object_mut()?;
    object
        .entry("status")
        .or_insert_with(|| json!(shape.status()));
    Some(value)
}

fn extract_json_from_markdown(text: &str) -> Option<String> {
    if let Some(start) = text.find("```json") {
        let content = &text[start + 7..];
        if let Some(end) = content.find("```") {
            return Some(content[..end].trim().to_string());
        }
    }

    if let Some(start) = text.find("```") {
        let content = &text[start + 3..];
        if let Some(end) = content.find("```") {
            let candidate = content[..end].trim();
            if candidate.starts_with('{') && candidate.ends_with('}') {
                return Some(candidate.to_string());
            }
        }
    }

    None
}

fn find_json_object(text: &str) -> Option<String> {
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if start.is_some() => in_string = true,
            '{' => {
                if start.is_none() {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        let candidate = &text[s..=i];
                        if serde_json::from_str::<Value>(candidate).is_ok() {
                            return Some(candidate.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    None
}
