//! Agent capability backed by an LLM provider
//!
//! Each agent id maps to a prompt profile. The agent is asked for a single
//! JSON object matching the output schema the invoker passes along, and
//! provider errors are translated into capability errors so the invoker
//! can classify them.

use super::capability::{AgentCallContext, AgentCapability, CapabilityError, RawAgentOutput};
use crate::config::{AgentSection, LlmSection};
use crate::context::TurnRole;
use crate::llm::provider::{
    CompletionRequest, FinishReason, LlmError, LlmProvider, Message, ResponseFormat,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct AgentProfile {
    pub system_prompt: String,
}

impl AgentProfile {
    pub fn new<S: Into<String>>(system_prompt: S) -> Self {
        Self {
            system_prompt: system_prompt.into(),
        }
    }
}

/// Built-in prompt for each pipeline agent
pub fn default_profile(agent_id: &str) -> Option<AgentProfile> {
    let prompt = match agent_id {
        "topic_generator" => {
            "You propose article topics. Given a brief, return several distinct topic \
             candidates, each with a short title and the angle that makes it interesting."
        }
        "research_planner" => {
            "You plan research. Given the chosen topic, return focused search queries \
             that together cover what a well-sourced article needs."
        }
        "researcher" => {
            "You research one query. Summarize what is known, citing sources where possible."
        }
        "synthesizer" => {
            "You merge research findings into one coherent summary, resolving overlaps \
             and flagging contradictions."
        }
        "outliner" => {
            "You outline an article from a topic and research synthesis. Return a title \
             and ordered sections with key points."
        }
        "writer" => "You write a complete article draft that follows the approved outline.",
        "finalizer" => {
            "You copy-edit an approved manuscript into its final form, keeping the author's \
             structure and voice."
        }
        _ => return None,
    };
    Some(AgentProfile::new(prompt))
}

pub struct LlmAgent {
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    history_window: usize,
    cost_micros_per_1k_tokens: u64,
    profiles: HashMap<String, AgentProfile>,
}

impl LlmAgent {
    pub fn new<S: Into<String>>(provider: Arc<dyn LlmProvider>, model: S) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: None,
            max_tokens: None,
            history_window: 6,
            cost_micros_per_1k_tokens: 0,
            profiles: HashMap::new(),
        }
    }

    pub fn from_config(
        provider: Arc<dyn LlmProvider>,
        llm: &LlmSection,
        agents: &HashMap<String, AgentSection>,
    ) -> Self {
        let mut agent = Self::new(provider, llm.model.clone());
        agent.temperature = llm.temperature;
        agent.max_tokens = llm.max_tokens;
        agent.history_window = llm.history_window;
        agent.cost_micros_per_1k_tokens = llm.cost_micros_per_1k_tokens;
        for (id, section) in agents {
            if let Some(prompt) = &section.system_prompt {
                agent.profiles.insert(id.clone(), AgentProfile::new(prompt.clone()));
            }
        }
        agent
    }

    pub fn with_profile<S: Into<String>>(mut self, agent_id: S, profile: AgentProfile) -> Self {
        self.profiles.insert(agent_id.into(), profile);
        self
    }

    fn profile(&self, agent_id: &str) -> Option<AgentProfile> {
        self.profiles
            .get(agent_id)
            .cloned()
            .or_else(|| default_profile(agent_id))
    }

    fn build_messages(
        &self,
        profile: &AgentProfile,
        input: &Value,
        context: &AgentCallContext,
    ) -> Vec<Message> {
        let mut messages = vec![Message::system(format!(
            "{}\n\nRespond with exactly one JSON object and nothing else. \
             It must validate against this JSON schema:\n{}",
            profile.system_prompt, context.output_schema
        ))];

        let skip = context.history.len().saturating_sub(self.history_window);
        for turn in context.history.iter().skip(skip) {
            messages.push(match turn.role {
                TurnRole::Agent => Message::assistant(turn.content.clone()),
                TurnRole::Operator | TurnRole::Pipeline => Message::user(turn.content.clone()),
            });
        }

        let body = serde_json::to_string_pretty(input).unwrap_or_else(|_| input.to_string());
        messages.push(Message::user(body));
        messages
    }
}

fn map_llm_error(error: LlmError) -> CapabilityError {
    match error {
        LlmError::AuthenticationFailed(m) => CapabilityError::Unauthorized(m),
        LlmError::NotConfigured(m) | LlmError::ModelNotFound(m) | LlmError::InvalidRequest(m) => {
            CapabilityError::InvalidRequest(m)
        }
        LlmError::RateLimitExceeded(m) => CapabilityError::RateLimited(m),
        LlmError::NetworkError(m) | LlmError::RequestFailed(m) => CapabilityError::Unavailable(m),
        LlmError::InvalidResponse(m) | LlmError::ApiError(m) => CapabilityError::Other(m),
    }
}

#[async_trait]
impl AgentCapability for LlmAgent {
    async fn invoke(
        &self,
        agent_id: &str,
        input: &Value,
        context: &AgentCallContext,
    ) -> Result<RawAgentOutput, CapabilityError> {
        let profile = self
            .profile(agent_id)
            .ok_or_else(|| CapabilityError::InvalidRequest(format!("Unknown agent: {agent_id}")))?;

        let mut metadata = HashMap::new();
        metadata.insert("process_id".to_string(), context.process_id.clone());
        metadata.insert("step".to_string(), context.step.to_string());

        let request = CompletionRequest {
            messages: self.build_messages(&profile, input, context),
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            response_format: Some(ResponseFormat::Json),
            metadata,
        };

        let response = self
            .provider
            .complete(request)
            .await
            .map_err(map_llm_error)?;

        if response.finish_reason == FinishReason::ContentFilter {
            return Err(CapabilityError::PolicyViolation(
                "completion was blocked by the provider's content filter".to_string(),
            ));
        }

        let tokens = u64::from(response.usage.total_tokens);
        debug!(agent_id, tokens, attempt = context.attempt, "LLM agent answered");
        Ok(RawAgentOutput {
            content: response.content,
            tokens,
            cost_micros: tokens * self.cost_micros_per_1k_tokens / 1000,
        })
    }
}
