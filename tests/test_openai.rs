//! OpenAI-compatible provider against a mock HTTP server

use draftflow::agent::{
    AgentCall, AgentCallContext, AgentCapability, AgentInvoker, AgentOutput, CapabilityError,
    ExpectedShape, FailureClass, InvokeError, LlmAgent, RetryPolicy,
};
use draftflow::llm::providers::{OpenAiConfig, OpenAiProvider};
use draftflow::llm::{LlmError, LlmProvider};
use draftflow::steps::Step;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> Arc<OpenAiProvider> {
    Arc::new(
        OpenAiProvider::new(OpenAiConfig {
            api_key: "test-key".to_string(),
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
        })
        .unwrap(),
    )
}

fn completion(content: &str, finish_reason: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": finish_reason
        }],
        "usage": {"prompt_tokens": 40, "completion_tokens": 20, "total_tokens": 60}
    })
}

fn call_context() -> AgentCallContext {
    AgentCallContext {
        process_id: "p-1".to_string(),
        step: Step::PlanResearch,
        attempt: 1,
        history: Vec::new(),
        output_schema: ExpectedShape::Queries.schema(),
    }
}

fn planner_call() -> AgentCall {
    AgentCall {
        process_id: "p-1".to_string(),
        step: Step::PlanResearch,
        agent_id: "research_planner".to_string(),
        input: json!({"topic": "Async Rust in practice"}),
        history: Vec::new(),
        expected: ExpectedShape::Queries,
    }
}

#[tokio::test]
async fn test_completion_is_sent_and_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "response_format": {"type": "json_object"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            r#"{"status":"queries","queries":["a","b"]}"#,
            "stop",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let agent = LlmAgent::new(provider(&server), "gpt-4o-mini");
    let raw = agent
        .invoke("research_planner", &json!({"topic": "x"}), &call_context())
        .await
        .unwrap();
    assert_eq!(raw.tokens, 60);
    assert!(raw.content.contains("queries"));
}

#[tokio::test]
async fn test_invoker_decodes_provider_answer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            "```json\n{\"status\":\"queries\",\"queries\":[\"runtimes\"]}\n```",
            "stop",
        )))
        .mount(&server)
        .await;

    let agent = Arc::new(LlmAgent::new(provider(&server), "gpt-4o-mini"));
    let invoker = AgentInvoker::new(agent, RetryPolicy::immediate(2));
    let invocation = invoker
        .invoke(planner_call(), &CancellationToken::new())
        .await
        .unwrap();
    let AgentOutput::Queries(payload) = invocation.output else {
        panic!("expected queries");
    };
    assert_eq!(payload.queries, vec!["runtimes".to_string()]);
    assert_eq!(invocation.tokens, 60);
}

#[tokio::test]
async fn test_unauthorized_is_fatal_and_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&server)
        .await;

    let agent = Arc::new(LlmAgent::new(provider(&server), "gpt-4o-mini"));
    let invoker = AgentInvoker::new(agent, RetryPolicy::immediate(3));
    let err = invoker
        .invoke(planner_call(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::Fatal { .. }));
}

#[tokio::test]
async fn test_server_errors_use_the_whole_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(3)
        .mount(&server)
        .await;

    let agent = Arc::new(LlmAgent::new(provider(&server), "gpt-4o-mini"));
    let invoker = AgentInvoker::new(agent, RetryPolicy::immediate(3));
    let err = invoker
        .invoke(planner_call(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::Exhausted { attempts: 3, .. }));
}

#[tokio::test]
async fn test_status_codes_map_to_failure_classes() {
    let cases = [
        (400, FailureClass::Fatal),
        (401, FailureClass::Fatal),
        (404, FailureClass::Fatal),
        (429, FailureClass::Transient),
        (500, FailureClass::Transient),
    ];
    for (status, expected) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let agent = LlmAgent::new(provider(&server), "gpt-4o-mini");
        let err = agent
            .invoke("research_planner", &json!({}), &call_context())
            .await
            .unwrap_err();
        assert_eq!(err.class(), expected, "status {status} classified as {err}");
    }
}

#[tokio::test]
async fn test_content_filter_is_a_policy_violation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("", "content_filter")))
        .mount(&server)
        .await;

    let agent = LlmAgent::new(provider(&server), "gpt-4o-mini");
    let err = agent
        .invoke("research_planner", &json!({}), &call_context())
        .await
        .unwrap_err();
    assert!(matches!(err, CapabilityError::PolicyViolation(_)));
}

#[tokio::test]
async fn test_empty_choices_is_an_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"model": "gpt-4o-mini", "choices": []})),
        )
        .mount(&server)
        .await;

    let provider = provider(&server);
    let request = draftflow::llm::CompletionRequest {
        messages: vec![draftflow::llm::Message::user("hi")],
        model: "gpt-4o-mini".to_string(),
        max_tokens: None,
        temperature: None,
        response_format: None,
        metadata: Default::default(),
    };
    let err = provider.complete(request).await.unwrap_err();
    assert!(matches!(err, LlmError::InvalidResponse(_)));
}
