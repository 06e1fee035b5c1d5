use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use futures::StreamExt;
use portfolio_chat::agent::{
    Agent, AgentEvent, AgentEventStream, AgentMessage, ContentBlock, ToolLoopAgent,
};
use portfolio_chat::config::{AgentConfig, AppConfig, RetrievalConfig, ServerConfig, StreamConfig};
use portfolio_chat::llm::{LlmChunk, LlmDriver, LlmRequest, LlmStream, Message, ToolCall};
use portfolio_chat::retrieval::{PortfolioSearchTool, RetrievalHit, VectorIndex};
use portfolio_chat::server::router;
use portfolio_chat::tools::ToolRegistry;
use portfolio_chat::{AppState, Services};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

fn test_config(surface_tool_calls: bool) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            port: 0,
            host: "127.0.0.1".to_string(),
            cors_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
        },
        retrieval: RetrievalConfig {
            k: 5,
            documents_path: "unused.json".into(),
        },
        agent: AgentConfig {
            temperature: 0.7,
            system_prompt_path: None,
            max_tool_iterations: 4,
        },
        stream: StreamConfig {
            surface_tool_calls,
            repair_urls: true,
        },
    }
}

/// Replays a fixed list of raw events; `Err` entries become stream failures.
#[derive(Debug)]
struct ScriptedAgent {
    events: Vec<Result<AgentEvent, String>>,
    seen: Mutex<Vec<(Vec<Message>, Option<f32>)>>,
}

impl ScriptedAgent {
    fn new(events: Vec<Result<AgentEvent, String>>) -> Arc<Self> {
        Arc::new(Self {
            events,
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn stream(
        &self,
        history: Vec<Message>,
        temperature: Option<f32>,
    ) -> anyhow::Result<AgentEventStream> {
        self.seen.lock().unwrap().push((history, temperature));
        let events: Vec<anyhow::Result<AgentEvent>> = self
            .events
            .iter()
            .cloned()
            .map(|e| e.map_err(anyhow::Error::msg))
            .collect();
        Ok(futures::stream::iter(events).boxed())
    }
}

#[derive(Debug)]
struct StaticIndex(Vec<RetrievalHit>);

#[async_trait]
impl VectorIndex for StaticIndex {
    async fn similarity_search(&self, _query: &str, k: usize) -> anyhow::Result<Vec<RetrievalHit>> {
        Ok(self.0.iter().take(k).cloned().collect())
    }
}

fn portfolio_hits() -> Vec<RetrievalHit> {
    vec![
        RetrievalHit::new("findkairos connects bikepackers worldwide.")
            .with_metadata("name", "findkairos")
            .with_metadata("file_name", "findkairos.md")
            .with_metadata("type", "project")
            .with_metadata("live_url", "https://findkairos.com"),
        RetrievalHit::new("Worked as a software engineer.")
            .with_metadata("file_name", "cv.pdf")
            .with_metadata("type", "cv")
            .with_metadata("live_url", "null"),
        RetrievalHit::new("jaspercycles tracks a bikepacking journey.")
            .with_metadata("file_name", "jaspercycles.md")
            .with_metadata("type", "project")
            .with_metadata("live_url", "https://jaspercycles.com"),
    ]
}

/// Replays one scripted model response per call.
#[derive(Debug)]
struct ScriptedDriver {
    responses: Mutex<Vec<Vec<LlmChunk>>>,
}

#[async_trait]
impl LlmDriver for ScriptedDriver {
    async fn stream(&self, _req: LlmRequest) -> anyhow::Result<LlmStream> {
        let mut responses = self.responses.lock().unwrap();
        anyhow::ensure!(!responses.is_empty(), "no scripted response left");
        let chunks = responses.remove(0);
        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }
}

fn text(s: &str) -> AgentEvent {
    AgentEvent::Model(AgentMessage {
        content_blocks: vec![ContentBlock::Text {
            text: s.to_string(),
        }],
    })
}

fn tool_call(name: &str) -> AgentEvent {
    AgentEvent::Model(AgentMessage {
        content_blocks: vec![ContentBlock::ToolCall {
            id: "call_0".to_string(),
            name: name.to_string(),
            arguments: r#"{"query":"projects"}"#.to_string(),
        }],
    })
}

fn server(config: AppConfig, services: Services) -> TestServer {
    TestServer::new(router(AppState::new(config, services))).unwrap()
}

fn agent_only(agent: Arc<dyn Agent>) -> Services {
    Services {
        index: None,
        agent: Some(agent),
        tools: Arc::new(ToolRegistry::new_empty()),
    }
}

/// `(event, data)` pairs from an SSE body; multi-line data is rejoined.
fn parse_sse(body: &str) -> Vec<(String, String)> {
    body.split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .filter_map(|frame| {
            let mut event = None;
            let mut data: Vec<&str> = Vec::new();
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data.push(rest.strip_prefix(' ').unwrap_or(rest));
                }
            }
            event.map(|e| (e, data.join("\n")))
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// /chat/stream
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stream_emits_deltas() {
    let agent = ScriptedAgent::new(vec![
        Ok(text("I")),
        Ok(text("I build")),
        Ok(text("I build things")),
    ]);
    let server = server(test_config(false), agent_only(Arc::clone(&agent) as Arc<dyn Agent>));

    let response = server
        .post("/chat/stream")
        .json(&json!({"message": "What do you do?", "temperature": 0.3}))
        .await;
    response.assert_status_ok();

    let events = parse_sse(&response.text());
    assert_eq!(
        events,
        vec![
            ("update".to_string(), "I".to_string()),
            ("update".to_string(), " build".to_string()),
            ("update".to_string(), " things".to_string()),
        ]
    );

    let seen = agent.seen.lock().unwrap();
    assert_eq!(seen[0].0, vec![Message::user("What do you do?")]);
    assert_eq!(seen[0].1, Some(0.3));
}

#[tokio::test]
async fn test_stream_uses_default_temperature_for_conversations() {
    let agent = ScriptedAgent::new(vec![Ok(text("ok"))]);
    let server = server(test_config(false), agent_only(Arc::clone(&agent) as Arc<dyn Agent>));

    server
        .post("/chat/stream")
        .json(&json!({"messages": [
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"},
            {"role": "user", "content": "and your projects?"}
        ]}))
        .await
        .assert_status_ok();

    let seen = agent.seen.lock().unwrap();
    assert_eq!(seen[0].0.len(), 3);
    assert_eq!(seen[0].1, Some(0.7));
}

#[tokio::test]
async fn test_tool_marker_only_in_client_variant() {
    let script = vec![
        Ok(text("Let me check")),
        Ok(tool_call("search_portfolio")),
        Ok(text("Found it")),
    ];

    let client = server(test_config(true), agent_only(ScriptedAgent::new(script.clone())));
    let events = parse_sse(&client.post("/chat/stream").json(&json!({"message": "x"})).await.text());
    assert_eq!(
        events,
        vec![
            ("update".to_string(), "Let me check".to_string()),
            ("tool".to_string(), "[tool: search_portfolio]".to_string()),
            ("update".to_string(), "Found it".to_string()),
        ]
    );

    let portfolio = server(test_config(false), agent_only(ScriptedAgent::new(script)));
    let events = parse_sse(&portfolio.post("/chat/stream").json(&json!({"message": "x"})).await.text());
    assert!(events.iter().all(|(kind, _)| kind == "update"));
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn test_failure_yields_updates_then_single_error() {
    let agent = ScriptedAgent::new(vec![
        Ok(text("one")),
        Ok(text("one two")),
        Err("model connection reset".to_string()),
        Ok(text("one two three")),
    ]);
    let server = server(test_config(false), agent_only(agent));

    let response = server
        .post("/chat/stream")
        .json(&json!({"message": "x"}))
        .await;
    response.assert_status_ok();

    let events = parse_sse(&response.text());
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].0, "update");
    assert_eq!(events[1].0, "update");
    assert_eq!(
        events[2],
        (
            "error".to_string(),
            "Stream error: model connection reset".to_string()
        )
    );
}

#[tokio::test]
async fn test_missing_links_appended_end_to_end() {
    let index: Arc<dyn VectorIndex> = Arc::new(StaticIndex(portfolio_hits()));
    let tools = Arc::new(
        ToolRegistry::new_empty().with_native_tool(Arc::new(PortfolioSearchTool::new(
            Arc::clone(&index),
            5,
        ))),
    );
    let driver = Arc::new(ScriptedDriver {
        responses: Mutex::new(vec![
            vec![
                LlmChunk::ToolCallComplete {
                    call_index: 0,
                    call: ToolCall {
                        id: "call_0".to_string(),
                        name: "search_portfolio".to_string(),
                        arguments: r#"{"query":"projects"}"#.to_string(),
                    },
                },
                LlmChunk::Done,
            ],
            vec![
                LlmChunk::TextDelta {
                    text: "I built findkairos ".to_string(),
                },
                LlmChunk::TextDelta {
                    text: "and jaspercycles (https://jaspercycles.com).".to_string(),
                },
                LlmChunk::Done,
            ],
        ]),
    });
    let agent = Arc::new(ToolLoopAgent::new(driver, Arc::clone(&tools), "persona"));
    let services = Services {
        index: Some(index),
        agent: Some(agent),
        tools,
    };
    let server = server(test_config(false), services);

    let response = server
        .post("/chat/stream")
        .json(&json!({"message": "What have you built?"}))
        .await;
    response.assert_status_ok();

    let events = parse_sse(&response.text());
    let (kind, last) = events.last().unwrap();
    assert_eq!(kind, "update");
    assert_eq!(
        last,
        "\n\n**Project Links:**\n- findkairos: https://findkairos.com"
    );
    let answer: String = events[..events.len() - 1]
        .iter()
        .map(|(_, d)| d.as_str())
        .collect();
    assert_eq!(
        answer,
        "I built findkairos and jaspercycles (https://jaspercycles.com)."
    );
}

#[tokio::test]
async fn test_stream_without_agent_is_unavailable() {
    let server = server(test_config(false), Services::default());

    let response = server
        .post("/chat/stream")
        .json(&json!({"message": "hello"}))
        .await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(
        body["error"]["message"],
        "Agent not initialized. Server may still be starting up."
    );
}

#[tokio::test]
async fn test_empty_conversation_is_rejected() {
    let server = server(test_config(false), agent_only(ScriptedAgent::new(vec![])));

    server
        .post("/chat/stream")
        .json(&json!({"messages": []}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .post("/chat/stream")
        .json(&json!({"message": ""}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_request_id_is_echoed_and_timed() {
    let server = server(test_config(false), Services::default());

    let response = server
        .get("/health")
        .add_header(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_static("req-123"),
        )
        .await;
    assert_eq!(response.header("x-request-id"), "req-123");
    assert!(response.headers().contains_key("x-process-time"));

    let generated = server.get("/health").await;
    assert!(!generated.header("x-request-id").is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Introspection
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_reports_readiness() {
    let empty = server(test_config(false), Services::default());
    let body: Value = empty.get("/health").await.json();
    assert_eq!(
        body,
        json!({"status": "healthy", "vector_store_ready": false, "agent_ready": false})
    );

    let services = Services {
        index: Some(Arc::new(StaticIndex(vec![]))),
        agent: Some(ScriptedAgent::new(vec![])),
        tools: Arc::new(ToolRegistry::new_empty()),
    };
    let ready = server(test_config(false), services);
    let body: Value = ready.get("/health").await.json();
    assert_eq!(body["vector_store_ready"], true);
    assert_eq!(body["agent_ready"], true);
}

#[tokio::test]
async fn test_tools_lists_search_tool() {
    let index: Arc<dyn VectorIndex> = Arc::new(StaticIndex(portfolio_hits()));
    let services = Services {
        index: Some(Arc::clone(&index)),
        agent: Some(ScriptedAgent::new(vec![])),
        tools: Arc::new(
            ToolRegistry::new_empty().with_native_tool(Arc::new(PortfolioSearchTool::new(index, 5))),
        ),
    };
    let server = server(test_config(false), services);

    let body: Value = server.get("/tools").await.json();
    assert_eq!(body["tools"][0]["name"], "search_portfolio");
    assert!(body["tools"][0]["description"].as_str().unwrap().contains("portfolio"));

    let unready = server_without_agent();
    unready
        .get("/tools")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
}

fn server_without_agent() -> TestServer {
    server(test_config(false), Services::default())
}

#[tokio::test]
async fn test_debug_search_shows_extraction() {
    let services = Services {
        index: Some(Arc::new(StaticIndex(portfolio_hits()))),
        agent: None,
        tools: Arc::new(ToolRegistry::new_empty()),
    };
    let server = server(test_config(false), services);

    let body: Value = server.get("/debug/search").await.json();
    assert_eq!(body["query"], "projects");
    assert_eq!(body["num_results"], 3);
    assert_eq!(
        body["project_urls_found"],
        json!({
            "findkairos": "https://findkairos.com",
            "jaspercycles": "https://jaspercycles.com"
        })
    );
    assert_eq!(body["sample_metadata"].as_array().unwrap().len(), 3);
    assert_eq!(body["sample_metadata"][1]["file"], "cv.pdf");
    assert_eq!(body["sample_metadata"][1]["type"], "cv");
    assert_eq!(body["sample_metadata"][1]["has_live_url"], true);
    assert_eq!(body["sample_metadata"][1]["live_url"], "null");

    let custom: Value = server
        .get("/debug/search")
        .add_query_param("query", "cv")
        .await
        .json();
    assert_eq!(custom["query"], "cv");

    server_without_agent()
        .get("/debug/search")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
}
