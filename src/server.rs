use axum::{
    Json, Router,
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::agent::{Agent, AgentEventStream, ToolLoopAgent};
use crate::config::AppConfig;
use crate::llm::{ChatCompletionsDriver, LlmSettings, Message, MessageRole};
use crate::normalized::{StreamEvent, event_name, sse_data};
use crate::persona::load_system_prompt;
use crate::pipeline::normalize;
use crate::retrieval::{self, FastEmbedder, MemoryIndex, PortfolioSearchTool, VectorIndex};
use crate::tools::{ToolDescriptor, ToolRegistry};
use crate::{AppState, Services};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const PROCESS_TIME_HEADER: &str = "x-process-time";

pub const AGENT_NOT_READY: &str = "Agent not initialized. Server may still be starting up.";
pub const INDEX_NOT_READY: &str = "Vector store not initialized";

/// Stand-in for "no timeout" that keeps the middleware stack uniform.
const TIMEOUT_DISABLED: Duration = Duration::from_secs(365 * 24 * 60 * 60);

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Build the index, tool registry and agent.
///
/// Failures are logged and leave the corresponding service unset.
pub async fn build_services(
    config: &AppConfig,
    settings: Result<LlmSettings, crate::config::SettingsError>,
) -> Services {
    let index: Option<Arc<dyn VectorIndex>> = match build_index(config).await {
        Ok(index) => Some(index),
        Err(e) => {
            tracing::error!(
                path = %config.retrieval.documents_path.display(),
                error = format!("{e:#}"),
                "Failed to initialize vector store"
            );
            None
        }
    };

    let mut tools = ToolRegistry::new_empty();
    if let Some(index) = &index {
        tools = tools.with_native_tool(Arc::new(PortfolioSearchTool::new(
            Arc::clone(index),
            config.retrieval.k,
        )));
    }
    let tools = Arc::new(tools);
    for tool in tools.descriptors() {
        info!(name: "tool.registered", tool = %tool.name, "Tool registered");
    }

    let agent = match build_agent(config, settings, Arc::clone(&tools)).await {
        Ok(agent) => Some(agent),
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "Failed to initialize agent");
            None
        }
    };

    Services {
        index,
        agent,
        tools,
    }
}

async fn build_index(config: &AppConfig) -> anyhow::Result<Arc<dyn VectorIndex>> {
    let embedder = Arc::new(FastEmbedder::initialize().await?);
    let index = MemoryIndex::load(&config.retrieval.documents_path, embedder).await?;
    if index.is_empty() {
        tracing::warn!(
            path = %config.retrieval.documents_path.display(),
            "Portfolio snapshot contains no documents"
        );
    }
    Ok(Arc::new(index))
}

async fn build_agent(
    config: &AppConfig,
    settings: Result<LlmSettings, crate::config::SettingsError>,
    tools: Arc<ToolRegistry>,
) -> anyhow::Result<Arc<dyn Agent>> {
    let settings = settings?;
    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.model,
        "LLM configuration loaded"
    );

    let system_prompt = load_system_prompt(config.agent.system_prompt_path.as_deref()).await?;
    let driver = Arc::new(ChatCompletionsDriver::new(settings));
    let agent = ToolLoopAgent::new(driver, tools, system_prompt)
        .with_max_iterations(config.agent.max_tool_iterations);
    Ok(Arc::new(agent))
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(
    config: AppConfig,
    settings: Result<LlmSettings, crate::config::SettingsError>,
) -> anyhow::Result<()> {
    info!(name: "services.starting", "Initializing services");
    let services = build_services(&config, settings).await;
    info!(
        name: "services.ready",
        vector_store_ready = services.index_ready(),
        agent_ready = services.agent_ready(),
        "Services initialized"
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config, services);
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(name: "server.stopped", "Server stopped, releasing services");
    drop(state);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!(name: "server.shutdown", "Shutdown signal received");
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Routes and middleware for the given state.
pub fn router(state: AppState) -> Router {
    let timeout_duration = state
        .config
        .server
        .request_timeout()
        .unwrap_or(TIMEOUT_DISABLED);
    let cors = cors_layer(&state.config.server.cors_origins);

    Router::new()
        .route("/chat/stream", post(chat_stream))
        .route("/health", get(health))
        .route("/tools", get(list_tools))
        .route("/debug/search", get(debug_search))
        .layer(axum::middleware::from_fn(
            move |req: Request, next: Next| async move {
                match tokio::time::timeout(timeout_duration, next.run(req)).await {
                    Ok(res) => res,
                    Err(_) => (StatusCode::REQUEST_TIMEOUT, "Request timed out").into_response(),
                }
            },
        ))
        .layer(axum::middleware::from_fn(log_requests))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Tag each request with an id and record how long it took.
/// What the request log records about an incoming request.
#[derive(Debug, PartialEq, Eq)]
struct RequestFields {
    method: String,
    path: String,
    query: String,
    client_host: String,
    user_agent: String,
    content_type: String,
}

impl RequestFields {
    fn from_request(req: &Request) -> Self {
        let header_str = |name: HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        Self {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            query: req.uri().query().unwrap_or("").to_string(),
            client_host: req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string()),
            user_agent: header_str(header::USER_AGENT),
            content_type: header_str(header::CONTENT_TYPE),
        }
    }
}

async fn log_requests(mut req: Request, next: Next) -> Response {
    let started = Instant::now();
    let fields = RequestFields::from_request(&req);

    let request_id = match req.headers().get(REQUEST_ID_HEADER) {
        Some(id) => id.clone(),
        None => {
            let id = HeaderValue::from_str(&Uuid::new_v4().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
            req.headers_mut()
                .insert(HeaderName::from_static(REQUEST_ID_HEADER), id.clone());
            id
        }
    };
    let request_id_str = request_id.to_str().unwrap_or("unknown").to_string();

    info!(
        request_id = %request_id_str,
        method = %fields.method,
        path = %fields.path,
        query = %fields.query,
        client_host = %fields.client_host,
        user_agent = %fields.user_agent,
        content_type = %fields.content_type,
        "Request started"
    );

    let mut response = next.run(req).await;
    let elapsed = started.elapsed();

    info!(
        request_id = %request_id_str,
        method = %fields.method,
        path = %fields.path,
        status = response.status().as_u16(),
        duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        "Request completed"
    );

    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&format!("{:.4}", elapsed.as_secs_f64())) {
        headers.insert(HeaderName::from_static(PROCESS_TIME_HEADER), v);
    }
    headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), request_id);
    response
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

/// JSON error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "not_ready",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat
// ─────────────────────────────────────────────────────────────────────────────

/// Request body for `POST /chat/stream`.
///
/// Either a full conversation or a single user message.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ChatRequest {
    Conversation {
        messages: Vec<Message>,
        #[serde(default)]
        temperature: Option<f32>,
    },
    Single {
        message: String,
        #[serde(default)]
        temperature: Option<f32>,
    },
}

impl ChatRequest {
    /// Conversation history and requested temperature.
    pub fn into_parts(self) -> (Vec<Message>, Option<f32>) {
        match self {
            Self::Conversation {
                messages,
                temperature,
            } => (messages, temperature),
            Self::Single {
                message,
                temperature,
            } => {
                let history = if message.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![Message::user(message)]
                };
                (history, temperature)
            }
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// POST /chat/stream - Answer the last turn as an SSE stream.
async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let Some(agent) = state.services.agent.clone() else {
        return Err(ApiError::unavailable(AGENT_NOT_READY));
    };

    let (history, temperature) = req.into_parts();
    if history.is_empty() {
        return Err(ApiError::bad_request("Conversation must contain at least one message"));
    }
    let temperature = temperature.unwrap_or(state.config.agent.temperature);

    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

    let last_user = history
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map_or("", |m| m.content.as_str());
    info!(
        request_id = %request_id,
        message = %truncate_chars(last_user, 50),
        history_length = history.len(),
        temperature = temperature,
        "Starting chat stream"
    );

    let upstream: AgentEventStream = match agent.stream(history, Some(temperature)).await {
        Ok(stream) => stream,
        Err(e) => futures::stream::once(async move { Err(e) }).boxed(),
    };

    let events = normalize(
        upstream,
        state.config.stream.normalizer_options(),
        request_id.clone(),
    );

    Ok(match state.config.server.request_timeout() {
        Some(deadline) => build_sse_response(with_deadline(events, deadline, request_id)).into_response(),
        None => build_sse_response(events).into_response(),
    })
}

/// End `events` with an error once `deadline` has passed.
///
/// Dropping `events` on expiry drops the agent run behind it.
pub fn with_deadline<S>(
    events: S,
    deadline: Duration,
    request_id: String,
) -> impl Stream<Item = StreamEvent> + Send
where
    S: Stream<Item = StreamEvent> + Send + 'static,
{
    async_stream::stream! {
        let sleep = tokio::time::sleep(deadline);
        tokio::pin!(sleep);
        futures::pin_mut!(events);

        loop {
            let next = tokio::select! {
                item = events.next() => Some(item),
                () = &mut sleep => None,
            };
            match next {
                Some(Some(event)) => yield event,
                Some(None) => break,
                None => {
                    tracing::warn!(
                        request_id = %request_id,
                        deadline_secs = deadline.as_secs(),
                        "Chat stream exceeded request deadline"
                    );
                    yield StreamEvent::Error {
                        message: format!(
                            "Stream error: request exceeded the {}s deadline",
                            deadline.as_secs()
                        ),
                    };
                    break;
                }
            }
        }
    }
}

/// Frame client events as SSE: `event:` is the kind, `data:` the plain text.
pub fn build_sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send>
where
    S: Stream<Item = StreamEvent> + Send + 'static,
{
    let stream = stream.map(|event| {
        Ok(Event::default()
            .event(event_name(&event))
            .data(sse_data(&event)))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Introspection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    vector_store_ready: bool,
    agent_ready: bool,
}

/// GET /health - Readiness of the index and the agent.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        vector_store_ready: state.services.index_ready(),
        agent_ready: state.services.agent_ready(),
    })
}

#[derive(Debug, Serialize)]
struct ToolsResponse {
    tools: Vec<ToolDescriptor>,
}

/// GET /tools - Tools the agent can call.
async fn list_tools(State(state): State<AppState>) -> Result<Json<ToolsResponse>, ApiError> {
    if !state.services.agent_ready() {
        return Err(ApiError::unavailable(AGENT_NOT_READY));
    }
    Ok(Json(ToolsResponse {
        tools: state.services.tools.descriptors(),
    }))
}

#[derive(Debug, Deserialize)]
struct DebugSearchParams {
    #[serde(default = "default_debug_query")]
    query: String,
}

fn default_debug_query() -> String {
    "projects".to_string()
}

#[derive(Debug, Serialize)]
struct DebugSearchResponse {
    query: String,
    num_results: usize,
    project_urls_found: retrieval::ProjectUrlTable,
    sample_metadata: Vec<SampleMetadata>,
}

#[derive(Debug, Serialize)]
struct SampleMetadata {
    file: String,
    #[serde(rename = "type")]
    kind: String,
    has_live_url: bool,
    live_url: serde_json::Value,
}

/// GET /debug/search - Run the retrieval adapter and show what it extracted.
async fn debug_search(
    State(state): State<AppState>,
    Query(params): Query<DebugSearchParams>,
) -> Result<Json<DebugSearchResponse>, ApiError> {
    let Some(index) = state.services.index.clone() else {
        return Err(ApiError::unavailable(INDEX_NOT_READY));
    };

    let result = retrieval::search(index.as_ref(), &params.query, state.config.retrieval.k)
        .await
        .map_err(|e| {
            tracing::error!(query = %params.query, error = format!("{e:#}"), "Debug search failed");
            ApiError::internal(format!("Search failed: {e:#}"))
        })?;

    let sample_metadata = result
        .hits
        .iter()
        .take(3)
        .map(|hit| {
            let text = |key: &str| {
                hit.metadata
                    .get(key)
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown")
                    .to_string()
            };
            SampleMetadata {
                file: text("file_name"),
                kind: text("type"),
                has_live_url: hit.metadata.contains_key("live_url"),
                live_url: hit
                    .metadata
                    .get("live_url")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            }
        })
        .collect();

    Ok(Json(DebugSearchResponse {
        query: params.query,
        num_results: result.hits.len(),
        project_urls_found: result.urls,
        sample_metadata,
    }))
}
