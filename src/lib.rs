//! Portfolio chat backend.
//!
//! A retrieval-augmented chat service that answers questions about a
//! professional portfolio and streams the answer over SSE.
//!
//! # Architecture
//!
//! - **Server**: Axum-based HTTP server with SSE streaming
//! - **Agent**: tool-loop agent over an OpenAI-compatible Chat Completions driver
//! - **Retrieval**: embedding-backed portfolio index exposed as the `search_portfolio` tool
//! - **Pipeline**: raw agent events → text deltas, tool markers and a terminal
//!   error, with end-of-stream URL repair
//!
//! # Modules
//!
//! - [`agent`]: raw agent events and the tool-loop agent
//! - [`llm`]: LLM driver traits and implementations
//! - [`normalized`]: client-visible streaming event model
//! - [`pipeline`]: delta tracking, normalization and URL repair
//! - [`retrieval`]: portfolio search, URL tables and the vector index
//! - [`server`]: HTTP surface and service lifecycle

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::unused_async)]

pub mod agent;
pub mod config;
pub mod llm;
pub mod normalized;
pub mod persona;
pub mod pipeline;
pub mod retrieval;
pub mod server;
pub mod telemetry;
pub mod tools;

use std::sync::Arc;

use crate::agent::Agent;
use crate::config::AppConfig;
use crate::retrieval::VectorIndex;
use crate::tools::ToolRegistry;

/// Long-lived collaborators, built once at startup.
///
/// A missing index or agent means it failed to build; the server still runs
/// and reports the gap through `/health`.
#[derive(Debug, Clone, Default)]
pub struct Services {
    pub index: Option<Arc<dyn VectorIndex>>,
    pub agent: Option<Arc<dyn Agent>>,
    pub tools: Arc<ToolRegistry>,
}

impl Services {
    pub fn index_ready(&self) -> bool {
        self.index.is_some()
    }

    pub fn agent_ready(&self) -> bool {
        self.agent.is_some()
    }
}

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub services: Arc<Services>,
}

impl AppState {
    pub fn new(config: AppConfig, services: Services) -> Self {
        Self {
            config: Arc::new(config),
            services: Arc::new(services),
        }
    }
}
