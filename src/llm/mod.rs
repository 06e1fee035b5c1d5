//! LLM driver traits and implementations.
//!
//! This module provides the conversation types shared by the HTTP surface and
//! the agent, and a streaming abstraction over OpenAI-compatible Chat
//! Completions endpoints.
//!
//! # Overview
//!
//! The [`LlmDriver`] trait defines the core streaming interface. The tool-loop
//! agent in [`crate::agent`] builds on top of a driver to interleave model
//! output with tool execution.
//!
//! # Example
//!
//! ```rust,ignore
//! use portfolio_chat::llm::{ChatCompletionsDriver, LlmSettings, Provider};
//!
//! let settings = LlmSettings {
//!     base_url: "https://api.openai.com".to_string(),
//!     api_key: Some("sk-...".to_string()),
//!     model: "gpt-4o-mini".to_string(),
//!     provider: Provider::OpenAI,
//!     deployment_name: None,
//!     api_version: None,
//! };
//! let driver = ChatCompletionsDriver::new(settings);
//! ```

pub mod chat_completions;
pub mod provider;

pub use chat_completions::ChatCompletionsDriver;
pub use provider::Provider;

use futures::Stream;
use std::pin::Pin;

/// LLM connection and model settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Base URL for the LLM API (e.g., `https://api.openai.com`).
    pub base_url: String,
    /// Optional API key for authentication.
    pub api_key: Option<String>,
    /// Model identifier (e.g., `gpt-4o-mini`).
    pub model: String,
    /// Provider type (auto-detected from `base_url`).
    pub provider: Provider,
    /// Azure deployment name (required for Azure `OpenAI`).
    pub deployment_name: Option<String>,
    /// Azure API version (required for Azure `OpenAI`).
    pub api_version: Option<String>,
}

/// One turn of a conversation, as sent by the client.
///
/// Turns are immutable once sent; an ordered `Vec<Message>` is the
/// conversation history.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: MessageRole,
    /// Text content of the message.
    pub content: String,
}

impl Message {
    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// User message.
    User,
    /// Assistant response.
    Assistant,
}

/// A tool call made by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call.
    pub id: String,
    /// Function name.
    pub name: String,
    /// Arguments as JSON string.
    pub arguments: String,
}

/// Request to an LLM driver.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Conversation messages in Chat Completions wire format.
    pub messages: Vec<serde_json::Value>,
    /// Available tools in `OpenAI` function schema format.
    pub tools: Vec<serde_json::Value>,
    /// Sampling temperature; provider default when `None`.
    pub temperature: Option<f32>,
}

/// Incremental output of a single model call.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmChunk {
    /// Assistant text fragment.
    TextDelta {
        /// The text fragment to append.
        text: String,
    },
    /// A tool call is still streaming; the decoder assembles its parts.
    ToolCallDelta {
        /// Index of this tool call in the current batch.
        call_index: usize,
    },
    /// Tool call is fully assembled and ready for execution.
    ToolCallComplete {
        /// Index of this tool call in the current batch.
        call_index: usize,
        /// The assembled call.
        call: ToolCall,
    },
    /// The model finished this response.
    Done,
}

/// Boxed stream of model output.
pub type LlmStream = Pin<Box<dyn Stream<Item = anyhow::Result<LlmChunk>> + Send>>;

/// Trait for LLM streaming drivers.
#[async_trait::async_trait]
pub trait LlmDriver: Send + Sync + std::fmt::Debug {
    /// Stream a response from the LLM.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the connection is interrupted.
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<LlmStream>;
}
