//! Client-visible streaming events.
//!
//! Every chat stream is a strictly ordered sequence of [`StreamEvent`]s. The
//! pipeline only ever produces three kinds:
//! - `update`: a text delta to append to the answer
//! - `tool`: a marker that the agent invoked a tool (client-facing variant only)
//! - `error`: a terminal failure; nothing follows it
//!
//! On the wire each event becomes one SSE frame whose `event:` line is the
//! [`event_name`] and whose `data:` line is plain text (see [`sse_data`]).
//!
//! # Example
//!
//! ```rust
//! use portfolio_chat::normalized::{StreamEvent, event_name, sse_data};
//!
//! let event = StreamEvent::ToolInvoked {
//!     name: "search_portfolio".to_string(),
//! };
//! assert_eq!(event_name(&event), "tool");
//! assert_eq!(sse_data(&event), "[tool: search_portfolio]");
//! ```

use serde::{Deserialize, Serialize};

/// Normalized streaming events emitted to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum StreamEvent {
    /// Incremental text to append to the assistant's answer.
    #[serde(rename = "update")]
    Update {
        /// The text fragment to append.
        delta: String,
    },

    /// The agent invoked a tool.
    #[serde(rename = "tool")]
    ToolInvoked {
        /// Tool/function name.
        name: String,
    },

    /// The stream failed. Always the last event of a stream.
    #[serde(rename = "error")]
    Error {
        /// Error message.
        message: String,
    },
}

impl StreamEvent {
    /// Create an update event.
    #[must_use]
    pub fn update(delta: impl Into<String>) -> Self {
        Self::Update {
            delta: delta.into(),
        }
    }

    /// Whether this event terminates the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Get the SSE event name for a [`StreamEvent`].
pub fn event_name(evt: &StreamEvent) -> &'static str {
    match evt {
        StreamEvent::Update { .. } => "update",
        StreamEvent::ToolInvoked { .. } => "tool",
        StreamEvent::Error { .. } => "error",
    }
}

/// Get the plain-text SSE `data` payload for a [`StreamEvent`].
pub fn sse_data(evt: &StreamEvent) -> String {
    match evt {
        StreamEvent::Update { delta } => delta.clone(),
        StreamEvent::ToolInvoked { name } => format!("[tool: {name}]"),
        StreamEvent::Error { message } => message.clone(),
    }
}
