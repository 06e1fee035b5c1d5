//! Agent execution events.
//!
//! An [`Agent`] interleaves model generation with tool calls and reports its
//! progress as a stream of raw [`AgentEvent`]s. These are snapshots, not
//! deltas: every [`AgentEvent::Model`] carries the assistant message as it
//! stands so far, and the pipeline in [`crate::pipeline`] is responsible for
//! turning them into client-facing deltas.

pub mod tool_loop;

pub use tool_loop::ToolLoopAgent;

use crate::llm::Message;
use futures::Stream;
use std::pin::Pin;

/// A unit of content inside an assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    /// Cumulative text of this block.
    Text { text: String },
    /// A tool invocation requested by the model.
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
}

/// The latest assistant message, as far as it has been generated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentMessage {
    pub content_blocks: Vec<ContentBlock>,
}

impl AgentMessage {
    /// Append text to the trailing text block, opening one if needed.
    pub fn push_text(&mut self, delta: &str) {
        if let Some(ContentBlock::Text { text }) = self.content_blocks.last_mut() {
            text.push_str(delta);
        } else {
            self.content_blocks.push(ContentBlock::Text {
                text: delta.to_string(),
            });
        }
    }

    pub fn last_block(&self) -> Option<&ContentBlock> {
        self.content_blocks.last()
    }
}

/// Raw events produced by an agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Model output: a snapshot of the latest message.
    Model(AgentMessage),
    /// A tool finished; `result` is the text fed back to the model.
    ToolResult { name: String, result: String },
    /// Progress that carries no model content (e.g. tool-argument streaming).
    Other { kind: String },
}

/// Boxed stream of raw agent events.
pub type AgentEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<AgentEvent>> + Send>>;

/// Something that can answer a conversation turn.
#[async_trait::async_trait]
pub trait Agent: Send + Sync + std::fmt::Debug {
    /// Start answering the last turn of `history`.
    ///
    /// The returned stream is single-use; dropping it abandons the run.
    async fn stream(
        &self,
        history: Vec<Message>,
        temperature: Option<f32>,
    ) -> anyhow::Result<AgentEventStream>;
}
