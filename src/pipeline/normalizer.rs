use futures::{Stream, StreamExt};
use serde::Deserialize;

use super::delta::{DeltaError, DeltaTracker};
use super::repair::repair;
use crate::agent::{AgentEvent, ContentBlock};
use crate::normalized::StreamEvent;
use crate::retrieval::{ProjectUrlTable, parse_url_table};

/// How tool invocations reach the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSurfacing {
    /// Logged only; the client sees nothing but text.
    #[default]
    LogOnly,
    /// Emitted as [`StreamEvent::ToolInvoked`].
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizerOptions {
    pub surfacing: ToolSurfacing,
    pub repair_urls: bool,
}

impl Default for NormalizerOptions {
    fn default() -> Self {
        Self {
            surfacing: ToolSurfacing::LogOnly,
            repair_urls: true,
        }
    }
}

/// Per-stream state: the delta baseline and the latest URL table.
#[derive(Debug, Default)]
pub struct StreamState {
    tracker: DeltaTracker,
    urls: ProjectUrlTable,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn urls(&self) -> &ProjectUrlTable {
        &self.urls
    }

    /// Fold one raw event into the state, returning the client event it
    /// produces, if any.
    pub fn observe(
        &mut self,
        event: AgentEvent,
        options: &NormalizerOptions,
    ) -> Result<Option<StreamEvent>, DeltaError> {
        match event {
            AgentEvent::ToolResult { name, result } => {
                // Last tool result wins, even when it lists no URLs.
                self.urls = parse_url_table(&result);
                tracing::info!(tool_name = %name, project_urls = ?self.urls, "Extracted project URLs");
                Ok(None)
            }
            AgentEvent::Other { .. } => Ok(None),
            AgentEvent::Model(message) => match message.content_blocks.last() {
                None => Ok(None),
                Some(ContentBlock::Text { text }) => {
                    if text.is_empty() {
                        return Ok(None);
                    }
                    Ok(self.tracker.update(text)?.map(StreamEvent::update))
                }
                Some(ContentBlock::ToolCall { name, .. }) => {
                    tracing::info!(tool_name = %name, "Tool called");
                    self.tracker.reset();
                    Ok(match options.surfacing {
                        ToolSurfacing::Client => Some(StreamEvent::ToolInvoked { name: name.clone() }),
                        ToolSurfacing::LogOnly => None,
                    })
                }
            },
        }
    }

    /// The closing update after a clean end of stream: links the answer
    /// mentions but forgot to include.
    pub fn finish(&self, options: &NormalizerOptions) -> Option<StreamEvent> {
        if !options.repair_urls || self.urls.is_empty() || self.tracker.text().is_empty() {
            return None;
        }
        let repaired = repair(self.tracker.text(), &self.urls);
        if repaired.is_noop() {
            return None;
        }
        tracing::info!(
            appended = %repaired.suffix.chars().take(100).collect::<String>(),
            "Adding missing URLs"
        );
        Some(StreamEvent::update(repaired.suffix))
    }
}

/// Normalize a raw agent event stream into client events.
///
/// The output ends either cleanly (after the optional URL-repair update) or
/// with exactly one [`StreamEvent::Error`]; an upstream failure is never
/// propagated as a fault. Dropping the returned stream drops `upstream`.
pub fn normalize<S>(
    upstream: S,
    options: NormalizerOptions,
    request_id: String,
) -> impl Stream<Item = StreamEvent> + Send
where
    S: Stream<Item = anyhow::Result<AgentEvent>> + Send + 'static,
{
    async_stream::stream! {
        let mut state = StreamState::new();
        let mut update_count = 0usize;

        futures::pin_mut!(upstream);
        while let Some(item) = upstream.next().await {
            let outcome = item.and_then(|event| state.observe(event, &options).map_err(anyhow::Error::from));
            match outcome {
                Ok(Some(event)) => {
                    if let StreamEvent::Update { delta } = &event {
                        update_count += 1;
                        tracing::trace!(request_id = %request_id, delta_length = delta.len(), "Update");
                    }
                    yield event;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        request_id = %request_id,
                        updates_sent = update_count,
                        error = format!("{e:#}"),
                        "Error during streaming"
                    );
                    yield StreamEvent::Error {
                        message: format!("Stream error: {e:#}"),
                    };
                    return;
                }
            }
        }

        if let Some(event) = state.finish(&options) {
            yield event;
        }
        tracing::info!(request_id = %request_id, updates_sent = update_count, "Stream complete");
    }
}
