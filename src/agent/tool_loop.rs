//! Agent with tool loop execution.
//!
//! The agent manages the complete lifecycle of one conversation turn:
//! 1. Send the persona prompt and history to the LLM
//! 2. Stream the response, snapshotting the assistant message as it grows
//! 3. Execute tool calls through the [`ToolRegistry`]
//! 4. Feed tool results back to the LLM
//! 5. Repeat until the model answers without calling a tool
//!
//! Each iteration of the loop is a new assistant message, so text always
//! restarts from empty after a tool call.

use std::sync::Arc;

use futures::StreamExt;
use uuid::Uuid;

use super::{Agent, AgentEvent, AgentEventStream, AgentMessage, ContentBlock};
use crate::llm::{LlmChunk, LlmDriver, LlmRequest, Message, ToolCall};
use crate::tools::ToolRegistry;

/// Default bound on tool loop iterations.
pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 10;

/// LLM + tools agent.
#[derive(Clone)]
pub struct ToolLoopAgent {
    driver: Arc<dyn LlmDriver>,
    tools: Arc<ToolRegistry>,
    system_prompt: String,
    max_iterations: usize,
}

impl std::fmt::Debug for ToolLoopAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolLoopAgent")
            .field("driver", &self.driver)
            .field("tools", &self.tools)
            .field("max_iterations", &self.max_iterations)
            .finish_non_exhaustive()
    }
}

impl ToolLoopAgent {
    pub fn new(
        driver: Arc<dyn LlmDriver>,
        tools: Arc<ToolRegistry>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            driver,
            tools,
            system_prompt: system_prompt.into(),
            max_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
        }
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    fn initial_messages(&self, history: &[Message]) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !self.system_prompt.is_empty() {
            messages.push(serde_json::json!({
                "role": "system",
                "content": self.system_prompt,
            }));
        }
        messages.extend(
            history
                .iter()
                .map(|m| serde_json::to_value(m).unwrap_or_default()),
        );
        messages
    }
}

/// Text fed back to the model for a tool's return value.
fn tool_output_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Decode a call's JSON arguments, falling back to `{}` when the model sent
/// something unparseable.
fn parse_tool_arguments(call: &ToolCall) -> serde_json::Value {
    match serde_json::from_str(&call.arguments) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                tool_id = %call.id,
                tool_name = %call.name,
                arguments = %call.arguments,
                error = %e,
                "Malformed tool call arguments, calling with empty object"
            );
            serde_json::Value::Object(serde_json::Map::new())
        }
    }
}

#[async_trait::async_trait]
impl Agent for ToolLoopAgent {
    async fn stream(
        &self,
        history: Vec<Message>,
        temperature: Option<f32>,
    ) -> anyhow::Result<AgentEventStream> {
        let run_id = Uuid::new_v4().to_string();
        let tools_json = self.tools.openai_tools_json();
        let mut message_json = self.initial_messages(&history);

        tracing::info!(
            run_id = %run_id,
            message_count = history.len(),
            tool_count = tools_json.len(),
            "Starting agent run"
        );

        let agent = self.clone();

        let stream = async_stream::try_stream! {
            let mut iteration = 0;
            let mut finished = false;

            while !finished {
                if iteration >= agent.max_iterations {
                    tracing::error!(
                        run_id = %run_id,
                        max_iterations = agent.max_iterations,
                        "Maximum tool loop iterations exceeded"
                    );
                    Err::<(), _>(anyhow::anyhow!("Maximum tool loop iterations exceeded"))?;
                }
                iteration += 1;

                let req = LlmRequest {
                    messages: message_json.clone(),
                    tools: tools_json.clone(),
                    temperature,
                };

                tracing::debug!(
                    run_id = %run_id,
                    iteration = iteration,
                    message_count = req.messages.len(),
                    "Sending request to LLM driver"
                );

                let mut driver_stream = agent.driver.stream(req).await?;
                let mut message = AgentMessage::default();
                let mut assistant_text = String::new();
                let mut tool_calls: Vec<ToolCall> = Vec::new();

                while let Some(chunk) = driver_stream.next().await {
                    match chunk? {
                        LlmChunk::TextDelta { text } => {
                            assistant_text.push_str(&text);
                            message.push_text(&text);
                            yield AgentEvent::Model(message.clone());
                        }
                        LlmChunk::ToolCallDelta { call_index } => {
                            tracing::trace!(run_id = %run_id, call_index = call_index, "Tool call streaming");
                            yield AgentEvent::Other { kind: "tool_call.delta".to_string() };
                        }
                        LlmChunk::ToolCallComplete { call, .. } => {
                            message.content_blocks.push(ContentBlock::ToolCall {
                                id: call.id.clone(),
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            });
                            tool_calls.push(call);
                            yield AgentEvent::Model(message.clone());
                        }
                        LlmChunk::Done => {}
                    }
                }

                if tool_calls.is_empty() {
                    tracing::info!(
                        run_id = %run_id,
                        iteration = iteration,
                        content_length = assistant_text.len(),
                        "Agent run complete"
                    );
                    finished = true;
                } else {
                    message_json.push(serde_json::json!({
                        "role": "assistant",
                        "content": if assistant_text.is_empty() { serde_json::Value::Null } else { serde_json::Value::String(assistant_text.clone()) },
                        "tool_calls": tool_calls.iter().map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments
                                }
                            })
                        }).collect::<Vec<_>>()
                    }));

                    for tool_call in &tool_calls {
                        let arguments = parse_tool_arguments(tool_call);

                        tracing::info!(
                            run_id = %run_id,
                            iteration = iteration,
                            tool_id = %tool_call.id,
                            tool_name = %tool_call.name,
                            "Executing tool call"
                        );

                        let output = match agent.tools.call(&tool_call.name, arguments).await {
                            Ok(value) => tool_output_text(value),
                            Err(e) => {
                                tracing::error!(
                                    run_id = %run_id,
                                    tool_name = %tool_call.name,
                                    error = %e,
                                    "Tool call failed"
                                );
                                Err(e.context(format!("tool '{}' failed", tool_call.name)))?
                            }
                        };

                        tracing::debug!(
                            run_id = %run_id,
                            tool_id = %tool_call.id,
                            result_length = output.len(),
                            "Tool call succeeded"
                        );

                        message_json.push(serde_json::json!({
                            "role": "tool",
                            "tool_call_id": tool_call.id,
                            "content": output,
                        }));

                        yield AgentEvent::ToolResult {
                            name: tool_call.name.clone(),
                            result: output,
                        };
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
