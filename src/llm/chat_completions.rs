//! OpenAI Chat Completions API driver.
//!
//! This module implements the [`LlmDriver`] trait for the Chat Completions
//! API, supporting streaming responses and tool calls. Decoding of the SSE body
//! is split into [`ChunkDecoder`] so it can be exercised without a network.

use std::collections::BTreeMap;

use futures::StreamExt;

use super::provider::AuthStyle;
use super::{LlmChunk, LlmDriver, LlmRequest, LlmSettings, LlmStream, ToolCall};

/// Accumulated state for a streaming tool call.
#[derive(Debug, Default)]
struct ToolAccum {
    id: Option<String>,
    name: Option<String>,
    args: String,
}

/// Incremental decoder from raw SSE bytes to [`LlmChunk`]s.
///
/// Tool calls are assembled from their deltas and released as
/// [`LlmChunk::ToolCallComplete`] once the choice reports a finish reason or
/// the stream reports `[DONE]`, whichever comes first.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    buf: Vec<u8>,
    tool_accum: BTreeMap<usize, ToolAccum>,
    finished: bool,
}

impl ChunkDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every chunk completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> anyhow::Result<Vec<LlmChunk>> {
        // CRLF framing is folded to LF so frames split on a plain blank line.
        self.buf.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
        let mut out = Vec::new();

        while let Some(pos) = find_double_newline(&self.buf) {
            let frame = self.buf.drain(..pos + 2).collect::<Vec<_>>();
            let text = String::from_utf8_lossy(&frame);

            for line in text.lines() {
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                self.decode_data(data.trim(), &mut out)?;
            }
        }

        Ok(out)
    }

    /// Flush tool calls still pending when the body ends without `[DONE]`.
    pub fn finish(&mut self) -> Vec<LlmChunk> {
        let mut out = Vec::new();
        self.flush_tool_calls(&mut out);
        out
    }

    fn decode_data(&mut self, data: &str, out: &mut Vec<LlmChunk>) -> anyhow::Result<()> {
        if data == "[DONE]" {
            self.flush_tool_calls(out);
            if !self.finished {
                self.finished = true;
                out.push(LlmChunk::Done);
            }
            return Ok(());
        }

        let v: serde_json::Value = serde_json::from_str(data)?;
        if let Some(err) = v.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .map_or_else(|| err.to_string(), ToString::to_string);
            anyhow::bail!("provider error: {message}");
        }

        let choice = &v["choices"][0];
        let delta = &choice["delta"];

        if let Some(s) = delta.get("content").and_then(|x| x.as_str())
            && !s.is_empty()
        {
            out.push(LlmChunk::TextDelta {
                text: s.to_string(),
            });
        }

        if let Some(arr) = delta.get("tool_calls").and_then(|x| x.as_array()) {
            for tc in arr {
                let idx = tc
                    .get("index")
                    .and_then(serde_json::Value::as_u64)
                    .and_then(|i| usize::try_from(i).ok())
                    .unwrap_or(0);
                let id = tc
                    .get("id")
                    .and_then(|x| x.as_str())
                    .map(ToString::to_string);
                let function = tc.get("function");
                let name = function
                    .and_then(|f| f.get("name"))
                    .and_then(|x| x.as_str())
                    .map(ToString::to_string);
                let args_delta = function
                    .and_then(|f| f.get("arguments"))
                    .and_then(|x| x.as_str());

                let entry = self.tool_accum.entry(idx).or_default();
                if entry.id.is_none() {
                    entry.id = id;
                }
                if entry.name.is_none() {
                    entry.name = name;
                }
                if let Some(ad) = args_delta {
                    entry.args.push_str(ad);
                }

                out.push(LlmChunk::ToolCallDelta { call_index: idx });
            }
        }

        if choice
            .get("finish_reason")
            .and_then(|x| x.as_str())
            .is_some()
        {
            self.flush_tool_calls(out);
        }

        Ok(())
    }

    fn flush_tool_calls(&mut self, out: &mut Vec<LlmChunk>) {
        for (idx, a) in std::mem::take(&mut self.tool_accum) {
            let Some(name) = a.name else {
                tracing::warn!(call_index = idx, "Dropping tool call without a name");
                continue;
            };
            let id = a.id.unwrap_or_else(|| format!("call_{idx}"));
            let arguments = if a.args.trim().is_empty() {
                "{}".to_string()
            } else {
                a.args
            };
            out.push(LlmChunk::ToolCallComplete {
                call_index: idx,
                call: ToolCall {
                    id,
                    name,
                    arguments,
                },
            });
        }
    }
}

/// Driver for the OpenAI Chat Completions API.
#[derive(Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsDriver")
            .field("base_url", &self.settings.base_url)
            .field("model", &self.settings.model)
            .field("provider", &self.settings.provider)
            .finish_non_exhaustive()
    }
}

impl ChatCompletionsDriver {
    /// Create a new Chat Completions driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }
}

#[async_trait::async_trait]
impl LlmDriver for ChatCompletionsDriver {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<LlmStream> {
        let url = self
            .settings
            .provider
            .build_chat_url(&self.settings.base_url);

        let mut body = serde_json::json!({
            "model": self.settings.model,
            "stream": true,
            "messages": req.messages,
        });
        if !req.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(req.tools);
        }
        if let Some(t) = req.temperature {
            body["temperature"] = serde_json::json!(t);
        }

        let mut rb = self.http.post(&url).json(&body);
        if let Some(k) = &self.settings.api_key {
            rb = match self.settings.provider.auth_style() {
                AuthStyle::Bearer => rb.bearer_auth(k),
                AuthStyle::ApiKeyHeader => rb.header("api-key", k),
            };
        }

        tracing::debug!(url = %url, model = %self.settings.model, "Opening chat completions stream");

        let resp = rb.send().await?.error_for_status()?;
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut decoder = ChunkDecoder::new();

            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                for decoded in decoder.push(&chunk)? {
                    yield decoded;
                }
            }
            for decoded in decoder.finish() {
                yield decoded;
            }
        };

        Ok(Box::pin(out))
    }
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}
