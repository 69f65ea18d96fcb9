//! Chat-completions client for OpenAI-compatible providers, with a
//! streaming parser that buffers tool-call argument fragments until the
//! provider reports `finish_reason`.

use futures_util::stream::{Stream, StreamExt};
use rand::Rng;
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use super::{gemini, ChatEvent, ChatMessage, FinishReason, LlmContext, LlmError, ToolDefinition};

pub type ChatEventStream = Pin<Box<dyn Stream<Item = Result<ChatEvent, LlmError>> + Send>>;

/// Per-LLM-call timeout.
pub const LLM_CALL_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_TRANSPORT_RETRIES: u32 = 3;
const MAX_RATE_LIMIT_RETRIES: u32 = 5;

// ─── Non-streaming completion ────────────────────────────

/// One-shot chat completion. Used for summarization and the overview call.
pub async fn complete(
    client: &reqwest::Client,
    ctx: &LlmContext,
    messages: Vec<ChatMessage>,
) -> Result<String, LlmError> {
    if !ctx.provider.is_openai_compatible() {
        return gemini::complete(client, ctx, messages).await;
    }

    let url = format!("{}/chat/completions", ctx.provider.base_url());
    let body = serde_json::json!({
        "model": ctx.model,
        "messages": messages,
        "temperature": 0.3,
        "stream": false,
    });

    let resp = send_with_retries(|| {
        client
            .post(&url)
            .timeout(LLM_CALL_TIMEOUT)
            .header("Authorization", format!("Bearer {}", ctx.api_key))
            .json(&body)
    })
    .await?;

    #[derive(Deserialize)]
    struct Completion {
        choices: Vec<Choice>,
    }
    #[derive(Deserialize)]
    struct Choice {
        message: ChoiceMessage,
    }
    #[derive(Deserialize)]
    struct ChoiceMessage {
        content: Option<String>,
    }

    let completion: Completion = resp
        .json()
        .await
        .map_err(|e| LlmError::Failure(format!("failed to parse completion: {e}")))?;

    let content = completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();

    Ok(strip_think_tags(&content))
}

// ─── Streaming chat ──────────────────────────────────────

/// Stream a chat completion. Content arrives as `ContentDelta` events;
/// tool-call requests are buffered across deltas and emitted whole,
/// followed by a `Finish` event carrying the provider's finish reason.
pub async fn stream_chat(
    client: &reqwest::Client,
    ctx: &LlmContext,
    messages: Vec<ChatMessage>,
    tools: Option<&[ToolDefinition]>,
) -> Result<ChatEventStream, LlmError> {
    if !ctx.provider.is_openai_compatible() {
        return gemini::stream_chat(client, ctx, messages, tools).await;
    }

    let url = format!("{}/chat/completions", ctx.provider.base_url());
    let mut body = serde_json::json!({
        "model": ctx.model,
        "messages": messages,
        "temperature": 0.3,
        "stream": true,
    });
    if let Some(tools) = tools {
        body["tools"] = serde_json::Value::Array(tools.iter().map(|t| t.to_openai()).collect());
        body["tool_choice"] = serde_json::Value::String("auto".to_string());
    }

    let resp = send_with_retries(|| {
        client
            .post(&url)
            .timeout(LLM_CALL_TIMEOUT)
            .header("Authorization", format!("Bearer {}", ctx.api_key))
            .json(&body)
    })
    .await?;

    let lines = stream_lines(resp.bytes_stream());

    struct StreamState<S> {
        lines: Pin<Box<S>>,
        partials: Vec<PartialToolCall>,
        pending: VecDeque<ChatEvent>,
        done: bool,
    }

    let state = StreamState {
        lines: Box::pin(lines),
        partials: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };

    let stream = futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }

            match state.lines.next().await {
                Some(Ok(line)) => match parse_stream_line(&line) {
                    LineOutcome::Skip => continue,
                    LineOutcome::Done => {
                        state.done = true;
                        continue;
                    }
                    LineOutcome::Error(message) => {
                        state.done = true;
                        return Some((Err(LlmError::Failure(message)), state));
                    }
                    LineOutcome::Delta(delta) => {
                        if let Some(content) = delta.content {
                            if !content.is_empty() {
                                state.pending.push_back(ChatEvent::ContentDelta(content));
                            }
                        }
                        for tc in delta.tool_calls {
                            apply_tool_call_delta(&mut state.partials, tc);
                        }
                        if let Some(reason) = delta.finish_reason {
                            for partial in state.partials.drain(..) {
                                state.pending.push_back(ChatEvent::ToolCallRequest {
                                    id: partial.id,
                                    name: partial.name,
                                    arguments: partial.arguments,
                                });
                            }
                            state.pending.push_back(ChatEvent::Finish(match reason.as_str() {
                                "stop" => FinishReason::Stop,
                                "tool_calls" => FinishReason::ToolCalls,
                                other => FinishReason::Other(other.to_string()),
                            }));
                        }
                        continue;
                    }
                },
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(LlmError::Failure(format!("stream read error: {e}"))), state));
                }
                None => {
                    state.done = true;
                    // Stream ended without a finish chunk; flush what we have
                    if !state.partials.is_empty() {
                        for partial in state.partials.drain(..) {
                            state.pending.push_back(ChatEvent::ToolCallRequest {
                                id: partial.id,
                                name: partial.name,
                                arguments: partial.arguments,
                            });
                        }
                        state.pending.push_back(ChatEvent::Finish(FinishReason::ToolCalls));
                        continue;
                    }
                    return None;
                }
            }
        }
    });

    Ok(Box::pin(stream))
}

// ─── Stream line parsing ─────────────────────────────────

#[derive(Debug, Default)]
struct LineDelta {
    content: Option<String>,
    tool_calls: Vec<ToolCallDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

enum LineOutcome {
    Delta(LineDelta),
    Skip,
    Done,
    Error(String),
}

/// Parse a single SSE line from a chat-completions stream.
fn parse_stream_line(line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Skip;
    }

    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return LineOutcome::Skip;
    };

    if data == "[DONE]" {
        return LineOutcome::Done;
    }

    #[derive(Deserialize)]
    struct Chunk {
        choices: Vec<ChunkChoice>,
    }
    #[derive(Deserialize)]
    struct ChunkChoice {
        #[serde(default)]
        delta: ChunkDelta,
        #[serde(default)]
        finish_reason: Option<String>,
    }
    #[derive(Deserialize, Default)]
    struct ChunkDelta {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        tool_calls: Option<Vec<ToolCallDelta>>,
    }

    match serde_json::from_str::<Chunk>(data) {
        Ok(chunk) => {
            let Some(choice) = chunk.choices.into_iter().next() else {
                return LineOutcome::Skip;
            };
            LineOutcome::Delta(LineDelta {
                content: choice.delta.content,
                tool_calls: choice.delta.tool_calls.unwrap_or_default(),
                finish_reason: choice.finish_reason,
            })
        }
        Err(e) => LineOutcome::Error(format!("failed to parse stream chunk: {e}")),
    }
}

/// Fold one tool-call fragment into the per-index accumulator.
fn apply_tool_call_delta(partials: &mut Vec<PartialToolCall>, delta: ToolCallDelta) {
    while partials.len() <= delta.index {
        partials.push(PartialToolCall::default());
    }
    let partial = &mut partials[delta.index];
    if let Some(id) = delta.id {
        partial.id = id;
    }
    if let Some(function) = delta.function {
        if let Some(name) = function.name {
            partial.name = name;
        }
        if let Some(arguments) = function.arguments {
            partial.arguments.push_str(&arguments);
        }
    }
}

// ─── Retries ─────────────────────────────────────────────

/// Send a request with the shared retry discipline: transport errors and
/// 5xx retry up to 3 times with jitter; 429 backs off up to 5 times;
/// 400/401/403 are fatal.
pub async fn send_with_retries(
    build: impl Fn() -> reqwest::RequestBuilder,
) -> Result<reqwest::Response, LlmError> {
    let mut transport_attempts = 0u32;
    let mut rate_limit_attempts = 0u32;

    loop {
        match build().send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return Ok(resp);
                }
                if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    rate_limit_attempts += 1;
                    if rate_limit_attempts > MAX_RATE_LIMIT_RETRIES {
                        return Err(LlmError::RateLimited(format!("{status}")));
                    }
                    let delay = backoff_delay(rate_limit_attempts, 1_000);
                    tracing::warn!("provider rate limited, backing off {delay:?}");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                if status.is_client_error() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(LlmError::Unauthorized(format!(
                        "provider rejected request ({status}): {body}"
                    )));
                }
                // 5xx: retry as transport
                transport_attempts += 1;
                if transport_attempts > MAX_TRANSPORT_RETRIES {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(LlmError::Failure(format!(
                        "provider returned {status}: {body}"
                    )));
                }
                let delay = backoff_delay(transport_attempts, 500);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                transport_attempts += 1;
                if transport_attempts > MAX_TRANSPORT_RETRIES {
                    return Err(LlmError::Failure(format!("transport error: {e}")));
                }
                let delay = backoff_delay(transport_attempts, 500);
                tracing::warn!("transport error: {e}, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn backoff_delay(attempt: u32, base_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..base_ms / 2 + 1);
    Duration::from_millis(exp + jitter)
}

// ─── Line buffering ──────────────────────────────────────

/// Convert a byte stream into a stream of complete lines.
pub fn stream_lines(
    byte_stream: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl Stream<Item = anyhow::Result<String>> + Send {
    futures_util::stream::unfold(
        (Box::pin(byte_stream), String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer[..newline_pos].to_string();
                    buffer = buffer[newline_pos + 1..].to_string();
                    if !line.trim().is_empty() {
                        return Some((Ok(line), (stream, buffer)));
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(anyhow::anyhow!("stream read error: {e}")),
                            (stream, buffer),
                        ));
                    }
                    None => {
                        if !buffer.trim().is_empty() {
                            let remaining = std::mem::take(&mut buffer);
                            return Some((Ok(remaining), (stream, buffer)));
                        }
                        return None;
                    }
                }
            }
        },
    )
}

// ─── Think-tag filtering ─────────────────────────────────

/// Remove `<think>...</think>` spans from a complete response.
pub fn strip_think_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find("<think>") {
            Some(start) => {
                out.push_str(&rest[..start]);
                match rest[start..].find("</think>") {
                    Some(end_rel) => {
                        rest = &rest[start + end_rel + "</think>".len()..];
                    }
                    None => {
                        // Unterminated think block: drop the remainder
                        rest = "";
                    }
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out.trim().to_string()
}

/// Streaming `<think>` filter. Reasoning models interleave their chain of
/// thought in think tags; those spans are dropped from the streamed answer,
/// including tags split across chunk boundaries.
#[derive(Debug, Default)]
pub struct ThinkFilter {
    buffer: String,
    inside: bool,
}

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

impl ThinkFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one content delta; returns the filtered text safe to emit now.
    pub fn push(&mut self, chunk: &str) -> String {
        self.buffer.push_str(chunk);
        let mut out = String::new();

        loop {
            if self.inside {
                match self.buffer.find(CLOSE_TAG) {
                    Some(end) => {
                        self.buffer.drain(..end + CLOSE_TAG.len());
                        self.inside = false;
                    }
                    None => {
                        // Keep a tail in case the close tag is split
                        let keep = CLOSE_TAG.len().saturating_sub(1);
                        let drain_to = self.buffer.len().saturating_sub(keep);
                        let boundary = floor_char_boundary(&self.buffer, drain_to);
                        self.buffer.drain(..boundary);
                        break;
                    }
                }
            } else {
                match self.buffer.find(OPEN_TAG) {
                    Some(start) => {
                        out.push_str(&self.buffer[..start]);
                        self.buffer.drain(..start + OPEN_TAG.len());
                        self.inside = true;
                    }
                    None => {
                        // Hold back a tail in case the open tag is split
                        let keep = OPEN_TAG.len().saturating_sub(1);
                        if self.buffer.len() > keep {
                            let drain_to = self.buffer.len() - keep;
                            let boundary = floor_char_boundary(&self.buffer, drain_to);
                            out.push_str(&self.buffer[..boundary]);
                            self.buffer.drain(..boundary);
                        }
                        break;
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is held back at end of stream.
    pub fn flush(&mut self) -> String {
        if self.inside {
            self.buffer.clear();
            return String::new();
        }
        std::mem::take(&mut self.buffer)
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
