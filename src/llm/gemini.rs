//! Native Gemini strategy. Gemini does not speak the chat-completions
//! protocol, so it gets its own request/response mapping and SSE parsing;
//! the rest of the system only ever sees [`ChatEvent`]s.

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;

use super::client::{send_with_retries, stream_lines, strip_think_tags, ChatEventStream, LLM_CALL_TIMEOUT};
use super::{ChatEvent, ChatMessage, FinishReason, LlmContext, LlmError, ToolDefinition};

pub const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// One-shot completion against the native `generateContent` endpoint.
pub async fn complete(
    client: &reqwest::Client,
    ctx: &LlmContext,
    messages: Vec<ChatMessage>,
) -> Result<String, LlmError> {
    let url = format!("{BASE_URL}/models/{}:generateContent", ctx.model);
    let body = build_request(&messages, None);

    let resp = send_with_retries(|| {
        client
            .post(&url)
            .timeout(LLM_CALL_TIMEOUT)
            .header("x-goog-api-key", &ctx.api_key)
            .json(&body)
    })
    .await?;

    let response: GenerateResponse = resp
        .json()
        .await
        .map_err(|e| LlmError::Failure(format!("failed to parse Gemini response: {e}")))?;

    let text = response
        .candidates
        .into_iter()
        .next()
        .map(|c| {
            c.content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    Ok(strip_think_tags(&text))
}

/// Streaming completion against `streamGenerateContent?alt=sse`. Gemini
/// delivers function calls whole within a single chunk, so no cross-delta
/// argument buffering is needed.
pub async fn stream_chat(
    client: &reqwest::Client,
    ctx: &LlmContext,
    messages: Vec<ChatMessage>,
    tools: Option<&[ToolDefinition]>,
) -> Result<ChatEventStream, LlmError> {
    let url = format!(
        "{BASE_URL}/models/{}:streamGenerateContent?alt=sse",
        ctx.model
    );
    let body = build_request(&messages, tools);

    let resp = send_with_retries(|| {
        client
            .post(&url)
            .timeout(LLM_CALL_TIMEOUT)
            .header("x-goog-api-key", &ctx.api_key)
            .json(&body)
    })
    .await?;

    let lines = stream_lines(resp.bytes_stream());

    struct State<S> {
        lines: Pin<Box<S>>,
        pending: VecDeque<ChatEvent>,
        saw_tool_call: bool,
        finished: bool,
        call_counter: usize,
    }

    let state = State {
        lines: Box::pin(lines),
        pending: VecDeque::new(),
        saw_tool_call: false,
        finished: false,
        call_counter: 0,
    };

    let stream = futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }

            match state.lines.next().await {
                Some(Ok(line)) => {
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };
                    let chunk: GenerateResponse = match serde_json::from_str(data) {
                        Ok(c) => c,
                        Err(e) => {
                            state.finished = true;
                            return Some((
                                Err(LlmError::Failure(format!(
                                    "failed to parse Gemini chunk: {e}"
                                ))),
                                state,
                            ));
                        }
                    };

                    let Some(candidate) = chunk.candidates.into_iter().next() else {
                        continue;
                    };

                    for part in candidate.content.parts {
                        if let Some(text) = part.text {
                            if !text.is_empty() {
                                state.pending.push_back(ChatEvent::ContentDelta(text));
                            }
                        }
                        if let Some(call) = part.function_call {
                            state.call_counter += 1;
                            state.saw_tool_call = true;
                            state.pending.push_back(ChatEvent::ToolCallRequest {
                                id: format!("call_{}", state.call_counter),
                                name: call.name,
                                arguments: call.args.to_string(),
                            });
                        }
                    }

                    if candidate.finish_reason.is_some() {
                        let reason = if state.saw_tool_call {
                            FinishReason::ToolCalls
                        } else {
                            FinishReason::Stop
                        };
                        state.pending.push_back(ChatEvent::Finish(reason));
                        state.finished = true;
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((
                        Err(LlmError::Failure(format!("stream read error: {e}"))),
                        state,
                    ));
                }
                None => {
                    state.finished = true;
                    return None;
                }
            }
        }
    });

    Ok(Box::pin(stream))
}

/// Map the provider-neutral message list onto Gemini's request shape:
/// system turns become `system_instruction`, assistant tool calls become
/// `functionCall` parts, tool results become `functionResponse` parts.
fn build_request(messages: &[ChatMessage], tools: Option<&[ToolDefinition]>) -> Value {
    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for msg in messages {
        match msg.role.as_str() {
            "system" => {
                if let Some(content) = &msg.content {
                    system_texts.push(content.clone());
                }
            }
            "assistant" => {
                let mut parts: Vec<Value> = Vec::new();
                if let Some(content) = &msg.content {
                    if !content.is_empty() {
                        parts.push(json!({"text": content}));
                    }
                }
                if let Some(tool_calls) = &msg.tool_calls {
                    for tc in tool_calls {
                        let args: Value = serde_json::from_str(&tc.function.arguments)
                            .unwrap_or_else(|_| json!({}));
                        parts.push(json!({
                            "functionCall": {"name": tc.function.name, "args": args}
                        }));
                    }
                }
                if !parts.is_empty() {
                    contents.push(json!({"role": "model", "parts": parts}));
                }
            }
            "tool" => {
                let response: Value = msg
                    .content
                    .as_deref()
                    .and_then(|c| serde_json::from_str(c).ok())
                    .unwrap_or_else(|| json!({"content": msg.content}));
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": msg.name.clone().unwrap_or_default(),
                            "response": wrap_response(response),
                        }
                    }]
                }));
            }
            _ => {
                contents.push(json!({
                    "role": "user",
                    "parts": [{"text": msg.content.clone().unwrap_or_default()}]
                }));
            }
        }
    }

    let mut body = json!({"contents": contents});
    if !system_texts.is_empty() {
        body["system_instruction"] = json!({"parts": [{"text": system_texts.join("\n\n")}]});
    }
    if let Some(tools) = tools {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!([{"function_declarations": declarations}]);
    }
    body
}

/// Gemini requires functionResponse.response to be a JSON object.
fn wrap_response(value: Value) -> Value {
    if value.is_object() {
        value
    } else {
        json!({"result": value})
    }
}

/// Batch embeddings via `batchEmbedContents`, order-preserving.
pub async fn embed_batch(
    client: &reqwest::Client,
    ctx: &LlmContext,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, LlmError> {
    let url = format!("{BASE_URL}/models/{}:batchEmbedContents", ctx.model);
    let requests: Vec<Value> = texts
        .iter()
        .map(|t| {
            json!({
                "model": format!("models/{}", ctx.model),
                "content": {"parts": [{"text": t}]},
            })
        })
        .collect();

    let resp = send_with_retries(|| {
        client
            .post(&url)
            .timeout(LLM_CALL_TIMEOUT)
            .header("x-goog-api-key", &ctx.api_key)
            .json(&json!({"requests": requests}))
    })
    .await?;

    #[derive(Deserialize)]
    struct BatchResponse {
        embeddings: Vec<Embedding>,
    }
    #[derive(Deserialize)]
    struct Embedding {
        values: Vec<f32>,
    }

    let body: BatchResponse = resp
        .json()
        .await
        .map_err(|e| LlmError::Failure(format!("failed to parse Gemini embeddings: {e}")))?;

    Ok(body.embeddings.into_iter().map(|e| e.values).collect())
}

// ─── Response shapes ─────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}
