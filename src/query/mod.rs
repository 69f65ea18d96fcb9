//! The streaming query engine: conversation history windowing, the
//! bounded tool-call loop, and event emission toward the SSE boundary.
//!
//! One call = one turn. The engine holds the per-conversation lock for the
//! whole turn so message sequence numbers stay contiguous; if the consumer
//! disconnects mid-stream, the partial assistant message is persisted with
//! `provider_meta.truncated = true`.

pub mod tools;

use futures_util::stream::{Stream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;

use crate::llm::client::{stream_chat, ThinkFilter};
use crate::llm::{ChatEvent, ChatMessage, LlmContext};
use crate::models::{
    ProviderMeta, QueryEvent, Role, SourceRef, ToolCallFunction, ToolCallRecord, ToolCallSummary,
};
use crate::store::Store;

/// Tool-call iterations before the engine forces a tool-less final turn.
const MAX_TOOL_ITERATIONS: usize = 6;
/// Messages of history replayed into the model context.
const HISTORY_WINDOW: usize = 20;
/// Conversation titles derive from the first user turn, clipped here.
const TITLE_MAX_CHARS: usize = 80;
/// Per-tool execution timeout; a timeout becomes an error tool-result.
const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything one query turn needs.
pub struct QueryDeps {
    pub store: Arc<Store>,
    pub http: reqwest::Client,
    pub chat_ctx: LlmContext,
    pub embed_ctx: LlmContext,
    pub llm_semaphore: Arc<Semaphore>,
}

/// Run one query turn, returning the event stream consumed by the SSE
/// handler. The turn itself runs on a spawned task; dropping the stream
/// cancels it after the current chunk.
pub fn stream_query(
    deps: QueryDeps,
    session_id: String,
    repo_id: String,
    user_text: String,
) -> impl Stream<Item = QueryEvent> + Send {
    let (tx, rx) = mpsc::channel::<QueryEvent>(32);

    tokio::spawn(async move {
        run_turn(deps, &session_id, &repo_id, &user_text, tx).await;
    });

    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
}

fn build_system_prompt(repo_name: &str) -> String {
    format!(
        "You are a code analysis assistant helping developers understand the repository \
         `{repo_name}`.\n\n\
         You have tools to search and retrieve code:\n\
         1. search_code - hybrid search over code chunks and file summaries; use when you \
         need actual code\n\
         2. search_files - search only file summaries; use for finding files by \
         characteristics\n\
         3. get_repo_overview - high-level repository overview\n\
         4. get_file_by_path - full content of a specific file\n\
         5. find_function - find a function by exact name\n\n\
         Guidelines:\n\
         - ALWAYS use tools to find relevant code before answering; never answer from \
         assumptions\n\
         - You may call multiple tools when a question needs them\n\
         - Cite file paths (and line numbers when available) in every answer\n\
         - If the tools return nothing relevant, say what you looked for and what is \
         missing\n\n\
         After receiving tool results, answer in natural language grounded only in those \
         results."
    )
}

async fn run_turn(
    deps: QueryDeps,
    session_id: &str,
    repo_id: &str,
    user_text: &str,
    tx: mpsc::Sender<QueryEvent>,
) {
    let repo_name = deps
        .store
        .get_repository(repo_id)
        .map(|r| r.full_name)
        .unwrap_or_else(|| repo_id.to_string());

    let title: String = user_text.chars().take(TITLE_MAX_CHARS).collect();
    let system_prompt = build_system_prompt(&repo_name);
    let conversation = deps.store.find_or_create_conversation(
        session_id,
        repo_id,
        &title,
        &system_prompt,
    );
    let conversation_id = conversation.conversation_id.clone();

    // Sequence numbers are assigned under this lock for the whole turn
    let lock = deps.store.conversation_lock(&conversation_id);
    let _guard = lock.lock().await;

    // History first, then the new user turn (persisted immediately)
    let history = deps.store.recent_messages(&conversation_id, HISTORY_WINDOW);
    deps.store.append_message(
        &conversation_id,
        Role::User,
        user_text.to_string(),
        None,
        ProviderMeta::default(),
    );

    let mut messages: Vec<ChatMessage> =
        Vec::with_capacity(history.len() + 2 + MAX_TOOL_ITERATIONS);
    messages.push(ChatMessage::system(conversation.system_prompt.clone()));
    for msg in &history {
        match msg.role {
            Role::User => messages.push(ChatMessage::user(msg.content.clone())),
            // Historical tool_calls are not replayed: their tool results are
            // not persisted, and dangling calls break the protocol
            Role::Assistant => {
                messages.push(ChatMessage::assistant(Some(msg.content.clone()), None))
            }
        }
    }
    messages.push(ChatMessage::user(user_text.to_string()));

    let tool_definitions = tools::definitions();
    let tool_ctx = tools::ToolContext {
        store: deps.store.clone(),
        http: &deps.http,
        embed_ctx: &deps.embed_ctx,
        repo_id,
    };

    let mut full_answer = String::new();
    let mut sources: Vec<SourceRef> = Vec::new();
    let mut seen_sources: HashSet<SourceRef> = HashSet::new();
    let mut tool_calls_made: Vec<ToolCallSummary> = Vec::new();
    let mut executed_tool_calls: Vec<ToolCallRecord> = Vec::new();

    for iteration in 0..=MAX_TOOL_ITERATIONS {
        // The turn after the last tool iteration is forced tool-less
        let offered_tools = if iteration < MAX_TOOL_ITERATIONS {
            Some(tool_definitions.as_slice())
        } else {
            None
        };

        let permit = deps.llm_semaphore.clone().acquire_owned().await;
        let mut stream =
            match stream_chat(&deps.http, &deps.chat_ctx, messages.clone(), offered_tools).await {
                Ok(s) => s,
                Err(e) => {
                    emit_error_and_persist(
                        &deps,
                        &conversation_id,
                        &full_answer,
                        &executed_tool_calls,
                        &tx,
                        e.to_string(),
                    )
                    .await;
                    return;
                }
            };

        let mut think_filter = ThinkFilter::new();
        let mut round_content = String::new();
        let mut round_tool_calls: Vec<ToolCallRecord> = Vec::new();

        loop {
            match stream.next().await {
                Some(Ok(ChatEvent::ContentDelta(delta))) => {
                    let visible = think_filter.push(&delta);
                    if visible.is_empty() {
                        continue;
                    }
                    round_content.push_str(&visible);
                    full_answer.push_str(&visible);
                    if tx
                        .send(QueryEvent::AnswerChunk { content: visible })
                        .await
                        .is_err()
                    {
                        // Client disconnected: stop now, persist the partial
                        persist_assistant(
                            &deps,
                            &conversation_id,
                            &full_answer,
                            &executed_tool_calls,
                            true,
                        );
                        return;
                    }
                }
                Some(Ok(ChatEvent::ToolCallRequest {
                    id,
                    name,
                    arguments,
                })) => {
                    round_tool_calls.push(ToolCallRecord {
                        id,
                        function: ToolCallFunction { name, arguments },
                    });
                }
                Some(Ok(ChatEvent::Finish(_))) => break,
                Some(Err(e)) => {
                    emit_error_and_persist(
                        &deps,
                        &conversation_id,
                        &full_answer,
                        &executed_tool_calls,
                        &tx,
                        e.to_string(),
                    )
                    .await;
                    return;
                }
                None => break,
            }
        }
        drop(stream);
        drop(permit);

        let tail = think_filter.flush();
        if !tail.is_empty() {
            round_content.push_str(&tail);
            full_answer.push_str(&tail);
            if tx
                .send(QueryEvent::AnswerChunk { content: tail })
                .await
                .is_err()
            {
                persist_assistant(
                    &deps,
                    &conversation_id,
                    &full_answer,
                    &executed_tool_calls,
                    true,
                );
                return;
            }
        }

        if round_tool_calls.is_empty() {
            // Terminal turn
            persist_assistant(
                &deps,
                &conversation_id,
                &full_answer,
                &executed_tool_calls,
                false,
            );
            let _ = tx
                .send(QueryEvent::Done {
                    sources,
                    tool_calls: tool_calls_made,
                })
                .await;
            return;
        }

        // Record the assistant's tool-calling turn in the model context
        messages.push(ChatMessage::assistant(
            if round_content.is_empty() {
                None
            } else {
                Some(round_content.clone())
            },
            Some(round_tool_calls.clone()),
        ));

        for call in round_tool_calls {
            // Arguments are parsed exactly once, here at the registry
            // boundary; the parsed value also feeds the tool_call event
            let args_value: serde_json::Value =
                serde_json::from_str(&call.function.arguments).unwrap_or_default();

            if tx
                .send(QueryEvent::ToolCall {
                    tool: call.function.name.clone(),
                    args: args_value.clone(),
                })
                .await
                .is_err()
            {
                persist_assistant(
                    &deps,
                    &conversation_id,
                    &full_answer,
                    &executed_tool_calls,
                    true,
                );
                return;
            }

            let outcome = match tokio::time::timeout(
                TOOL_TIMEOUT,
                tools::execute(&tool_ctx, &call.function.name, args_value.clone()),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => tools::ToolOutcome {
                    result: serde_json::json!({"error": "timeout"}),
                    result_count: 0,
                    sources: Vec::new(),
                },
            };

            if tx
                .send(QueryEvent::ToolResult {
                    tool: call.function.name.clone(),
                    result_count: outcome.result_count,
                })
                .await
                .is_err()
            {
                persist_assistant(
                    &deps,
                    &conversation_id,
                    &full_answer,
                    &executed_tool_calls,
                    true,
                );
                return;
            }

            for source in outcome.sources {
                if seen_sources.insert(source.clone()) {
                    sources.push(source);
                }
            }
            tool_calls_made.push(ToolCallSummary {
                tool: call.function.name.clone(),
                args: args_value,
                result_count: outcome.result_count,
            });

            messages.push(ChatMessage::tool(
                call.id.clone(),
                call.function.name.clone(),
                outcome.result.to_string(),
            ));
            executed_tool_calls.push(call);
        }
    }

    // Defensive close: the forced tool-less turn above always returns, but
    // if the provider misbehaves we still finish the protocol
    persist_assistant(
        &deps,
        &conversation_id,
        &full_answer,
        &executed_tool_calls,
        false,
    );
    let _ = tx
        .send(QueryEvent::Done {
            sources,
            tool_calls: tool_calls_made,
        })
        .await;
}

/// Persist whatever assistant content accumulated this turn.
fn persist_assistant(
    deps: &QueryDeps,
    conversation_id: &str,
    content: &str,
    tool_calls: &[ToolCallRecord],
    truncated: bool,
) {
    if content.is_empty() && tool_calls.is_empty() {
        return;
    }

    let meta = ProviderMeta {
        provider: Some(deps.chat_ctx.provider.name().to_string()),
        model: Some(deps.chat_ctx.model.clone()),
        error: None,
        truncated: truncated.then_some(true),
    };
    deps.store.append_message(
        conversation_id,
        Role::Assistant,
        content.to_string(),
        if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls.to_vec())
        },
        meta,
    );
}

async fn emit_error_and_persist(
    deps: &QueryDeps,
    conversation_id: &str,
    content: &str,
    tool_calls: &[ToolCallRecord],
    tx: &mpsc::Sender<QueryEvent>,
    message: String,
) {
    tracing::warn!("query turn failed: {message}");
    persist_assistant(deps, conversation_id, content, tool_calls, true);
    let _ = tx.send(QueryEvent::Error { error: message }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_names_the_tools_and_citing() {
        let prompt = build_system_prompt("acme/widgets");
        assert!(prompt.contains("acme/widgets"));
        for tool in [
            "search_code",
            "search_files",
            "get_repo_overview",
            "get_file_by_path",
            "find_function",
        ] {
            assert!(prompt.contains(tool), "prompt should mention {tool}");
        }
        assert!(prompt.contains("Cite file paths"));
    }

    #[test]
    fn test_title_clipping_is_char_safe() {
        let text = "é".repeat(200);
        let title: String = text.chars().take(TITLE_MAX_CHARS).collect();
        assert_eq!(title.chars().count(), 80);
    }
}
