//! The tool registry: name → (argument schema, handler). Arguments arrive
//! as the protocol's string-encoded JSON and are parsed exactly once here;
//! invalid arguments and unknown tools produce error tool-results instead
//! of failing the turn.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::llm::{LlmContext, ToolDefinition};
use crate::models::SourceRef;
use crate::search;
use crate::store::Store;

const DEFAULT_TOP_K: usize = 5;

/// Execution context shared by all tool handlers within one turn.
pub struct ToolContext<'a> {
    pub store: Arc<Store>,
    pub http: &'a reqwest::Client,
    pub embed_ctx: &'a LlmContext,
    pub repo_id: &'a str,
}

/// The outcome of one tool execution: the JSON fed back to the model, a
/// result count for the progress event, and the source references that
/// appeared in the result.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub result: Value,
    pub result_count: usize,
    pub sources: Vec<SourceRef>,
}

impl ToolOutcome {
    fn error(message: impl Into<String>) -> Self {
        Self {
            result: json!({"error": message.into()}),
            result_count: 0,
            sources: Vec::new(),
        }
    }
}

/// The fixed tool catalog offered to the model.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "search_code",
            description: "Search for code implementations (functions, classes) AND file \
                summaries using hybrid vector + keyword search. Use this when you need to \
                see actual code. Examples: 'how does the parser work', 'authentication logic'.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Search query, e.g. 'request routing' or 'RDB parser'"
                    },
                    "top_k": {
                        "type": "integer",
                        "description": "Number of results to return (default 5)",
                        "default": DEFAULT_TOP_K
                    }
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: "search_files",
            description: "Search ONLY file summaries (no code chunks). Best for finding \
                files by characteristics or patterns: 'files handling authentication', \
                'configuration files', 'files with security concerns'.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Query about file characteristics"
                    },
                    "top_k": {
                        "type": "integer",
                        "description": "Number of files to return (default 5)",
                        "default": DEFAULT_TOP_K
                    }
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: "get_repo_overview",
            description: "Get the high-level repository overview: purpose, architecture, \
                and the most central files. Use when the user asks what the repo does.",
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
        ToolDefinition {
            name: "get_file_by_path",
            description: "Get the complete content, summary, and structure of a specific \
                file by its path. Use when the user names a file, e.g. 'explain src/main.py'.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path, e.g. 'src/main.py'"
                    }
                },
                "required": ["path"]
            }),
        },
        ToolDefinition {
            name: "find_function",
            description: "Find a function by its exact name across the repository. Use when \
                the user asks about a specific function, e.g. 'show me validateToken'.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "description": "Exact function name, e.g. 'validateToken'"
                    }
                },
                "required": ["name"]
            }),
        },
    ]
}

/// Execute one tool call. `args` is the already-parsed argument object;
/// per-tool validation happens here against the handlers' schemas.
pub async fn execute(ctx: &ToolContext<'_>, name: &str, args: Value) -> ToolOutcome {
    if !args.is_object() {
        return ToolOutcome::error("invalid tool arguments: expected a JSON object");
    }

    match name {
        "search_code" => search_code(ctx, args).await,
        "search_files" => search_files(ctx, args).await,
        "get_repo_overview" => get_repo_overview(ctx).await,
        "get_file_by_path" => get_file_by_path(ctx, args).await,
        "find_function" => find_function(ctx, args).await,
        other => ToolOutcome::error(format!("unknown tool: {other}")),
    }
}

// ─── Handlers ────────────────────────────────────────────

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

async fn search_code(ctx: &ToolContext<'_>, args: Value) -> ToolOutcome {
    let args: SearchArgs = match serde_json::from_value(args) {
        Ok(a) => a,
        Err(e) => return ToolOutcome::error(format!("invalid search_code arguments: {e}")),
    };
    let top_k = args.top_k.unwrap_or(DEFAULT_TOP_K);

    let results = match search::hybrid_search(
        ctx.http,
        ctx.embed_ctx,
        ctx.store.clone(),
        ctx.repo_id,
        &args.query,
        top_k,
    )
    .await
    {
        Ok(r) => r,
        Err(e) => return ToolOutcome::error(format!("search failed: {e}")),
    };

    let mut sources = Vec::new();
    for result in &results {
        if result.code_elements.is_empty() {
            sources.push(SourceRef {
                file_path: result.path.clone(),
                line_start: None,
                line_end: None,
            });
        }
        for element in &result.code_elements {
            sources.push(SourceRef {
                file_path: result.path.clone(),
                line_start: Some(element.line_start),
                line_end: Some(element.line_end),
            });
        }
    }

    ToolOutcome {
        result_count: results.len(),
        result: json!({ "results": results }),
        sources,
    }
}

async fn search_files(ctx: &ToolContext<'_>, args: Value) -> ToolOutcome {
    let args: SearchArgs = match serde_json::from_value(args) {
        Ok(a) => a,
        Err(e) => return ToolOutcome::error(format!("invalid search_files arguments: {e}")),
    };
    let top_k = args.top_k.unwrap_or(DEFAULT_TOP_K);

    let hits = match search::file_search(
        ctx.http,
        ctx.embed_ctx,
        ctx.store.clone(),
        ctx.repo_id,
        &args.query,
        top_k,
    )
    .await
    {
        Ok(h) => h,
        Err(e) => return ToolOutcome::error(format!("search failed: {e}")),
    };

    let sources = hits
        .iter()
        .map(|h| SourceRef {
            file_path: h.path.clone(),
            line_start: None,
            line_end: None,
        })
        .collect();

    ToolOutcome {
        result_count: hits.len(),
        result: json!({ "results": hits }),
        sources,
    }
}

async fn get_repo_overview(ctx: &ToolContext<'_>) -> ToolOutcome {
    let Some(repo) = ctx.store.get_repository(ctx.repo_id) else {
        return ToolOutcome::error("repository not found");
    };

    let key_files: Vec<Value> = ctx
        .store
        .most_imported_files(ctx.repo_id, 10)
        .into_iter()
        .filter_map(|f| {
            let summary = f.summary?;
            Some(json!({"path": f.path, "summary": summary}))
        })
        .collect();

    let sources = key_files
        .iter()
        .filter_map(|kf| kf["path"].as_str())
        .map(|path| SourceRef {
            file_path: path.to_string(),
            line_start: None,
            line_end: None,
        })
        .collect();

    ToolOutcome {
        result: json!({
            "overview": repo.overview,
            "name": repo.full_name,
            "description": repo.description,
            "languages": repo.languages_breakdown,
            "file_count": repo.file_count,
            "key_files": key_files,
        }),
        result_count: 1,
        sources,
    }
}

#[derive(Deserialize)]
struct FileArgs {
    path: String,
}

async fn get_file_by_path(ctx: &ToolContext<'_>, args: Value) -> ToolOutcome {
    let args: FileArgs = match serde_json::from_value(args) {
        Ok(a) => a,
        Err(e) => return ToolOutcome::error(format!("invalid get_file_by_path arguments: {e}")),
    };
    let normalized = args.path.trim_start_matches('/');

    let Some(file) = ctx.store.get_file_by_path(ctx.repo_id, normalized) else {
        return ToolOutcome::error(format!("file not found: {normalized}"));
    };

    ToolOutcome {
        result: json!({
            "path": file.path,
            "language": file.language,
            "content": file.content,
            "summary": file.summary,
            "functions": file.functions,
            "classes": file.classes,
            "dependencies": file.dependencies,
        }),
        result_count: 1,
        sources: vec![SourceRef {
            file_path: file.path,
            line_start: None,
            line_end: None,
        }],
    }
}

#[derive(Deserialize)]
struct FunctionArgs {
    name: String,
}

async fn find_function(ctx: &ToolContext<'_>, args: Value) -> ToolOutcome {
    let args: FunctionArgs = match serde_json::from_value(args) {
        Ok(a) => a,
        Err(e) => return ToolOutcome::error(format!("invalid find_function arguments: {e}")),
    };

    let matches = ctx.store.find_functions_by_name(ctx.repo_id, &args.name);
    if matches.is_empty() {
        return ToolOutcome::error(format!("function not found: {}", args.name));
    }

    let mut sources = Vec::new();
    let entries: Vec<Value> = matches
        .iter()
        .map(|(file, index)| {
            let function = &file.functions[*index];
            sources.push(SourceRef {
                file_path: file.path.clone(),
                line_start: Some(function.line_start),
                line_end: Some(function.line_end),
            });
            json!({
                "path": file.path,
                "function": function,
                "code": crate::pipeline::chunks::extract_code_by_lines(
                    &file.content,
                    function.line_start,
                    function.line_end,
                ),
            })
        })
        .collect();

    ToolOutcome {
        result_count: entries.len(),
        result: json!({ "matches": entries }),
        sources,
    }
}
