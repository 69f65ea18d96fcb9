//! File summarization and the repository overview call. Prompts are
//! grounded in the structural record so the model describes what the file
//! actually declares rather than guessing from raw text alone.

use std::fmt::Write;

use super::client::complete;
use super::{ChatMessage, LlmContext, LlmError};
use crate::models::FileDoc;

/// Overview text persisted for repositories with no indexable files.
pub const EMPTY_REPO_OVERVIEW: &str =
    "This repository contains no indexable source files.";

/// Content sent to the summarizer is capped to keep prompts bounded.
const MAX_CONTENT_CHARS: usize = 2_000;
/// At most this many file summaries feed the overview prompt.
const MAX_OVERVIEW_FILES: usize = 20;

const SUMMARY_SYSTEM_PROMPT: &str = "\
You are a code analysis expert. Generate concise, structured summaries of source files.

Format:
1. Overview (3-6 sentences): what the file does, its main functionality, and key components
2. Notable: only critical gotchas, security concerns, or important warnings (omit if none)

Rules:
- Keep the overview to 3-6 sentences
- Skip minor optimizations and trivial patterns
- Mention how the file fits into the codebase when the imports make it clear";

/// Produce a 3–6 sentence summary of one file, grounded in its parsed
/// structure. Returns the summary text.
pub async fn summarize_file(
    client: &reqwest::Client,
    ctx: &LlmContext,
    file: &FileDoc,
) -> Result<String, LlmError> {
    let prompt = build_summary_prompt(file);
    let messages = vec![
        ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
        ChatMessage::user(prompt),
    ];

    let summary = complete(client, ctx, messages).await?;
    if summary.trim().is_empty() {
        return Err(LlmError::Failure(format!(
            "empty summary response for {}",
            file.path
        )));
    }
    Ok(summary.trim().to_string())
}

fn build_summary_prompt(file: &FileDoc) -> String {
    let mut prompt = String::new();

    let _ = writeln!(
        prompt,
        "Analyze this {} file and generate a summary.\n",
        file.language
    );
    let _ = writeln!(prompt, "File: `{}`\n", file.path);

    let _ = writeln!(prompt, "Functions ({}):", file.functions.len());
    if file.functions.is_empty() {
        prompt.push_str("  (none)\n");
    }
    for func in file.functions.iter().take(20) {
        let parent = func
            .parent_class
            .as_deref()
            .map(|c| format!(" (in {c})"))
            .unwrap_or_default();
        let _ = writeln!(prompt, "  - {}{parent}", func.signature);
    }

    let _ = writeln!(prompt, "\nClasses ({}):", file.classes.len());
    if file.classes.is_empty() {
        prompt.push_str("  (none)\n");
    }
    for cls in file.classes.iter().take(10) {
        let method_names: Vec<&str> = cls
            .methods
            .iter()
            .take(5)
            .map(|m| m.name.as_str())
            .collect();
        let _ = writeln!(
            prompt,
            "  - {} ({} methods: {})",
            cls.name,
            cls.methods.len(),
            method_names.join(", ")
        );
    }

    let imports: Vec<&str> = file.imports.iter().take(10).map(|s| s.as_str()).collect();
    let _ = writeln!(
        prompt,
        "\nImports ({}): {}",
        file.imports.len(),
        if imports.is_empty() {
            "(none)".to_string()
        } else {
            imports.join(", ")
        }
    );

    let content = truncate_chars(&file.content, MAX_CONTENT_CHARS);
    let truncated_note = if content.len() < file.content.len() {
        "\n... (truncated)"
    } else {
        ""
    };
    let _ = write!(
        prompt,
        "\nCode:\n```{}\n{}{}\n```\n\nGenerate a concise summary (3-6 sentences) covering the \
         file's primary purpose, its key functionality and components, and how it fits into \
         the codebase.",
        file.language, content, truncated_note
    );

    prompt
}

/// Produce a repository-level overview from the most-imported files'
/// summaries. `top_files` is expected in descending in-degree order.
pub async fn overview(
    client: &reqwest::Client,
    ctx: &LlmContext,
    repo_name: &str,
    top_files: &[(String, String)],
) -> Result<String, LlmError> {
    if top_files.is_empty() {
        return Ok(EMPTY_REPO_OVERVIEW.to_string());
    }

    let mut prompt = format!(
        "Below are summaries of the most central files of the repository `{repo_name}` \
         (ordered by how many other files import them).\n\n"
    );
    for (path, summary) in top_files.iter().take(MAX_OVERVIEW_FILES) {
        let _ = writeln!(prompt, "### {path}\n{summary}\n");
    }
    prompt.push_str(
        "Write a repository overview (5-8 sentences) covering: what the project does, its \
         architecture and main components, the primary technologies in use, and how the \
         central files relate to each other.",
    );

    let messages = vec![
        ChatMessage::system(
            "You are a code analysis expert. Write clear, factual repository overviews \
             based only on the provided file summaries.",
        ),
        ChatMessage::user(prompt),
    ];

    let text = complete(client, ctx, messages).await?;
    if text.trim().is_empty() {
        return Err(LlmError::Failure("empty overview response".into()));
    }
    Ok(text.trim().to_string())
}

fn truncate_chars(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
