use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Sessions ────────────────────────────────────────────

/// Per-session AI and UI preferences. Set once by the client, consumed by
/// the pipeline and query engine to pick the provider/model pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPreferences {
    pub ai_provider: String,
    pub ai_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Repo ids ingested under this session
    pub repositories: Vec<String>,
    pub preferences: Option<SessionPreferences>,
}

// ─── Repositories ────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepoStatus {
    Fetched,
    Processing,
    Completed,
    Failed,
}

/// One node of the recursive file tree. Folders carry their children in a
/// BTreeMap so serialization order is stable across ingestions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeNode {
    File {
        path: String,
        size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    Folder {
        children: BTreeMap<String, TreeNode>,
    },
}

pub type FileTree = BTreeMap<String, TreeNode>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub repo_id: String,
    pub session_id: String,
    pub source_url: String,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub description: Option<String>,
    pub default_branch: String,
    pub language: Option<String>,
    pub stars: u64,
    pub forks: u64,
    pub file_tree: FileTree,
    pub status: RepoStatus,
    pub task_id: Option<String>,
    pub error_message: Option<String>,
    pub file_count: usize,
    pub languages_breakdown: BTreeMap<String, usize>,
    pub overview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview_embedding: Option<Vec<f32>>,
    /// Embedding dimension discovered on the first embed call; every vector
    /// stored for this repository must match it.
    pub embedding_dim: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Files ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub signature: String,
    pub parameters: Vec<String>,
    pub parent_class: Option<String>,
    pub is_method: bool,
    /// 1-based inclusive
    pub line_start: usize,
    pub line_end: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MethodInfo {
    pub name: String,
    pub parameters: Vec<String>,
    pub line_start: usize,
    pub line_end: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassInfo {
    pub name: String,
    pub line_start: usize,
    pub line_end: usize,
    pub methods: Vec<MethodInfo>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Function,
    Class,
}

/// A function- or class-level slice of a file carrying its own embedding
/// and a deterministic natural-language description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_type: ChunkType,
    pub chunk_name: String,
    /// Short natural-language description used as embedding text
    pub chunk_text: String,
    /// The line-span slice of the file content
    pub code: String,
    pub line_start: usize,
    pub line_end: usize,
    pub parent_class: Option<String>,
    /// Position within this file's chunk list
    pub chunk_index: usize,
    pub total_chunks: usize,
    #[serde(default)]
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Dependencies {
    /// Repo-local file paths this file imports
    pub imports: Vec<String>,
    /// Repo-local file paths that import this file (exact inverse of imports)
    pub imported_by: Vec<String>,
    /// Import targets that did not resolve to a repo file
    pub external_imports: Vec<String>,
}

/// Provenance and per-file error info attached by the pipeline and the
/// query engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDoc {
    pub file_id: String,
    pub repo_id: String,
    pub path: String,
    pub filename: String,
    pub language: String,
    pub content: String,
    pub content_hash: String,
    pub size: u64,
    pub parsed: bool,
    pub embedded: bool,
    pub functions: Vec<FunctionInfo>,
    pub classes: Vec<ClassInfo>,
    /// Literal import target strings as written in the source
    pub imports: Vec<String>,
    pub dependencies: Dependencies,
    pub chunks: Vec<Chunk>,
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_vector: Option<Vec<f32>>,
    #[serde(default)]
    pub provider_meta: ProviderMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Tasks ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Pipeline step labels. Steps only ever advance forward through this
/// order, except on failure which freezes the step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStep {
    Queued,
    Fetching,
    Parsing,
    Embedding,
    Summarizing,
    Overview,
    Finalizing,
    Completed,
}

impl TaskStep {
    /// Position in the step order, used to enforce forward-only advances.
    pub fn order(self) -> u8 {
        match self {
            TaskStep::Queued => 0,
            TaskStep::Fetching => 1,
            TaskStep::Parsing => 2,
            TaskStep::Embedding => 3,
            TaskStep::Summarizing => 4,
            TaskStep::Overview => 5,
            TaskStep::Finalizing => 6,
            TaskStep::Completed => 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total_files: usize,
    pub processed_files: usize,
    pub current_step: TaskStep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// Only "process_files" in v1
    pub kind: String,
    pub status: TaskStatus,
    pub progress: TaskProgress,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// ─── Conversations ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub session_id: String,
    pub repo_id: String,
    pub title: String,
    pub system_prompt: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallFunction {
    pub name: String,
    /// String-encoded JSON object, as the chat-completions protocol carries it
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub id: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    /// Strictly increasing and contiguous from 1 within a conversation
    pub sequence_number: usize,
    #[serde(default)]
    pub provider_meta: ProviderMeta,
    pub timestamp: DateTime<Utc>,
}

// ─── Query events ────────────────────────────────────────

/// A `(file_path, line span)` reference that appeared in a tool result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_end: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub tool: String,
    pub args: serde_json::Value,
    pub result_count: usize,
}

/// Events streamed to the client over SSE, one JSON object per `data:` line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    ToolResult {
        tool: String,
        result_count: usize,
    },
    AnswerChunk {
        content: String,
    },
    Done {
        sources: Vec<SourceRef>,
        tool_calls: Vec<ToolCallSummary>,
    },
    Error {
        error: String,
    },
}

// ─── Search results ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeElement {
    pub chunk_name: String,
    pub chunk_type: ChunkType,
    pub line_start: usize,
    pub line_end: usize,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_class: Option<String>,
    pub chunk_index: usize,
    pub score: f32,
}

/// One deduplicated hybrid-search result: a file with its summary (when a
/// summary hit survived) and the surviving chunk hits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub file_id: String,
    pub path: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_elements: Vec<CodeElement>,
    pub score: f32,
}

/// A summary-index-only hit, returned by the search_files tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHit {
    pub file_id: String,
    pub path: String,
    pub language: String,
    pub summary: String,
    pub score: f32,
}

// ─── Request bodies ──────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRepositoryRequest {
    pub session_id: String,
    pub github_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub session_id: String,
    pub repo_id: String,
    pub query: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreferencesUpdate {
    pub ai_provider: String,
    pub ai_model: String,
    #[serde(default)]
    pub embedding_provider: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub theme: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_step_order_is_strictly_increasing() {
        let steps = [
            TaskStep::Queued,
            TaskStep::Fetching,
            TaskStep::Parsing,
            TaskStep::Embedding,
            TaskStep::Summarizing,
            TaskStep::Overview,
            TaskStep::Finalizing,
            TaskStep::Completed,
        ];
        for pair in steps.windows(2) {
            assert!(pair[0].order() < pair[1].order());
        }
    }

    #[test]
    fn test_task_step_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStep::Fetching).unwrap(),
            "\"fetching\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStep::Summarizing).unwrap(),
            "\"summarizing\""
        );
    }

    #[test]
    fn test_query_event_tagging() {
        let event = QueryEvent::AnswerChunk {
            content: "The".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "answer_chunk");
        assert_eq!(json["content"], "The");

        let event = QueryEvent::ToolCall {
            tool: "search_code".to_string(),
            args: serde_json::json!({"query": "parser"}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_call");
        assert_eq!(json["tool"], "search_code");
    }

    #[test]
    fn test_tree_node_round_trip() {
        let mut children = BTreeMap::new();
        children.insert(
            "main.rs".to_string(),
            TreeNode::File {
                path: "src/main.rs".to_string(),
                size: 120,
                language: Some("rust".to_string()),
            },
        );
        let node = TreeNode::Folder { children };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "folder");
        assert_eq!(json["children"]["main.rs"]["type"], "file");

        let back: TreeNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_repo_status_snake_case() {
        assert_eq!(
            serde_json::to_string(&RepoStatus::Completed).unwrap(),
            "\"completed\""
        );
    }
}
