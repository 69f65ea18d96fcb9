//! Hybrid search: dense-vector retrieval over the summary and code indexes
//! combined with a lexical signal, deduplicated per file.
//!
//! Per candidate, `score = filename_boost · (0.7·vector_score + 0.3·text_score)`
//! where vector scores are normalized cosine in [0,1], text scores are the
//! lexical hit's share of the best lexical score (0 when absent), and the
//! filename boost is 1.3 when a query token intersects the candidate's
//! filename case-insensitively. Candidates are grouped by file; a group
//! scores as its best member. Equal scores break toward the smaller
//! file_id for determinism.

use std::collections::HashMap;
use std::sync::Arc;

use crate::llm::{embeddings, LlmContext, LlmError};
use crate::models::{CodeElement, FileHit, SearchResult};
use crate::store::Store;

const VECTOR_WEIGHT: f32 = 0.7;
const TEXT_WEIGHT: f32 = 0.3;
const FILENAME_BOOST: f32 = 1.3;

/// Full hybrid search: embeds the query, then ranks.
pub async fn hybrid_search(
    http: &reqwest::Client,
    embed_ctx: &LlmContext,
    store: Arc<Store>,
    repo_id: &str,
    query_text: &str,
    top_k: usize,
) -> Result<Vec<SearchResult>, LlmError> {
    let q_vec = embeddings::embed_single(http, embed_ctx, query_text).await?;
    search_with_vector(store, repo_id, query_text, &q_vec, top_k)
        .await
        .map_err(|e| LlmError::Failure(format!("search failed: {e:#}")))
}

/// Summary-index-only hybrid search backing the `search_files` tool.
pub async fn file_search(
    http: &reqwest::Client,
    embed_ctx: &LlmContext,
    store: Arc<Store>,
    repo_id: &str,
    query_text: &str,
    top_k: usize,
) -> Result<Vec<FileHit>, LlmError> {
    let q_vec = embeddings::embed_single(http, embed_ctx, query_text).await?;
    file_search_with_vector(store, repo_id, query_text, &q_vec, top_k)
        .await
        .map_err(|e| LlmError::Failure(format!("search failed: {e:#}")))
}

/// The ranking half of hybrid search, taking a precomputed query vector.
pub async fn search_with_vector(
    store: Arc<Store>,
    repo_id: &str,
    query_text: &str,
    q_vec: &[f32],
    top_k: usize,
) -> anyhow::Result<Vec<SearchResult>> {
    let top_k = top_k.max(1);

    let summary_hits = store.search_summary_vectors(repo_id, q_vec, 2 * top_k);
    let chunk_hits = store.search_chunk_vectors(repo_id, q_vec, 2 * top_k);
    let text_scores = lexical_scores(store.clone(), repo_id, query_text, 4 * top_k).await?;

    // Candidate scores keyed by (file_id, optional chunk_index)
    #[derive(Default)]
    struct Group {
        best_score: f32,
        summary_hit: bool,
        chunks: HashMap<usize, f32>, // chunk_index → score
    }
    let mut groups: HashMap<String, Group> = HashMap::new();

    let files = store.get_files(repo_id);
    let by_id: HashMap<&str, &crate::models::FileDoc> =
        files.iter().map(|f| (f.file_id.as_str(), f)).collect();

    let add_candidate = |groups: &mut HashMap<String, Group>,
                         file_id: &str,
                         chunk_index: Option<usize>,
                         vector_score: f32| {
        let Some(file) = by_id.get(file_id) else {
            return;
        };
        let text_score = text_scores.get(file_id).copied().unwrap_or(0.0);
        let boost = filename_boost(query_text, &file.filename);
        let score = boost * (VECTOR_WEIGHT * vector_score + TEXT_WEIGHT * text_score);

        let group = groups.entry(file_id.to_string()).or_default();
        group.best_score = group.best_score.max(score);
        match chunk_index {
            Some(index) => {
                let entry = group.chunks.entry(index).or_insert(score);
                *entry = entry.max(score);
            }
            None => group.summary_hit = true,
        }
    };

    for hit in &summary_hits {
        add_candidate(&mut groups, &hit.file_id, None, hit.score);
    }
    for hit in &chunk_hits {
        add_candidate(&mut groups, &hit.file_id, Some(hit.chunk.chunk_index), hit.score);
    }
    // Lexical-only candidates participate at the file level with no
    // vector signal
    for file_id in text_scores.keys() {
        if !groups.contains_key(file_id) {
            add_candidate(&mut groups, file_id, None, 0.0);
        }
    }

    // One result per file
    let mut results: Vec<SearchResult> = groups
        .into_iter()
        .filter_map(|(file_id, group)| {
            let file = by_id.get(file_id.as_str())?;

            let mut code_elements: Vec<CodeElement> = group
                .chunks
                .iter()
                .filter_map(|(&index, &score)| {
                    let chunk = file.chunks.iter().find(|c| c.chunk_index == index)?;
                    Some(CodeElement {
                        chunk_name: chunk.chunk_name.clone(),
                        chunk_type: chunk.chunk_type,
                        line_start: chunk.line_start,
                        line_end: chunk.line_end,
                        code: chunk.code.clone(),
                        parent_class: chunk.parent_class.clone(),
                        chunk_index: chunk.chunk_index,
                        score,
                    })
                })
                .collect();
            code_elements.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.chunk_index.cmp(&b.chunk_index))
            });

            Some(SearchResult {
                file_id,
                path: file.path.clone(),
                language: file.language.clone(),
                summary: if group.summary_hit {
                    file.summary.clone()
                } else {
                    None
                },
                code_elements,
                score: group.best_score,
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.file_id.cmp(&b.file_id))
    });
    results.truncate(top_k);
    Ok(results)
}

/// Ranking half of the summary-only search.
pub async fn file_search_with_vector(
    store: Arc<Store>,
    repo_id: &str,
    query_text: &str,
    q_vec: &[f32],
    top_k: usize,
) -> anyhow::Result<Vec<FileHit>> {
    let top_k = top_k.max(1);

    let summary_hits = store.search_summary_vectors(repo_id, q_vec, 2 * top_k);
    let text_scores = lexical_scores(store.clone(), repo_id, query_text, 4 * top_k).await?;

    let mut hits: Vec<FileHit> = summary_hits
        .into_iter()
        .map(|hit| {
            let text_score = text_scores.get(&hit.file_id).copied().unwrap_or(0.0);
            let boost = filename_boost(query_text, filename_of(&hit.path));
            let score = boost * (VECTOR_WEIGHT * hit.score + TEXT_WEIGHT * text_score);
            FileHit {
                file_id: hit.file_id,
                path: hit.path,
                language: hit.language,
                summary: hit.summary,
                score,
            }
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.file_id.cmp(&b.file_id))
    });
    hits.truncate(top_k);
    Ok(hits)
}

/// Lexical leg: raw tantivy scores normalized into [0,1] by the best hit.
/// Runs on the blocking pool; tantivy search is CPU-bound.
async fn lexical_scores(
    store: Arc<Store>,
    repo_id: &str,
    query_text: &str,
    limit: usize,
) -> anyhow::Result<HashMap<String, f32>> {
    let repo_id = repo_id.to_string();
    let query_text = query_text.to_string();

    let hits = tokio::task::spawn_blocking(move || {
        store.lexical.search(&repo_id, &query_text, limit)
    })
    .await??;

    let max = hits.iter().map(|h| h.score).fold(0.0f32, f32::max);
    if max <= 0.0 {
        return Ok(HashMap::new());
    }

    Ok(hits
        .into_iter()
        .map(|h| (h.file_id, (h.score / max).clamp(0.0, 1.0)))
        .collect())
}

/// 1.3 when a whitespace token of the query intersects the filename's
/// alphanumeric tokens, case-insensitively.
pub fn filename_boost(query: &str, filename: &str) -> f32 {
    let name_tokens: Vec<String> = filename
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect();

    for token in query.split_whitespace() {
        let token = token.to_lowercase();
        if name_tokens.iter().any(|t| *t == token) {
            return FILENAME_BOOST;
        }
    }
    1.0
}

fn filename_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ChunkType};
    use crate::store::Store;

    fn seeded_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());

        // parser.py and utils.py both mention "parser" once in their summary
        for (path, vector) in [("parser.py", [0.9f32, 0.1]), ("utils.py", [0.85, 0.15])] {
            store.upsert_file("r1", path, "python", format!("# {path}\n"));
            store.update_file("r1", path, |f| {
                f.parsed = true;
                f.summary = Some("contains a parser helper".into());
                f.summary_vector = Some(vector.to_vec());
                f.chunks = vec![Chunk {
                    chunk_type: ChunkType::Function,
                    chunk_name: "run".into(),
                    chunk_text: format!("Function run() in {path}"),
                    code: "def run(): pass".into(),
                    line_start: 1,
                    line_end: 2,
                    parent_class: None,
                    chunk_index: 0,
                    total_chunks: 1,
                    vector: vec![0.5, 0.5],
                }];
            });
        }
        store.reindex_lexical("r1").unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_filename_boost_wins_ranking() {
        let (_dir, store) = seeded_store();

        let results = search_with_vector(store, "r1", "parser", &[1.0, 0.0], 5)
            .await
            .unwrap();
        assert!(!results.is_empty());
        // Both files score similarly on vectors and text, but parser.py
        // gets the 1.3x filename boost
        assert_eq!(results[0].path, "parser.py");
    }

    #[tokio::test]
    async fn test_results_deduplicated_by_file() {
        let (_dir, store) = seeded_store();

        let results = search_with_vector(store, "r1", "parser helper", &[1.0, 0.0], 5)
            .await
            .unwrap();
        let mut paths: Vec<&str> = results.iter().map(|r| r.path.as_str()).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), results.len(), "every file appears once");

        // Summary and chunk hits merged into one entry per file
        let top = &results[0];
        assert!(top.summary.is_some());
        assert_eq!(top.code_elements.len(), 1);
        assert_eq!(top.code_elements[0].chunk_name, "run");
    }

    #[tokio::test]
    async fn test_empty_repo_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let results = search_with_vector(store, "r1", "anything", &[1.0, 0.0], 5)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_determinism_same_query_same_ranking() {
        let (_dir, store) = seeded_store();

        let a = search_with_vector(store.clone(), "r1", "parser", &[1.0, 0.0], 5)
            .await
            .unwrap();
        let b = search_with_vector(store, "r1", "parser", &[1.0, 0.0], 5)
            .await
            .unwrap();

        let paths_a: Vec<&str> = a.iter().map(|r| r.path.as_str()).collect();
        let paths_b: Vec<&str> = b.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths_a, paths_b);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.score, y.score);
        }
    }

    #[tokio::test]
    async fn test_truncates_to_top_k() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        for i in 0..10 {
            let path = format!("mod{i}.py");
            store.upsert_file("r1", &path, "python", "".into());
            store.update_file("r1", &path, |f| {
                f.summary = Some("widget module".into());
                f.summary_vector = Some(vec![1.0, 0.0]);
            });
        }
        let results = search_with_vector(store, "r1", "widget", &[1.0, 0.0], 3)
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_file_search_returns_summaries_only() {
        let (_dir, store) = seeded_store();
        let hits = file_search_with_vector(store, "r1", "parser", &[1.0, 0.0], 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].path, "parser.py");
        assert!(hits[0].summary.contains("parser"));
    }

    // ── filename boost ───────────────────────────────────

    #[test]
    fn test_filename_boost_exact_token() {
        assert_eq!(filename_boost("parser", "parser.py"), FILENAME_BOOST);
        assert_eq!(filename_boost("the parser module", "parser.py"), FILENAME_BOOST);
    }

    #[test]
    fn test_filename_boost_case_insensitive() {
        assert_eq!(filename_boost("Parser", "PARSER.PY"), FILENAME_BOOST);
    }

    #[test]
    fn test_filename_boost_no_match() {
        assert_eq!(filename_boost("tokenizer", "parser.py"), 1.0);
        // Substring alone is not a token match
        assert_eq!(filename_boost("parse", "parser.py"), 1.0);
    }
}
