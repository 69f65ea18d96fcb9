//! The staged ingestion pipeline. Stages execute in a fixed order —
//! fetching → parsing → (dependencies ∥ chunk-embeddings ∥ summaries) →
//! summary-embeddings → overview → finalizing — with bounded fan-out
//! inside each stage and durable progress written at bucket boundaries.
//!
//! Failure semantics: per-file errors are recorded on the file's
//! `provider_meta.error` and never abort the run; credential and
//! catastrophic rate-limit errors fail the task and the repository.

pub mod chunks;

use anyhow::{bail, Context, Result};
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::github::{self, GitHubClient};
use crate::llm::summarize::EMPTY_REPO_OVERVIEW;
use crate::llm::{embeddings, summarize, LlmContext, LlmError};
use crate::models::{RepoStatus, Repository, TaskStep};
use crate::store::Store;

/// Files per bucket; a bucket's completion is the smallest progress unit.
const BUCKET_SIZE: usize = 100;
/// Most-imported files feeding the overview prompt.
const OVERVIEW_TOP_K: usize = 20;

/// Everything one pipeline run needs. Semaphores are shared with the rest
/// of the process so concurrent ingestions still respect the global bounds.
pub struct PipelineContext {
    pub store: Arc<Store>,
    pub http: reqwest::Client,
    pub github: Arc<GitHubClient>,
    pub chat_ctx: LlmContext,
    pub embed_ctx: LlmContext,
    pub fetch_semaphore: Arc<Semaphore>,
    pub parse_semaphore: Arc<Semaphore>,
    pub llm_semaphore: Arc<Semaphore>,
    pub embed_semaphore: Arc<Semaphore>,
}

/// Run the full pipeline for one repository, updating the task record as
/// stages complete. Never panics; all failures land on the task.
pub async fn run(ctx: PipelineContext, repo_id: String, task_id: String) {
    tracing::info!("starting ingestion for repo {repo_id} (task {task_id})");

    match run_stages(&ctx, &repo_id, &task_id).await {
        Ok(processed) => {
            let file_count = ctx.store.file_count(&repo_id);
            ctx.store.update_repository(&repo_id, |r| {
                r.status = RepoStatus::Completed;
                r.file_count = file_count;
            });
            ctx.store.complete_task(
                &task_id,
                Some(serde_json::json!({
                    "files_processed": processed,
                    "file_count": file_count,
                })),
            );
            tracing::info!("ingestion complete for repo {repo_id}: {file_count} files");
        }
        Err(e) => {
            let message = format!("{e:#}");
            tracing::error!("ingestion failed for repo {repo_id}: {message}");
            ctx.store.fail_task(&task_id, &message);
            ctx.store.update_repository(&repo_id, |r| {
                r.status = RepoStatus::Failed;
                r.error_message = Some(message.clone());
            });
        }
    }
}

async fn run_stages(ctx: &PipelineContext, repo_id: &str, task_id: &str) -> Result<usize> {
    let repo = ctx
        .store
        .get_repository(repo_id)
        .context("repository not found")?;
    let blobs = github::flatten_tree(&repo.file_tree);
    let total = blobs.len();

    ctx.store.update_repository(repo_id, |r| {
        r.status = RepoStatus::Processing;
    });
    ctx.store.update_progress(task_id, 0, total, TaskStep::Fetching);

    if total == 0 {
        ctx.store.update_repository(repo_id, |r| {
            r.overview = Some(EMPTY_REPO_OVERVIEW.to_string());
        });
        ctx.store.update_step(task_id, TaskStep::Finalizing);
        return Ok(0);
    }

    let processed = fetch_stage(ctx, &repo, task_id, &blobs, total).await?;
    parse_stage(ctx, repo_id, task_id, total).await?;

    // Stage-level fan-out: the three analyses are independent given the
    // parsed file set
    ctx.store.update_step(task_id, TaskStep::Embedding);
    let (deps, embeds, summaries) = tokio::join!(
        dependencies_stage(ctx, repo_id),
        chunk_embedding_stage(ctx, repo_id),
        summarize_stage(ctx, repo_id),
    );
    deps?;
    embeds?;
    summaries?;

    ctx.store.update_step(task_id, TaskStep::Summarizing);
    summary_embedding_stage(ctx, repo_id).await?;
    refresh_lexical_index(ctx, repo_id).await?;

    ctx.store.update_step(task_id, TaskStep::Overview);
    overview_stage(ctx, &repo).await?;

    ctx.store.update_step(task_id, TaskStep::Finalizing);
    Ok(processed)
}

// ─── Stage 1: fetching ───────────────────────────────────

async fn fetch_stage(
    ctx: &PipelineContext,
    repo: &Repository,
    task_id: &str,
    blobs: &[(String, u64)],
    total: usize,
) -> Result<usize> {
    let mut attempted = 0usize;

    for bucket in blobs.chunks(BUCKET_SIZE) {
        let tasks = bucket.iter().map(|(path, _)| {
            let path = path.clone();
            let github = ctx.github.clone();
            let store = ctx.store.clone();
            let semaphore = ctx.fetch_semaphore.clone();
            let owner = repo.owner.clone();
            let name = repo.name.clone();
            let branch = repo.default_branch.clone();
            let repo_id = repo.repo_id.clone();

            async move {
                let _permit = semaphore.acquire_owned().await;
                match github.blob(&owner, &name, &branch, &path).await {
                    Ok(Some(content)) => {
                        let filename = path.rsplit('/').next().unwrap_or(&path);
                        let language = github::detect_language(filename)
                            .unwrap_or_else(|| "unknown".to_string());
                        store.upsert_file(&repo_id, &path, &language, content);
                        Ok(())
                    }
                    Ok(None) => {
                        tracing::warn!("skipping non-UTF-8 blob {path}");
                        Ok(())
                    }
                    Err(github::FetchError::RateLimited) => {
                        Err(anyhow::anyhow!("source host rate limit exceeded"))
                    }
                    Err(e) => {
                        // Per-file transport failure after retries: skip
                        tracing::warn!("failed to fetch {path}: {e}");
                        Ok(())
                    }
                }
            }
        });

        for result in join_all(tasks).await {
            result?;
        }

        attempted += bucket.len();
        ctx.store
            .update_progress(task_id, attempted, total, TaskStep::Fetching);
    }

    Ok(attempted)
}

// ─── Stage 2: parsing ────────────────────────────────────

async fn parse_stage(
    ctx: &PipelineContext,
    repo_id: &str,
    task_id: &str,
    total: usize,
) -> Result<()> {
    let files = ctx.store.get_files(repo_id);
    let mut attempted = 0usize;

    for bucket in files.chunks(BUCKET_SIZE) {
        let tasks = bucket.iter().map(|file| {
            let semaphore = ctx.parse_semaphore.clone();
            let content = file.content.clone();
            let language = file.language.clone();
            let path = file.path.clone();

            async move {
                let _permit = semaphore.acquire_owned().await;
                // CPU-bound: run on the blocking pool so parser work never
                // starves the I/O workers
                let parsed = tokio::task::spawn_blocking(move || {
                    crate::parser::parse_source(&content, &language)
                })
                .await
                .unwrap_or_else(|e| {
                    crate::parser::ParsedFile::unparsed(format!("parser task failed: {e}"))
                });
                (path, parsed)
            }
        });

        let results: std::collections::HashMap<String, crate::parser::ParsedFile> =
            join_all(tasks).await.into_iter().collect();

        ctx.store.update_files(repo_id, |doc| {
            if let Some(parsed) = results.get(&doc.path) {
                if let Some(reason) = &parsed.parse_error {
                    tracing::warn!("parse failed for {}: {reason}", doc.path);
                    doc.parsed = false;
                } else {
                    doc.parsed = true;
                    doc.functions = parsed.functions.clone();
                    doc.classes = parsed.classes.clone();
                    doc.imports = parsed.imports.clone();
                }
            }
        });

        attempted += bucket.len();
        ctx.store
            .update_progress(task_id, attempted, total, TaskStep::Parsing);
    }

    Ok(())
}

// ─── Stage 3a: dependencies ──────────────────────────────

async fn dependencies_stage(ctx: &PipelineContext, repo_id: &str) -> Result<()> {
    let files = ctx.store.get_files(repo_id);
    let records: Vec<crate::deps::ImportRecord> = files
        .iter()
        .map(|f| crate::deps::ImportRecord {
            path: f.path.clone(),
            language: f.language.clone(),
            imports: f.imports.clone(),
        })
        .collect();

    let resolved = crate::deps::resolve_all(&records);

    ctx.store.update_files(repo_id, |doc| {
        if let Some(deps) = resolved.get(&doc.path) {
            doc.dependencies = deps.clone();
        }
    });

    tracing::info!(
        "dependency resolution complete for repo {repo_id}: {} files",
        records.len()
    );
    Ok(())
}

// ─── Stage 3b: chunk embeddings ──────────────────────────

async fn chunk_embedding_stage(ctx: &PipelineContext, repo_id: &str) -> Result<()> {
    let files = ctx.store.get_files(repo_id);

    let buckets: Vec<Vec<crate::models::FileDoc>> = files
        .chunks(BUCKET_SIZE)
        .map(|bucket| bucket.to_vec())
        .collect();

    let tasks = buckets.into_iter().map(|bucket| {
        let semaphore = ctx.embed_semaphore.clone();
        async move {
            let _permit = semaphore.acquire_owned().await;
            embed_chunk_bucket(ctx, repo_id, bucket).await
        }
    });

    for result in join_all(tasks).await {
        result?;
    }
    Ok(())
}

async fn embed_chunk_bucket(
    ctx: &PipelineContext,
    repo_id: &str,
    bucket: Vec<crate::models::FileDoc>,
) -> Result<()> {
    // Build chunks per file, then one flat text list for batching
    let mut per_file: Vec<(String, Vec<crate::models::Chunk>)> = Vec::new();
    let mut texts: Vec<String> = Vec::new();
    for file in &bucket {
        let file_chunks = chunks::build_chunks(file);
        if file_chunks.is_empty() {
            continue;
        }
        texts.extend(file_chunks.iter().map(|c| c.chunk_text.clone()));
        per_file.push((file.path.clone(), file_chunks));
    }
    if texts.is_empty() {
        return Ok(());
    }

    let vectors = match embeddings::embed(&ctx.http, &ctx.embed_ctx, &texts).await {
        Ok(v) => v,
        Err(e) if is_stage_fatal(&e) => bail!("embedding provider error: {e}"),
        Err(e) => {
            tracing::warn!("chunk embedding failed for a bucket in {repo_id}: {e}");
            let failed: Vec<String> = per_file.iter().map(|(p, _)| p.clone()).collect();
            ctx.store.update_files(repo_id, |doc| {
                if failed.contains(&doc.path) {
                    doc.provider_meta.error = Some(format!("chunk embedding failed: {e}"));
                }
            });
            return Ok(());
        }
    };

    let dim = ensure_embedding_dim(ctx, repo_id, &vectors)?;

    // Distribute vectors back to their chunks in order
    let mut cursor = 0usize;
    for (_path, file_chunks) in per_file.iter_mut() {
        for chunk in file_chunks.iter_mut() {
            if let Some(vector) = vectors.get(cursor) {
                if vector.len() == dim {
                    chunk.vector = vector.clone();
                } else {
                    tracing::warn!(
                        "dropping chunk vector with dimension {} (expected {dim})",
                        vector.len()
                    );
                }
            }
            cursor += 1;
        }
    }

    let chunk_map: std::collections::HashMap<String, Vec<crate::models::Chunk>> =
        per_file.into_iter().collect();
    ctx.store.update_files(repo_id, |doc| {
        if let Some(file_chunks) = chunk_map.get(&doc.path) {
            doc.chunks = file_chunks.clone();
            doc.embedded = file_chunks.iter().any(|c| !c.vector.is_empty());
        }
    });

    Ok(())
}

// ─── Stage 3c: summaries ─────────────────────────────────

async fn summarize_stage(ctx: &PipelineContext, repo_id: &str) -> Result<()> {
    let files = ctx.store.get_files(repo_id);

    for bucket in files.chunks(BUCKET_SIZE) {
        let tasks = bucket.iter().map(|file| {
            let semaphore = ctx.llm_semaphore.clone();
            let file = file.clone();
            async move {
                let _permit = semaphore.acquire_owned().await;
                let result = summarize::summarize_file(&ctx.http, &ctx.chat_ctx, &file).await;
                (file.path, result)
            }
        });

        let mut summaries: std::collections::HashMap<String, String> =
            std::collections::HashMap::new();
        let mut failures: std::collections::HashMap<String, String> =
            std::collections::HashMap::new();

        for (path, result) in join_all(tasks).await {
            match result {
                Ok(summary) => {
                    summaries.insert(path, summary);
                }
                Err(e) if is_stage_fatal(&e) => bail!("summary provider error: {e}"),
                Err(e) => {
                    tracing::warn!("summary failed for {path}: {e}");
                    failures.insert(path, e.to_string());
                }
            }
        }

        let provider = ctx.chat_ctx.provider.name().to_string();
        let model = ctx.chat_ctx.model.clone();
        ctx.store.update_files(repo_id, |doc| {
            if let Some(summary) = summaries.get(&doc.path) {
                doc.summary = Some(summary.clone());
                doc.provider_meta.provider = Some(provider.clone());
                doc.provider_meta.model = Some(model.clone());
            } else if let Some(error) = failures.get(&doc.path) {
                doc.provider_meta.error = Some(error.clone());
            }
        });
    }

    Ok(())
}

// ─── Stage 4: summary embeddings ─────────────────────────

async fn summary_embedding_stage(ctx: &PipelineContext, repo_id: &str) -> Result<()> {
    let files = ctx.store.get_files(repo_id);
    let with_summaries: Vec<(String, String)> = files
        .iter()
        .filter_map(|f| f.summary.clone().map(|s| (f.path.clone(), s)))
        .collect();
    if with_summaries.is_empty() {
        return Ok(());
    }

    let texts: Vec<String> = with_summaries.iter().map(|(_, s)| s.clone()).collect();
    let vectors = match embeddings::embed(&ctx.http, &ctx.embed_ctx, &texts).await {
        Ok(v) => v,
        Err(e) if is_stage_fatal(&e) => bail!("embedding provider error: {e}"),
        Err(e) => {
            tracing::warn!("summary embedding failed for {repo_id}: {e}");
            return Ok(());
        }
    };

    let dim = ensure_embedding_dim(ctx, repo_id, &vectors)?;
    let vector_map: std::collections::HashMap<String, Vec<f32>> = with_summaries
        .iter()
        .zip(vectors)
        .filter(|(_, v)| v.len() == dim)
        .map(|((path, _), v)| (path.clone(), v))
        .collect();

    ctx.store.update_files(repo_id, |doc| {
        if let Some(vector) = vector_map.get(&doc.path) {
            doc.summary_vector = Some(vector.clone());
        }
    });

    Ok(())
}

// ─── Stage 5: overview ───────────────────────────────────

async fn overview_stage(ctx: &PipelineContext, repo: &Repository) -> Result<()> {
    let top_files: Vec<(String, String)> = ctx
        .store
        .most_imported_files(&repo.repo_id, OVERVIEW_TOP_K)
        .into_iter()
        .filter_map(|f| f.summary.clone().map(|s| (f.path, s)))
        .collect();

    let text = match summarize::overview(&ctx.http, &ctx.chat_ctx, &repo.full_name, &top_files)
        .await
    {
        Ok(text) => text,
        Err(e) if is_stage_fatal(&e) => bail!("overview provider error: {e}"),
        Err(e) => {
            tracing::warn!("overview generation failed for {}: {e}", repo.repo_id);
            return Ok(());
        }
    };

    let embedding = if text == EMPTY_REPO_OVERVIEW {
        None
    } else {
        match embeddings::embed_single(&ctx.http, &ctx.embed_ctx, &text).await {
            Ok(v) => Some(v),
            Err(e) if is_stage_fatal(&e) => bail!("embedding provider error: {e}"),
            Err(e) => {
                tracing::warn!("overview embedding failed for {}: {e}", repo.repo_id);
                None
            }
        }
    };

    ctx.store.update_repository(&repo.repo_id, |r| {
        r.overview = Some(text.clone());
        r.overview_embedding = embedding.clone();
    });

    Ok(())
}

// ─── Lexical refresh ─────────────────────────────────────

async fn refresh_lexical_index(ctx: &PipelineContext, repo_id: &str) -> Result<()> {
    let store = ctx.store.clone();
    let repo_id = repo_id.to_string();
    tokio::task::spawn_blocking(move || store.reindex_lexical(&repo_id))
        .await
        .context("lexical indexing task failed")??;
    Ok(())
}

// ─── Helpers ─────────────────────────────────────────────

/// Credential and catastrophic rate-limit errors abort the pipeline;
/// everything else is per-file best-effort.
fn is_stage_fatal(e: &LlmError) -> bool {
    matches!(e, LlmError::Unauthorized(_) | LlmError::RateLimited(_))
}

/// Cache the provider's embedding dimension on the repository the first
/// time vectors come back; all later vectors must match it.
fn ensure_embedding_dim(ctx: &PipelineContext, repo_id: &str, vectors: &[Vec<f32>]) -> Result<usize> {
    let Some(first) = vectors.first() else {
        bail!("provider returned no vectors");
    };
    let dim = first.len();
    if dim == 0 {
        bail!("provider returned empty vectors");
    }

    let repo = ctx
        .store
        .get_repository(repo_id)
        .context("repository disappeared mid-pipeline")?;
    match repo.embedding_dim {
        Some(cached) => Ok(cached),
        None => {
            ctx.store.update_repository(repo_id, |r| {
                r.embedding_dim = Some(dim);
            });
            Ok(dim)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::Provider;
    use crate::models::{TaskStatus, TaskStep};

    fn test_context(store: Arc<Store>) -> PipelineContext {
        let config = Config::default();
        let http = reqwest::Client::new();
        let ctx = LlmContext {
            provider: Provider::OpenAi,
            model: "gpt-4o-mini".into(),
            api_key: "test-key".into(),
        };
        PipelineContext {
            store,
            http: http.clone(),
            github: Arc::new(GitHubClient::new(http, None, config.limits.max_blob_size)),
            chat_ctx: ctx.clone(),
            embed_ctx: ctx,
            fetch_semaphore: Arc::new(Semaphore::new(config.limits.c_fetch)),
            parse_semaphore: Arc::new(Semaphore::new(config.limits.c_parse)),
            llm_semaphore: Arc::new(Semaphore::new(config.limits.c_llm)),
            embed_semaphore: Arc::new(Semaphore::new(config.limits.c_embed)),
        }
    }

    #[tokio::test]
    async fn test_empty_repository_completes_without_provider_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());

        store.insert_repository(crate::store::tests::sample_repo("r1", "s1"));
        let task_id = store.create_task("process_files");
        store.update_repository("r1", |r| r.task_id = Some(task_id.clone()));

        let ctx = test_context(store.clone());
        run(ctx, "r1".into(), task_id.clone()).await;

        let repo = store.get_repository("r1").unwrap();
        assert_eq!(repo.status, RepoStatus::Completed);
        assert_eq!(repo.file_count, 0);
        assert_eq!(repo.overview.as_deref(), Some(EMPTY_REPO_OVERVIEW));

        let task = store.get_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress.current_step, TaskStep::Completed);
        assert_eq!(task.progress.total_files, 0);
    }

    #[tokio::test]
    async fn test_missing_repository_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let task_id = store.create_task("process_files");

        let ctx = test_context(store.clone());
        run(ctx, "missing".into(), task_id.clone()).await;

        let task = store.get_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("not found"));
    }

}
