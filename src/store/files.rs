//! File-collection operations: idempotent upserts keyed by
//! `(repo_id, path)`, in-place mutation by the pipeline stages, and the
//! vector-search primitives over the two indexes (summary vectors and
//! chunk vectors).

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, Dependencies, FileDoc, ProviderMeta};

use super::Store;

/// A nearest-neighbor hit from the summary index.
#[derive(Debug, Clone)]
pub struct SummaryHit {
    pub file_id: String,
    pub path: String,
    pub language: String,
    pub summary: String,
    /// Normalized cosine similarity in [0,1]
    pub score: f32,
}

/// A nearest-neighbor hit from the code (chunk) index.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub file_id: String,
    pub path: String,
    pub language: String,
    pub summary: Option<String>,
    pub chunk: Chunk,
    pub score: f32,
}

impl Store {
    /// Insert or replace the file at `(repo_id, path)`, keeping the
    /// existing `file_id` when the file was seen before.
    pub fn upsert_file(&self, repo_id: &str, path: &str, language: &str, content: String) -> FileDoc {
        let now = Utc::now();
        let filename = path.rsplit('/').next().unwrap_or(path).to_string();
        let content_hash = format!("{:x}", Sha256::digest(content.as_bytes()));

        let mut files = self.files.write();
        let repo_files = files.entry(repo_id.to_string()).or_default();

        let doc = match repo_files.iter_mut().find(|f| f.path == path) {
            Some(existing) => {
                existing.language = language.to_string();
                existing.size = content.len() as u64;
                existing.content = content;
                existing.content_hash = content_hash;
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let doc = FileDoc {
                    file_id: Uuid::new_v4().to_string(),
                    repo_id: repo_id.to_string(),
                    path: path.to_string(),
                    filename,
                    language: language.to_string(),
                    size: content.len() as u64,
                    content,
                    content_hash,
                    parsed: false,
                    embedded: false,
                    functions: Vec::new(),
                    classes: Vec::new(),
                    imports: Vec::new(),
                    dependencies: Dependencies::default(),
                    chunks: Vec::new(),
                    summary: None,
                    summary_vector: None,
                    provider_meta: ProviderMeta::default(),
                    created_at: now,
                    updated_at: now,
                };
                repo_files.push(doc.clone());
                doc
            }
        };

        self.persist_vec(repo_files, &format!("files/{repo_id}.json"));
        doc
    }

    /// Mutate one file in place and persist the repo's file collection.
    /// Returns the updated copy, or None when the file does not exist.
    pub fn update_file(
        &self,
        repo_id: &str,
        path: &str,
        mutate: impl FnOnce(&mut FileDoc),
    ) -> Option<FileDoc> {
        let mut files = self.files.write();
        let repo_files = files.get_mut(repo_id)?;
        let doc = repo_files.iter_mut().find(|f| f.path == path)?;
        mutate(doc);
        doc.updated_at = Utc::now();
        let updated = doc.clone();
        self.persist_vec(repo_files, &format!("files/{repo_id}.json"));
        Some(updated)
    }

    /// Mutate every file of a repository, persisting the collection once.
    /// Used by bulk stages (dependency writes) to avoid write amplification.
    pub fn update_files(&self, repo_id: &str, mut mutate: impl FnMut(&mut FileDoc)) {
        let mut files = self.files.write();
        let Some(repo_files) = files.get_mut(repo_id) else {
            return;
        };
        let now = Utc::now();
        for doc in repo_files.iter_mut() {
            mutate(doc);
            doc.updated_at = now;
        }
        self.persist_vec(repo_files, &format!("files/{repo_id}.json"));
    }

    pub fn get_files(&self, repo_id: &str) -> Vec<FileDoc> {
        self.files.read().get(repo_id).cloned().unwrap_or_default()
    }

    pub fn get_file_by_path(&self, repo_id: &str, path: &str) -> Option<FileDoc> {
        self.files
            .read()
            .get(repo_id)?
            .iter()
            .find(|f| f.path == path)
            .cloned()
    }

    pub fn file_count(&self, repo_id: &str) -> usize {
        self.files.read().get(repo_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Paths of the top-k most imported files, by `imported_by` in-degree
    /// descending, path ascending on ties.
    pub fn most_imported_files(&self, repo_id: &str, k: usize) -> Vec<FileDoc> {
        let files = self.files.read();
        let Some(repo_files) = files.get(repo_id) else {
            return Vec::new();
        };

        let mut ranked: Vec<&FileDoc> = repo_files.iter().collect();
        ranked.sort_by(|a, b| {
            b.dependencies
                .imported_by
                .len()
                .cmp(&a.dependencies.imported_by.len())
                .then_with(|| a.path.cmp(&b.path))
        });
        ranked.into_iter().take(k).cloned().collect()
    }

    /// Exact-name function lookup across all files of a repository.
    pub fn find_functions_by_name(&self, repo_id: &str, name: &str) -> Vec<(FileDoc, usize)> {
        let files = self.files.read();
        let Some(repo_files) = files.get(repo_id) else {
            return Vec::new();
        };

        let mut matches = Vec::new();
        for file in repo_files {
            for (i, func) in file.functions.iter().enumerate() {
                if func.name == name {
                    matches.push((file.clone(), i));
                }
            }
        }
        matches.sort_by(|a, b| a.0.path.cmp(&b.0.path));
        matches
    }

    // ─── Vector search primitives ────────────────────────

    /// Nearest neighbors over `summary_vector`, normalized cosine scores.
    pub fn search_summary_vectors(
        &self,
        repo_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Vec<SummaryHit> {
        let files = self.files.read();
        let Some(repo_files) = files.get(repo_id) else {
            return Vec::new();
        };

        let mut hits: Vec<SummaryHit> = repo_files
            .iter()
            .filter_map(|f| {
                let vector = f.summary_vector.as_ref()?;
                let summary = f.summary.clone()?;
                Some(SummaryHit {
                    file_id: f.file_id.clone(),
                    path: f.path.clone(),
                    language: f.language.clone(),
                    summary,
                    score: normalized_cosine(query, vector),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.file_id.cmp(&b.file_id))
        });
        hits.truncate(limit);
        hits
    }

    /// Nearest neighbors over `chunks[].vector`, normalized cosine scores.
    pub fn search_chunk_vectors(
        &self,
        repo_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Vec<ChunkHit> {
        let files = self.files.read();
        let Some(repo_files) = files.get(repo_id) else {
            return Vec::new();
        };

        let mut hits: Vec<ChunkHit> = Vec::new();
        for file in repo_files {
            for chunk in &file.chunks {
                if chunk.vector.is_empty() {
                    continue;
                }
                hits.push(ChunkHit {
                    file_id: file.file_id.clone(),
                    path: file.path.clone(),
                    language: file.language.clone(),
                    summary: file.summary.clone(),
                    chunk: chunk.clone(),
                    score: normalized_cosine(query, &chunk.vector),
                });
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.file_id.cmp(&b.file_id))
        });
        hits.truncate(limit);
        hits
    }
}

/// Cosine similarity mapped from [-1,1] into [0,1]. Mismatched or empty
/// vectors score 0.
pub fn normalized_cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    ((dot / denom) + 1.0) / 2.0
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_store;
    use super::*;
    use crate::models::ChunkType;

    #[test]
    fn test_upsert_is_idempotent_on_path() {
        let (_dir, store) = test_store();

        let first = store.upsert_file("r1", "src/a.rs", "rust", "fn a() {}".into());
        let second = store.upsert_file("r1", "src/a.rs", "rust", "fn a() { b() }".into());

        assert_eq!(first.file_id, second.file_id);
        assert_eq!(store.file_count("r1"), 1);
        assert_eq!(
            store.get_file_by_path("r1", "src/a.rs").unwrap().content,
            "fn a() { b() }"
        );
        assert_ne!(first.content_hash, second.content_hash);
    }

    #[test]
    fn test_paths_unique_per_repo_not_global() {
        let (_dir, store) = test_store();
        store.upsert_file("r1", "main.py", "python", "x".into());
        store.upsert_file("r2", "main.py", "python", "y".into());
        assert_eq!(store.file_count("r1"), 1);
        assert_eq!(store.file_count("r2"), 1);
    }

    #[test]
    fn test_update_file_persists_mutation() {
        let (_dir, store) = test_store();
        store.upsert_file("r1", "a.py", "python", "pass".into());

        let updated = store
            .update_file("r1", "a.py", |f| {
                f.parsed = true;
                f.summary = Some("does nothing".into());
            })
            .unwrap();
        assert!(updated.parsed);

        assert!(store.update_file("r1", "missing.py", |_| {}).is_none());
    }

    #[test]
    fn test_most_imported_ranking() {
        let (_dir, store) = test_store();
        for (path, n) in [("a.py", 3), ("b.py", 1), ("c.py", 3), ("d.py", 0)] {
            store.upsert_file("r1", path, "python", "".into());
            store.update_file("r1", path, |f| {
                f.dependencies.imported_by = (0..n).map(|i| format!("i{i}.py")).collect();
            });
        }

        let top: Vec<String> = store
            .most_imported_files("r1", 3)
            .into_iter()
            .map(|f| f.path)
            .collect();
        // in-degree desc, path asc on ties
        assert_eq!(top, vec!["a.py", "c.py", "b.py"]);
    }

    #[test]
    fn test_find_functions_by_name() {
        let (_dir, store) = test_store();
        store.upsert_file("r1", "a.py", "python", "def go(): pass".into());
        store.update_file("r1", "a.py", |f| {
            f.functions = vec![crate::models::FunctionInfo {
                name: "go".into(),
                signature: "go()".into(),
                parameters: vec![],
                parent_class: None,
                is_method: false,
                line_start: 1,
                line_end: 1,
            }];
        });

        let matches = store.find_functions_by_name("r1", "go");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0.path, "a.py");
        assert!(store.find_functions_by_name("r1", "stop").is_empty());
    }

    #[test]
    fn test_normalized_cosine_bounds() {
        assert_eq!(normalized_cosine(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(normalized_cosine(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        let orthogonal = normalized_cosine(&[1.0, 0.0], &[0.0, 1.0]);
        assert!((orthogonal - 0.5).abs() < 1e-6);
        // mismatched dims
        assert_eq!(normalized_cosine(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(normalized_cosine(&[], &[]), 0.0);
    }

    #[test]
    fn test_summary_vector_search_ranks_by_similarity() {
        let (_dir, store) = test_store();
        let entries = [
            ("db.py", vec![0.9f32, 0.1, 0.0]),
            ("http.py", vec![0.0, 0.9, 0.1]),
            ("cli.py", vec![0.1, 0.0, 0.9]),
        ];
        for (path, vector) in entries {
            store.upsert_file("r1", path, "python", "".into());
            store.update_file("r1", path, |f| {
                f.summary = Some(format!("summary of {path}"));
                f.summary_vector = Some(vector.clone());
            });
        }

        let hits = store.search_summary_vectors("r1", &[1.0, 0.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].path, "db.py");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_chunk_vector_search_skips_unembedded() {
        let (_dir, store) = test_store();
        store.upsert_file("r1", "a.py", "python", "def f(): pass".into());
        store.update_file("r1", "a.py", |f| {
            f.chunks = vec![
                Chunk {
                    chunk_type: ChunkType::Function,
                    chunk_name: "f".into(),
                    chunk_text: "Function f()".into(),
                    code: "def f(): pass".into(),
                    line_start: 1,
                    line_end: 1,
                    parent_class: None,
                    chunk_index: 0,
                    total_chunks: 2,
                    vector: vec![1.0, 0.0],
                },
                Chunk {
                    chunk_type: ChunkType::Function,
                    chunk_name: "g".into(),
                    chunk_text: "Function g()".into(),
                    code: "def g(): pass".into(),
                    line_start: 2,
                    line_end: 2,
                    parent_class: None,
                    chunk_index: 1,
                    total_chunks: 2,
                    vector: vec![],
                },
            ];
        });

        let hits = store.search_chunk_vectors("r1", &[1.0, 0.0], 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.chunk_name, "f");
    }

    #[test]
    fn test_vector_search_empty_repo() {
        let (_dir, store) = test_store();
        assert!(store.search_summary_vectors("nope", &[1.0], 5).is_empty());
        assert!(store.search_chunk_vectors("nope", &[1.0], 5).is_empty());
    }
}
