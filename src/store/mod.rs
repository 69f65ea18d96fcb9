//! File-backed document store. Collections are held in memory behind
//! `parking_lot::RwLock`s and persisted as JSON on every mutation via
//! atomic temp-file renames; every write is a key-addressed idempotent
//! upsert, so no transactions are needed. The store also owns the two
//! search primitives: cosine vector search over file/chunk vectors and a
//! tantivy lexical index.

pub mod conversations;
pub mod files;
pub mod lexical;
pub mod tasks;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::models::{
    Conversation, FileDoc, Message, Repository, Session, SessionPreferences, Task,
};

use lexical::LexicalIndex;

pub struct Store {
    root: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
    repos: RwLock<HashMap<String, Repository>>,
    /// repo_id → file documents
    files: RwLock<HashMap<String, Vec<FileDoc>>>,
    tasks: RwLock<HashMap<String, Task>>,
    /// Last durable flush instant per task, for write coalescing
    task_flush: Mutex<HashMap<String, Instant>>,
    conversations: RwLock<HashMap<String, Conversation>>,
    /// conversation_id → messages, ordered by sequence_number
    messages: RwLock<HashMap<String, Vec<Message>>>,
    /// Per-conversation locks serializing message sequencing
    conversation_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    pub(crate) lexical: LexicalIndex,
}

impl Store {
    /// Open (or create) the store rooted at `root`. All collections are
    /// loaded eagerly; any task left `in_progress` by a previous process is
    /// marked failed with `error="interrupted"`.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed to create store dir {}", root.display()))?;
        std::fs::create_dir_all(root.join("files"))?;
        std::fs::create_dir_all(root.join("messages"))?;

        let sessions = read_collection(&root.join("sessions.json"))?;
        let repos = read_collection(&root.join("repositories.json"))?;
        let tasks = read_collection(&root.join("tasks.json"))?;
        let conversations = read_collection(&root.join("conversations.json"))?;

        let mut files: HashMap<String, Vec<FileDoc>> = HashMap::new();
        for entry in std::fs::read_dir(root.join("files"))? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                let repo_id = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                let docs: Vec<FileDoc> = read_json(&path)?.unwrap_or_default();
                files.insert(repo_id, docs);
            }
        }

        let mut messages: HashMap<String, Vec<Message>> = HashMap::new();
        for entry in std::fs::read_dir(root.join("messages"))? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                let conversation_id = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                let msgs: Vec<Message> = read_json(&path)?.unwrap_or_default();
                messages.insert(conversation_id, msgs);
            }
        }

        let lexical = LexicalIndex::open_or_create(&root.join("lexical"))?;

        let store = Self {
            root: root.to_path_buf(),
            sessions: RwLock::new(sessions),
            repos: RwLock::new(repos),
            files: RwLock::new(files),
            tasks: RwLock::new(tasks),
            task_flush: Mutex::new(HashMap::new()),
            conversations: RwLock::new(conversations),
            messages: RwLock::new(messages),
            conversation_locks: Mutex::new(HashMap::new()),
            lexical,
        };

        store.mark_interrupted_tasks();
        Ok(store)
    }

    // ─── Sessions ────────────────────────────────────────

    pub fn create_session(&self) -> Session {
        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            repositories: Vec::new(),
            preferences: None,
        };

        let mut sessions = self.sessions.write();
        sessions.insert(session.session_id.clone(), session.clone());
        self.persist_map(&sessions, "sessions.json");
        session
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn update_preferences(
        &self,
        session_id: &str,
        preferences: SessionPreferences,
    ) -> Option<Session> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(session_id)?;
        session.preferences = Some(preferences);
        session.updated_at = Utc::now();
        let updated = session.clone();
        self.persist_map(&sessions, "sessions.json");
        Some(updated)
    }

    pub fn add_repository_to_session(&self, session_id: &str, repo_id: &str) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(session_id) {
            if !session.repositories.iter().any(|r| r == repo_id) {
                session.repositories.push(repo_id.to_string());
                session.updated_at = Utc::now();
            }
            self.persist_map(&sessions, "sessions.json");
        }
    }

    // ─── Repositories ────────────────────────────────────

    pub fn insert_repository(&self, repo: Repository) {
        let mut repos = self.repos.write();
        repos.insert(repo.repo_id.clone(), repo);
        self.persist_map(&repos, "repositories.json");
    }

    pub fn get_repository(&self, repo_id: &str) -> Option<Repository> {
        self.repos.read().get(repo_id).cloned()
    }

    /// Mutate a repository in place and persist. Returns the updated copy.
    pub fn update_repository(
        &self,
        repo_id: &str,
        mutate: impl FnOnce(&mut Repository),
    ) -> Option<Repository> {
        let mut repos = self.repos.write();
        let repo = repos.get_mut(repo_id)?;
        mutate(repo);
        repo.updated_at = Utc::now();
        let updated = repo.clone();
        self.persist_map(&repos, "repositories.json");
        Some(updated)
    }

    /// Rebuild the lexical index entries for one repository from its
    /// current file set.
    pub fn reindex_lexical(&self, repo_id: &str) -> Result<()> {
        let files = self.get_files(repo_id);
        self.lexical.index_files(&files)
    }

    // ─── Persistence helpers ─────────────────────────────

    pub(crate) fn persist_map<V: serde::Serialize>(
        &self,
        map: &HashMap<String, V>,
        name: &str,
    ) {
        let path = self.root.join(name);
        if let Err(e) = write_json(&path, map) {
            tracing::error!("failed to persist {name}: {e:#}");
        }
    }

    pub(crate) fn persist_vec<V: serde::Serialize>(&self, items: &[V], relative: &str) {
        let path = self.root.join(relative);
        if let Err(e) = write_json(&path, &items) {
            tracing::error!("failed to persist {relative}: {e:#}");
        }
    }

}

/// Atomic JSON write: temp file then rename.
pub(crate) fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string(value).context("serialization failed")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &data).with_context(|| format!("write {} failed", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename to {} failed", path.display()))?;
    Ok(())
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data =
        std::fs::read_to_string(path).with_context(|| format!("read {} failed", path.display()))?;
    Ok(serde_json::from_str(&data).ok())
}

fn read_collection<T: serde::de::DeserializeOwned>(path: &Path) -> Result<HashMap<String, T>> {
    Ok(read_json(path)?.unwrap_or_default())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{RepoStatus, TaskStatus, TaskStep};
    use std::collections::BTreeMap;

    pub(crate) fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    pub(crate) fn sample_repo(repo_id: &str, session_id: &str) -> Repository {
        let now = Utc::now();
        Repository {
            repo_id: repo_id.to_string(),
            session_id: session_id.to_string(),
            source_url: "https://github.com/acme/widgets".into(),
            owner: "acme".into(),
            name: "widgets".into(),
            full_name: "acme/widgets".into(),
            description: None,
            default_branch: "main".into(),
            language: Some("Rust".into()),
            stars: 1,
            forks: 0,
            file_tree: BTreeMap::new(),
            status: RepoStatus::Fetched,
            task_id: None,
            error_message: None,
            file_count: 0,
            languages_breakdown: BTreeMap::new(),
            overview: None,
            overview_embedding: None,
            embedding_dim: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_session_lifecycle() {
        let (_dir, store) = test_store();

        let session = store.create_session();
        assert!(session.preferences.is_none());
        assert!(session.repositories.is_empty());

        let fetched = store.get_session(&session.session_id).unwrap();
        assert_eq!(fetched.session_id, session.session_id);

        let prefs = SessionPreferences {
            ai_provider: "fireworks".into(),
            ai_model: "qwen3-30b".into(),
            embedding_provider: None,
            embedding_model: None,
            theme: None,
        };
        let updated = store
            .update_preferences(&session.session_id, prefs)
            .unwrap();
        assert_eq!(
            updated.preferences.as_ref().unwrap().ai_provider,
            "fireworks"
        );

        store.add_repository_to_session(&session.session_id, "r1");
        store.add_repository_to_session(&session.session_id, "r1");
        let session = store.get_session(&session.session_id).unwrap();
        assert_eq!(session.repositories, vec!["r1"]);
    }

    #[test]
    fn test_repository_upsert_and_update() {
        let (_dir, store) = test_store();
        store.insert_repository(sample_repo("r1", "s1"));

        let updated = store
            .update_repository("r1", |r| {
                r.status = RepoStatus::Processing;
                r.file_count = 7;
            })
            .unwrap();
        assert_eq!(updated.status, RepoStatus::Processing);
        assert_eq!(updated.file_count, 7);

        assert!(store.update_repository("missing", |_| {}).is_none());
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let session_id;
        {
            let store = Store::open(dir.path()).unwrap();
            let session = store.create_session();
            session_id = session.session_id.clone();
            store.insert_repository(sample_repo("r1", &session_id));
        }

        let store = Store::open(dir.path()).unwrap();
        assert!(store.get_session(&session_id).is_some());
        assert_eq!(store.get_repository("r1").unwrap().name, "widgets");
    }

    #[test]
    fn test_reopen_marks_in_progress_tasks_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let task_id;
        {
            let store = Store::open(dir.path()).unwrap();
            task_id = store.create_task("process_files");
            store.update_progress(&task_id, 1, 10, TaskStep::Fetching);
            store.flush_task(&task_id);
        }

        let store = Store::open(dir.path()).unwrap();
        let task = store.get_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("interrupted"));
    }
}
