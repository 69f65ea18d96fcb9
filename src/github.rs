//! Source-host API client: resolves a repository URL into metadata, a
//! recursive file tree of text-eligible blobs, and per-blob content.
//!
//! All network calls go through a shared [`reqwest::Client`] with
//! exponential backoff on transport errors and on documented rate-limit
//! signals. A bearer token (`SOURCE_HOST_TOKEN`) raises the host rate
//! ceiling when present.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::models::{FileTree, TreeNode};

const API_BASE: &str = "https://api.github.com";
const RAW_BASE: &str = "https://raw.githubusercontent.com";
const USER_AGENT: &str = "repo-chat";

/// Backoff cycles spent on rate-limit responses before giving up.
const MAX_RATE_LIMIT_RETRIES: u32 = 5;
/// Retries on plain transport errors.
const MAX_TRANSPORT_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid source URL: {0}")]
    InvalidUrl(String),

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    /// Rate limit persisted through the whole backoff budget.
    #[error("source host rate limit exceeded")]
    RateLimited,

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Repository metadata as reported by the host API.
#[derive(Debug, Clone)]
pub struct RepoMetadata {
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub description: Option<String>,
    pub default_branch: String,
    pub language: Option<String>,
    pub stars: u64,
    pub forks: u64,
}

pub struct GitHubClient {
    http: reqwest::Client,
    token: Option<String>,
    max_blob_size: u64,
}

impl GitHubClient {
    pub fn new(http: reqwest::Client, token: Option<String>, max_blob_size: u64) -> Self {
        Self {
            http,
            token,
            max_blob_size,
        }
    }

    /// Fetch repository metadata.
    pub async fn metadata(&self, owner: &str, name: &str) -> Result<RepoMetadata, FetchError> {
        let url = format!("{API_BASE}/repos/{owner}/{name}");
        let resp = self.get_with_retries(&url).await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::RepoNotFound(format!("{owner}/{name}")));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Transport(anyhow!(
                "metadata request returned {status}: {body}"
            )));
        }

        #[derive(Deserialize)]
        struct ApiOwner {
            login: String,
        }
        #[derive(Deserialize)]
        struct ApiRepo {
            owner: ApiOwner,
            name: String,
            full_name: String,
            description: Option<String>,
            default_branch: Option<String>,
            language: Option<String>,
            #[serde(default)]
            stargazers_count: u64,
            #[serde(default)]
            forks_count: u64,
        }

        let repo: ApiRepo = resp
            .json()
            .await
            .context("failed to parse repository metadata")?;

        Ok(RepoMetadata {
            owner: repo.owner.login,
            name: repo.name,
            full_name: repo.full_name,
            description: repo.description,
            default_branch: repo.default_branch.unwrap_or_else(|| "main".to_string()),
            language: repo.language,
            stars: repo.stargazers_count,
            forks: repo.forks_count,
        })
    }

    /// Fetch the recursive file tree, filtered by the extension/size policy
    /// and folded into the nested tree shape. Falls back to `master` when
    /// the default `main` branch does not exist.
    pub async fn tree(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<FileTree, FetchError> {
        let url = format!("{API_BASE}/repos/{owner}/{name}/git/trees/{branch}?recursive=1");
        let mut resp = self.get_with_retries(&url).await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND && branch == "main" {
            let url = format!("{API_BASE}/repos/{owner}/{name}/git/trees/master?recursive=1");
            resp = self.get_with_retries(&url).await?;
        }

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::RepoNotFound(format!("{owner}/{name}@{branch}")));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Transport(anyhow!(
                "tree request returned {status}: {body}"
            )));
        }

        #[derive(Deserialize)]
        struct ApiTreeEntry {
            path: String,
            #[serde(rename = "type")]
            kind: String,
            #[serde(default)]
            size: u64,
        }
        #[derive(Deserialize)]
        struct ApiTree {
            tree: Vec<ApiTreeEntry>,
        }

        let api_tree: ApiTree = resp.json().await.context("failed to parse tree response")?;

        let blobs = api_tree
            .tree
            .into_iter()
            .filter(|e| e.kind == "blob")
            .map(|e| (e.path, e.size));

        Ok(build_file_tree(blobs, self.max_blob_size))
    }

    /// Fetch a single blob's raw content. Returns `Ok(None)` for blobs that
    /// are not valid UTF-8 (binary content slipped past the extension policy).
    pub async fn blob(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>, FetchError> {
        let url = format!("{RAW_BASE}/{owner}/{name}/{branch}/{path}");
        let resp = self.get_with_retries(&url).await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::Transport(anyhow!("blob not found: {path}")));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(FetchError::Transport(anyhow!(
                "blob request for {path} returned {status}"
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("failed to read blob body for {path}"))?;

        Ok(String::from_utf8(bytes.to_vec()).ok())
    }

    /// GET with the retry/backoff discipline: transport errors retry up to
    /// MAX_TRANSPORT_RETRIES with jittered backoff; rate-limit responses
    /// back off up to MAX_RATE_LIMIT_RETRIES cycles, then surface
    /// [`FetchError::RateLimited`].
    async fn get_with_retries(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let mut transport_attempts = 0u32;
        let mut rate_limit_attempts = 0u32;

        loop {
            let mut req = self
                .http
                .get(url)
                .header("User-Agent", USER_AGENT)
                .timeout(Duration::from_secs(30));
            if let Some(token) = &self.token {
                req = req.header("Authorization", format!("Bearer {token}"));
            }

            match req.send().await {
                Ok(resp) if is_rate_limited(&resp) => {
                    rate_limit_attempts += 1;
                    if rate_limit_attempts > MAX_RATE_LIMIT_RETRIES {
                        return Err(FetchError::RateLimited);
                    }
                    let delay = backoff_delay(rate_limit_attempts, 1_000);
                    tracing::warn!(
                        "source host rate limited (attempt {rate_limit_attempts}), backing off {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    transport_attempts += 1;
                    if transport_attempts > MAX_TRANSPORT_RETRIES {
                        return Err(FetchError::Transport(
                            anyhow::Error::new(e).context(format!("GET {url} failed")),
                        ));
                    }
                    let delay = backoff_delay(transport_attempts, 500);
                    tracing::warn!("transport error on {url}: {e}, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn is_rate_limited(resp: &reqwest::Response) -> bool {
    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    // GitHub signals primary rate limiting with 403 + exhausted quota header
    resp.status() == reqwest::StatusCode::FORBIDDEN
        && resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            == Some("0")
}

fn backoff_delay(attempt: u32, base_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..base_ms / 2 + 1);
    Duration::from_millis(exp + jitter)
}

/// Parse a repository URL into `(owner, name)`.
pub fn parse_github_url(url: &str) -> Result<(String, String), FetchError> {
    let trimmed = url.trim();
    let after_host = trimmed
        .split_once("github.com/")
        .map(|(_, rest)| rest)
        .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;

    let mut parts = after_host.split('/').filter(|s| !s.is_empty());
    let owner = parts
        .next()
        .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;
    let name = parts
        .next()
        .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;

    let name = name.trim_end_matches(".git");
    if owner.is_empty() || name.is_empty() {
        return Err(FetchError::InvalidUrl(url.to_string()));
    }

    Ok((owner.to_string(), name.to_string()))
}

/// Fold a flat blob listing into the nested file tree, applying the
/// extension/size exclusion policy and annotating detected languages.
pub fn build_file_tree(
    blobs: impl Iterator<Item = (String, u64)>,
    max_blob_size: u64,
) -> FileTree {
    let mut tree: FileTree = BTreeMap::new();

    for (path, size) in blobs {
        if should_ignore_path(&path) || size > max_blob_size {
            continue;
        }

        let parts: Vec<&str> = path.split('/').collect();
        let mut current = &mut tree;

        for (i, part) in parts.iter().enumerate() {
            if i == parts.len() - 1 {
                current.insert(
                    part.to_string(),
                    TreeNode::File {
                        path: path.clone(),
                        size,
                        language: detect_language(part),
                    },
                );
            } else {
                let entry = current
                    .entry(part.to_string())
                    .or_insert_with(|| TreeNode::Folder {
                        children: BTreeMap::new(),
                    });
                current = match entry {
                    TreeNode::Folder { children } => children,
                    // A file and a folder sharing a path segment should not
                    // happen in a git tree; skip the conflicting blob.
                    TreeNode::File { .. } => break,
                };
            }
        }
    }

    tree
}

/// Flatten the nested tree back into `(path, size)` pairs, in path order.
pub fn flatten_tree(tree: &FileTree) -> Vec<(String, u64)> {
    let mut files = Vec::new();
    collect_files(tree, &mut files);
    files
}

fn collect_files(tree: &FileTree, out: &mut Vec<(String, u64)>) {
    for node in tree.values() {
        match node {
            TreeNode::File { path, size, .. } => out.push((path.clone(), *size)),
            TreeNode::Folder { children } => collect_files(children, out),
        }
    }
}

/// Count files by detected language, capitalized for display.
pub fn languages_breakdown(tree: &FileTree) -> BTreeMap<String, usize> {
    let mut breakdown = BTreeMap::new();
    count_languages(tree, &mut breakdown);
    breakdown
}

fn count_languages(tree: &FileTree, out: &mut BTreeMap<String, usize>) {
    for node in tree.values() {
        match node {
            TreeNode::File {
                language: Some(lang),
                ..
            } => {
                let mut display = lang.clone();
                if let Some(first) = display.get_mut(0..1) {
                    first.make_ascii_uppercase();
                }
                *out.entry(display).or_insert(0) += 1;
            }
            TreeNode::File { .. } => {}
            TreeNode::Folder { children } => count_languages(children, out),
        }
    }
}

fn should_ignore_path(path: &str) -> bool {
    const IGNORE_DIRS: &[&str] = &[
        "node_modules/",
        "__pycache__/",
        ".pytest_cache/",
        ".mypy_cache/",
        "venv/",
        ".venv/",
        "dist/",
        "build/",
        ".next/",
        ".nuxt/",
        "out/",
        "target/",
        "bin/",
        "obj/",
        ".git/",
        ".svn/",
        ".hg/",
        "vendor/",
        "bower_components/",
        "coverage/",
        ".cache/",
        ".idea/",
        ".vscode/",
    ];
    for dir in IGNORE_DIRS {
        if path.starts_with(dir) || path.contains(&format!("/{dir}")) {
            return true;
        }
    }

    const IGNORE_EXTENSIONS: &[&str] = &[
        ".pyc", ".pyo", ".pyd", ".class", ".jar", ".o", ".so", ".dylib", ".dll", ".exe", ".bin",
        ".jpg", ".jpeg", ".png", ".gif", ".svg", ".ico", ".mp4", ".mov", ".avi", ".mp3", ".wav",
        ".pdf", ".doc", ".docx", ".zip", ".tar", ".gz", ".rar", ".woff", ".woff2", ".ttf", ".eot",
        ".lock",
    ];
    let lower = path.to_lowercase();
    for ext in IGNORE_EXTENSIONS {
        if lower.ends_with(ext) {
            return true;
        }
    }

    // Hidden files, except a few configs worth keeping
    const KEEP_HIDDEN: &[&str] = &[
        ".env.example",
        ".gitignore",
        ".eslintrc.json",
        ".prettierrc",
        ".babelrc",
    ];
    let filename = path.rsplit('/').next().unwrap_or(path);
    if filename.starts_with('.') && !KEEP_HIDDEN.contains(&filename) {
        return true;
    }

    false
}

/// Detect the programming language from a filename's extension.
pub fn detect_language(filename: &str) -> Option<String> {
    let ext = filename.rsplit_once('.').map(|(_, e)| e.to_lowercase())?;

    let language = match ext.as_str() {
        "py" => "python",
        "js" => "javascript",
        "jsx" => "jsx",
        "ts" => "typescript",
        "tsx" => "tsx",
        "rs" => "rust",
        "go" => "go",
        "java" => "java",
        "c" => "c",
        "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" | "kts" => "kotlin",
        "scala" => "scala",
        "md" => "markdown",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "xml" => "xml",
        "html" => "html",
        "css" => "css",
        "scss" => "scss",
        "sql" => "sql",
        "sh" | "bash" => "shell",
        _ => return None,
    };

    Some(language.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── URL parsing ──────────────────────────────────────

    #[test]
    fn test_parse_plain_url() {
        let (owner, name) = parse_github_url("https://github.com/rust-lang/rust").unwrap();
        assert_eq!(owner, "rust-lang");
        assert_eq!(name, "rust");
    }

    #[test]
    fn test_parse_url_with_git_suffix() {
        let (owner, name) = parse_github_url("https://github.com/tokio-rs/tokio.git").unwrap();
        assert_eq!(owner, "tokio-rs");
        assert_eq!(name, "tokio");
    }

    #[test]
    fn test_parse_url_without_scheme() {
        let (owner, name) = parse_github_url("github.com/serde-rs/serde").unwrap();
        assert_eq!(owner, "serde-rs");
        assert_eq!(name, "serde");
    }

    #[test]
    fn test_parse_url_trailing_slash() {
        let (owner, name) = parse_github_url("https://github.com/a/b/").unwrap();
        assert_eq!(owner, "a");
        assert_eq!(name, "b");
    }

    #[test]
    fn test_parse_invalid_url() {
        assert!(matches!(
            parse_github_url("https://example.com/a/b"),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_github_url("https://github.com/"),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_github_url("https://github.com/onlyowner"),
            Err(FetchError::InvalidUrl(_))
        ));
    }

    // ── ignore policy ────────────────────────────────────

    #[test]
    fn test_ignores_dependency_dirs() {
        assert!(should_ignore_path("node_modules/react/index.js"));
        assert!(should_ignore_path("frontend/node_modules/x/y.js"));
        assert!(should_ignore_path("target/debug/main"));
        assert!(should_ignore_path("__pycache__/mod.pyc"));
    }

    #[test]
    fn test_ignores_binary_extensions() {
        assert!(should_ignore_path("assets/logo.png"));
        assert!(should_ignore_path("dist.tar.gz"));
        assert!(should_ignore_path("Cargo.lock"));
    }

    #[test]
    fn test_ignores_hidden_except_whitelist() {
        assert!(should_ignore_path(".github-token"));
        assert!(should_ignore_path("src/.DS_Store"));
        assert!(!should_ignore_path(".gitignore"));
        assert!(!should_ignore_path(".env.example"));
    }

    #[test]
    fn test_keeps_source_files() {
        assert!(!should_ignore_path("src/main.rs"));
        assert!(!should_ignore_path("app/server.py"));
        assert!(!should_ignore_path("README.md"));
    }

    // ── language detection ───────────────────────────────

    #[test]
    fn test_detect_language_common() {
        assert_eq!(detect_language("main.rs").as_deref(), Some("rust"));
        assert_eq!(detect_language("app.py").as_deref(), Some("python"));
        assert_eq!(detect_language("index.tsx").as_deref(), Some("tsx"));
        assert_eq!(detect_language("server.go").as_deref(), Some("go"));
        assert_eq!(detect_language("Foo.java").as_deref(), Some("java"));
    }

    #[test]
    fn test_detect_language_unknown() {
        assert_eq!(detect_language("noextension"), None);
        assert_eq!(detect_language("file.xyz"), None);
    }

    // ── tree building ────────────────────────────────────

    #[test]
    fn test_build_tree_nests_folders() {
        let blobs = vec![
            ("src/main.rs".to_string(), 100),
            ("src/lib.rs".to_string(), 80),
            ("README.md".to_string(), 40),
        ];
        let tree = build_file_tree(blobs.into_iter(), 1_048_576);

        assert!(matches!(tree.get("README.md"), Some(TreeNode::File { .. })));
        match tree.get("src") {
            Some(TreeNode::Folder { children }) => {
                assert!(children.contains_key("main.rs"));
                assert!(children.contains_key("lib.rs"));
            }
            other => panic!("expected folder, got {other:?}"),
        }
    }

    #[test]
    fn test_build_tree_filters_by_policy_and_size() {
        let blobs = vec![
            ("src/main.rs".to_string(), 100),
            ("node_modules/x/y.js".to_string(), 100),
            ("big.rs".to_string(), 2_000_000),
            ("logo.png".to_string(), 10),
        ];
        let tree = build_file_tree(blobs.into_iter(), 1_048_576);
        let files = flatten_tree(&tree);
        assert_eq!(files, vec![("src/main.rs".to_string(), 100)]);
    }

    #[test]
    fn test_build_tree_is_deterministic() {
        let blobs = || {
            vec![
                ("b.rs".to_string(), 1),
                ("a.rs".to_string(), 1),
                ("dir/c.rs".to_string(), 1),
            ]
            .into_iter()
        };
        let t1 = build_file_tree(blobs(), 1_048_576);
        let t2 = build_file_tree(blobs().rev(), 1_048_576);
        assert_eq!(
            serde_json::to_string(&t1).unwrap(),
            serde_json::to_string(&t2).unwrap()
        );
    }

    #[test]
    fn test_languages_breakdown() {
        let blobs = vec![
            ("a.py".to_string(), 1),
            ("b.py".to_string(), 1),
            ("c.rs".to_string(), 1),
        ];
        let tree = build_file_tree(blobs.into_iter(), 1_048_576);
        let breakdown = languages_breakdown(&tree);
        assert_eq!(breakdown.get("Python"), Some(&2));
        assert_eq!(breakdown.get("Rust"), Some(&1));
    }

    #[test]
    fn test_flatten_tree_path_order() {
        let blobs = vec![
            ("z.rs".to_string(), 1),
            ("a/x.rs".to_string(), 1),
            ("a/b.rs".to_string(), 1),
        ];
        let tree = build_file_tree(blobs.into_iter(), 1_048_576);
        let files: Vec<String> = flatten_tree(&tree).into_iter().map(|(p, _)| p).collect();
        assert_eq!(files, vec!["a/b.rs", "a/x.rs", "z.rs"]);
    }
}
