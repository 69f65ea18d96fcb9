//! Textual import resolution: maps the literal import strings extracted by
//! the parser onto repo-local file paths, building forward (`imports`),
//! reverse (`imported_by`), and external edge sets.
//!
//! Resolution never executes code or consults package metadata. For each
//! import target the candidate order is:
//! 1. exact path match
//! 2. path with a language-customary extension appended
//! 3. directory match via the `index` / `mod` / `__init__` convention
//! 4. otherwise external
//!
//! Ambiguous targets resolve to the lexicographically first match.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::Dependencies;

/// The slice of a file the resolver needs.
#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub path: String,
    pub language: String,
    pub imports: Vec<String>,
}

/// Resolve every file's imports against the full file set. Returns a map
/// keyed by file path; every input path has an entry.
pub fn resolve_all(files: &[ImportRecord]) -> HashMap<String, Dependencies> {
    let known_paths: BTreeSet<&str> = files.iter().map(|f| f.path.as_str()).collect();

    let mut result: HashMap<String, Dependencies> = files
        .iter()
        .map(|f| (f.path.clone(), Dependencies::default()))
        .collect();

    // Forward edges
    for file in files {
        let Some(deps) = result.get_mut(&file.path) else {
            continue;
        };
        let mut seen_local: BTreeSet<String> = BTreeSet::new();
        let mut seen_external: BTreeSet<String> = BTreeSet::new();

        for import in &file.imports {
            match resolve_one(import, &file.path, &file.language, &known_paths) {
                Some(target) if target != file.path => {
                    if seen_local.insert(target.clone()) {
                        deps.imports.push(target);
                    }
                }
                Some(_) => {} // self-import, drop
                None => {
                    if seen_external.insert(import.clone()) {
                        deps.external_imports.push(import.clone());
                    }
                }
            }
        }
    }

    // Reverse edges: exact inverse of the forward set
    let mut reverse: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (path, deps) in &result {
        for target in &deps.imports {
            reverse.entry(target.clone()).or_default().push(path.clone());
        }
    }
    for (target, mut importers) in reverse {
        importers.sort();
        if let Some(deps) = result.get_mut(&target) {
            deps.imported_by = importers;
        }
    }

    result
}

/// Resolve a single import target to a repo-local path, or None if external.
fn resolve_one(
    import: &str,
    importer_path: &str,
    language: &str,
    known_paths: &BTreeSet<&str>,
) -> Option<String> {
    let mut matches: BTreeSet<String> = BTreeSet::new();

    for candidate in candidate_bases(import, importer_path, language) {
        // (a) exact path
        if known_paths.contains(candidate.as_str()) {
            matches.insert(candidate.clone());
        }
        // (b) customary extension appended
        for ext in extensions(language) {
            let with_ext = format!("{candidate}{ext}");
            if known_paths.contains(with_ext.as_str()) {
                matches.insert(with_ext);
            }
        }
        // (c) directory convention
        for entry in dir_entries(language) {
            let in_dir = format!("{candidate}/{entry}");
            if known_paths.contains(in_dir.as_str()) {
                matches.insert(in_dir);
            }
        }
    }

    // BTreeSet iteration order gives the lexicographically first match
    matches.into_iter().next()
}

/// Candidate base paths (no extension) an import target may refer to.
fn candidate_bases(import: &str, importer_path: &str, language: &str) -> Vec<String> {
    let importer_dir = match importer_path.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    };

    let mut bases = Vec::new();
    let mut push = |p: String| {
        if !p.is_empty() && !bases.contains(&p) {
            bases.push(p);
        }
    };

    match language {
        "python" => {
            let trimmed = import.trim_start_matches('.');
            let slashed = trimmed.replace('.', "/");
            // repo-root dotted module, sibling module, and explicit relative
            push(slashed.clone());
            push(join_normalized(importer_dir, &slashed));
        }
        "javascript" | "jsx" | "typescript" | "tsx" => {
            if import.starts_with("./") || import.starts_with("../") {
                push(join_normalized(importer_dir, import));
            } else {
                push(import.trim_start_matches('/').to_string());
            }
        }
        "rust" => {
            // `use crate::a::b::{C, D}` — cut the group/glob/rename tail
            let head = import
                .split(" as ")
                .next()
                .unwrap_or(import)
                .split('{')
                .next()
                .unwrap_or(import)
                .trim()
                .trim_end_matches("::*")
                .trim_end_matches("::");
            let slashed = head.replace("::", "/");
            if let Some(rest) = slashed.strip_prefix("crate/") {
                push(format!("src/{rest}"));
                push(rest.to_string());
            } else if let Some(rest) = slashed.strip_prefix("self/") {
                push(join_normalized(importer_dir, rest));
            } else {
                push(slashed);
            }
        }
        "java" => {
            let slashed = import.replace('.', "/");
            push(slashed.clone());
            push(format!("src/main/java/{slashed}"));
        }
        "c" | "cpp" => {
            push(join_normalized(importer_dir, import));
            push(import.to_string());
        }
        _ => {
            push(import.to_string());
            push(join_normalized(importer_dir, import));
        }
    }

    bases
}

fn extensions(language: &str) -> &'static [&'static str] {
    match language {
        "python" => &[".py"],
        "javascript" | "jsx" | "typescript" | "tsx" => &[".ts", ".tsx", ".js", ".jsx"],
        "rust" => &[".rs"],
        "go" => &[".go"],
        "java" => &[".java"],
        "c" | "cpp" => &[".h", ".hpp", ".c", ".cpp"],
        _ => &[],
    }
}

fn dir_entries(language: &str) -> &'static [&'static str] {
    match language {
        "python" => &["__init__.py"],
        "javascript" | "jsx" | "typescript" | "tsx" => {
            &["index.ts", "index.tsx", "index.js", "index.jsx"]
        }
        "rust" => &["mod.rs"],
        _ => &[],
    }
}

/// Join a relative specifier onto a directory and normalize `.`/`..`
/// segments, purely textually.
fn join_normalized(dir: &str, relative: &str) -> String {
    let mut segments: Vec<&str> = if dir.is_empty() {
        Vec::new()
    } else {
        dir.split('/').collect()
    };

    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, language: &str, imports: &[&str]) -> ImportRecord {
        ImportRecord {
            path: path.to_string(),
            language: language.to_string(),
            imports: imports.iter().map(|s| s.to_string()).collect(),
        }
    }

    // ── Python ───────────────────────────────────────────

    #[test]
    fn test_python_sibling_module() {
        let files = vec![
            record("a.py", "python", &["b"]),
            record("b.py", "python", &[]),
        ];
        let deps = resolve_all(&files);
        assert_eq!(deps["a.py"].imports, vec!["b.py"]);
        assert_eq!(deps["b.py"].imported_by, vec!["a.py"]);
        assert!(deps["a.py"].external_imports.is_empty());
    }

    #[test]
    fn test_python_dotted_module() {
        let files = vec![
            record("main.py", "python", &["app.services.files", "os"]),
            record("app/services/files.py", "python", &[]),
        ];
        let deps = resolve_all(&files);
        assert_eq!(deps["main.py"].imports, vec!["app/services/files.py"]);
        assert_eq!(deps["main.py"].external_imports, vec!["os"]);
    }

    #[test]
    fn test_python_package_init() {
        let files = vec![
            record("main.py", "python", &["app"]),
            record("app/__init__.py", "python", &[]),
        ];
        let deps = resolve_all(&files);
        assert_eq!(deps["main.py"].imports, vec!["app/__init__.py"]);
    }

    // ── JavaScript / TypeScript ──────────────────────────

    #[test]
    fn test_js_relative_import_with_extension_append() {
        let files = vec![
            record("src/app.ts", "typescript", &["./utils", "react"]),
            record("src/utils.ts", "typescript", &[]),
        ];
        let deps = resolve_all(&files);
        assert_eq!(deps["src/app.ts"].imports, vec!["src/utils.ts"]);
        assert_eq!(deps["src/app.ts"].external_imports, vec!["react"]);
        assert_eq!(deps["src/utils.ts"].imported_by, vec!["src/app.ts"]);
    }

    #[test]
    fn test_js_parent_directory_import() {
        let files = vec![
            record("src/components/button.tsx", "tsx", &["../theme"]),
            record("src/theme.ts", "typescript", &[]),
        ];
        let deps = resolve_all(&files);
        assert_eq!(
            deps["src/components/button.tsx"].imports,
            vec!["src/theme.ts"]
        );
    }

    #[test]
    fn test_js_index_convention() {
        let files = vec![
            record("src/app.ts", "typescript", &["./widgets"]),
            record("src/widgets/index.ts", "typescript", &[]),
        ];
        let deps = resolve_all(&files);
        assert_eq!(deps["src/app.ts"].imports, vec!["src/widgets/index.ts"]);
    }

    // ── Rust ─────────────────────────────────────────────

    #[test]
    fn test_rust_crate_use() {
        let files = vec![
            record("src/main.rs", "rust", &["crate::models::Repo", "std::fmt"]),
            record("src/models.rs", "rust", &[]),
        ];
        let deps = resolve_all(&files);
        assert_eq!(deps["src/main.rs"].imports, vec!["src/models.rs"]);
        assert_eq!(deps["src/main.rs"].external_imports, vec!["std::fmt"]);
    }

    #[test]
    fn test_rust_mod_rs_convention() {
        let files = vec![
            record("src/main.rs", "rust", &["crate::store"]),
            record("src/store/mod.rs", "rust", &[]),
        ];
        let deps = resolve_all(&files);
        assert_eq!(deps["src/main.rs"].imports, vec!["src/store/mod.rs"]);
    }

    #[test]
    fn test_ambiguity_resolves_lexicographically_first() {
        let files = vec![
            record("src/app.ts", "typescript", &["./widget"]),
            record("src/widget.js", "javascript", &[]),
            record("src/widget.ts", "typescript", &[]),
        ];
        let deps = resolve_all(&files);
        // Both extension candidates exist; lexicographic order wins
        assert_eq!(deps["src/app.ts"].imports, vec!["src/widget.js"]);
    }

    // ── C ────────────────────────────────────────────────

    #[test]
    fn test_c_include_relative_to_importer() {
        let files = vec![
            record("src/main.c", "c", &["util.h", "stdio.h"]),
            record("src/util.h", "c", &[]),
        ];
        let deps = resolve_all(&files);
        assert_eq!(deps["src/main.c"].imports, vec!["src/util.h"]);
        assert_eq!(deps["src/main.c"].external_imports, vec!["stdio.h"]);
    }

    // ── Inversion invariant ──────────────────────────────

    #[test]
    fn test_inversion_is_exact() {
        let files = vec![
            record("a.py", "python", &["b", "c"]),
            record("b.py", "python", &["c"]),
            record("c.py", "python", &[]),
        ];
        let deps = resolve_all(&files);

        for (path, d) in &deps {
            for target in &d.imports {
                assert!(
                    deps[target].imported_by.contains(path),
                    "{target} should list {path} in imported_by"
                );
            }
            for importer in &d.imported_by {
                assert!(
                    deps[importer].imports.contains(path),
                    "{importer} should list {path} in imports"
                );
            }
        }
        assert_eq!(deps["c.py"].imported_by, vec!["a.py", "b.py"]);
    }

    #[test]
    fn test_self_import_dropped() {
        let files = vec![record("a.py", "python", &["a"])];
        let deps = resolve_all(&files);
        assert!(deps["a.py"].imports.is_empty());
        assert!(deps["a.py"].imported_by.is_empty());
    }

    #[test]
    fn test_duplicate_imports_deduplicated() {
        let files = vec![
            record("a.py", "python", &["b", "b"]),
            record("b.py", "python", &[]),
        ];
        let deps = resolve_all(&files);
        assert_eq!(deps["a.py"].imports, vec!["b.py"]);
        assert_eq!(deps["b.py"].imported_by, vec!["a.py"]);
    }

    #[test]
    fn test_join_normalized() {
        assert_eq!(join_normalized("src", "./utils"), "src/utils");
        assert_eq!(join_normalized("src/components", "../theme"), "src/theme");
        assert_eq!(join_normalized("", "b"), "b");
        assert_eq!(join_normalized("a/b", "../../c"), "c");
    }
}
