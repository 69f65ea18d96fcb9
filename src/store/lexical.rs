//! Lexical index over `(path, summary, chunk_text, code)` built on
//! tantivy. Scores are raw BM25; the hybrid scorer normalizes them into
//! [0,1] against the best hit of the candidate set.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexWriter, ReloadPolicy, TantivyDocument, Term};

use crate::models::FileDoc;

pub struct LexicalIndex {
    index: Index,
    /// Serializes writer creation; tantivy allows one writer at a time.
    write_guard: Mutex<()>,
    f_file_id: Field,
    f_repo_id: Field,
    f_path: Field,
    f_summary: Field,
    f_chunk_text: Field,
    f_code: Field,
}

#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub file_id: String,
    pub score: f32,
}

impl LexicalIndex {
    pub fn open_or_create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut schema_builder = Schema::builder();
        let f_file_id = schema_builder.add_text_field("file_id", STRING | STORED);
        let f_repo_id = schema_builder.add_text_field("repo_id", STRING | STORED);
        let f_path = schema_builder.add_text_field("path", TEXT | STORED);
        let f_summary = schema_builder.add_text_field("summary", TEXT);
        let f_chunk_text = schema_builder.add_text_field("chunk_text", TEXT);
        let f_code = schema_builder.add_text_field("code", TEXT);
        let schema = schema_builder.build();

        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir).context("failed to open existing lexical index")?
        } else {
            Index::create_in_dir(dir, schema).context("failed to create lexical index")?
        };

        Ok(Self {
            index,
            write_guard: Mutex::new(()),
            f_file_id,
            f_repo_id,
            f_path,
            f_summary,
            f_chunk_text,
            f_code,
        })
    }

    /// (Re)index a batch of files: existing documents with the same file_id
    /// are replaced, so the call is an idempotent upsert.
    pub fn index_files(&self, files: &[FileDoc]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let _guard = self.write_guard.lock();
        let mut writer: IndexWriter = self
            .index
            .writer(50_000_000)
            .context("failed to create lexical index writer")?;

        for file in files {
            writer.delete_term(Term::from_field_text(self.f_file_id, &file.file_id));

            let chunk_text: String = file
                .chunks
                .iter()
                .map(|c| c.chunk_text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let code: String = file
                .chunks
                .iter()
                .map(|c| c.code.as_str())
                .collect::<Vec<_>>()
                .join("\n");

            writer.add_document(doc!(
                self.f_file_id => file.file_id.clone(),
                self.f_repo_id => file.repo_id.clone(),
                self.f_path => file.path.clone(),
                self.f_summary => file.summary.clone().unwrap_or_default(),
                self.f_chunk_text => chunk_text,
                self.f_code => code,
            ))?;
        }

        writer.commit().context("failed to commit lexical index")?;
        Ok(())
    }

    /// Search within one repository. Returns raw BM25-scored hits, best
    /// first. A query that parses to nothing yields no hits.
    pub fn search(&self, repo_id: &str, query_text: &str, limit: usize) -> Result<Vec<LexicalHit>> {
        let reader = self
            .index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("failed to create lexical reader")?;
        let searcher = reader.searcher();

        let query_parser = QueryParser::for_index(
            &self.index,
            vec![self.f_path, self.f_summary, self.f_chunk_text, self.f_code],
        );
        // Lenient parse: user queries are free text, not query syntax
        let (parsed, _errors) = query_parser.parse_query_lenient(query_text);

        let repo_filter: Box<dyn Query> = Box::new(TermQuery::new(
            Term::from_field_text(self.f_repo_id, repo_id),
            IndexRecordOption::Basic,
        ));
        let combined = BooleanQuery::new(vec![(Occur::Must, repo_filter), (Occur::Must, parsed)]);

        let top_docs = searcher
            .search(&combined, &TopDocs::with_limit(limit))
            .context("lexical search failed")?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let document: TantivyDocument = searcher
                .doc(address)
                .context("failed to retrieve lexical document")?;
            let file_id = document
                .get_first(self.f_file_id)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if file_id.is_empty() {
                continue;
            }
            hits.push(LexicalHit { file_id, score });
        }

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ChunkType, Dependencies, ProviderMeta};
    use chrono::Utc;

    fn doc_with(
        file_id: &str,
        repo_id: &str,
        path: &str,
        summary: Option<&str>,
        code: &str,
    ) -> FileDoc {
        let now = Utc::now();
        FileDoc {
            file_id: file_id.into(),
            repo_id: repo_id.into(),
            path: path.into(),
            filename: path.rsplit('/').next().unwrap_or(path).into(),
            language: "python".into(),
            content: code.into(),
            content_hash: "h".into(),
            size: code.len() as u64,
            parsed: true,
            embedded: false,
            functions: vec![],
            classes: vec![],
            imports: vec![],
            dependencies: Dependencies::default(),
            chunks: vec![Chunk {
                chunk_type: ChunkType::Function,
                chunk_name: "f".into(),
                chunk_text: format!("Function in {path}"),
                code: code.into(),
                line_start: 1,
                line_end: 1,
                parent_class: None,
                chunk_index: 0,
                total_chunks: 1,
                vector: vec![],
            }],
            summary: summary.map(|s| s.to_string()),
            summary_vector: None,
            provider_meta: ProviderMeta::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_index_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let index = LexicalIndex::open_or_create(dir.path()).unwrap();

        index
            .index_files(&[
                doc_with("f1", "r1", "db.py", Some("database pooling"), "def connect(): pass"),
                doc_with("f2", "r1", "http.py", Some("request routing"), "def route(): pass"),
            ])
            .unwrap();

        let hits = index.search("r1", "database", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_id, "f1");
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn test_search_is_scoped_to_repo() {
        let dir = tempfile::tempdir().unwrap();
        let index = LexicalIndex::open_or_create(dir.path()).unwrap();

        index
            .index_files(&[
                doc_with("f1", "r1", "auth.py", Some("token auth"), ""),
                doc_with("f2", "r2", "auth.py", Some("token auth"), ""),
            ])
            .unwrap();

        let hits = index.search("r1", "token", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_id, "f1");
    }

    #[test]
    fn test_reindex_replaces_document() {
        let dir = tempfile::tempdir().unwrap();
        let index = LexicalIndex::open_or_create(dir.path()).unwrap();

        index
            .index_files(&[doc_with("f1", "r1", "a.py", Some("about cats"), "")])
            .unwrap();
        index
            .index_files(&[doc_with("f1", "r1", "a.py", Some("about dogs"), "")])
            .unwrap();

        assert!(index.search("r1", "cats", 10).unwrap().is_empty());
        assert_eq!(index.search("r1", "dogs", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_no_match_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = LexicalIndex::open_or_create(dir.path()).unwrap();
        index
            .index_files(&[doc_with("f1", "r1", "a.py", Some("parsing"), "")])
            .unwrap();

        assert!(index.search("r1", "blockchain", 10).unwrap().is_empty());
    }

    #[test]
    fn test_query_syntax_characters_are_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let index = LexicalIndex::open_or_create(dir.path()).unwrap();
        index
            .index_files(&[doc_with("f1", "r1", "a.py", Some("parsing"), "")])
            .unwrap();

        // Free-text queries with operator characters must not error
        let result = index.search("r1", "parsing AND (weird:\"syntax", 10);
        assert!(result.is_ok());
    }
}
