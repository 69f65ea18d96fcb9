//! Structural parsing: produces a uniform per-file record (functions,
//! classes with nested methods, import targets, line spans) from source
//! text. One generic tree-sitter strategy covers all supported grammars,
//! selected by the detected language.

pub mod generic;

use crate::models::{ClassInfo, FunctionInfo};

/// Uniform output of the parser pool.
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub functions: Vec<FunctionInfo>,
    pub classes: Vec<ClassInfo>,
    /// Literal import targets, normalized (quotes stripped, one per target)
    pub imports: Vec<String>,
    pub parse_error: Option<String>,
}

impl ParsedFile {
    pub fn unparsed(reason: impl Into<String>) -> Self {
        Self {
            parse_error: Some(reason.into()),
            ..Self::default()
        }
    }

    /// True when the parse produced usable structure.
    pub fn is_parsed(&self) -> bool {
        self.parse_error.is_none()
    }
}

/// Languages the parser pool can handle.
pub fn is_supported(language: &str) -> bool {
    generic::grammar_for(language).is_some()
}

/// Parse source text for the given language. Never panics; unsupported
/// languages and parse failures yield an unparsed record.
pub fn parse_source(content: &str, language: &str) -> ParsedFile {
    if generic::grammar_for(language).is_none() {
        return ParsedFile::unparsed(format!("unsupported language: {language}"));
    }
    generic::parse(content, language)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_languages() {
        for lang in [
            "rust",
            "python",
            "javascript",
            "jsx",
            "typescript",
            "tsx",
            "go",
            "java",
            "c",
            "cpp",
        ] {
            assert!(is_supported(lang), "expected {lang} to be supported");
        }
        assert!(!is_supported("markdown"));
        assert!(!is_supported("yaml"));
    }

    #[test]
    fn test_unsupported_language_yields_unparsed() {
        let parsed = parse_source("# heading", "markdown");
        assert!(!parsed.is_parsed());
        assert!(parsed.functions.is_empty());
        assert!(parsed.classes.is_empty());
        assert!(parsed.imports.is_empty());
    }
}
