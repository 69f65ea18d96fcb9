//! Chunk construction: one chunk per function and per class, each carrying
//! a deterministic natural-language description (the embedding text) and
//! the line-span slice of the file content.

use crate::models::{Chunk, ChunkType, FileDoc};

/// Build the chunk list for a parsed file. Vectors are left empty; the
/// embedding stage fills them in.
pub fn build_chunks(file: &FileDoc) -> Vec<Chunk> {
    let mut chunks = Vec::with_capacity(file.functions.len() + file.classes.len());

    for func in &file.functions {
        let chunk_text = match &func.parent_class {
            Some(parent) => format!("{parent}.{}", func.signature),
            None => func.signature.clone(),
        };
        chunks.push(Chunk {
            chunk_type: ChunkType::Function,
            chunk_name: func.name.clone(),
            chunk_text,
            code: extract_code_by_lines(&file.content, func.line_start, func.line_end),
            line_start: func.line_start,
            line_end: func.line_end,
            parent_class: func.parent_class.clone(),
            chunk_index: 0,
            total_chunks: 0,
            vector: Vec::new(),
        });
    }

    for cls in &file.classes {
        let method_names: Vec<&str> = cls.methods.iter().map(|m| m.name.as_str()).collect();
        chunks.push(Chunk {
            chunk_type: ChunkType::Class,
            chunk_name: cls.name.clone(),
            chunk_text: format!("class {}: {}", cls.name, method_names.join(", ")),
            code: extract_code_by_lines(&file.content, cls.line_start, cls.line_end),
            line_start: cls.line_start,
            line_end: cls.line_end,
            parent_class: None,
            chunk_index: 0,
            total_chunks: 0,
            vector: Vec::new(),
        });
    }

    let total = chunks.len();
    for (i, chunk) in chunks.iter_mut().enumerate() {
        chunk.chunk_index = i;
        chunk.total_chunks = total;
    }

    chunks
}

/// Slice `content` by 1-based inclusive line span.
pub fn extract_code_by_lines(content: &str, line_start: usize, line_end: usize) -> String {
    if line_start == 0 || line_end < line_start {
        return String::new();
    }
    content
        .lines()
        .skip(line_start - 1)
        .take(line_end - line_start + 1)
        .collect::<Vec<&str>>()
        .join("\n")
}
