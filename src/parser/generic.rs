//! Generic tree-sitter extraction driven by per-language node-kind tables.
//!
//! Extraction rules:
//! - function/method declarations yield a flat `functions[]` list; methods
//!   carry a `parent_class` backlink resolved by line containment, or by
//!   receiver type where the grammar detaches methods from their type
//! - class/struct/interface/trait declarations yield `classes[]` with
//!   methods nested from the class body; Rust impl blocks and Go receiver
//!   methods fold into their type's entry
//! - import/use/include directives yield `imports[]` normalized to their
//!   literal target string
//!
//! Line spans are 1-based inclusive. Parses with more than 30% error
//! nodes are treated as failed.

use std::collections::HashMap;

use crate::models::{ClassInfo, FunctionInfo, MethodInfo};

use super::ParsedFile;

/// If more than this fraction of AST nodes are error nodes, the parse is
/// considered failed and the file is stored without structure.
const ERROR_THRESHOLD: f64 = 0.30;

/// Resolve the tree-sitter grammar for a detected language name.
pub fn grammar_for(language: &str) -> Option<tree_sitter::Language> {
    match language {
        "rust" => Some(tree_sitter_rust::LANGUAGE.into()),
        "python" => Some(tree_sitter_python::LANGUAGE.into()),
        "javascript" | "jsx" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "typescript" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "tsx" => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        "java" => Some(tree_sitter_java::LANGUAGE.into()),
        "c" => Some(tree_sitter_c::LANGUAGE.into()),
        "cpp" => Some(tree_sitter_cpp::LANGUAGE.into()),
        _ => None,
    }
}

fn function_kinds(language: &str) -> &'static [&'static str] {
    match language {
        "javascript" | "jsx" | "typescript" | "tsx" => &[
            "function_declaration",
            "generator_function_declaration",
            "method_definition",
        ],
        "python" => &["function_definition"],
        "go" => &["function_declaration", "method_declaration"],
        "java" => &["method_declaration", "constructor_declaration"],
        "rust" => &["function_item"],
        "c" | "cpp" => &["function_definition"],
        _ => &[],
    }
}

fn class_kinds(language: &str) -> &'static [&'static str] {
    match language {
        "javascript" | "jsx" => &["class_declaration"],
        "typescript" | "tsx" => &["class_declaration", "interface_declaration"],
        "python" => &["class_definition"],
        "go" => &["type_declaration"],
        "java" => &["class_declaration", "interface_declaration"],
        // impl blocks carry the methods; they merge into their type's entry
        "rust" => &["struct_item", "enum_item", "trait_item", "impl_item"],
        "cpp" => &["class_specifier", "struct_specifier"],
        "c" => &["struct_specifier"],
        _ => &[],
    }
}

fn method_kinds(language: &str) -> &'static [&'static str] {
    match language {
        "javascript" | "jsx" | "typescript" | "tsx" => &["method_definition"],
        "python" => &["function_definition"],
        "go" => &["method_declaration"],
        "java" => &["method_declaration", "constructor_declaration"],
        "rust" => &["function_item", "function_signature_item"],
        "cpp" => &["function_definition"],
        _ => &[],
    }
}

const CLASS_BODY_KINDS: &[&str] = &[
    "class_body",
    "declaration_list",
    "field_declaration_list",
    "interface_body",
    "block",
];

fn import_kinds(language: &str) -> &'static [&'static str] {
    match language {
        "javascript" | "jsx" | "typescript" | "tsx" => &["import_statement"],
        "python" => &["import_statement", "import_from_statement"],
        "go" => &["import_declaration"],
        "java" => &["import_declaration"],
        "rust" => &["use_declaration"],
        "c" | "cpp" => &["preproc_include"],
        _ => &[],
    }
}

pub fn parse(content: &str, language: &str) -> ParsedFile {
    let Some(grammar) = grammar_for(language) else {
        return ParsedFile::unparsed(format!("unsupported language: {language}"));
    };

    let mut parser = tree_sitter::Parser::new();
    if parser.set_language(&grammar).is_err() {
        return ParsedFile::unparsed("grammar rejected by parser");
    }

    let Some(tree) = parser.parse(content, None) else {
        return ParsedFile::unparsed("parse returned no tree");
    };
    let root = tree.root_node();

    let (total, errors) = count_nodes(root);
    if total > 0 && (errors as f64 / total as f64) > ERROR_THRESHOLD {
        return ParsedFile::unparsed(format!(
            "error nodes exceed threshold ({errors}/{total})"
        ));
    }

    let src = content.as_bytes();

    // Raw entries include one per struct/class node AND one per impl
    // block; their spans drive parent_class resolution before impl
    // entries are folded into their type's entry.
    let raw_classes = extract_classes(root, src, language);

    // Line → class name map for parent_class resolution
    let mut class_ranges: HashMap<usize, String> = HashMap::new();
    for cls in &raw_classes {
        for line in cls.line_start..=cls.line_end {
            class_ranges.entry(line).or_insert_with(|| cls.name.clone());
        }
    }

    let mut classes = merge_classes(raw_classes);

    let mut functions = Vec::new();
    collect_functions(root, src, language, &class_ranges, &mut functions);

    // Go methods hang off a receiver, syntactically apart from their type
    if language == "go" {
        attach_receiver_methods(&functions, &mut classes);
    }

    let mut imports = Vec::new();
    collect_imports(root, src, language, &mut imports);
    imports.dedup();

    ParsedFile {
        functions,
        classes,
        imports,
        parse_error: None,
    }
}

/// Fold entries sharing a name into one: a struct and its impl blocks
/// become a single class carrying all the methods. The first entry's
/// span (the type declaration when present) is kept.
fn merge_classes(raw: Vec<ClassInfo>) -> Vec<ClassInfo> {
    let mut merged: Vec<ClassInfo> = Vec::new();
    for cls in raw {
        match merged.iter_mut().find(|c| c.name == cls.name) {
            Some(existing) => {
                for method in cls.methods {
                    let seen = existing
                        .methods
                        .iter()
                        .any(|m| m.name == method.name && m.line_start == method.line_start);
                    if !seen {
                        existing.methods.push(method);
                    }
                }
            }
            None => merged.push(cls),
        }
    }
    merged
}

/// Attach receiver-based methods (`func (s *Server) Handle()`) to their
/// type's class entry.
fn attach_receiver_methods(functions: &[FunctionInfo], classes: &mut [ClassInfo]) {
    for func in functions {
        let Some(parent) = &func.parent_class else {
            continue;
        };
        let Some(cls) = classes.iter_mut().find(|c| c.name == *parent) else {
            continue;
        };
        let seen = cls
            .methods
            .iter()
            .any(|m| m.name == func.name && m.line_start == func.line_start);
        if !seen {
            cls.methods.push(MethodInfo {
                name: func.name.clone(),
                parameters: func.parameters.clone(),
                line_start: func.line_start,
                line_end: func.line_end,
            });
        }
    }
}

fn count_nodes(node: tree_sitter::Node) -> (usize, usize) {
    let mut total = 1usize;
    let mut errors = if node.is_error() { 1usize } else { 0 };

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        let (t, e) = count_nodes(child);
        total += t;
        errors += e;
    }

    (total, errors)
}

// ─── Functions ───────────────────────────────────────────

fn collect_functions(
    node: tree_sitter::Node,
    src: &[u8],
    language: &str,
    class_ranges: &HashMap<usize, String>,
    out: &mut Vec<FunctionInfo>,
) {
    if function_kinds(language).contains(&node.kind()) {
        let line_start = node.start_position().row + 1;
        let parent_class = class_ranges
            .get(&line_start)
            .cloned()
            .or_else(|| receiver_type(node, src));

        if let Some(name) = node_name(node, src) {
            let parameters = node_parameters(node, src);
            let signature = format!("{name}({})", parameters.join(", "));
            out.push(FunctionInfo {
                name,
                signature,
                parameters,
                is_method: parent_class.is_some(),
                parent_class,
                line_start,
                line_end: node.end_position().row + 1,
            });
        }
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_functions(child, src, language, class_ranges, out);
    }
}

// ─── Classes ─────────────────────────────────────────────

fn extract_classes(root: tree_sitter::Node, src: &[u8], language: &str) -> Vec<ClassInfo> {
    let mut classes = Vec::new();
    collect_classes(root, src, language, &mut classes);
    classes
}

fn collect_classes(
    node: tree_sitter::Node,
    src: &[u8],
    language: &str,
    out: &mut Vec<ClassInfo>,
) {
    if class_kinds(language).contains(&node.kind()) {
        if let Some(name) = node_name(node, src) {
            out.push(ClassInfo {
                name,
                line_start: node.start_position().row + 1,
                line_end: node.end_position().row + 1,
                methods: extract_methods(node, src, language),
            });
        }
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_classes(child, src, language, out);
    }
}

fn extract_methods(class_node: tree_sitter::Node, src: &[u8], language: &str) -> Vec<MethodInfo> {
    let mut methods = Vec::new();
    let kinds = method_kinds(language);

    let mut cursor = class_node.walk();
    for body in class_node.children(&mut cursor) {
        if !CLASS_BODY_KINDS.contains(&body.kind()) {
            continue;
        }
        let mut body_cursor = body.walk();
        for member in body.children(&mut body_cursor) {
            // Python wraps decorated methods in decorated_definition
            let member = if member.kind() == "decorated_definition" {
                member
                    .child_by_field_name("definition")
                    .unwrap_or(member)
            } else {
                member
            };

            if kinds.contains(&member.kind()) {
                if let Some(name) = node_name(member, src) {
                    methods.push(MethodInfo {
                        name,
                        parameters: node_parameters(member, src),
                        line_start: member.start_position().row + 1,
                        line_end: member.end_position().row + 1,
                    });
                }
            }
        }
    }

    methods
}

// ─── Imports ─────────────────────────────────────────────

fn collect_imports(
    node: tree_sitter::Node,
    src: &[u8],
    language: &str,
    out: &mut Vec<String>,
) {
    if import_kinds(language).contains(&node.kind()) {
        extract_import_targets(node, src, language, out);
        // Import nodes don't nest further targets worth visiting, except Go
        // declarations which hold an import_spec_list handled above.
        return;
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_imports(child, src, language, out);
    }
}

/// Pull the literal import target(s) out of one import node, stripping
/// quotes and include brackets.
fn extract_import_targets(
    node: tree_sitter::Node,
    src: &[u8],
    language: &str,
    out: &mut Vec<String>,
) {
    match language {
        "javascript" | "jsx" | "typescript" | "tsx" => {
            if let Some(source) = node.child_by_field_name("source") {
                out.push(strip_quotes(node_text(source, src)));
            }
        }
        "python" => match node.kind() {
            "import_from_statement" => {
                if let Some(module) = node.child_by_field_name("module_name") {
                    out.push(node_text(module, src));
                }
            }
            _ => {
                // `import a, b.c` — one target per dotted name
                let mut cursor = node.walk();
                for child in node.children(&mut cursor) {
                    match child.kind() {
                        "dotted_name" => out.push(node_text(child, src)),
                        "aliased_import" => {
                            if let Some(name) = child.child_by_field_name("name") {
                                out.push(node_text(name, src));
                            }
                        }
                        _ => {}
                    }
                }
            }
        },
        "go" => collect_descendant_kind(node, src, "interpreted_string_literal", out),
        "java" => {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.kind() == "scoped_identifier" || child.kind() == "identifier" {
                    out.push(node_text(child, src));
                }
            }
        }
        "rust" => {
            if let Some(argument) = node.child_by_field_name("argument") {
                out.push(node_text(argument, src));
            }
        }
        "c" | "cpp" => {
            if let Some(path) = node.child_by_field_name("path") {
                let text = node_text(path, src);
                out.push(
                    text.trim_matches(|c| c == '"' || c == '<' || c == '>')
                        .to_string(),
                );
            }
        }
        _ => {}
    }
}

fn collect_descendant_kind(
    node: tree_sitter::Node,
    src: &[u8],
    kind: &str,
    out: &mut Vec<String>,
) {
    if node.kind() == kind {
        out.push(strip_quotes(node_text(node, src)));
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_descendant_kind(child, src, kind, out);
    }
}

// ─── Node helpers ────────────────────────────────────────

fn node_text(node: tree_sitter::Node, src: &[u8]) -> String {
    node.utf8_text(src).unwrap_or_default().to_string()
}

/// The base type name of a receiver-based method's receiver
/// (`func (s *Server) Handle()` → `Server`), or None for plain functions.
fn receiver_type(node: tree_sitter::Node, src: &[u8]) -> Option<String> {
    let receiver = node.child_by_field_name("receiver")?;
    let mut cursor = receiver.walk();
    for param in receiver.named_children(&mut cursor) {
        if let Some(ty) = param.child_by_field_name("type") {
            let base = base_type_name(&node_text(ty, src));
            if !base.is_empty() {
                return Some(base);
            }
        }
    }
    None
}

/// Strip pointer sigils and generic arguments from a type expression:
/// `*Server` → `Server`, `Index<usize>` → `Index`.
fn base_type_name(text: &str) -> String {
    text.trim_start_matches(['*', '&'])
        .split(['<', '['])
        .next()
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Extract a declaration's name: the `name` field when present, otherwise
/// the first identifier-like child (covers C/C++ declarators). Impl
/// blocks are named by the type they attach to.
fn node_name(node: tree_sitter::Node, src: &[u8]) -> Option<String> {
    if let Some(name) = node.child_by_field_name("name") {
        return Some(node_text(name, src));
    }

    if node.kind() == "impl_item" {
        if let Some(ty) = node.child_by_field_name("type") {
            let base = base_type_name(&node_text(ty, src));
            if !base.is_empty() {
                return Some(base);
            }
        }
    }

    // Go type declarations name the type on the nested type_spec
    if node.kind() == "type_declaration" {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() == "type_spec" {
                if let Some(name) = child.child_by_field_name("name") {
                    return Some(node_text(name, src));
                }
            }
        }
    }

    // C/C++ function definitions hide the name inside the declarator
    if let Some(declarator) = node.child_by_field_name("declarator") {
        if let Some(name) = node_name(declarator, src) {
            return Some(name);
        }
        let mut cursor = declarator.walk();
        for child in declarator.children(&mut cursor) {
            if child.kind().contains("identifier") {
                return Some(node_text(child, src));
            }
        }
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind().contains("identifier") || child.kind() == "name" {
            return Some(node_text(child, src));
        }
    }
    None
}

/// Extract parameter names from the `parameters` field, stripping type
/// annotations and defaults.
fn node_parameters(node: tree_sitter::Node, src: &[u8]) -> Vec<String> {
    let params_node = node
        .child_by_field_name("parameters")
        .or_else(|| {
            node.child_by_field_name("declarator")
                .and_then(|d| d.child_by_field_name("parameters"))
        });

    let Some(params_node) = params_node else {
        return Vec::new();
    };

    let mut params = Vec::new();
    let mut cursor = params_node.walk();
    for param in params_node.named_children(&mut cursor) {
        let text = node_text(param, src);
        let name = text
            .split(':')
            .next()
            .unwrap_or("")
            .split('=')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        if !name.is_empty() && name != "self" && name != "," {
            params.push(name);
        }
    }
    params
}


fn strip_quotes(s: String) -> String {
    s.trim_matches(|c| c == '"' || c == '\'' || c == '`').to_string()
}
