//! Parser capability and the tree-sitter implementation of it
//!
//! A `SymbolParser` is one reusable worker that turns file content into
//! symbol entries. A `ParserFactory` creates workers and knows which paths
//! any of its parsers can handle. The parser pool only ever talks to these
//! two traits.
//!
//! Each language submodule provides a tree-sitter grammar, a definitions
//! query and a scope resolver. Query captures follow one convention:
//! `@name` is the identifier and `@definition.<kind>` is the whole
//! definition node.

pub mod c;
pub mod go;
pub mod java;
pub mod python;
pub mod rust;
pub mod typescript;

use std::collections::{HashMap, HashSet};
use std::fmt;

use streaming_iterator::StreamingIterator;
use tree_sitter::{Node, Parser, Query, QueryCursor};

use crate::models::{Language, SymbolEntry, SymbolKind};

/// Why a parse produced no symbols
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    /// The input could not be parsed; the worker is still healthy
    Input(String),
    /// The worker itself is in a bad state and must be replaced
    Worker(String),
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseFailure::Input(msg) => write!(f, "{}", msg),
            ParseFailure::Worker(msg) => write!(f, "parser worker failed: {}", msg),
        }
    }
}

/// One reusable parser worker
pub trait SymbolParser: Send {
    fn parse(&mut self, path: &str, content: &[u8]) -> Result<Vec<SymbolEntry>, ParseFailure>;

    /// Release the worker's resources
    fn close(&mut self) {}
}

/// Creates parser workers on demand
pub trait ParserFactory: Send + Sync {
    fn create(&self) -> anyhow::Result<Box<dyn SymbolParser>>;

    /// Whether any registered parser handles this path
    fn supports(&self, path: &str) -> bool;
}

/// Grammar registration for one language
pub struct LanguageSpec {
    /// Query cache key; distinct per grammar
    pub name: &'static str,
    pub language: Language,
    pub grammar: tree_sitter::Language,
    pub query: &'static str,
    /// Enclosing type-like scope of a definition node
    pub scope: fn(&Node, &[u8]) -> Option<String>,
}

/// Select the grammar for an archive path
pub fn spec_for_path(path: &str) -> Option<LanguageSpec> {
    match Language::from_path(path) {
        Language::Rust => Some(rust::spec()),
        Language::Python => Some(python::spec()),
        Language::JavaScript => Some(typescript::javascript_spec()),
        Language::TypeScript if path.ends_with(".tsx") => Some(typescript::tsx_spec()),
        Language::TypeScript => Some(typescript::spec()),
        Language::Go => Some(go::spec()),
        Language::Java => Some(java::spec()),
        Language::C => Some(c::spec()),
        Language::Unknown => None,
    }
}

/// Factory for tree-sitter workers
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeSitterParserFactory;

impl ParserFactory for TreeSitterParserFactory {
    fn create(&self) -> anyhow::Result<Box<dyn SymbolParser>> {
        Ok(Box::new(TreeSitterParser::new()))
    }

    fn supports(&self, path: &str) -> bool {
        Language::from_path(path).is_supported()
    }
}

/// A tree-sitter parser plus its compiled queries, reused across files
pub struct TreeSitterParser {
    parser: Parser,
    queries: HashMap<&'static str, Query>,
}

impl TreeSitterParser {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            queries: HashMap::new(),
        }
    }
}

impl Default for TreeSitterParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolParser for TreeSitterParser {
    fn parse(&mut self, path: &str, content: &[u8]) -> Result<Vec<SymbolEntry>, ParseFailure> {
        let spec = spec_for_path(path)
            .ok_or_else(|| ParseFailure::Input(format!("no parser registered for {}", path)))?;

        self.parser
            .set_language(&spec.grammar)
            .map_err(|e| ParseFailure::Worker(format!("failed to set {} grammar: {}", spec.name, e)))?;

        // A missing tree means the parser was cancelled or is wedged
        let tree = self
            .parser
            .parse(content, None)
            .ok_or_else(|| ParseFailure::Worker(format!("no syntax tree for {}", path)))?;

        if !self.queries.contains_key(spec.name) {
            let query = Query::new(&spec.grammar, spec.query).map_err(|e| {
                ParseFailure::Input(format!("invalid {} definitions query: {}", spec.name, e))
            })?;
            self.queries.insert(spec.name, query);
        }
        let query = &self.queries[spec.name];

        Ok(extract_definitions(path, content, &tree.root_node(), query, &spec))
    }

    fn close(&mut self) {
        self.queries.clear();
        self.parser.reset();
    }
}

/// Run a definitions query and convert every match into a symbol entry
fn extract_definitions(
    path: &str,
    source: &[u8],
    root: &Node,
    query: &Query,
    spec: &LanguageSpec,
) -> Vec<SymbolEntry> {
    let lines: Vec<&[u8]> = source.split(|&b| b == b'\n').collect();
    let mut cursor = QueryCursor::new();
    let mut matches = cursor.matches(query, *root, source);

    let mut seen = HashSet::new();
    let mut symbols = Vec::new();

    while let Some(match_) = matches.next() {
        let mut name_node = None;
        let mut definition = None;

        for capture in match_.captures {
            let capture_name: &str = &query.capture_names()[capture.index as usize];
            if capture_name == "name" {
                name_node = Some(capture.node);
            } else if let Some(kind) = capture_name.strip_prefix("definition.") {
                definition = Some((capture.node, kind));
            }
        }

        let (Some(name_node), Some((def_node, kind_name))) = (name_node, definition) else {
            continue;
        };

        let position = name_node.start_position();
        if !seen.insert((position.row, position.column)) {
            continue;
        }

        let name = node_text(&name_node, source);
        if name.is_empty() {
            continue;
        }

        let parent_scope = (spec.scope)(&def_node, source).unwrap_or_default();
        let kind = refine_kind(kind_from_capture(kind_name), &def_node, !parent_scope.is_empty());

        symbols.push(SymbolEntry {
            name: name.to_string(),
            file_path: path.to_string(),
            line: position.row + 1,
            character: position.column,
            kind,
            parent_scope,
            match_pattern: lines
                .get(position.row)
                .map(|line| ctags_pattern(line))
                .unwrap_or_default(),
            signature: signature_of(&def_node, source),
            language: spec.language,
        });
    }

    symbols
}

fn kind_from_capture(kind: &str) -> SymbolKind {
    match kind {
        "function" => SymbolKind::Function,
        "method" => SymbolKind::Method,
        "class" => SymbolKind::Class,
        "struct" => SymbolKind::Struct,
        "enum" => SymbolKind::Enum,
        "interface" => SymbolKind::Interface,
        "trait" => SymbolKind::Trait,
        "constant" => SymbolKind::Constant,
        "variable" => SymbolKind::Variable,
        "field" => SymbolKind::Field,
        "module" => SymbolKind::Module,
        "type" => SymbolKind::Type,
        "macro" => SymbolKind::Macro,
        other => SymbolKind::Unknown(other.to_string()),
    }
}

/// Sharpen a query-level kind using the shape of the definition node
fn refine_kind(kind: SymbolKind, def_node: &Node, scoped: bool) -> SymbolKind {
    match kind {
        SymbolKind::Function if scoped => SymbolKind::Method,
        SymbolKind::Variable | SymbolKind::Constant => {
            let value = def_node
                .child_by_field_name("value")
                .or_else(|| def_node.child_by_field_name("right"));
            match value.map(|v| v.kind()) {
                Some("arrow_function" | "function_expression" | "function" | "lambda") => {
                    SymbolKind::Function
                }
                _ => kind,
            }
        }
        SymbolKind::Type => match def_node.child_by_field_name("type").map(|t| t.kind()) {
            Some("struct_type") => SymbolKind::Struct,
            Some("interface_type") => SymbolKind::Interface,
            _ => kind,
        },
        other => other,
    }
}

/// Parameter list of a definition, whitespace-collapsed
fn signature_of(def_node: &Node, source: &[u8]) -> String {
    let mut node = *def_node;
    for _ in 0..4 {
        if let Some(params) = node.child_by_field_name("parameters") {
            return node_text(&params, source)
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
        }
        match node.child_by_field_name("declarator") {
            Some(next) => node = next,
            None => break,
        }
    }
    String::new()
}

/// ctags search pattern for one source line
fn ctags_pattern(line: &[u8]) -> String {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end_matches('\r');
    let escaped = text.replace('\\', "\\\\").replace('/', "\\/");
    format!("/^{}$/", escaped)
}

/// Source text of a node, empty when it is not valid UTF-8
pub(crate) fn node_text<'a>(node: &Node, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or("")
}

/// Name of the first ancestor whose kind appears in `containers`
///
/// Used by the language modules to build scopes such as "class User".
pub(crate) fn enclosing_scope(
    node: &Node,
    source: &[u8],
    containers: &[(&str, &str, &str)],
) -> Option<String> {
    let mut current = node.parent();
    while let Some(ancestor) = current {
        for (kind, field, label) in containers {
            if ancestor.kind() == *kind {
                let name = ancestor
                    .child_by_field_name(field)
                    .map(|n| node_text(&n, source))
                    .unwrap_or("");
                if !name.is_empty() {
                    return Some(format!("{} {}", label, name));
                }
            }
        }
        current = ancestor.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(path: &str, source: &str) -> Vec<SymbolEntry> {
        TreeSitterParser::new().parse(path, source.as_bytes()).unwrap()
    }

    #[test]
    fn test_factory_supports() {
        let factory = TreeSitterParserFactory;
        assert!(factory.supports("a.js"));
        assert!(factory.supports("src/lib.rs"));
        assert!(!factory.supports("README.md"));
        assert!(!factory.supports("Makefile"));
    }

    #[test]
    fn test_unsupported_path_is_input_failure() {
        let mut parser = TreeSitterParser::new();
        let err = parser.parse("notes.txt", b"hello").unwrap_err();
        assert!(matches!(err, ParseFailure::Input(_)));
    }

    #[test]
    fn test_javascript_var() {
        let symbols = parse("a.js", "var x = 1");
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "x");
        assert_eq!(symbols[0].file_path, "a.js");
        assert_eq!(symbols[0].line, 1);
        assert_eq!(symbols[0].character, 4);
        assert_eq!(symbols[0].kind, SymbolKind::Variable);
        assert_eq!(symbols[0].match_pattern, "/^var x = 1$/");
        assert_eq!(symbols[0].language, Language::JavaScript);
    }

    #[test]
    fn test_arrow_function_is_function() {
        let symbols = parse("app.js", "const handler = (req, res) => res.send(1);\n");
        let handler = symbols.iter().find(|s| s.name == "handler").unwrap();
        assert_eq!(handler.kind, SymbolKind::Function);
    }

    #[test]
    fn test_ctags_pattern_escaping() {
        assert_eq!(ctags_pattern(b"a/b\\c\r"), "/^a\\/b\\\\c$/");
    }

    #[test]
    fn test_parser_reuse_across_languages() {
        let mut parser = TreeSitterParser::new();
        let rs = parser.parse("lib.rs", b"fn alpha() {}\n").unwrap();
        let py = parser.parse("mod.py", b"def beta():\n    pass\n").unwrap();
        let rs_again = parser.parse("main.rs", b"fn gamma() {}\n").unwrap();
        assert_eq!(rs[0].name, "alpha");
        assert_eq!(py[0].name, "beta");
        assert_eq!(rs_again[0].name, "gamma");
    }
}
