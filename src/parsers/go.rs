//! Go language parser using Tree-sitter
//!
//! Extracts functions, methods (scoped to their receiver type), named
//! types (structs and interfaces are distinguished), struct fields,
//! constants and variables.

use tree_sitter::Node;

use super::{enclosing_scope, node_text, LanguageSpec};
use crate::models::Language;

const DEFINITIONS_QUERY: &str = r#"
    (function_declaration
        name: (identifier) @name) @definition.function

    (method_declaration
        name: (field_identifier) @name) @definition.method

    (type_spec
        name: (type_identifier) @name) @definition.type

    (field_declaration
        name: (field_identifier) @name) @definition.field

    (const_spec
        name: (identifier) @name) @definition.constant

    (var_spec
        name: (identifier) @name) @definition.variable
"#;

pub fn spec() -> LanguageSpec {
    LanguageSpec {
        name: "go",
        language: Language::Go,
        grammar: tree_sitter_go::LANGUAGE.into(),
        query: DEFINITIONS_QUERY,
        scope,
    }
}

fn scope(node: &Node, source: &[u8]) -> Option<String> {
    match node.kind() {
        "method_declaration" => {
            let receiver = node.child_by_field_name("receiver")?;
            receiver_type(node_text(&receiver, source)).map(|t| format!("type {}", t))
        }
        "field_declaration" => enclosing_scope(node, source, &[("type_spec", "name", "type")]),
        _ => None,
    }
}

/// Receiver type name from a receiver list such as `(s *Server[T])`
fn receiver_type(receiver: &str) -> Option<String> {
    let inner = receiver.trim().trim_start_matches('(').trim_end_matches(')');
    let type_part = inner.split_whitespace().last()?;
    let type_name = type_part.trim_start_matches('*');
    let type_name = type_name.split('[').next().unwrap_or(type_name);
    (!type_name.is_empty()).then(|| type_name.to_string())
}
