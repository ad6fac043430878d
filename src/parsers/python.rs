//! Python language parser using Tree-sitter
//!
//! Extracts functions, classes, methods (functions inside a class body),
//! class attributes and module-level variables.

use tree_sitter::Node;

use super::{node_text, LanguageSpec};
use crate::models::Language;

const DEFINITIONS_QUERY: &str = r#"
    (function_definition
        name: (identifier) @name) @definition.function

    (class_definition
        name: (identifier) @name) @definition.class

    (module
        (expression_statement
            (assignment
                left: (identifier) @name) @definition.variable))

    (class_definition
        body: (block
            (expression_statement
                (assignment
                    left: (identifier) @name) @definition.field)))
"#;

pub fn spec() -> LanguageSpec {
    LanguageSpec {
        name: "python",
        language: Language::Python,
        grammar: tree_sitter_python::LANGUAGE.into(),
        query: DEFINITIONS_QUERY,
        scope,
    }
}

/// "class Name" of the nearest enclosing class, unless a function intervenes
fn scope(node: &Node, source: &[u8]) -> Option<String> {
    let mut current = node.parent();
    while let Some(ancestor) = current {
        match ancestor.kind() {
            "class_definition" => {
                let name = ancestor
                    .child_by_field_name("name")
                    .map(|n| node_text(&n, source))
                    .unwrap_or("");
                return Some(format!("class {}", name));
            }
            "function_definition" => return None,
            _ => {}
        }
        current = ancestor.parent();
    }
    None
}
