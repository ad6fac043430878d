//! TypeScript/JavaScript language parser using Tree-sitter
//!
//! JavaScript files use the JavaScript grammar, `.ts` files the TypeScript
//! grammar and `.tsx` files the TSX grammar. Extracts functions, generator
//! functions, classes, methods, variables (functions when initialised with
//! an arrow function or function expression) and, for TypeScript,
//! interfaces, type aliases and enums.

use tree_sitter::Node;

use super::{enclosing_scope, LanguageSpec};
use crate::models::Language;

const JAVASCRIPT_QUERY: &str = r#"
    (function_declaration
        name: (identifier) @name) @definition.function

    (generator_function_declaration
        name: (identifier) @name) @definition.function

    (class_declaration
        name: (identifier) @name) @definition.class

    (method_definition
        name: (property_identifier) @name) @definition.method

    (variable_declarator
        name: (identifier) @name) @definition.variable
"#;

const TYPESCRIPT_QUERY: &str = r#"
    (function_declaration
        name: (identifier) @name) @definition.function

    (generator_function_declaration
        name: (identifier) @name) @definition.function

    (class_declaration
        name: (type_identifier) @name) @definition.class

    (abstract_class_declaration
        name: (type_identifier) @name) @definition.class

    (interface_declaration
        name: (type_identifier) @name) @definition.interface

    (type_alias_declaration
        name: (type_identifier) @name) @definition.type

    (enum_declaration
        name: (identifier) @name) @definition.enum

    (method_definition
        name: (property_identifier) @name) @definition.method

    (method_signature
        name: (property_identifier) @name) @definition.method

    (variable_declarator
        name: (identifier) @name) @definition.variable
"#;

pub fn javascript_spec() -> LanguageSpec {
    LanguageSpec {
        name: "javascript",
        language: Language::JavaScript,
        grammar: tree_sitter_javascript::LANGUAGE.into(),
        query: JAVASCRIPT_QUERY,
        scope,
    }
}

pub fn spec() -> LanguageSpec {
    LanguageSpec {
        name: "typescript",
        language: Language::TypeScript,
        grammar: tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        query: TYPESCRIPT_QUERY,
        scope,
    }
}

pub fn tsx_spec() -> LanguageSpec {
    LanguageSpec {
        name: "tsx",
        language: Language::TypeScript,
        grammar: tree_sitter_typescript::LANGUAGE_TSX.into(),
        query: TYPESCRIPT_QUERY,
        scope,
    }
}

fn scope(node: &Node, source: &[u8]) -> Option<String> {
    // Only class and interface members are scoped
    if !matches!(node.kind(), "method_definition" | "method_signature") {
        return None;
    }
    enclosing_scope(
        node,
        source,
        &[
            ("class_declaration", "name", "class"),
            ("abstract_class_declaration", "name", "class"),
            ("class", "name", "class"),
            ("interface_declaration", "name", "interface"),
        ],
    )
}
