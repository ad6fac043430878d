//! C language parser using Tree-sitter
//!
//! Extracts function definitions (including pointer-returning ones),
//! structs, unions, enums, typedefs, macros, struct fields and file-scope
//! variables.

use tree_sitter::Node;

use super::{enclosing_scope, LanguageSpec};
use crate::models::Language;

const DEFINITIONS_QUERY: &str = r#"
    (function_definition
        declarator: (function_declarator
            declarator: (identifier) @name)) @definition.function

    (function_definition
        declarator: (pointer_declarator
            declarator: (function_declarator
                declarator: (identifier) @name))) @definition.function

    (struct_specifier
        name: (type_identifier) @name
        body: (field_declaration_list)) @definition.struct

    (union_specifier
        name: (type_identifier) @name
        body: (field_declaration_list)) @definition.struct

    (enum_specifier
        name: (type_identifier) @name
        body: (enumerator_list)) @definition.enum

    (type_definition
        declarator: (type_identifier) @name) @definition.type

    (preproc_def
        name: (identifier) @name) @definition.macro

    (preproc_function_def
        name: (identifier) @name) @definition.macro

    (field_declaration
        declarator: (field_identifier) @name) @definition.field

    (translation_unit
        (declaration
            declarator: (init_declarator
                declarator: (identifier) @name)) @definition.variable)

    (translation_unit
        (declaration
            declarator: (identifier) @name) @definition.variable)
"#;

pub fn spec() -> LanguageSpec {
    LanguageSpec {
        name: "c",
        language: Language::C,
        grammar: tree_sitter_c::LANGUAGE.into(),
        query: DEFINITIONS_QUERY,
        scope,
    }
}

fn scope(node: &Node, source: &[u8]) -> Option<String> {
    if node.kind() != "field_declaration" {
        return None;
    }
    enclosing_scope(
        node,
        source,
        &[
            ("struct_specifier", "name", "struct"),
            ("union_specifier", "name", "union"),
        ],
    )
}
