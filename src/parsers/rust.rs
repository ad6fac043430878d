//! Rust language parser using Tree-sitter
//!
//! Extracts functions, structs, enums, unions, traits, type aliases,
//! constants, statics, modules, macros and struct fields. Functions inside
//! `impl` or `trait` blocks are reported as methods scoped to that block.

use tree_sitter::Node;

use super::{enclosing_scope, node_text, LanguageSpec};
use crate::models::Language;

const DEFINITIONS_QUERY: &str = r#"
    (function_item
        name: (identifier) @name) @definition.function

    (function_signature_item
        name: (identifier) @name) @definition.function

    (struct_item
        name: (type_identifier) @name) @definition.struct

    (union_item
        name: (type_identifier) @name) @definition.struct

    (enum_item
        name: (type_identifier) @name) @definition.enum

    (trait_item
        name: (type_identifier) @name) @definition.trait

    (type_item
        name: (type_identifier) @name) @definition.type

    (const_item
        name: (identifier) @name) @definition.constant

    (static_item
        name: (identifier) @name) @definition.variable

    (mod_item
        name: (identifier) @name) @definition.module

    (macro_definition
        name: (identifier) @name) @definition.macro

    (field_declaration
        name: (field_identifier) @name) @definition.field
"#;

pub fn spec() -> LanguageSpec {
    LanguageSpec {
        name: "rust",
        language: Language::Rust,
        grammar: tree_sitter_rust::LANGUAGE.into(),
        query: DEFINITIONS_QUERY,
        scope,
    }
}

/// "impl Type", "trait Name", "struct Name" or "enum Name"
fn scope(node: &Node, source: &[u8]) -> Option<String> {
    let mut current = node.parent();
    while let Some(ancestor) = current {
        match ancestor.kind() {
            "impl_item" => {
                let type_name = ancestor
                    .child_by_field_name("type")
                    .map(|n| node_text(&n, source))
                    .unwrap_or("");
                return match ancestor.child_by_field_name("trait") {
                    Some(trait_node) => Some(format!(
                        "impl {} for {}",
                        node_text(&trait_node, source),
                        type_name
                    )),
                    None => Some(format!("impl {}", type_name)),
                };
            }
            // Items nested in a function body are not members of an outer type
            "function_item" => return None,
            _ => {}
        }
        current = ancestor.parent();
    }

    enclosing_scope(
        node,
        source,
        &[
            ("trait_item", "name", "trait"),
            ("struct_item", "name", "struct"),
            ("union_item", "name", "union"),
        ],
    )
}
