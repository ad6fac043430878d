//! Java language parser using Tree-sitter
//!
//! Extracts classes, interfaces, enums, methods, constructors and fields,
//! each member scoped to its enclosing type.

use tree_sitter::Node;

use super::{enclosing_scope, LanguageSpec};
use crate::models::Language;

const DEFINITIONS_QUERY: &str = r#"
    (class_declaration
        name: (identifier) @name) @definition.class

    (interface_declaration
        name: (identifier) @name) @definition.interface

    (enum_declaration
        name: (identifier) @name) @definition.enum

    (method_declaration
        name: (identifier) @name) @definition.method

    (constructor_declaration
        name: (identifier) @name) @definition.method

    (field_declaration
        declarator: (variable_declarator
            name: (identifier) @name)) @definition.field
"#;

pub fn spec() -> LanguageSpec {
    LanguageSpec {
        name: "java",
        language: Language::Java,
        grammar: tree_sitter_java::LANGUAGE.into(),
        query: DEFINITIONS_QUERY,
        scope,
    }
}

fn scope(node: &Node, source: &[u8]) -> Option<String> {
    enclosing_scope(
        node,
        source,
        &[
            ("class_declaration", "name", "class"),
            ("interface_declaration", "name", "interface"),
            ("enum_declaration", "name", "enum"),
        ],
    )
}

#[cfg(test)]
mod tests {
    use crate::models::SymbolKind;
    use crate::parsers::{SymbolParser, TreeSitterParser};

    #[test]
    fn test_parse_java_class() {
        let source = r#"
public class Account {
    private long balance;

    public Account(long initial) {
        this.balance = initial;
    }

    public void deposit(long amount) {
        balance += amount;
    }

    interface Listener {
        void onChange();
    }
}
"#;
        let symbols = TreeSitterParser::new()
            .parse("src/Account.java", source.as_bytes())
            .unwrap();
        let find = |name: &str, kind: SymbolKind| {
            symbols
                .iter()
                .find(|s| s.name == name && s.kind == kind)
                .unwrap()
        };

        assert_eq!(find("Account", SymbolKind::Class).parent_scope, "");
        assert_eq!(find("Account", SymbolKind::Method).parent_scope, "class Account");
        assert_eq!(find("balance", SymbolKind::Field).parent_scope, "class Account");
        let deposit = find("deposit", SymbolKind::Method);
        assert_eq!(deposit.signature, "(long amount)");
        assert_eq!(find("Listener", SymbolKind::Interface).parent_scope, "class Account");
        assert_eq!(find("onChange", SymbolKind::Method).parent_scope, "interface Listener");
    }
}
