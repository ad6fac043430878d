//! Core data models for Symdex
//!
//! These structures are the wire format of the query endpoint and the row
//! format of every on-disk symbol index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use strum::{Display, EnumString};

/// Schema fingerprint computed by build.rs from the storage-critical sources
pub const INDEX_SCHEMA_HASH: &str = env!("INDEX_SCHEMA_HASH");

/// Type of symbol found in code
#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "PascalCase")]
pub enum SymbolKind {
    Function,
    Class,
    Struct,
    Enum,
    Interface,
    Trait,
    Constant,
    Variable,
    Field,
    Method,
    Module,
    Namespace,
    Type,
    Macro,
    /// Catch-all for kinds a parser reports that have no dedicated variant.
    /// The string is the parser's own kind name.
    #[strum(default)]
    Unknown(String),
}

impl SymbolKind {
    /// Name used on the wire and in index files
    pub(crate) fn as_wire(&self) -> String {
        match self {
            SymbolKind::Unknown(raw) => raw.clone(),
            other => other.to_string(),
        }
    }

    pub(crate) fn from_wire(raw: String) -> Self {
        // EnumString with a default variant never fails
        raw.parse().unwrap_or(SymbolKind::Unknown(raw))
    }
}

impl Serialize for SymbolKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_wire())
    }
}

impl<'de> Deserialize<'de> for SymbolKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(SymbolKind::from_wire(String::deserialize(deserializer)?))
    }
}

/// Programming language identifier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    C,
    Unknown,
}

impl Language {
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "rs" => Language::Rust,
            "py" | "pyi" => Language::Python,
            "js" | "mjs" | "cjs" | "jsx" => Language::JavaScript,
            "ts" | "mts" | "cts" | "tsx" => Language::TypeScript,
            "go" => Language::Go,
            "java" => Language::Java,
            "c" | "h" => Language::C,
            _ => Language::Unknown,
        }
    }

    /// Detect the language of an archive path from its extension
    pub fn from_path(path: &str) -> Self {
        let file_name = path.rsplit('/').next().unwrap_or(path);
        match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => Self::from_extension(ext),
            _ => Language::Unknown,
        }
    }

    /// Check if this language has a parser implementation
    pub fn is_supported(&self) -> bool {
        !matches!(self, Language::Unknown)
    }
}

/// One symbol definition extracted from a file
///
/// Immutable once emitted by a parser. `line` is 1-indexed and `character`
/// is the 0-indexed column of the symbol name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SymbolEntry {
    pub name: String,
    pub file_path: String,
    pub line: usize,
    pub character: usize,
    pub kind: SymbolKind,
    /// Enclosing scope (e.g. "impl Parser", "class User"), empty at top level
    #[serde(default)]
    pub parent_scope: String,
    /// ctags-style search pattern for the definition line
    #[serde(default)]
    pub match_pattern: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default = "unknown_language")]
    pub language: Language,
}

fn unknown_language() -> Language {
    Language::Unknown
}

impl SymbolEntry {
    pub fn new(name: impl Into<String>, file_path: impl Into<String>, line: usize, kind: SymbolKind) -> Self {
        Self {
            name: name.into(),
            file_path: file_path.into(),
            line,
            character: 0,
            kind,
            parent_scope: String::new(),
            match_pattern: String::new(),
            signature: String::new(),
            language: Language::Unknown,
        }
    }
}

/// Identity of one cached index
///
/// Two keys are equal iff every field matches exactly. The path filter is
/// kept sorted and deduplicated so equal filter sets compare equal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IndexKey {
    pub component: String,
    pub repo: String,
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
}

impl IndexKey {
    pub fn new(component: impl Into<String>, repo: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            repo: repo.into(),
            revision: revision.into(),
            paths: None,
        }
    }

    /// Restrict the key to a path set
    pub fn with_paths(mut self, mut paths: Vec<String>) -> Self {
        paths.sort();
        paths.dedup();
        self.paths = Some(paths);
        self
    }

    /// Path filter handed to the revision fetcher (empty = whole tree)
    pub fn path_filter(&self) -> &[String] {
        self.paths.as_deref().unwrap_or(&[])
    }

    /// Content address of this key, used as the index file stem
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for part in [INDEX_SCHEMA_HASH, &self.component, &self.repo, &self.revision] {
            hasher.update(part.as_bytes());
            hasher.update(&[0]);
        }
        match &self.paths {
            Some(paths) => {
                hasher.update(b"paths");
                for path in paths {
                    hasher.update(path.as_bytes());
                    hasher.update(&[0]);
                }
            }
            None => {
                hasher.update(b"all");
            }
        }
        hasher.finalize().to_hex().to_string()
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.component, self.repo, self.revision)?;
        if let Some(paths) = &self.paths {
            write!(f, " [{} paths]", paths.len())?;
        }
        Ok(())
    }
}

/// A symbol search request
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub repository_name: String,
    #[serde(rename = "revisionID", alias = "revisionId")]
    pub revision_id: String,
    /// Regular expression over symbol names (empty = match all)
    #[serde(default)]
    pub name_pattern: String,
    #[serde(default)]
    pub is_case_sensitive: bool,
    /// A path must match at least one of these, when any are given
    #[serde(default)]
    pub include_path_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_path_pattern: Option<String>,
    /// Result cap; None means the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
}

impl SearchQuery {
    pub fn new(repository_name: impl Into<String>, revision_id: impl Into<String>) -> Self {
        Self {
            repository_name: repository_name.into(),
            revision_id: revision_id.into(),
            ..Default::default()
        }
    }
}

/// Lifecycle state of a cache entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Building,
    Ready,
    Failed,
}

/// Snapshot of one cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: IndexKey,
    pub path: std::path::PathBuf,
    pub state: CacheState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_started_at: Option<DateTime<Utc>>,
}

/// Statistics about one index build
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStats {
    /// Files handed to a parser
    pub files_parsed: usize,
    /// Files skipped (unsupported, too large, not a regular file)
    pub files_skipped: usize,
    /// Files whose parse failed and were left out of the index
    pub parse_failures: usize,
    /// Symbols written to the index
    pub symbols: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_from_path() {
        assert_eq!(Language::from_path("src/main.rs"), Language::Rust);
        assert_eq!(Language::from_path("a.js"), Language::JavaScript);
        assert_eq!(Language::from_path("web/app.tsx"), Language::TypeScript);
        assert_eq!(Language::from_path("Makefile"), Language::Unknown);
        assert_eq!(Language::from_path("dir.d/.gitignore"), Language::Unknown);
        assert!(!Language::from_path("README.md").is_supported());
    }

    #[test]
    fn test_symbol_kind_wire_format() {
        let entry = SymbolEntry::new("x", "a.js", 1, SymbolKind::Variable);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["kind"], "Variable");
        assert_eq!(json["filePath"], "a.js");

        let kind: SymbolKind = serde_json::from_str("\"Function\"").unwrap();
        assert_eq!(kind, SymbolKind::Function);
        let kind: SymbolKind = serde_json::from_str("\"typealias\"").unwrap();
        assert_eq!(kind, SymbolKind::Unknown("typealias".to_string()));
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"typealias\"");
    }

    #[test]
    fn test_index_key_identity() {
        let a = IndexKey::new("symbols", "github.com/a/b", "deadbeef");
        let b = IndexKey::new("symbols", "github.com/a/b", "deadbeef");
        let c = IndexKey::new("symbols", "github.com/a/b", "cafebabe");
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());

        let filtered = a.clone().with_paths(vec!["b.go".into(), "a.go".into(), "a.go".into()]);
        assert_ne!(a, filtered);
        assert_ne!(a.digest(), filtered.digest());
        assert_eq!(filtered.path_filter(), &["a.go".to_string(), "b.go".to_string()]);

        let empty_filter = a.clone().with_paths(vec![]);
        assert_ne!(a.digest(), empty_filter.digest());
    }

    #[test]
    fn test_search_query_defaults() {
        let query: SearchQuery = serde_json::from_str(
            r#"{"repositoryName": "r", "revisionID": "abc", "namePattern": "^X$"}"#,
        )
        .unwrap();
        assert_eq!(query.repository_name, "r");
        assert_eq!(query.revision_id, "abc");
        assert!(!query.is_case_sensitive);
        assert!(query.include_path_patterns.is_empty());
        assert_eq!(query.exclude_path_pattern, None);
        assert_eq!(query.max_results, None);
    }
}
