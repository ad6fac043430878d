//! On-disk symbol index
//!
//! One SQLite file per cache key. The writer fills a fresh file in batched
//! transactions and records the key and build stats in a `meta` table; the
//! reader opens finished files read-only and streams rows back in
//! `(path, line)` order.
//!
//! Schema:
//! - meta(key TEXT PRIMARY KEY, value TEXT)
//! - symbols(name, path, line, character, kind, parent_scope,
//!   match_pattern, signature, language)

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::{Path, PathBuf};

use crate::error::{Result, SymbolsError};
use crate::models::{IndexKey, IndexStats, Language, SymbolEntry, SymbolKind, INDEX_SCHEMA_HASH};
use crate::query::QueryMatcher;

/// Metadata stored alongside the symbols of one index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    pub schema_hash: String,
    pub key: IndexKey,
    pub stats: IndexStats,
    pub built_at: DateTime<Utc>,
}

/// Streams symbols into a new index file
pub struct IndexWriter {
    conn: Connection,
    path: PathBuf,
    pending: Vec<SymbolEntry>,
    batch_size: usize,
    written: usize,
}

impl IndexWriter {
    /// Create the index file and its tables
    ///
    /// The file must not already hold an index; callers write to a fresh
    /// temporary path and rename it into place once `finish` returns.
    pub fn create(path: &Path, batch_size: usize) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Scratch file until renamed into place
        conn.pragma_update(None, "journal_mode", "OFF")?;
        conn.pragma_update(None, "synchronous", "OFF")?;

        conn.execute(
            "CREATE TABLE meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE symbols (
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                line INTEGER NOT NULL,
                character INTEGER NOT NULL,
                kind TEXT NOT NULL,
                parent_scope TEXT NOT NULL,
                match_pattern TEXT NOT NULL,
                signature TEXT NOT NULL,
                language TEXT NOT NULL
            )",
            [],
        )?;

        log::debug!("Created index file {:?}", path);

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            pending: Vec::with_capacity(batch_size.max(1)),
            batch_size: batch_size.max(1),
            written: 0,
        })
    }

    /// Queue the symbols of one file, flushing full batches
    pub fn add(&mut self, symbols: Vec<SymbolEntry>) -> Result<()> {
        self.pending.extend(symbols);
        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Symbols written or queued so far
    pub fn symbol_count(&self) -> usize {
        self.written + self.pending.len()
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO symbols (name, path, line, character, kind, parent_scope, match_pattern, signature, language)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for symbol in &self.pending {
                stmt.execute(params![
                    symbol.name,
                    symbol.file_path,
                    symbol.line as i64,
                    symbol.character as i64,
                    symbol.kind.as_wire(),
                    symbol.parent_scope,
                    symbol.match_pattern,
                    symbol.signature,
                    symbol.language.to_string(),
                ])?;
            }
        }
        tx.commit()?;

        self.written += self.pending.len();
        log::trace!("Flushed {} symbols to {:?}", self.pending.len(), self.path);
        self.pending.clear();
        Ok(())
    }

    /// Flush remaining symbols, record metadata and close the file
    pub fn finish(mut self, key: &IndexKey, stats: &IndexStats) -> Result<IndexMeta> {
        self.flush()?;

        let meta = IndexMeta {
            schema_hash: INDEX_SCHEMA_HASH.to_string(),
            key: key.clone(),
            stats: stats.clone(),
            built_at: Utc::now(),
        };

        let paths = match &key.paths {
            Some(paths) => serde_json::to_string(paths)
                .map_err(|e| SymbolsError::Build(format!("failed to encode path filter: {}", e)))?,
            None => String::new(),
        };

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO meta (key, value) VALUES (?1, ?2)")?;
            for (name, value) in [
                ("schema_hash", meta.schema_hash.clone()),
                ("component", key.component.clone()),
                ("repo", key.repo.clone()),
                ("revision", key.revision.clone()),
                ("paths", paths),
                ("files_parsed", stats.files_parsed.to_string()),
                ("files_skipped", stats.files_skipped.to_string()),
                ("parse_failures", stats.parse_failures.to_string()),
                ("symbols", stats.symbols.to_string()),
                ("built_at", meta.built_at.to_rfc3339()),
            ] {
                stmt.execute(params![name, value])?;
            }
        }
        tx.commit()?;

        // Indexes are built once, after the bulk insert
        self.conn
            .execute("CREATE INDEX idx_symbols_path_line ON symbols(path, line)", [])?;
        self.conn.execute("CREATE INDEX idx_symbols_name ON symbols(name)", [])?;

        self.conn.close().map_err(|(_, e)| SymbolsError::from(e))?;

        log::debug!("Finished index {:?} ({} symbols)", self.path, self.written);
        Ok(meta)
    }
}

/// Read-only view of a finished index file
pub struct IndexReader {
    conn: Connection,
}

impl IndexReader {
    /// Open an index, rejecting files written with a different schema
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let schema_hash: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_hash'", [], |row| row.get(0))
            .optional()?;

        match schema_hash {
            Some(hash) if hash == INDEX_SCHEMA_HASH => Ok(Self { conn }),
            Some(hash) => Err(SymbolsError::Build(format!(
                "index {:?} has schema {} (expected {})",
                path, hash, INDEX_SCHEMA_HASH
            ))),
            None => Err(SymbolsError::Build(format!("index {:?} has no metadata", path))),
        }
    }

    pub fn meta(&self) -> Result<IndexMeta> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM meta")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut meta = IndexMeta {
            schema_hash: String::new(),
            key: IndexKey::new("", "", ""),
            stats: IndexStats::default(),
            built_at: DateTime::<Utc>::default(),
        };
        for row in rows {
            let (name, value) = row?;
            let count = || value.parse::<usize>().unwrap_or(0);
            match name.as_str() {
                "schema_hash" => meta.schema_hash = value.clone(),
                "component" => meta.key.component = value.clone(),
                "repo" => meta.key.repo = value.clone(),
                "revision" => meta.key.revision = value.clone(),
                "paths" if !value.is_empty() => {
                    let paths: Vec<String> = serde_json::from_str(&value)
                        .map_err(|e| SymbolsError::Build(format!("corrupt path filter in index: {}", e)))?;
                    meta.key.paths = Some(paths);
                }
                "files_parsed" => meta.stats.files_parsed = count(),
                "files_skipped" => meta.stats.files_skipped = count(),
                "parse_failures" => meta.stats.parse_failures = count(),
                "symbols" => meta.stats.symbols = count(),
                "built_at" => {
                    meta.built_at = DateTime::parse_from_rfc3339(&value)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or(DateTime::<Utc>::default());
                }
                _ => {}
            }
        }
        Ok(meta)
    }

    /// Matching symbols in `(path, line)` order, at most `limit` of them
    ///
    /// Rows are read lazily and reading stops as soon as `limit` matches
    /// have been collected. An exact-name pattern narrows the scan in SQL;
    /// every other filter is applied to the streamed rows.
    pub fn search(&self, matcher: &QueryMatcher, limit: usize) -> Result<Vec<SymbolEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        const COLUMNS: &str =
            "name, path, line, character, kind, parent_scope, match_pattern, signature, language";
        const ORDER: &str = "ORDER BY path, line, character, name";

        let mut results = Vec::new();
        let mut collect = |row: &Row<'_>| -> Result<bool> {
            let entry = row_to_entry(row)?;
            if matcher.matches(&entry) {
                results.push(entry);
            }
            Ok(results.len() < limit)
        };

        match matcher.exact_name() {
            Some(exact) => {
                let collation = if exact.case_sensitive { "" } else { " COLLATE NOCASE" };
                let sql = format!("SELECT {} FROM symbols WHERE name = ?1{} {}", COLUMNS, collation, ORDER);
                let mut stmt = self.conn.prepare(&sql)?;
                let mut rows = stmt.query(params![exact.value])?;
                while let Some(row) = rows.next()? {
                    if !collect(row)? {
                        break;
                    }
                }
            }
            None => {
                let sql = format!("SELECT {} FROM symbols {}", COLUMNS, ORDER);
                let mut stmt = self.conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    if !collect(row)? {
                        break;
                    }
                }
            }
        }

        Ok(results)
    }
}

fn row_to_entry(row: &Row<'_>) -> Result<SymbolEntry> {
    let language: String = row.get(8)?;
    Ok(SymbolEntry {
        name: row.get(0)?,
        file_path: row.get(1)?,
        line: row.get::<_, i64>(2)? as usize,
        character: row.get::<_, i64>(3)? as usize,
        kind: SymbolKind::from_wire(row.get(4)?),
        parent_scope: row.get(5)?,
        match_pattern: row.get(6)?,
        signature: row.get(7)?,
        language: language.parse().unwrap_or(Language::Unknown),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchQuery;
    use tempfile::TempDir;

    fn symbol(name: &str, path: &str, line: usize) -> SymbolEntry {
        SymbolEntry::new(name, path, line, SymbolKind::Function)
    }

    fn build_index(dir: &Path, symbols: Vec<Vec<SymbolEntry>>) -> PathBuf {
        let path = dir.join("index.sqlite");
        let key = IndexKey::new("symbols", "acme/web", "abc123");
        let mut writer = IndexWriter::create(&path, 2).unwrap();
        let mut stats = IndexStats::default();
        for file_symbols in symbols {
            stats.files_parsed += 1;
            stats.symbols += file_symbols.len();
            writer.add(file_symbols).unwrap();
        }
        writer.finish(&key, &stats).unwrap();
        path
    }

    fn matcher(name_pattern: &str, case_sensitive: bool) -> QueryMatcher {
        let mut query = SearchQuery::new("acme/web", "abc123");
        query.name_pattern = name_pattern.to_string();
        query.is_case_sensitive = case_sensitive;
        QueryMatcher::new(&query).unwrap()
    }

    #[test]
    fn test_write_then_read_in_order() {
        let temp = TempDir::new().unwrap();
        let path = build_index(
            temp.path(),
            vec![
                vec![symbol("zeta", "b.go", 9), symbol("alpha", "b.go", 2)],
                vec![symbol("beta", "a.go", 5)],
                vec![],
            ],
        );

        let reader = IndexReader::open(&path).unwrap();
        let results = reader.search(&matcher("", false), 100).unwrap();
        let order: Vec<(&str, usize)> = results.iter().map(|s| (s.file_path.as_str(), s.line)).collect();
        assert_eq!(order, vec![("a.go", 5), ("b.go", 2), ("b.go", 9)]);
    }

    #[test]
    fn test_meta_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = build_index(temp.path(), vec![vec![symbol("x", "a.js", 1)]]);

        let meta = IndexReader::open(&path).unwrap().meta().unwrap();
        assert_eq!(meta.schema_hash, INDEX_SCHEMA_HASH);
        assert_eq!(meta.key, IndexKey::new("symbols", "acme/web", "abc123"));
        assert_eq!(meta.stats.symbols, 1);
        assert_eq!(meta.stats.files_parsed, 1);
        assert!(meta.built_at > DateTime::<Utc>::default());
    }

    #[test]
    fn test_unknown_kind_preserved() {
        let temp = TempDir::new().unwrap();
        let mut entry = symbol("Alias", "a.ts", 3);
        entry.kind = SymbolKind::Unknown("typealias".into());
        entry.language = Language::TypeScript;
        let path = build_index(temp.path(), vec![vec![entry.clone()]]);

        let results = IndexReader::open(&path).unwrap().search(&matcher("", false), 10).unwrap();
        assert_eq!(results, vec![entry]);
    }

    #[test]
    fn test_limit_stops_reading() {
        let temp = TempDir::new().unwrap();
        let symbols = (1..=50).map(|i| symbol(&format!("f{}", i), "a.rs", i)).collect();
        let path = build_index(temp.path(), vec![symbols]);
        let reader = IndexReader::open(&path).unwrap();

        let results = reader.search(&matcher("", false), 3).unwrap();
        assert_eq!(results.iter().map(|s| s.line).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(reader.search(&matcher("", false), 0).unwrap().is_empty());
    }

    #[test]
    fn test_exact_name_push_down() {
        let temp = TempDir::new().unwrap();
        let path = build_index(
            temp.path(),
            vec![vec![symbol("Foo", "a.rs", 1), symbol("foo", "a.rs", 2), symbol("foobar", "a.rs", 3)]],
        );
        let reader = IndexReader::open(&path).unwrap();

        let sensitive = reader.search(&matcher("^foo$", true), 10).unwrap();
        assert_eq!(sensitive.len(), 1);
        assert_eq!(sensitive[0].name, "foo");

        let insensitive = reader.search(&matcher("^foo$", false), 10).unwrap();
        assert_eq!(insensitive.iter().map(|s| s.line).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let temp = TempDir::new().unwrap();
        let path = build_index(temp.path(), vec![]);
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("UPDATE meta SET value = 'stale' WHERE key = 'schema_hash'", [])
                .unwrap();
        }
        assert!(matches!(IndexReader::open(&path), Err(SymbolsError::Build(_))));
    }

    #[test]
    fn test_open_missing_file_fails() {
        let temp = TempDir::new().unwrap();
        assert!(IndexReader::open(&temp.path().join("missing.sqlite")).is_err());
    }
}
