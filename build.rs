//! Build-time schema hash for index invalidation
//!
//! Hashes the sources that define the on-disk index format and exports the
//! result as `INDEX_SCHEMA_HASH`. Every index file records the hash it was
//! written with; readers refuse files carrying a different one.
//!
//! Index-critical files:
//! - src/store.rs: SQLite tables, columns and meta rows
//! - src/models.rs: SymbolEntry fields and the SymbolKind wire names

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

const INDEX_CRITICAL_FILES: &[&str] = &["src/store.rs", "src/models.rs"];

fn main() {
    let schema_hash = compute_schema_hash();

    println!("cargo:rustc-env=INDEX_SCHEMA_HASH={}", schema_hash);

    for file in INDEX_CRITICAL_FILES {
        println!("cargo:rerun-if-changed={}", file);
    }
}

/// Deterministic hash of all index-critical source files
fn compute_schema_hash() -> String {
    let mut hasher = blake3::Hasher::new();

    let files: BTreeSet<&str> = INDEX_CRITICAL_FILES.iter().copied().collect();

    for file_path in &files {
        // A missing file still contributes its name, so the hash stays stable
        // for packaged builds that ship without it
        hasher.update(file_path.as_bytes());
        match fs::read(Path::new(file_path)) {
            Ok(content) => {
                hasher.update(&content);
            }
            Err(e) => println!("cargo:warning=Could not read {}: {}", file_path, e),
        }
    }

    // First 8 bytes as hex
    hasher.finalize().as_bytes()[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
