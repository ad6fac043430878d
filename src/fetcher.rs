//! Revision fetcher interface
//!
//! The indexer consumes a repository tree at one revision as a stream of
//! archive entries. Where the entries come from (a local clone, a remote
//! archive service) is up to the implementation; the core treats the
//! stream as authoritative and never retries a failed fetch.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::Result;

/// Kind of tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Symlink,
    Submodule,
}

/// One entry of a revision archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path relative to the repository root, `/`-separated
    pub path: String,
    pub entry_type: EntryType,
    /// Size of the object in the tree, in bytes
    pub size: usize,
    /// Empty when the fetcher dropped an object above its size cap
    pub content: Vec<u8>,
}

impl ArchiveEntry {
    pub fn file(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            entry_type: EntryType::File,
            size: content.len(),
            content,
        }
    }

    /// A regular file whose content was not read
    pub fn oversized(path: impl Into<String>, size: usize) -> Self {
        Self {
            path: path.into(),
            entry_type: EntryType::File,
            size,
            content: Vec::new(),
        }
    }

    /// Whether the content was left out for size
    pub fn is_oversized(&self) -> bool {
        self.content.len() < self.size
    }

    pub fn is_regular_file(&self) -> bool {
        self.entry_type == EntryType::File
    }
}

/// Entries arrive one at a time; an `Err` item ends the archive
pub type ArchiveStream = BoxStream<'static, Result<ArchiveEntry>>;

/// Supplies repository trees at a given revision
#[async_trait]
pub trait RevisionFetcher: Send + Sync {
    /// Stream the tree of `repo` at `revision`, restricted to `paths` when
    /// non-empty
    async fn fetch_archive(&self, repo: &str, revision: &str, paths: &[String]) -> Result<ArchiveStream>;
}

/// Wrap already-materialised entries as an archive stream
pub fn archive_from_entries(entries: Vec<ArchiveEntry>) -> ArchiveStream {
    stream::iter(entries.into_iter().map(Ok)).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_archive_from_entries() {
        let archive = archive_from_entries(vec![
            ArchiveEntry::file("a.js", "var x = 1"),
            ArchiveEntry {
                path: "link".into(),
                entry_type: EntryType::Symlink,
                size: 4,
                content: b"a.js".to_vec(),
            },
            ArchiveEntry::oversized("big.bin", 1 << 30),
        ]);

        let entries: Vec<ArchiveEntry> = archive.try_collect().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].is_regular_file());
        assert!(!entries[0].is_oversized());
        assert!(!entries[1].is_regular_file());
        assert!(entries[2].is_regular_file());
        assert!(entries[2].is_oversized());
        assert!(entries[2].content.is_empty());
    }
}
