//! Git-backed revision fetcher
//!
//! Streams the tree of a commit straight out of a local clone without
//! touching a working copy: `git ls-tree` lists the entries and a single
//! long-lived `git cat-file --batch` process returns blob contents one at
//! a time. Clones live under a repos directory, one per repository name.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use futures::StreamExt;

use crate::config::ServiceConfig;
use crate::error::{Result, SymbolsError};
use crate::fetcher::{ArchiveEntry, ArchiveStream, EntryType, RevisionFetcher};

/// Entries buffered between the git reader task and the indexer
const ENTRY_BUFFER: usize = 64;

/// One line of `git ls-tree` output
#[derive(Debug, Clone, PartialEq, Eq)]
struct TreeEntry {
    mode: String,
    object_type: String,
    object_id: String,
    path: String,
}

/// Fetches revisions from local clones under `repos_dir`
#[derive(Debug, Clone)]
pub struct GitArchiveFetcher {
    repos_dir: PathBuf,
    max_file_size: usize,
}

impl GitArchiveFetcher {
    pub fn new(repos_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            max_file_size: usize::MAX,
        }
    }

    /// Fetcher for the configured repos dir, capped at the indexer's file size
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.git.repos_dir.clone()).with_max_file_size(config.indexer.max_file_size)
    }

    /// Skip reading blobs larger than `max_file_size` bytes; they are
    /// streamed as oversized entries without content
    pub fn with_max_file_size(mut self, max_file_size: usize) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    fn repo_path(&self, repo: &str) -> Result<PathBuf> {
        if repo.is_empty() || repo.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(SymbolsError::Fetch(format!("invalid repository name: {:?}", repo)));
        }
        let path = self.repos_dir.join(repo);
        if !path.exists() {
            return Err(SymbolsError::Fetch(format!("unknown repository: {}", repo)));
        }
        Ok(path)
    }
}

#[async_trait]
impl RevisionFetcher for GitArchiveFetcher {
    async fn fetch_archive(&self, repo: &str, revision: &str, paths: &[String]) -> Result<ArchiveStream> {
        let repo_path = self.repo_path(repo)?;
        let commit = resolve_commit(&repo_path, revision).await?;
        let entries = list_tree(&repo_path, &commit, paths).await?;

        log::debug!(
            "Fetching {} tree entries from {}@{}",
            entries.len(),
            repo,
            commit
        );

        let (tx, rx) = mpsc::channel(ENTRY_BUFFER);
        let max_file_size = self.max_file_size;
        tokio::spawn(async move {
            if let Err(e) = stream_blobs(&repo_path, entries, max_file_size, &tx).await {
                // Receiver may already be gone; nothing else to report to
                let _ = tx.send(Err(e)).await;
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Resolve a revision to a full commit SHA
pub async fn resolve_commit(repo_path: &Path, revision: &str) -> Result<String> {
    if revision.is_empty() || revision.starts_with('-') {
        return Err(SymbolsError::Fetch(format!("invalid revision: {:?}", revision)));
    }

    let output = Command::new("git")
        .arg("-C")
        .arg(repo_path)
        .args(["rev-parse", "--verify", "--quiet"])
        .arg(format!("{}^{{commit}}", revision))
        .output()
        .await
        .map_err(|e| SymbolsError::Fetch(format!("failed to execute git rev-parse: {}", e)))?;

    if !output.status.success() {
        return Err(SymbolsError::Fetch(format!("unknown revision: {}", revision)));
    }

    let commit = String::from_utf8(output.stdout)
        .map_err(|_| SymbolsError::Fetch("invalid UTF-8 in commit SHA".into()))?
        .trim()
        .to_string();

    Ok(commit)
}

async fn list_tree(repo_path: &Path, commit: &str, paths: &[String]) -> Result<Vec<TreeEntry>> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_path)
        .args(["ls-tree", "-r", "-z", "--full-tree", commit, "--"])
        .args(paths)
        .output()
        .await
        .map_err(|e| SymbolsError::Fetch(format!("failed to execute git ls-tree: {}", e)))?;

    if !output.status.success() {
        return Err(SymbolsError::Fetch(format!(
            "git ls-tree failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    parse_ls_tree(&output.stdout)
}

/// Parse NUL-separated `<mode> <type> <object>\t<path>` records
fn parse_ls_tree(raw: &[u8]) -> Result<Vec<TreeEntry>> {
    raw.split(|&b| b == 0)
        .filter(|record| !record.is_empty())
        .map(|record| {
            let record = String::from_utf8_lossy(record);
            let (meta, path) = record
                .split_once('\t')
                .ok_or_else(|| SymbolsError::Fetch(format!("malformed ls-tree record: {}", record)))?;
            let mut fields = meta.split(' ');
            match (fields.next(), fields.next(), fields.next()) {
                (Some(mode), Some(object_type), Some(object_id)) => Ok(TreeEntry {
                    mode: mode.to_string(),
                    object_type: object_type.to_string(),
                    object_id: object_id.to_string(),
                    path: path.to_string(),
                }),
                _ => Err(SymbolsError::Fetch(format!("malformed ls-tree record: {}", record))),
            }
        })
        .collect()
}

/// Read every blob through one `git cat-file --batch` process
async fn stream_blobs(
    repo_path: &Path,
    entries: Vec<TreeEntry>,
    max_file_size: usize,
    tx: &mpsc::Sender<Result<ArchiveEntry>>,
) -> Result<()> {
    let mut child = Command::new("git")
        .arg("-C")
        .arg(repo_path)
        .args(["cat-file", "--batch"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SymbolsError::Fetch(format!("failed to start git cat-file: {}", e)))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| SymbolsError::Fetch("git cat-file has no stdin".into()))?;
    let mut stdout = BufReader::new(
        child
            .stdout
            .take()
            .ok_or_else(|| SymbolsError::Fetch("git cat-file has no stdout".into()))?,
    );

    let fetch_err = |e: std::io::Error| SymbolsError::Fetch(format!("git cat-file: {}", e));

    for entry in entries {
        let entry_type = match (entry.object_type.as_str(), entry.mode.as_str()) {
            ("commit", _) => EntryType::Submodule,
            ("blob", "120000") => EntryType::Symlink,
            ("blob", _) => EntryType::File,
            _ => continue,
        };

        let (size, content) = if entry_type == EntryType::Submodule {
            (0, Vec::new())
        } else {
            stdin
                .write_all(format!("{}\n", entry.object_id).as_bytes())
                .await
                .map_err(fetch_err)?;
            stdin.flush().await.map_err(fetch_err)?;

            let mut header = String::new();
            stdout.read_line(&mut header).await.map_err(fetch_err)?;
            let size = parse_batch_header(&header, &entry.object_id)?;

            // Blob content followed by a single newline
            if size > max_file_size {
                let skipped = tokio::io::copy(&mut (&mut stdout).take(size as u64 + 1), &mut tokio::io::sink())
                    .await
                    .map_err(fetch_err)?;
                if skipped != size as u64 + 1 {
                    return Err(SymbolsError::Fetch(format!("git cat-file: short read for {}", entry.object_id)));
                }
                log::debug!("Not reading {} ({} bytes exceeds {})", entry.path, size, max_file_size);
                (size, Vec::new())
            } else {
                let mut content = vec![0u8; size + 1];
                stdout.read_exact(&mut content).await.map_err(fetch_err)?;
                content.truncate(size);
                (size, content)
            }
        };

        let archive_entry = ArchiveEntry {
            path: entry.path,
            entry_type,
            size,
            content,
        };
        if tx.send(Ok(archive_entry)).await.is_err() {
            log::debug!("Archive consumer went away, stopping git cat-file");
            return Ok(());
        }
    }

    drop(stdin);
    let status = child.wait().await.map_err(fetch_err)?;
    if !status.success() {
        return Err(SymbolsError::Fetch(format!("git cat-file exited with {}", status)));
    }
    Ok(())
}

/// Parse `<object> <type> <size>` and return the size
fn parse_batch_header(header: &str, object_id: &str) -> Result<usize> {
    let mut fields = header.trim_end().split(' ');
    match (fields.next(), fields.next(), fields.next()) {
        (Some(_), Some("missing"), None) => Err(SymbolsError::Fetch(format!("object {} is missing", object_id))),
        (Some(_), Some(_), Some(size)) => size
            .parse()
            .map_err(|_| SymbolsError::Fetch(format!("bad cat-file header: {:?}", header))),
        _ => Err(SymbolsError::Fetch(format!("bad cat-file header: {:?}", header))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(args)
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    fn init_repo(repos_dir: &Path, name: &str) -> PathBuf {
        let repo = repos_dir.join(name);
        std::fs::create_dir_all(repo.join("src")).unwrap();
        std::fs::write(repo.join("a.js"), "var x = 1").unwrap();
        std::fs::write(repo.join("src/lib.rs"), "fn main() {}\n").unwrap();
        git(&repo, &["init", "-q"]);
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "initial"]);
        repo
    }

    #[test]
    fn test_parse_ls_tree() {
        let raw = b"100644 blob 1111\ta.js\0120000 blob 2222\tlink\0160000 commit 3333\tvendor/sub\0";
        let entries = parse_ls_tree(raw).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, "a.js");
        assert_eq!(entries[1].mode, "120000");
        assert_eq!(entries[2].object_type, "commit");
        assert!(parse_ls_tree(b"garbage\0").is_err());
    }

    #[test]
    fn test_parse_batch_header() {
        assert_eq!(parse_batch_header("abc blob 12\n", "abc").unwrap(), 12);
        assert!(parse_batch_header("abc missing\n", "abc").is_err());
        assert!(parse_batch_header("", "abc").is_err());
    }

    #[tokio::test]
    async fn test_fetch_archive_from_clone() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path(), "acme/web");

        let fetcher = GitArchiveFetcher::new(temp.path());
        let archive = fetcher.fetch_archive("acme/web", "HEAD", &[]).await.unwrap();
        let mut entries: Vec<ArchiveEntry> = archive.try_collect().await.unwrap();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ArchiveEntry::file("a.js", "var x = 1"));
        assert_eq!(entries[1].path, "src/lib.rs");
    }

    #[tokio::test]
    async fn test_oversized_blobs_are_not_read() {
        let temp = TempDir::new().unwrap();
        let repo = init_repo(temp.path(), "acme/web");
        std::fs::write(repo.join("z.js"), "var z = 2").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "more"]);

        let fetcher = GitArchiveFetcher::new(temp.path()).with_max_file_size(10);
        let archive = fetcher.fetch_archive("acme/web", "HEAD", &[]).await.unwrap();
        let entries: Vec<ArchiveEntry> = archive.try_collect().await.unwrap();

        // src/lib.rs is 13 bytes; the blobs around it still line up
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], ArchiveEntry::file("a.js", "var x = 1"));
        assert_eq!(entries[1], ArchiveEntry::oversized("src/lib.rs", 13));
        assert_eq!(entries[2], ArchiveEntry::file("z.js", "var z = 2"));
    }

    #[tokio::test]
    async fn test_fetch_archive_with_path_filter() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path(), "acme/web");

        let fetcher = GitArchiveFetcher::new(temp.path());
        let archive = fetcher
            .fetch_archive("acme/web", "HEAD", &["src".to_string()])
            .await
            .unwrap();
        let entries: Vec<ArchiveEntry> = archive.try_collect().await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "src/lib.rs");
    }

    #[tokio::test]
    async fn test_fetch_errors() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path(), "acme/web");
        let fetcher = GitArchiveFetcher::new(temp.path());

        let unknown_repo = fetcher.fetch_archive("acme/nope", "HEAD", &[]).await;
        assert!(matches!(unknown_repo, Err(SymbolsError::Fetch(_))));

        let escape = fetcher.fetch_archive("../etc", "HEAD", &[]).await;
        assert!(matches!(escape, Err(SymbolsError::Fetch(_))));

        let unknown_rev = fetcher.fetch_archive("acme/web", "no-such-branch", &[]).await;
        assert!(matches!(unknown_rev, Err(SymbolsError::Fetch(_))));

        let flag = fetcher.fetch_archive("acme/web", "--all", &[]).await;
        assert!(matches!(flag, Err(SymbolsError::Fetch(_))));
    }
}
