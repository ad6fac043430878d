//! Symbol search
//!
//! `QueryMatcher` is a validated, compiled form of a `SearchQuery`: name
//! and path regexes built under one case-sensitivity flag. `Searcher`
//! resolves the query's index through the disk cache (building it on a
//! miss) and streams matching rows out of it in `(path, line)` order.

use regex::{Regex, RegexBuilder};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

use crate::activity::{ActivitySnapshot, FetchLimiter};
use crate::cache::DiskCache;
use crate::error::{Result, SymbolsError};
use crate::fetcher::RevisionFetcher;
use crate::indexer::Indexer;
use crate::models::{IndexKey, SearchQuery, SymbolEntry};
use crate::store::{IndexMeta, IndexReader};

/// A name pattern that is a plain anchored literal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExactName {
    pub value: String,
    pub case_sensitive: bool,
}

/// Compiled filters of one search request
#[derive(Debug, Clone)]
pub struct QueryMatcher {
    name: Option<Regex>,
    include: Vec<Regex>,
    exclude: Option<Regex>,
    exact: Option<ExactName>,
}

impl QueryMatcher {
    /// Compile every pattern of `query`, failing on the first malformed one
    pub fn new(query: &SearchQuery) -> Result<Self> {
        let case_sensitive = query.is_case_sensitive;
        let compile = |pattern: &str, field: &str| -> Result<Regex> {
            RegexBuilder::new(pattern)
                .case_insensitive(!case_sensitive)
                .build()
                .map_err(|e| SymbolsError::QueryValidation(format!("{} {:?}: {}", field, pattern, e)))
        };

        let name = match query.name_pattern.as_str() {
            "" => None,
            pattern => Some(compile(pattern, "namePattern")?),
        };
        let include = query
            .include_path_patterns
            .iter()
            .map(|pattern| compile(pattern, "includePathPatterns"))
            .collect::<Result<Vec<_>>>()?;
        let exclude = match query.exclude_path_pattern.as_deref() {
            None | Some("") => None,
            Some(pattern) => Some(compile(pattern, "excludePathPattern")?),
        };

        let exact = anchored_literal(&query.name_pattern)
            .filter(|literal| case_sensitive || folds_like_sqlite(literal))
            .map(|value| ExactName { value, case_sensitive });

        Ok(Self {
            name,
            include,
            exclude,
            exact,
        })
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name.as_ref().is_none_or(|re| re.is_match(name))
    }

    pub fn matches_path(&self, path: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(path)) {
            return false;
        }
        !self.exclude.as_ref().is_some_and(|re| re.is_match(path))
    }

    pub fn matches(&self, entry: &SymbolEntry) -> bool {
        self.matches_path(&entry.file_path) && self.matches_name(&entry.name)
    }

    /// Literal the name must equal, when the pattern allows an index lookup
    pub fn exact_name(&self) -> Option<&ExactName> {
        self.exact.as_ref()
    }
}

/// `^literal$` with no metacharacters in between
fn anchored_literal(pattern: &str) -> Option<String> {
    let inner = pattern.strip_prefix('^')?.strip_suffix('$')?;
    if inner.is_empty() || regex::escape(inner) != inner {
        return None;
    }
    Some(inner.to_string())
}

/// Whether SQLite's ASCII-only NOCASE agrees with Unicode case folding
///
/// `k` and `s` also fold to KELVIN SIGN and LATIN SMALL LETTER LONG S.
fn folds_like_sqlite(literal: &str) -> bool {
    literal.is_ascii()
        && !literal
            .chars()
            .any(|c| matches!(c.to_ascii_lowercase(), 'k' | 's'))
}

/// Answers search requests, building indexes on demand
#[derive(Clone)]
pub struct Searcher {
    cache: DiskCache,
    fetcher: Arc<dyn RevisionFetcher>,
    indexer: Indexer,
    fetches: FetchLimiter,
    component: String,
    default_max_results: usize,
}

impl Searcher {
    pub fn new(
        cache: DiskCache,
        fetcher: Arc<dyn RevisionFetcher>,
        indexer: Indexer,
        component: impl Into<String>,
        default_max_results: usize,
    ) -> Self {
        Self {
            cache,
            fetcher,
            indexer,
            fetches: FetchLimiter::new(Semaphore::MAX_PERMITS),
            component: component.into(),
            default_max_results,
        }
    }

    /// Run at most `max_concurrent` archive fetches at once
    pub fn with_fetch_limit(mut self, max_concurrent: usize) -> Self {
        self.fetches = FetchLimiter::new(max_concurrent);
        self
    }

    /// Count archive entries of every build this searcher starts
    pub fn with_progress(mut self, counter: Arc<AtomicU64>) -> Self {
        self.indexer = self.indexer.with_progress(counter);
        self
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn activity(&self) -> ActivitySnapshot {
        ActivitySnapshot::new(&self.fetches, self.cache.build_counts(), self.indexer.pool().stats())
    }

    pub fn key(&self, repo: &str, revision: &str) -> IndexKey {
        IndexKey::new(self.component.as_str(), repo, revision)
    }

    /// Run a search, building the index first if it is not cached
    ///
    /// Patterns are validated before any index access.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SymbolEntry>> {
        let started = Instant::now();
        let matcher = QueryMatcher::new(query)?;
        if query.repository_name.is_empty() {
            return Err(SymbolsError::QueryValidation("repositoryName is required".into()));
        }
        if query.revision_id.is_empty() {
            return Err(SymbolsError::QueryValidation("revisionID is required".into()));
        }

        let limit = query.max_results.unwrap_or(self.default_max_results);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let key = self.key(&query.repository_name, &query.revision_id);
        let mut retried = false;
        let results = loop {
            let path = self.ensure_index(&key).await?;
            match read_matches(path.clone(), matcher.clone(), limit).await {
                // Evicted between lookup and open; a miss, not an error
                Err(_) if !retried && !path.exists() => {
                    log::debug!("Index for {} vanished before it was read, rebuilding", key);
                    retried = true;
                }
                other => break other?,
            }
        };

        log::debug!(
            "Search {} name={:?} returned {} results in {:.2?}",
            key,
            query.name_pattern,
            results.len(),
            started.elapsed()
        );
        Ok(results)
    }

    /// Build (or find) the index for a revision without searching it
    pub async fn index(&self, repo: &str, revision: &str, paths: Option<Vec<String>>) -> Result<IndexMeta> {
        let mut key = self.key(repo, revision);
        if let Some(paths) = paths {
            key = key.with_paths(paths);
        }

        let path = self.ensure_index(&key).await?;
        tokio::task::spawn_blocking(move || IndexReader::open(&path)?.meta())
            .await
            .map_err(|e| SymbolsError::Build(format!("index reader task failed: {}", e)))?
    }

    async fn ensure_index(&self, key: &IndexKey) -> Result<PathBuf> {
        let fetcher = Arc::clone(&self.fetcher);
        let indexer = self.indexer.clone();
        let fetches = self.fetches.clone();
        let build_key = key.clone();

        self.cache
            .get_or_build(key, move |dest| async move {
                if fetches.queued() > 0 || fetches.running() > 0 {
                    log::info!(
                        "Fetch for {} waiting ({} running, {} queued)",
                        build_key,
                        fetches.running(),
                        fetches.queued()
                    );
                }
                // Held until the archive is fully consumed
                let _slot = fetches.acquire().await?;
                let archive = fetcher
                    .fetch_archive(&build_key.repo, &build_key.revision, build_key.path_filter())
                    .await?;
                indexer.build(&build_key, archive, &dest).await.map(|_| ())
            })
            .await
    }
}

async fn read_matches(path: PathBuf, matcher: QueryMatcher, limit: usize) -> Result<Vec<SymbolEntry>> {
    tokio::task::spawn_blocking(move || IndexReader::open(&path)?.search(&matcher, limit))
        .await
        .map_err(|e| SymbolsError::Build(format!("index reader task failed: {}", e)))?
}
