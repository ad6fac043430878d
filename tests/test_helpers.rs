//! Shared fixtures for HTTP-level tests
//!
//! Provides a scripted parser that reports `x` and `y` for every file, an
//! in-memory fetcher that counts fetches, and a server bound to an
//! ephemeral port.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

use symdex::client::SymbolsClient;
use symdex::config::ServiceConfig;
use symdex::fetcher::{archive_from_entries, ArchiveStream};
use symdex::parsers::{ParseFailure, ParserFactory, SymbolParser};
use symdex::server::{self, AppState};
use symdex::{ArchiveEntry, RevisionFetcher, SymbolEntry, SymbolKind, SymbolsError};

/// Reports symbols `x` and `y` on the first line of every file
pub struct MockParser {
    calls: Arc<AtomicUsize>,
}

impl SymbolParser for MockParser {
    fn parse(&mut self, path: &str, _content: &[u8]) -> Result<Vec<SymbolEntry>, ParseFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut x = SymbolEntry::new("x", path, 1, SymbolKind::Variable);
        x.character = 4;
        let mut y = SymbolEntry::new("y", path, 1, SymbolKind::Variable);
        y.character = 8;
        Ok(vec![x, y])
    }
}

#[derive(Default)]
pub struct MockParserFactory {
    pub calls: Arc<AtomicUsize>,
}

impl ParserFactory for MockParserFactory {
    fn create(&self) -> anyhow::Result<Box<dyn SymbolParser>> {
        Ok(Box::new(MockParser {
            calls: Arc::clone(&self.calls),
        }))
    }

    fn supports(&self, path: &str) -> bool {
        path.ends_with(".js")
    }
}

/// Serves a fixed file set for every revision except `missing`
pub struct MemoryFetcher {
    files: Vec<ArchiveEntry>,
    delay: Duration,
    pub fetches: AtomicUsize,
}

impl MemoryFetcher {
    pub fn new(files: Vec<ArchiveEntry>) -> Self {
        Self {
            files,
            delay: Duration::ZERO,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Hold each fetch open for `delay` so concurrent requests overlap
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RevisionFetcher for MemoryFetcher {
    async fn fetch_archive(&self, _repo: &str, revision: &str, _paths: &[String]) -> symdex::Result<ArchiveStream> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if revision == "missing" {
            return Err(SymbolsError::Fetch(format!("unknown revision: {}", revision)));
        }
        Ok(archive_from_entries(self.files.clone()))
    }
}

/// A running server plus the handles a test inspects
pub struct TestServer {
    pub client: SymbolsClient,
    pub base_url: String,
    pub fetcher: Arc<MemoryFetcher>,
    pub parser_calls: Arc<AtomicUsize>,
    shutdown: Option<oneshot::Sender<()>>,
    _cache_dir: TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// The single-file fixture: `a.js` containing `var x = 1`
pub fn fixture_files() -> Vec<ArchiveEntry> {
    vec![ArchiveEntry::file("a.js", "var x = 1")]
}

/// Start a server on an ephemeral port backed by `fetcher` and the mock parser
pub async fn spawn_server(fetcher: MemoryFetcher) -> TestServer {
    spawn_server_with_timeout(fetcher, Duration::from_secs(30)).await
}

/// Like `spawn_server`, with a per-request deadline of `request_timeout`
pub async fn spawn_server_with_timeout(fetcher: MemoryFetcher, request_timeout: Duration) -> TestServer {
    let cache_dir = TempDir::new().unwrap();
    let mut config = ServiceConfig::default();
    config.cache.dir = cache_dir.path().to_path_buf();
    config.indexer.parser_pool_size = 2;
    config.indexer.max_concurrent_parses = 2;

    let fetcher = Arc::new(fetcher);
    let factory = Arc::new(MockParserFactory::default());
    let parser_calls = Arc::clone(&factory.calls);
    let searcher = server::build_searcher(&config, fetcher.clone(), factory).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = oneshot::channel::<()>();
    let state = AppState {
        searcher,
        request_timeout,
    };
    tokio::spawn(async move {
        let shutdown = async {
            let _ = rx.await;
        };
        server::serve(listener, state, shutdown).await.unwrap();
    });

    TestServer {
        client: SymbolsClient::new(base_url.clone()),
        base_url,
        fetcher,
        parser_calls,
        shutdown: Some(tx),
        _cache_dir: cache_dir,
    }
}

/// Names of the returned symbols, in order
pub fn names(results: &[SymbolEntry]) -> Vec<&str> {
    results.iter().map(|s| s.name.as_str()).collect()
}
