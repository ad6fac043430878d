//! Symdex: symbol indexing and search for repository revisions
//!
//! Symdex answers "which symbols named like X exist in repository R at
//! revision V". The first query for a revision fetches its archive, parses
//! every supported file with Tree-sitter and writes a symbol index to disk.
//! Later queries read the cached index.
//!
//! # Architecture
//!
//! - **Fetcher**: streams the files of a revision (`git` backend included)
//! - **Parser pool**: bounded set of reusable Tree-sitter parsers
//! - **Indexer**: parses an archive concurrently under a process-wide limit
//!   and writes the index file
//! - **Disk cache**: one build per key, shared by all waiters, bounded by a
//!   background timeout, with size and age eviction
//! - **Searcher**: validates queries, ensures the index and filters it
//! - **Server**: `POST /search`, `GET /status` and `GET /health` over HTTP,
//!   with fetch admission and activity counters
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use symdex::{config::ServiceConfig, git::GitArchiveFetcher, models::SearchQuery};
//! use symdex::parsers::TreeSitterParserFactory;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = ServiceConfig::default();
//! let fetcher = Arc::new(GitArchiveFetcher::from_config(&config));
//! let searcher = symdex::server::build_searcher(&config, fetcher, Arc::new(TreeSitterParserFactory))?;
//!
//! let query = SearchQuery {
//!     name_pattern: "^parse".into(),
//!     ..SearchQuery::new("acme/web", "main")
//! };
//! for symbol in searcher.search(&query).await? {
//!     println!("{}:{} {}", symbol.file_path, symbol.line, symbol.name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod activity;
pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod git;
pub mod indexer;
pub mod models;
pub mod output;
pub mod parser_pool;
pub mod parsers;
pub mod query;
pub mod server;
pub mod store;

// Re-export commonly used types
pub use activity::ActivitySnapshot;
pub use cache::DiskCache;
pub use error::{Result, SymbolsError};
pub use fetcher::{ArchiveEntry, RevisionFetcher};
pub use indexer::Indexer;
pub use models::{IndexKey, IndexStats, Language, SearchQuery, SymbolEntry, SymbolKind};
pub use parser_pool::ParserPool;
pub use query::{QueryMatcher, Searcher};
