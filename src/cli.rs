//! CLI argument parsing and command handlers

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::client::SymbolsClient;
use crate::config::{load_config, ServiceConfig};
use crate::git::GitArchiveFetcher;
use crate::models::{SearchQuery, SymbolEntry};
use crate::output;
use crate::parsers::TreeSitterParserFactory;
use crate::query::Searcher;
use crate::server;

/// Symdex: per-revision symbol index and search service
#[derive(Parser, Debug)]
#[command(
    name = "sdx",
    version,
    about = "Symbol indexing and search for repository revisions",
    long_about = "Symdex builds a symbol index for a repository at a given revision on first \
                  request, caches it on disk, and answers name/path searches against it. \
                  Run 'sdx serve' to expose the search endpoint over HTTP."
)]
pub struct Cli {
    /// Enable verbose logging (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP search server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Build the index for a revision ahead of the first search
    Index {
        /// Repository name (directory under the repos dir)
        repo: String,

        /// Revision (commit, branch or tag)
        revision: String,

        /// Only index these paths (can be repeated)
        #[arg(long = "path", value_name = "PATH")]
        paths: Vec<String>,

        /// Suppress progress and summary output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Search symbols in a revision
    ///
    /// Examples:
    ///   sdx search acme/web main '^handle'
    ///   sdx search acme/web main Config --case-sensitive --include '\.go$'
    ///   sdx search acme/web 4f2a9c --server http://127.0.0.1:3184 --json
    Search {
        repo: String,

        revision: String,

        /// Regular expression over symbol names (empty = all symbols)
        #[arg(default_value = "")]
        pattern: String,

        /// Match name and path patterns case-sensitively
        #[arg(short = 's', long)]
        case_sensitive: bool,

        /// A file path must match at least one of these (can be repeated)
        #[arg(short, long, value_name = "REGEX")]
        include: Vec<String>,

        /// Drop files whose path matches this
        #[arg(short = 'x', long, value_name = "REGEX")]
        exclude: Option<String>,

        /// Maximum number of results (default from config)
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Pretty-print JSON output (only with --json)
        #[arg(long)]
        pretty: bool,

        /// Query a running server instead of the local cache
        #[arg(long, value_name = "URL")]
        server: Option<String>,
    },

    /// Show the cache state of a revision's index
    Status {
        repo: String,

        revision: String,

        /// Ask a running server, which also sees its in-flight and failed builds
        #[arg(long, value_name = "URL")]
        server: Option<String>,
    },

    /// Evict cached indexes by size and age
    Evict {
        /// Size budget in MB (overrides config)
        #[arg(long)]
        max_size_mb: Option<u64>,

        /// Remove indexes not used for this many seconds (overrides config)
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        // Setup logging based on verbosity
        let log_level = match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
            .init();

        let config = load_config(self.config.as_deref())?;
        log::debug!("Cache dir: {}", config.cache.dir.display());

        let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

        match self.command {
            Command::Serve { port, host } => runtime.block_on(handle_serve(config, port, host)),
            Command::Index { repo, revision, paths, quiet } => {
                runtime.block_on(handle_index(config, repo, revision, paths, quiet))
            }
            Command::Search {
                repo,
                revision,
                pattern,
                case_sensitive,
                include,
                exclude,
                limit,
                json,
                pretty,
                server,
            } => {
                let query = SearchQuery {
                    name_pattern: pattern,
                    is_case_sensitive: case_sensitive,
                    include_path_patterns: include,
                    exclude_path_pattern: exclude,
                    max_results: limit,
                    ..SearchQuery::new(repo, revision)
                };
                runtime.block_on(handle_search(config, query, server, json, pretty))
            }
            Command::Status { repo, revision, server } => {
                runtime.block_on(handle_status(&config, &repo, &revision, server))
            }
            Command::Evict { max_size_mb, max_age_secs } => {
                handle_evict(config, max_size_mb, max_age_secs)
            }
        }
    }
}

fn local_searcher(config: &ServiceConfig) -> Result<Searcher> {
    let fetcher = Arc::new(GitArchiveFetcher::from_config(config));
    server::build_searcher(config, fetcher, Arc::new(TreeSitterParserFactory))
}

/// Handle the `serve` subcommand
async fn handle_serve(mut config: ServiceConfig, port: Option<u16>, host: Option<String>) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    println!("Starting Symdex HTTP server...");
    println!("  Address: http://{}:{}", config.server.host, config.server.port);
    println!("  Cache:   {}", config.cache.dir.display());
    println!("  Repos:   {}", config.git.repos_dir.display());
    println!("\nEndpoints:");
    println!("  POST /search");
    println!("  GET  /status?repositoryName=..&revisionID=..");
    println!("  GET  /health");
    println!("\nPress Ctrl+C to stop.");

    server::run(config).await
}

/// Handle the `index` subcommand
async fn handle_index(
    config: ServiceConfig,
    repo: String,
    revision: String,
    paths: Vec<String>,
    quiet: bool,
) -> Result<()> {
    let counter = Arc::new(AtomicU64::new(0));
    let searcher = local_searcher(&config)?.with_progress(Arc::clone(&counter));
    let started = Instant::now();

    let pb = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_draw_target(ProgressDrawTarget::stderr());
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} [{elapsed_precise}] {msg}") {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    };

    let progress: tokio::task::JoinHandle<()> = {
        let pb = pb.clone();
        let counter = Arc::clone(&counter);
        let label = format!("{}@{}", repo, revision);
        tokio::spawn(async move {
            loop {
                pb.set_message(format!("Indexing {}: {} files read", label, counter.load(Ordering::Relaxed)));
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    };

    let paths = (!paths.is_empty()).then_some(paths);
    let result = searcher.index(&repo, &revision, paths).await;
    progress.abort();
    searcher.indexer().pool().close_all();

    let meta = match result {
        Ok(meta) => meta,
        Err(e) => {
            pb.abandon_with_message("Indexing failed");
            return Err(e).with_context(|| format!("Failed to index {}@{}", repo, revision));
        }
    };
    pb.finish_and_clear();

    if !quiet {
        println!("Index ready for {}@{}", repo, revision);
        println!("  Files parsed:   {}", meta.stats.files_parsed);
        println!("  Files skipped:  {}", meta.stats.files_skipped);
        println!("  Parse failures: {}", meta.stats.parse_failures);
        println!("  Symbols:        {}", meta.stats.symbols);
        println!("  Built at:       {}", meta.built_at);
        println!("  Elapsed:        {:.2?}", started.elapsed());
        if meta.stats.parse_failures > 0 {
            output::warn(&format!(
                "{} files failed to parse and were left out (run with -v for details)",
                meta.stats.parse_failures
            ));
        }
    }

    Ok(())
}

/// Handle the `search` subcommand
async fn handle_search(
    config: ServiceConfig,
    query: SearchQuery,
    server_url: Option<String>,
    as_json: bool,
    pretty_json: bool,
) -> Result<()> {
    let started = Instant::now();
    let results = match server_url {
        Some(url) => {
            log::info!("Searching via {}", url);
            SymbolsClient::new(url).search(&query).await?
        }
        None => {
            let searcher = local_searcher(&config)?;
            let results = searcher.search(&query).await;
            searcher.indexer().pool().close_all();
            results?
        }
    };

    if as_json {
        let json_str = if pretty_json {
            serde_json::to_string_pretty(&results)?
        } else {
            serde_json::to_string(&results)?
        };
        println!("{}", json_str);
        return Ok(());
    }

    if results.is_empty() {
        output::info("No symbols found.");
        return Ok(());
    }

    for entry in &results {
        print_entry(entry);
    }
    eprintln!(
        "\n{} results in {:.2?}",
        results.len(),
        started.elapsed()
    );
    Ok(())
}

fn print_entry(entry: &SymbolEntry) {
    let scope = if entry.parent_scope.is_empty() {
        String::new()
    } else {
        format!(" ({})", entry.parent_scope)
    };
    println!(
        "{}:{}:{} {} {}{}{}",
        entry.file_path.cyan(),
        entry.line,
        entry.character,
        entry.kind.to_string().yellow(),
        entry.name.bold(),
        entry.signature.dimmed(),
        scope.dimmed()
    );
}

/// Handle the `status` subcommand
async fn handle_status(
    config: &ServiceConfig,
    repo: &str,
    revision: &str,
    server_url: Option<String>,
) -> Result<()> {
    let (entry, activity) = match server_url {
        Some(url) => {
            log::info!("Asking {} for status", url);
            let client = SymbolsClient::new(url);
            let entry = client.status(repo, revision).await?;
            (entry, Some(client.activity().await?))
        }
        None => {
            // Builds of a running server show up through their temp files
            let searcher = local_searcher(config)?;
            (searcher.cache().status(&searcher.key(repo, revision)), None)
        }
    };

    match entry {
        Some(entry) => {
            println!("Key:    {}", entry.key);
            println!("State:  {:?}", entry.state);
            println!("File:   {}", entry.path.display());
            if let Some(started) = entry.build_started_at {
                println!("Since:  {}", started);
            }
        }
        None => {
            println!("No index cached for {}@{}", repo, revision);
            println!("\nRun 'sdx index {} {}' to build it.", repo, revision);
        }
    }

    if let Some(activity) = activity {
        println!("\nServer Activity");
        println!("===============");
        println!("Fetches running:  {}", activity.fetches_running);
        println!("Fetches queued:   {}", activity.fetches_queued);
        println!("Builds running:   {}", activity.builds.running);
        println!(
            "Builds finished:  {} ok, {} failed, {} timed out",
            activity.builds.succeeded, activity.builds.failed, activity.builds.timed_out
        );
        println!(
            "Parsers:          {} idle of {} ({} created, {} replaced)",
            activity.parsers_idle,
            activity.parser_capacity,
            activity.parsers_created,
            activity.parsers_replaced
        );
    }
    Ok(())
}

/// Handle the `evict` subcommand
fn handle_evict(config: ServiceConfig, max_size_mb: Option<u64>, max_age_secs: Option<u64>) -> Result<()> {
    let max_bytes = max_size_mb
        .map(|mb| mb.saturating_mul(1024 * 1024))
        .unwrap_or_else(|| config.cache.max_size_bytes());
    let max_age = match max_age_secs {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => config.cache.max_age(),
    };

    let searcher = local_searcher(&config)?;
    let stats = searcher.cache().evict(max_bytes, max_age)?;

    println!("Cache Eviction Complete");
    println!("=======================");
    println!("Indexes removed:  {}", stats.removed);
    println!("Space freed:      {}", format_bytes(stats.freed_bytes));
    println!("Space remaining:  {}", format_bytes(stats.remaining_bytes));
    Ok(())
}

/// Format bytes into human-readable size (KB, MB, GB, etc.)
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
