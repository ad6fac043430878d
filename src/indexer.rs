//! Index builder
//!
//! Consumes one revision archive and produces one index file. Entries are
//! filtered (regular, supported, not too large), parsed concurrently on the
//! parser pool, and handed to a single writer running on the blocking pool.
//!
//! Concurrency is bounded twice: the pool caps live parser workers, and a
//! process-wide semaphore shared by every build caps files in flight, so
//! concurrent builds for different keys cannot oversubscribe the machine.
//! A parse slot is held by the parse itself, so an aborted build keeps its
//! slots until the blocking parses it started have returned.

use futures::StreamExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::config::IndexerConfig;
use crate::error::{Result, SymbolsError};
use crate::fetcher::{ArchiveEntry, ArchiveStream};
use crate::models::{IndexKey, IndexStats, SymbolEntry};
use crate::parser_pool::ParserPool;
use crate::store::IndexWriter;

/// Parsed files buffered ahead of the writer
const PARSED_BUFFER: usize = 256;

/// What happened to one file handed to a parser
enum FileOutcome {
    Parsed,
    Failed,
}

/// Builds index files from revision archives
#[derive(Clone)]
pub struct Indexer {
    pool: ParserPool,
    parse_slots: Arc<Semaphore>,
    max_file_size: usize,
    write_batch_size: usize,
    progress: Option<Arc<AtomicU64>>,
}

impl Indexer {
    /// `parse_slots` is shared with every other indexer in the process
    pub fn new(pool: ParserPool, parse_slots: Arc<Semaphore>, config: &IndexerConfig) -> Self {
        Self {
            pool,
            parse_slots,
            max_file_size: config.max_file_size,
            write_batch_size: config.write_batch_size,
            progress: None,
        }
    }

    /// Count archive entries seen into `counter`
    pub fn with_progress(mut self, counter: Arc<AtomicU64>) -> Self {
        self.progress = Some(counter);
        self
    }

    pub fn pool(&self) -> &ParserPool {
        &self.pool
    }

    /// Build the index for `key` from `archive` into the file at `dest`
    ///
    /// A failing file is logged and left out; a failing fetch or write
    /// fails the whole build. `dest` is left behind on failure and is the
    /// caller's to remove.
    pub async fn build(&self, key: &IndexKey, archive: ArchiveStream, dest: &Path) -> Result<IndexStats> {
        let started = Instant::now();
        log::info!("Building index for {}", key);

        let (tx, rx) = mpsc::channel::<Vec<SymbolEntry>>(PARSED_BUFFER);
        let writer_task = spawn_writer(dest, self.write_batch_size, rx);

        let mut stats = IndexStats::default();
        let parsed = self.parse_archive(archive, tx, &mut stats).await;

        // A writer failure is the root cause of any send failures seen above
        let writer = writer_task
            .await
            .map_err(|e| SymbolsError::Build(format!("index writer task failed: {}", e)))??;
        parsed?;

        stats.symbols = writer.symbol_count();
        let key_for_writer = key.clone();
        let stats_for_writer = stats.clone();
        let meta = tokio::task::spawn_blocking(move || writer.finish(&key_for_writer, &stats_for_writer))
            .await
            .map_err(|e| SymbolsError::Build(format!("index writer task failed: {}", e)))??;

        log::info!(
            "Indexed {}: {} files parsed, {} skipped, {} failed, {} symbols in {:.2?}",
            key,
            meta.stats.files_parsed,
            meta.stats.files_skipped,
            meta.stats.parse_failures,
            meta.stats.symbols,
            started.elapsed()
        );

        Ok(meta.stats)
    }

    async fn parse_archive(
        &self,
        mut archive: ArchiveStream,
        tx: mpsc::Sender<Vec<SymbolEntry>>,
        stats: &mut IndexStats,
    ) -> Result<()> {
        // Dropping the set on an early return aborts outstanding parses
        let mut tasks: JoinSet<Result<FileOutcome>> = JoinSet::new();

        while let Some(entry) = archive.next().await {
            let entry = entry?;
            if let Some(progress) = &self.progress {
                progress.fetch_add(1, Ordering::Relaxed);
            }

            if !self.should_parse(&entry) {
                stats.files_skipped += 1;
                continue;
            }

            let permit = Arc::clone(&self.parse_slots)
                .acquire_owned()
                .await
                .map_err(|_| SymbolsError::PoolClosed)?;
            let pool = self.pool.clone();
            let tx = tx.clone();

            tasks.spawn(async move { parse_entry(&pool, entry, &tx, permit).await });

            while let Some(done) = tasks.try_join_next() {
                record_outcome(stats, done)?;
            }
        }

        drop(tx);
        while let Some(done) = tasks.join_next().await {
            record_outcome(stats, done)?;
        }
        Ok(())
    }

    fn should_parse(&self, entry: &ArchiveEntry) -> bool {
        if !entry.is_regular_file() {
            log::trace!("Skipping {} ({:?})", entry.path, entry.entry_type);
            return false;
        }
        if entry.size > self.max_file_size || entry.content.len() > self.max_file_size {
            log::debug!(
                "Skipping {} ({} bytes exceeds max_file_size {})",
                entry.path,
                entry.size,
                self.max_file_size
            );
            return false;
        }
        if !self.pool.supports(&entry.path) {
            log::trace!("Skipping {} (no parser)", entry.path);
            return false;
        }
        true
    }
}

async fn parse_entry(
    pool: &ParserPool,
    entry: ArchiveEntry,
    tx: &mpsc::Sender<Vec<SymbolEntry>>,
    parse_slot: OwnedSemaphorePermit,
) -> Result<FileOutcome> {
    let mut handle = pool.checkout().await?;
    handle.hold(parse_slot);
    let result = pool.parse(&mut handle, &entry.path, entry.content).await;
    pool.checkin(handle);

    match result {
        Ok(symbols) => {
            let count = symbols.len();
            log::trace!("Extracted {} symbols from {}", count, entry.path);
            if count > 0 {
                tx.send(symbols)
                    .await
                    .map_err(|_| SymbolsError::Build("index writer stopped".into()))?;
            }
            Ok(FileOutcome::Parsed)
        }
        Err(err @ SymbolsError::Parse { .. }) => {
            log::warn!("{}", err);
            Ok(FileOutcome::Failed)
        }
        Err(err) => Err(err),
    }
}

fn record_outcome(
    stats: &mut IndexStats,
    done: std::result::Result<Result<FileOutcome>, tokio::task::JoinError>,
) -> Result<()> {
    let outcome = done.map_err(|e| SymbolsError::Build(format!("parse task failed: {}", e)))??;
    stats.files_parsed += 1;
    match outcome {
        FileOutcome::Parsed => {}
        FileOutcome::Failed => stats.parse_failures += 1,
    }
    Ok(())
}

fn spawn_writer(
    dest: &Path,
    batch_size: usize,
    mut rx: mpsc::Receiver<Vec<SymbolEntry>>,
) -> tokio::task::JoinHandle<Result<IndexWriter>> {
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut writer = IndexWriter::create(&dest, batch_size)?;
        while let Some(symbols) = rx.blocking_recv() {
            writer.add(symbols)?;
        }
        Ok(writer)
    })
}
