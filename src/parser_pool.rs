//! Fixed-capacity pool of reusable parser workers
//!
//! A counted semaphore bounds how many workers are checked out at once.
//! Workers are created lazily on first demand and returned to an idle list
//! on checkin. A worker that fails in a way that points at its own state
//! (or panics) is closed and replaced by a fresh one, so the pool keeps its
//! capacity and only the offending file sees the failure.
//!
//! Permits held by a handle travel with its worker into the blocking parse.
//! If the async side of a parse is dropped, the permits stay taken until the
//! parse itself returns.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, SymbolsError};
use crate::models::SymbolEntry;
use crate::parsers::{ParseFailure, ParserFactory, SymbolParser};

/// Shared handle to a parser pool; clones refer to the same workers
#[derive(Clone)]
pub struct ParserPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    factory: Arc<dyn ParserFactory>,
    capacity: usize,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn SymbolParser>>>,
    closed: AtomicBool,
    workers_created: AtomicUsize,
    workers_replaced: AtomicUsize,
}

/// Pool counters, mostly useful for tests and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub workers_created: usize,
    pub workers_replaced: usize,
}

/// One checked-out worker
///
/// Dropping the handle checks the worker back in.
pub struct ParserHandle {
    parser: Option<Box<dyn SymbolParser>>,
    pool: Arc<PoolInner>,
    /// The pool slot plus any permits attached with `hold`
    permits: Vec<OwnedSemaphorePermit>,
}

impl ParserHandle {
    /// Keep `permit` taken for as long as this worker is checked out or
    /// busy parsing
    pub fn hold(&mut self, permit: OwnedSemaphorePermit) {
        self.permits.push(permit);
    }
}

type ParseAttempt = std::thread::Result<std::result::Result<Vec<SymbolEntry>, ParseFailure>>;

impl ParserPool {
    pub fn new(factory: Arc<dyn ParserFactory>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                factory,
                capacity,
                slots: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(Vec::with_capacity(capacity)),
                closed: AtomicBool::new(false),
                workers_created: AtomicUsize::new(0),
                workers_replaced: AtomicUsize::new(0),
            }),
        }
    }

    /// Whether any registered parser handles this path
    pub fn supports(&self, path: &str) -> bool {
        self.inner.factory.supports(path)
    }

    /// Take a worker, waiting while all of them are in use
    pub async fn checkout(&self) -> Result<ParserHandle> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SymbolsError::PoolClosed);
        }

        let permit = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SymbolsError::PoolClosed)?;

        let idle_worker = self.inner.lock_idle().pop();
        let parser = match idle_worker {
            Some(parser) => parser,
            None => self.inner.spawn_worker()?,
        };

        Ok(ParserHandle {
            parser: Some(parser),
            pool: Arc::clone(&self.inner),
            permits: vec![permit],
        })
    }

    /// Return a worker to the pool
    pub fn checkin(&self, handle: ParserHandle) {
        drop(handle);
    }

    /// Parse one file on a checked-out worker
    ///
    /// The parse runs on the blocking thread pool. Input failures leave the
    /// worker in place; worker failures and panics replace it.
    pub async fn parse(
        &self,
        handle: &mut ParserHandle,
        path: &str,
        content: Vec<u8>,
    ) -> Result<Vec<SymbolEntry>> {
        let mut parser = match handle.parser.take() {
            Some(parser) => parser,
            None => self.inner.spawn_worker()?,
        };

        let file_path = path.to_string();
        let permits = std::mem::take(&mut handle.permits);
        let joined = tokio::task::spawn_blocking(move || {
            let attempt: ParseAttempt =
                panic::catch_unwind(AssertUnwindSafe(|| parser.parse(&file_path, &content)));
            (parser, permits, attempt)
        })
        .await;

        let (mut parser, permits, attempt) = match joined {
            Ok(done) => done,
            Err(join_err) => {
                // Only happens while the runtime shuts down; the permits
                // went with the task
                self.inner.workers_replaced.fetch_add(1, Ordering::Relaxed);
                return Err(SymbolsError::Parse {
                    path: path.to_string(),
                    message: format!("parser task failed: {}", join_err),
                });
            }
        };
        handle.permits = permits;

        match attempt {
            Ok(Ok(symbols)) => {
                handle.parser = Some(parser);
                Ok(symbols)
            }
            Ok(Err(ParseFailure::Input(message))) => {
                handle.parser = Some(parser);
                Err(SymbolsError::Parse {
                    path: path.to_string(),
                    message,
                })
            }
            Ok(Err(failure @ ParseFailure::Worker(_))) => {
                log::warn!("Replacing parser worker after failure on {}: {}", path, failure);
                parser.close();
                self.replace_worker(handle);
                Err(SymbolsError::Parse {
                    path: path.to_string(),
                    message: failure.to_string(),
                })
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::warn!("Replacing parser worker that panicked on {}: {}", path, message);
                drop(parser);
                self.replace_worker(handle);
                Err(SymbolsError::Parse {
                    path: path.to_string(),
                    message: format!("parser worker panicked: {}", message),
                })
            }
        }
    }

    /// Close every idle worker and refuse further checkouts
    ///
    /// Workers still checked out are closed when they come back.
    pub fn close_all(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.slots.close();

        let mut idle = self.inner.lock_idle();
        let count = idle.len();
        for mut parser in idle.drain(..) {
            parser.close();
        }
        log::debug!("Closed parser pool ({} idle workers released)", count);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.capacity,
            idle: self.inner.lock_idle().len(),
            workers_created: self.inner.workers_created.load(Ordering::Relaxed),
            workers_replaced: self.inner.workers_replaced.load(Ordering::Relaxed),
        }
    }

    fn replace_worker(&self, handle: &mut ParserHandle) {
        self.inner.workers_replaced.fetch_add(1, Ordering::Relaxed);
        match self.inner.spawn_worker() {
            Ok(parser) => handle.parser = Some(parser),
            Err(e) => {
                // The slot stays free; the next checkout retries creation
                log::error!("Failed to respawn parser worker: {}", e);
                handle.parser = None;
            }
        }
    }
}

impl PoolInner {
    fn lock_idle(&self) -> MutexGuard<'_, Vec<Box<dyn SymbolParser>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(&self) -> Result<Box<dyn SymbolParser>> {
        let parser = self
            .factory
            .create()
            .map_err(|e| SymbolsError::Build(format!("failed to start parser worker: {:#}", e)))?;
        let created = self.workers_created.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("Started parser worker #{} (capacity {})", created, self.capacity);
        Ok(parser)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| msg.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl Drop for ParserHandle {
    fn drop(&mut self) {
        let Some(mut parser) = self.parser.take() else {
            return;
        };
        if self.pool.closed.load(Ordering::Acquire) {
            parser.close();
        } else {
            self.pool.lock_idle().push(parser);
        }
    }
}
