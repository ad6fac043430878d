//! Error taxonomy shared by every component
//!
//! Build outcomes are delivered to every waiter on a key, so the error type
//! is `Clone` and carries rendered messages rather than source errors.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SymbolsError {
    /// Archive retrieval failed; fatal to the build
    #[error("fetch error: {0}")]
    Fetch(String),

    /// A single file failed to parse; the file is skipped
    #[error("parse error in {path}: {message}")]
    Parse { path: String, message: String },

    /// Index write or aggregation failed; fatal to the build
    #[error("build error: {0}")]
    Build(String),

    /// The build outlived the cache's background timeout and was abandoned
    #[error("index build for {0} timed out; retry the request")]
    CacheTimeout(String),

    /// Malformed search request, rejected before any index access
    #[error("invalid query: {0}")]
    QueryValidation(String),

    /// Checkout attempted after the parser pool was closed
    #[error("parser pool is closed")]
    PoolClosed,

    /// A remote symbols service failed or could not be reached
    #[error("symbols service error: {0}")]
    Remote(String),
}

impl SymbolsError {
    /// Whether the caller, not the service, is at fault
    pub fn is_client_error(&self) -> bool {
        matches!(self, SymbolsError::QueryValidation(_))
    }

    /// Whether re-issuing the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SymbolsError::CacheTimeout(_))
    }
}

impl From<rusqlite::Error> for SymbolsError {
    fn from(err: rusqlite::Error) -> Self {
        SymbolsError::Build(format!("index storage: {}", err))
    }
}

impl From<std::io::Error> for SymbolsError {
    fn from(err: std::io::Error) -> Self {
        SymbolsError::Build(format!("io: {}", err))
    }
}

impl From<regex::Error> for SymbolsError {
    fn from(err: regex::Error) -> Self {
        SymbolsError::QueryValidation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SymbolsError>;
