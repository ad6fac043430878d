//! HTTP API
//!
//! Endpoints:
//! - `POST /search`: JSON `SearchQuery` body, JSON array of `SymbolEntry`
//! - `GET /status?repositoryName=..&revisionID=..`: cache state of one index
//! - `GET /health`: liveness plus fetch, build and parser activity
//!
//! Handlers only decode, delegate to the `Searcher` and map errors to
//! status codes.

use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::{Any, CorsLayer};

use crate::activity::ActivitySnapshot;
use crate::cache::DiskCache;
use crate::config::ServiceConfig;
use crate::error::SymbolsError;
use crate::fetcher::RevisionFetcher;
use crate::git::GitArchiveFetcher;
use crate::indexer::Indexer;
use crate::models::{CacheEntry, SearchQuery, SymbolEntry};
use crate::parser_pool::ParserPool;
use crate::parsers::{ParserFactory, TreeSitterParserFactory};
use crate::query::Searcher;

/// State shared by every request
#[derive(Clone)]
pub struct AppState {
    pub searcher: Searcher,
    pub request_timeout: Duration,
}

/// Error response: status code plus a JSON `{"error": ...}` body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<SymbolsError> for ApiError {
    fn from(err: SymbolsError) -> Self {
        Self::new(status_for(&err), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

/// `GET /status` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusParams {
    pub repository_name: String,
    #[serde(rename = "revisionID", alias = "revisionId")]
    pub revision_id: String,
}

/// `GET /health` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub activity: ActivitySnapshot,
}

/// HTTP status for a failed search
pub fn status_for(err: &SymbolsError) -> StatusCode {
    if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else if err.is_retryable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Wire the searcher with its cache, indexer and parser pool
///
/// The parse-slot semaphore created here is the one process-wide limit
/// shared by every build this searcher starts.
pub fn build_searcher(
    config: &ServiceConfig,
    fetcher: Arc<dyn RevisionFetcher>,
    factory: Arc<dyn ParserFactory>,
) -> Result<Searcher> {
    let cache = DiskCache::open(
        &config.cache.dir,
        &config.cache.component,
        config.cache.background_timeout(),
    )
    .with_context(|| format!("Failed to open cache at {}", config.cache.dir.display()))?;

    let pool = ParserPool::new(factory, config.indexer.parser_pool_size);
    let parse_slots = Arc::new(Semaphore::new(config.indexer.max_concurrent_parses));
    let indexer = Indexer::new(pool, parse_slots, &config.indexer);

    Ok(Searcher::new(
        cache,
        fetcher,
        indexer,
        config.cache.component.clone(),
        config.server.default_max_results,
    )
    .with_fetch_limit(config.indexer.max_concurrent_fetches))
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search", post(handle_search))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(Arc::new(state))
}

async fn handle_search(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<SearchQuery>, JsonRejection>,
) -> std::result::Result<Json<Vec<SymbolEntry>>, ApiError> {
    let Json(query) = body.map_err(|rejection| {
        log::info!("Rejected search request: {}", rejection.body_text());
        ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text())
    })?;

    let started = Instant::now();
    log::info!(
        "POST /search repo={} rev={} name={:?} case_sensitive={}",
        query.repository_name,
        query.revision_id,
        query.name_pattern,
        query.is_case_sensitive
    );

    // Timing out only drops this request; the build keeps running
    let outcome = tokio::time::timeout(state.request_timeout, state.searcher.search(&query)).await;
    match outcome {
        Ok(Ok(results)) => {
            log::info!(
                "POST /search {}@{}: {} results in {:.2?}",
                query.repository_name,
                query.revision_id,
                results.len(),
                started.elapsed()
            );
            Ok(Json(results))
        }
        Ok(Err(err)) => {
            if err.is_client_error() {
                log::info!("POST /search rejected: {}", err);
            } else {
                log::error!("POST /search failed: {}", err);
            }
            Err(err.into())
        }
        Err(_) => {
            log::error!(
                "POST /search {}@{} exceeded request timeout of {:?}",
                query.repository_name,
                query.revision_id,
                state.request_timeout
            );
            Err(ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "search timed out; the index may still be building, retry later",
            ))
        }
    }
}

async fn handle_status(
    State(state): State<Arc<AppState>>,
    params: std::result::Result<Query<StatusParams>, QueryRejection>,
) -> std::result::Result<Json<CacheEntry>, ApiError> {
    let Query(params) =
        params.map_err(|rejection| ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text()))?;
    log::debug!("GET /status {}@{}", params.repository_name, params.revision_id);
    let key = state.searcher.key(&params.repository_name, &params.revision_id);

    state.searcher.cache().status(&key).map(Json).ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            format!("no index cached for {}@{}", params.repository_name, params.revision_id),
        )
    })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok".to_string(),
        activity: state.searcher.activity(),
    })
}

/// Bind the listener for `config`
pub async fn bind(config: &ServiceConfig) -> Result<TcpListener> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))
}

/// Serve `state` on `listener` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    log::info!("Server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")
}

/// Run the service with the git fetcher and tree-sitter parsers
pub async fn run(config: ServiceConfig) -> Result<()> {
    let fetcher = Arc::new(GitArchiveFetcher::from_config(&config));
    let searcher = build_searcher(&config, fetcher, Arc::new(TreeSitterParserFactory))?;

    let janitor = searcher.cache().spawn_janitor(
        Duration::from_secs(config.cache.evict_interval_secs.max(1)),
        config.cache.max_size_bytes(),
        config.cache.max_age(),
    );

    let listener = bind(&config).await?;
    let state = AppState {
        searcher: searcher.clone(),
        request_timeout: config.server.request_timeout(),
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Shutdown signal received");
    };

    let served = serve(listener, state, shutdown).await;

    janitor.abort();
    searcher.indexer().pool().close_all();
    served
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&SymbolsError::QueryValidation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&SymbolsError::CacheTimeout("k".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&SymbolsError::Fetch("gone".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&SymbolsError::Build("disk full".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_build_searcher_opens_cache() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = ServiceConfig::default();
        config.cache.dir = temp.path().to_path_buf();
        config.git.repos_dir = temp.path().join("repos");

        let fetcher = Arc::new(GitArchiveFetcher::from_config(&config));
        let searcher = build_searcher(&config, fetcher, Arc::new(TreeSitterParserFactory)).unwrap();
        assert_eq!(searcher.cache().dir(), temp.path().join("symbols"));
        assert_eq!(
            searcher.indexer().pool().stats().capacity,
            config.indexer.parser_pool_size
        );
    }
}
