//! HTTP client for a running symbols service

use serde::Deserialize;

use crate::activity::ActivitySnapshot;
use crate::error::{Result, SymbolsError};
use crate::models::{CacheEntry, SearchQuery, SymbolEntry};
use crate::server::HealthReport;

/// Error body returned by the server
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Client for `POST /search`, `GET /status` and `GET /health`
#[derive(Debug, Clone)]
pub struct SymbolsClient {
    client: reqwest::Client,
    base_url: String,
}

impl SymbolsClient {
    /// `base_url` is e.g. `http://127.0.0.1:3184`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run a search on the server
    ///
    /// 4xx responses become `QueryValidation`, 503/504 become the retryable
    /// `CacheTimeout`, anything else that is not a success is `Remote`.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SymbolEntry>> {
        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(query)
            .send()
            .await
            .map_err(|e| SymbolsError::Remote(format!("failed to send search request: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| SymbolsError::Remote(format!("failed to decode search response: {}", e)));
        }

        let message = error_message(response).await;
        Err(match status.as_u16() {
            400..=499 => SymbolsError::QueryValidation(message),
            503 | 504 => SymbolsError::CacheTimeout(message),
            _ => SymbolsError::Remote(format!("{}: {}", status, message)),
        })
    }

    /// Cache state of one index as the server sees it, `None` if nothing is cached
    pub async fn status(&self, repo: &str, revision: &str) -> Result<Option<CacheEntry>> {
        let response = self
            .client
            .get(format!("{}/status", self.base_url))
            .query(&[("repositoryName", repo), ("revisionID", revision)])
            .send()
            .await
            .map_err(|e| SymbolsError::Remote(format!("failed to reach server: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = error_message(response).await;
            return Err(SymbolsError::Remote(format!("{}: {}", status, message)));
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| SymbolsError::Remote(format!("failed to decode status response: {}", e)))
    }

    /// Whether the server answers its health check
    pub async fn health(&self) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| SymbolsError::Remote(format!("failed to reach server: {}", e)))?;
        Ok(response.status().is_success())
    }

    /// Fetch, build and parser activity reported by the health check
    pub async fn activity(&self) -> Result<ActivitySnapshot> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| SymbolsError::Remote(format!("failed to reach server: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SymbolsError::Remote(format!("health check returned {}", status)));
        }
        let report: HealthReport = response
            .json()
            .await
            .map_err(|e| SymbolsError::Remote(format!("failed to decode health response: {}", e)))?;
        Ok(report.activity)
    }
}

/// The `error` field of a JSON error body, or the raw text
async fn error_message(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalised() {
        let client = SymbolsClient::new("http://localhost:3184/");
        assert_eq!(client.base_url(), "http://localhost:3184");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_remote_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = SymbolsClient::new(format!("http://127.0.0.1:{}", port));
        let err = client.search(&SearchQuery::new("r", "c")).await.unwrap_err();
        assert!(matches!(err, SymbolsError::Remote(_)));
    }
}
