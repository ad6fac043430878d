//! End-to-end tests of the search endpoint
//!
//! Every test runs a real server on an ephemeral port. The fixture is one
//! file, `a.js` containing `var x = 1`, which the mock parser turns into
//! the symbols `x` and `y`.

mod test_helpers;

use std::time::Duration;

use symdex::models::CacheState;
use symdex::{ArchiveEntry, SearchQuery, SymbolsError};
use test_helpers::*;

fn query() -> SearchQuery {
    SearchQuery::new("acme/web", "abc123")
}

#[tokio::test]
async fn test_simple() {
    let server = spawn_server(MemoryFetcher::new(fixture_files())).await;

    let results = server
        .client
        .search(&SearchQuery {
            max_results: Some(10),
            ..query()
        })
        .await
        .unwrap();

    assert_eq!(names(&results), vec!["x", "y"]);
    assert_eq!(results[0].file_path, "a.js");
    assert_eq!(results[0].line, 1);
}

#[tokio::test]
async fn test_one_match() {
    let server = spawn_server(MemoryFetcher::new(fixture_files())).await;

    let results = server
        .client
        .search(&SearchQuery {
            name_pattern: "x".into(),
            max_results: Some(10),
            ..query()
        })
        .await
        .unwrap();

    assert_eq!(names(&results), vec!["x"]);
}

#[tokio::test]
async fn test_no_matches() {
    let server = spawn_server(MemoryFetcher::new(fixture_files())).await;

    let results = server
        .client
        .search(&SearchQuery {
            name_pattern: "foo".into(),
            ..query()
        })
        .await
        .unwrap();

    assert!(results.is_empty());
}

#[tokio::test]
async fn test_exact_name_case_sensitivity() {
    let server = spawn_server(MemoryFetcher::new(fixture_files())).await;

    let insensitive = SearchQuery {
        name_pattern: "^X$".into(),
        ..query()
    };
    assert_eq!(names(&server.client.search(&insensitive).await.unwrap()), vec!["x"]);

    let sensitive = SearchQuery {
        is_case_sensitive: true,
        ..insensitive
    };
    assert!(server.client.search(&sensitive).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_include_path_case_sensitivity() {
    let server = spawn_server(MemoryFetcher::new(fixture_files())).await;

    let insensitive = SearchQuery {
        include_path_patterns: vec!["^A.js$".into()],
        ..query()
    };
    assert_eq!(
        names(&server.client.search(&insensitive).await.unwrap()),
        vec!["x", "y"]
    );

    let sensitive = SearchQuery {
        is_case_sensitive: true,
        ..insensitive
    };
    assert!(server.client.search(&sensitive).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_exclude_path() {
    let server = spawn_server(MemoryFetcher::new(fixture_files())).await;

    let results = server
        .client
        .search(&SearchQuery {
            exclude_path_pattern: Some("a.js".into()),
            is_case_sensitive: true,
            ..query()
        })
        .await
        .unwrap();

    assert!(results.is_empty());
}

#[tokio::test]
async fn test_ordering_and_max_results() {
    let files = vec![
        ArchiveEntry::file("src/z.js", "var x = 1"),
        ArchiveEntry::file("a.js", "var x = 1"),
        ArchiveEntry::file("lib/m.js", "var x = 1"),
        ArchiveEntry::file("README.md", "# not parsed"),
    ];
    let server = spawn_server(MemoryFetcher::new(files)).await;

    let results = server.client.search(&query()).await.unwrap();
    let order: Vec<(&str, &str)> = results
        .iter()
        .map(|s| (s.file_path.as_str(), s.name.as_str()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("a.js", "x"),
            ("a.js", "y"),
            ("lib/m.js", "x"),
            ("lib/m.js", "y"),
            ("src/z.js", "x"),
            ("src/z.js", "y"),
        ]
    );

    for limit in [0, 1, 3, 6, 50] {
        let results = server
            .client
            .search(&SearchQuery {
                max_results: Some(limit),
                ..query()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), limit.min(6), "maxResults {}", limit);
    }

    assert_eq!(server.fetcher.fetch_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_build() {
    let fetcher = MemoryFetcher::new(fixture_files()).with_delay(Duration::from_millis(200));
    let server = spawn_server(fetcher).await;

    let requests = (0..8).map(|_| {
        let client = server.client.clone();
        tokio::spawn(async move { client.search(&query()).await })
    });
    for handle in futures::future::join_all(requests).await {
        assert_eq!(names(&handle.unwrap().unwrap()), vec!["x", "y"]);
    }

    assert_eq!(server.fetcher.fetch_count(), 1);
    assert_eq!(server.parser_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_different_revisions_build_separately() {
    let server = spawn_server(MemoryFetcher::new(fixture_files())).await;

    server.client.search(&query()).await.unwrap();
    server
        .client
        .search(&SearchQuery::new("acme/web", "def456"))
        .await
        .unwrap();
    server.client.search(&query()).await.unwrap();

    assert_eq!(server.fetcher.fetch_count(), 2);
}

#[tokio::test]
async fn test_invalid_pattern_is_client_error() {
    let server = spawn_server(MemoryFetcher::new(fixture_files())).await;

    let err = server
        .client
        .search(&SearchQuery {
            name_pattern: "(".into(),
            ..query()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SymbolsError::QueryValidation(_)), "got {:?}", err);

    // Rejected before any fetch
    assert_eq!(server.fetcher.fetch_count(), 0);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let server = spawn_server(MemoryFetcher::new(fixture_files())).await;

    let response = reqwest::Client::new()
        .post(format!("{}/search", server.base_url))
        .header("content-type", "application/json")
        .body("{\"repositoryName\": 42")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_fetch_failure_is_server_error_and_retried() {
    let server = spawn_server(MemoryFetcher::new(fixture_files())).await;
    let missing = SearchQuery::new("acme/web", "missing");

    let err = server.client.search(&missing).await.unwrap_err();
    assert!(matches!(err, SymbolsError::Remote(_)), "got {:?}", err);

    // Failures are not cached; the next request fetches again
    server.client.search(&missing).await.unwrap_err();
    assert_eq!(server.fetcher.fetch_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_timeout_leaves_build_running() {
    let fetcher = MemoryFetcher::new(fixture_files()).with_delay(Duration::from_millis(300));
    let server = spawn_server_with_timeout(fetcher, Duration::from_millis(50)).await;

    let err = server.client.search(&query()).await.unwrap_err();
    assert!(matches!(err, SymbolsError::CacheTimeout(_)), "got {:?}", err);

    let status = server.client.status("acme/web", "abc123").await.unwrap().unwrap();
    assert_eq!(status.state, CacheState::Building);
    assert!(status.build_started_at.is_some());

    // The build outlives the request; a later retry reads its index
    tokio::time::sleep(Duration::from_millis(500)).await;
    let results = server.client.search(&query()).await.unwrap();
    assert_eq!(names(&results), vec!["x", "y"]);
    assert_eq!(server.fetcher.fetch_count(), 1);
}

#[tokio::test]
async fn test_status_endpoint() {
    let server = spawn_server(MemoryFetcher::new(fixture_files())).await;
    assert!(server.client.status("acme/web", "abc123").await.unwrap().is_none());

    server.client.search(&query()).await.unwrap();
    let status = server.client.status("acme/web", "abc123").await.unwrap().unwrap();
    assert_eq!(status.state, CacheState::Ready);
    assert_eq!(status.key.repo, "acme/web");

    let missing = SearchQuery::new("acme/web", "missing");
    server.client.search(&missing).await.unwrap_err();
    let status = server.client.status("acme/web", "missing").await.unwrap().unwrap();
    assert_eq!(status.state, CacheState::Failed);
}

#[tokio::test]
async fn test_status_requires_key() {
    let server = spawn_server(MemoryFetcher::new(fixture_files())).await;

    let response = reqwest::Client::new()
        .get(format!("{}/status?repositoryName=acme/web", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health() {
    let server = spawn_server(MemoryFetcher::new(fixture_files())).await;
    assert!(server.client.health().await.unwrap());

    server.client.search(&query()).await.unwrap();
    server
        .client
        .search(&SearchQuery::new("acme/web", "missing"))
        .await
        .unwrap_err();

    let activity = server.client.activity().await.unwrap();
    assert_eq!(activity.builds.succeeded, 1);
    assert_eq!(activity.builds.failed, 1);
    assert_eq!(activity.builds.running, 0);
    assert_eq!(activity.fetches_running, 0);
    assert_eq!(activity.fetches_queued, 0);
    assert_eq!(activity.parser_capacity, 2);
}
