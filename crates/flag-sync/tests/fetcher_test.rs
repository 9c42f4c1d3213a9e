use open_feature_flag_sync::{FlagFetcher, HttpFlagFetcher, SyncError};
use serde_json::json;
use test_log::test;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;

use common::{API_KEY, BULK_PATH, bulk_response, options};

async fn respond_with(template: ResponseTemplate) -> (MockServer, HttpFlagFetcher) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(BULK_PATH))
        .respond_with(template)
        .mount(&server)
        .await;
    let fetcher = HttpFlagFetcher::new(&options(&server)).unwrap();
    (server, fetcher)
}

#[test(tokio::test)]
async fn test_fetch_all_posts_context_with_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(BULK_PATH))
        .and(header("X-API-Key", API_KEY))
        .and(body_json(json!({ "context": { "targetingKey": "user-1" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(bulk_response(true)))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = HttpFlagFetcher::new(&options(&server)).unwrap();
    let flags = fetcher.fetch_all().await.unwrap();

    // the entry carrying an error code is skipped
    assert_eq!(flags.len(), 2);
    assert_eq!(flags[0].key, "new-checkout");
    assert_eq!(flags[0].value, json!(true));
    assert_eq!(flags[0].variant.as_deref(), Some("on"));
    assert_eq!(flags[0].reason.as_deref(), Some("TARGETING_MATCH"));
    assert_eq!(flags[1].key, "banner-text");
    assert_eq!(flags[1].variant, None);
}

#[test(tokio::test)]
async fn test_unauthorized_is_invalid_credentials() {
    for status in [401u16, 403] {
        let (_server, fetcher) = respond_with(ResponseTemplate::new(status)).await;
        let err = fetcher.fetch_all().await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidCredentials(_)), "{status}: {err:?}");
        assert!(err.is_fatal());
    }
}

#[test(tokio::test)]
async fn test_not_found_means_no_flags() {
    let (_server, fetcher) = respond_with(ResponseTemplate::new(404)).await;
    assert!(fetcher.fetch_all().await.unwrap().is_empty());
}

#[test(tokio::test)]
async fn test_server_error_is_connection_error() {
    let (_server, fetcher) = respond_with(ResponseTemplate::new(503)).await;
    let err = fetcher.fetch_all().await.unwrap_err();
    assert!(matches!(err, SyncError::Connection(msg) if msg.contains("503")));
}

#[test(tokio::test)]
async fn test_invalid_body_is_parse_error() {
    let (_server, fetcher) =
        respond_with(ResponseTemplate::new(200).set_body_string("{not json")).await;
    let err = fetcher.fetch_all().await.unwrap_err();
    assert!(matches!(err, SyncError::Parse(_)));
}

#[test(tokio::test)]
async fn test_slow_server_times_out() {
    let (server, _) = respond_with(
        ResponseTemplate::new(200)
            .set_body_json(bulk_response(true))
            .set_delay(std::time::Duration::from_secs(5)),
    )
    .await;
    let mut options = options(&server);
    options.request_timeout = std::time::Duration::from_millis(100);
    let fetcher = HttpFlagFetcher::new(&options).unwrap();

    let err = fetcher.fetch_all().await.unwrap_err();
    assert!(matches!(err, SyncError::Connection(_)));
}

#[test(tokio::test)]
async fn test_unreachable_server_is_connection_error() {
    let server = MockServer::start().await;
    let mut options = options(&server);
    options.base_url = "http://127.0.0.1:1".to_string();
    let fetcher = HttpFlagFetcher::new(&options).unwrap();

    let err = fetcher.fetch_all().await.unwrap_err();
    assert!(matches!(err, SyncError::Connection(_)));
}
