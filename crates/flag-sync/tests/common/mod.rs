#![allow(dead_code)]

use open_feature_flag_sync::SyncOptions;
use reqwest::header::HeaderMap;
use serde_json::json;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use wiremock::MockServer;

pub const API_KEY: &str = "test-api-key";
pub const BULK_PATH: &str = "/ofrep/v1/evaluate/flags";
pub const EVENTS_PATH: &str = "/api/v1/flags/events";

pub const FLAG_UPDATED: &str = "event: flag-updated\n\
data: {\"flagKey\":\"new-checkout\",\"timestamp\":\"2025-01-01T00:00:00Z\"}\n\n";

/// Options with short delays, pointed at `server`.
pub fn options(server: &MockServer) -> SyncOptions {
    SyncOptions {
        base_url: server.uri(),
        api_key: API_KEY.to_string(),
        headers: HeaderMap::new(),
        context: json!({ "targetingKey": "user-1" }),
        cache_ttl: Duration::from_secs(60),
        initial_retry_delay: Duration::from_millis(50),
        max_retry_delay: Duration::from_millis(200),
        max_retries: 2,
        polling_fallback: true,
        polling_interval: Duration::from_millis(100),
        offline_aware: false,
        streaming: true,
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        on_change: None,
    }
}

pub fn bulk_response(checkout_enabled: bool) -> serde_json::Value {
    json!({
        "flags": [
            {
                "key": "new-checkout",
                "value": checkout_enabled,
                "variant": if checkout_enabled { "on" } else { "off" },
                "reason": "TARGETING_MATCH"
            },
            {
                "key": "banner-text",
                "value": "Welcome back",
                "reason": "STATIC"
            },
            {
                "key": "broken-flag",
                "errorCode": "PARSE_ERROR",
                "errorDetails": "invalid targeting rule"
            }
        ]
    })
}

/// Number of requests `server` received for `path`.
pub async fn requests_to(server: &MockServer, path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == path)
        .count()
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}
