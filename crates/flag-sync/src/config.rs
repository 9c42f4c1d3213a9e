//! # Synchronization Options
//!
//! Every field has a default, most of which can be overridden from the
//! environment:
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `FLAG_SYNC_BASE_URL` | `base_url` | `http://localhost:8016` |
//! | `FLAG_SYNC_API_KEY` | `api_key` | empty |
//! | `FLAG_SYNC_CACHE_TTL` | `cache_ttl` (seconds) | 60 |
//! | `FLAG_SYNC_RETRY_BACKOFF_MS` | `initial_retry_delay` | 1000 |
//! | `FLAG_SYNC_RETRY_BACKOFF_MAX_MS` | `max_retry_delay` | 30000 |
//! | `FLAG_SYNC_MAX_RETRIES` | `max_retries` | 3 |
//! | `FLAG_SYNC_POLLING_FALLBACK` | `polling_fallback` | true |
//! | `FLAG_SYNC_POLLING_INTERVAL_MS` | `polling_interval` | 30000 |
//! | `FLAG_SYNC_OFFLINE_AWARE` | `offline_aware` | true |
//! | `FLAG_SYNC_STREAMING` | `streaming` | true |

use crate::error::SyncError;
use crate::model::ChangeEvent;
use crate::provider::context_to_json;
use open_feature::EvaluationContext;
use reqwest::header::HeaderMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "http://localhost:8016";
const DEFAULT_CACHE_TTL_SECS: u64 = 60;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
const DEFAULT_RETRY_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_POLLING_INTERVAL_MS: u64 = 30_000;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Called with every change event received from the stream.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Clone)]
pub struct SyncOptions {
    pub base_url: String,
    pub api_key: String,
    /// Extra headers (telemetry, user agent) sent with every request.
    pub headers: HeaderMap,
    /// Evaluation context posted with each bulk evaluation.
    pub context: serde_json::Value,
    pub cache_ttl: Duration,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Consecutive stream failures before polling takes over.
    pub max_retries: u32,
    pub polling_fallback: bool,
    pub polling_interval: Duration,
    /// Pause all network activity while the host reports being offline.
    pub offline_aware: bool,
    /// Open the events stream. When disabled only polling keeps flags fresh.
    pub streaming: bool,
    /// Applies to establishing the events connection, not to the body.
    pub connect_timeout: Duration,
    /// Applies to each bulk evaluation call as a whole.
    pub request_timeout: Duration,
    pub on_change: Option<ChangeCallback>,
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("headers", &self.headers)
            .field("context", &self.context)
            .field("cache_ttl", &self.cache_ttl)
            .field("initial_retry_delay", &self.initial_retry_delay)
            .field("max_retry_delay", &self.max_retry_delay)
            .field("max_retries", &self.max_retries)
            .field("polling_fallback", &self.polling_fallback)
            .field("polling_interval", &self.polling_interval)
            .field("offline_aware", &self.offline_aware)
            .field("streaming", &self.streaming)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("on_change", &self.on_change.is_some())
            .finish()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_millis(name: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(name).unwrap_or(default))
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            base_url: std::env::var("FLAG_SYNC_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            api_key: std::env::var("FLAG_SYNC_API_KEY").unwrap_or_default(),
            headers: HeaderMap::new(),
            context: serde_json::Value::Object(serde_json::Map::new()),
            cache_ttl: Duration::from_secs(
                env_parse("FLAG_SYNC_CACHE_TTL").unwrap_or(DEFAULT_CACHE_TTL_SECS),
            ),
            initial_retry_delay: env_millis("FLAG_SYNC_RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS),
            max_retry_delay: env_millis(
                "FLAG_SYNC_RETRY_BACKOFF_MAX_MS",
                DEFAULT_RETRY_BACKOFF_MAX_MS,
            ),
            max_retries: env_parse("FLAG_SYNC_MAX_RETRIES").unwrap_or(DEFAULT_MAX_RETRIES),
            polling_fallback: env_parse("FLAG_SYNC_POLLING_FALLBACK").unwrap_or(true),
            polling_interval: env_millis(
                "FLAG_SYNC_POLLING_INTERVAL_MS",
                DEFAULT_POLLING_INTERVAL_MS,
            ),
            offline_aware: env_parse("FLAG_SYNC_OFFLINE_AWARE").unwrap_or(true),
            streaming: env_parse("FLAG_SYNC_STREAMING").unwrap_or(true),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            on_change: None,
        }
    }
}

impl SyncOptions {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn with_on_change(mut self, callback: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(callback));
        self
    }

    /// Evaluation context sent with every bulk evaluation.
    pub fn with_context(mut self, context: &EvaluationContext) -> Self {
        self.context = context_to_json(context);
        self
    }

    /// Base URL without a trailing slash, ready for path concatenation.
    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let url = url::Url::parse(&self.base_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::Config(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(SyncError::Config("api key must not be empty".to_string()));
        }
        if self.cache_ttl.is_zero() {
            return Err(SyncError::Config("cache ttl must be positive".to_string()));
        }
        if self.polling_interval.is_zero() {
            return Err(SyncError::Config(
                "polling interval must be positive".to_string(),
            ));
        }
        if self.initial_retry_delay.is_zero() {
            return Err(SyncError::Config(
                "initial retry delay must be positive".to_string(),
            ));
        }
        if self.max_retry_delay < self.initial_retry_delay {
            return Err(SyncError::Config(
                "max retry delay must not be below the initial retry delay".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(SyncError::Config("max retries must be at least 1".to_string()));
        }
        Ok(())
    }
}
