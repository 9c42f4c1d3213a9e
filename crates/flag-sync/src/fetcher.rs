//! # Bulk Flag Fetcher
//!
//! The validation/refresh call: one POST evaluating every flag for the
//! configured context.
//!
//! | Status | Outcome |
//! |---|---|
//! | 2xx | parsed flags |
//! | 401, 403 | [`SyncError::InvalidCredentials`] |
//! | 404 | no flags configured yet, empty list |
//! | other | [`SyncError::Connection`] |

use crate::config::SyncOptions;
use crate::error::SyncError;
use crate::model::EvaluatedFlag;
use crate::stream::API_KEY_HEADER;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::HeaderValue;
use serde::Deserialize;
use std::fmt;
use tracing::{debug, error, instrument};

pub const BULK_EVALUATION_PATH: &str = "/ofrep/v1/evaluate/flags";

#[async_trait]
pub trait FlagFetcher: Send + Sync + fmt::Debug {
    async fn fetch_all(&self) -> Result<Vec<EvaluatedFlag>, SyncError>;
}

#[derive(Debug)]
pub struct HttpFlagFetcher {
    url: String,
    api_key: HeaderValue,
    context: serde_json::Value,
    client: Client,
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    flags: Vec<BulkEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkEntry {
    key: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
}

impl HttpFlagFetcher {
    pub fn new(options: &SyncOptions) -> Result<Self, SyncError> {
        let mut api_key = HeaderValue::from_str(&options.api_key)
            .map_err(|e| SyncError::Config(format!("invalid api key: {}", e)))?;
        api_key.set_sensitive(true);

        let client = Client::builder()
            .default_headers(options.headers.clone())
            .connect_timeout(options.connect_timeout)
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: options.endpoint(BULK_EVALUATION_PATH),
            api_key,
            context: options.context.clone(),
            client,
        })
    }
}

#[async_trait]
impl FlagFetcher for HttpFlagFetcher {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch_all(&self) -> Result<Vec<EvaluatedFlag>, SyncError> {
        debug!("Fetching flags");

        let payload = serde_json::json!({ "context": self.context });

        let response = self
            .client
            .post(&self.url)
            .header(API_KEY_HEADER, self.api_key.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to fetch flags");
                SyncError::Connection(e.to_string())
            })?;

        let status = response.status().as_u16();
        debug!(status, "Received response");

        if status == 401 || status == 403 {
            return Err(SyncError::InvalidCredentials(format!(
                "evaluation endpoint returned {}",
                status
            )));
        }

        if status == 404 {
            debug!("No flags configured");
            return Ok(Vec::new());
        }

        if !response.status().is_success() {
            return Err(SyncError::Connection(format!(
                "evaluation endpoint returned {}",
                status
            )));
        }

        let body = response.json::<BulkResponse>().await.map_err(|e| {
            error!(error = %e, "Failed to parse bulk evaluation response");
            SyncError::Parse(e.to_string())
        })?;

        let flags: Vec<EvaluatedFlag> = body
            .flags
            .into_iter()
            .filter_map(|entry| match (entry.error_code, entry.value) {
                (Some(code), _) => {
                    debug!(flag_key = %entry.key, error_code = %code, "Skipping flag that failed to evaluate");
                    None
                }
                (None, None) => {
                    debug!(flag_key = %entry.key, "Skipping flag without a value");
                    None
                }
                (None, Some(value)) => Some(EvaluatedFlag {
                    key: entry.key,
                    value,
                    variant: entry.variant,
                    reason: entry.reason,
                }),
            })
            .collect();

        debug!(count = flags.len(), "Flags fetched");
        Ok(flags)
    }
}
