use crate::config::SyncOptions;
use crate::error::SyncError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use reqwest::header::{ACCEPT, CACHE_CONTROL, HeaderValue};
use std::fmt;
use std::pin::Pin;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, instrument};

pub const EVENTS_PATH: &str = "/api/v1/flags/events";
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Response body of an open events connection.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, SyncError>> + Send>>;

/// Opens connections to the change-notification stream.
#[async_trait]
pub trait EventSource: Send + Sync + fmt::Debug {
    /// Resolves once the server accepted the request; the returned stream
    /// yields the body as it arrives.
    async fn open(&self) -> Result<ByteStream, SyncError>;
}

#[derive(Debug)]
pub struct HttpEventSource {
    url: String,
    api_key: HeaderValue,
    client: Client,
}

impl HttpEventSource {
    pub fn new(options: &SyncOptions) -> Result<Self, SyncError> {
        let mut api_key = HeaderValue::from_str(&options.api_key)
            .map_err(|e| SyncError::Config(format!("invalid api key: {}", e)))?;
        api_key.set_sensitive(true);

        let client = Client::builder()
            .default_headers(options.headers.clone())
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: options.endpoint(EVENTS_PATH),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn open(&self) -> Result<ByteStream, SyncError> {
        let response = self
            .client
            .get(&self.url)
            .header(API_KEY_HEADER, self.api_key.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        let status = response.status();
        debug!(status = status.as_u16(), "Received events response");
        if status != StatusCode::OK {
            return Err(SyncError::Connection(format!(
                "events endpoint returned {}",
                status
            )));
        }

        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(SyncError::from)),
        ))
    }
}
