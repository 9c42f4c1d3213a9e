//! Real-time flag synchronization for OpenFeature
//!
//! Keeps a local copy of evaluated feature flags fresh by listening to a
//! server-sent change stream, falling back to periodic polling when the stream
//! keeps failing.
//!
//! # Overview
//!
//! * [`StreamingClient`] holds one `text/event-stream` connection to
//!   `/api/v1/flags/events` and reconnects with exponential backoff.
//! * [`SyncCoordinator`] owns readiness (`NOT_READY`, `READY`, `ERROR`,
//!   `STALE`), the in-memory [`TtlCache`] and an optional [`DurableStore`],
//!   and routes every change event to cache invalidation and a refresh.
//! * [`FallbackPoller`] refreshes on a fixed interval while the stream is down.
//! * [`FlagSyncProvider`] serves the cached values through the OpenFeature
//!   [`FeatureProvider`](open_feature::provider::FeatureProvider) trait.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use open_feature::EvaluationContext;
//! use open_feature::provider::FeatureProvider;
//! use open_feature_flag_sync::{FlagSyncProvider, SyncOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let context = EvaluationContext::default().with_targeting_key("user-123");
//!     let options = SyncOptions::new("https://flags.example.com", "sdk-key")
//!         .with_context(&context)
//!         .with_on_change(|event| println!("flag changed: {:?}", event.flag_key()));
//!
//!     let provider = FlagSyncProvider::new(options).await.unwrap();
//!
//!     let result = provider
//!         .resolve_bool_value("new-checkout", &EvaluationContext::default())
//!         .await;
//!     println!("Feature enabled: {}", result.unwrap().value);
//!
//!     provider.shutdown().await;
//! }
//! ```

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod model;
pub mod poller;
pub mod provider;
pub mod signals;
pub mod stream;

#[cfg(test)]
mod test_support;

pub use cache::{DurableStore, MemoryStore, NoopStore, TtlCache};
pub use config::{ChangeCallback, SyncOptions};
pub use coordinator::{SyncCoordinator, SyncCoordinatorBuilder};
pub use error::SyncError;
pub use fetcher::{FlagFetcher, HttpFlagFetcher};
pub use model::{ChangeEvent, ConnectionStatus, EvaluatedFlag, SyncEvent, SyncStatus};
pub use poller::FallbackPoller;
pub use provider::FlagSyncProvider;
pub use signals::{AlwaysOnline, AlwaysVisible, ConnectivitySource, HostSignal, VisibilitySource};
pub use stream::{EventSource, HttpEventSource, StreamNotification, StreamingClient};
