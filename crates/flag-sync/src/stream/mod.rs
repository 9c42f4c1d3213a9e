//! # Streaming Change-Notification Client
//!
//! Keeps one long-lived connection to the events endpoint open, turns the
//! framed events into [`ChangeEvent`]s and reconnects with exponential backoff
//! when the connection fails or ends.
//!
//! ## States
//!
//! ```text
//! disconnected -> connecting -> connected
//!                     ^             |
//!                     |  (backoff)  v
//!                     +--------- error
//! ```
//!
//! `close()` ends in `disconnected` for good. `pause()` also moves to
//! `disconnected` but `resume()` reconnects with a fresh backoff.
//!
//! Every attempt owns a [`CancellationToken`]. Starting a new attempt, pausing
//! or closing cancels the previous token under the state lock, so at most one
//! connection is live and nothing is dispatched from a superseded one.
//!
//! Notifications are delivered in order on the channel returned by
//! [`StreamingClient::new`].

mod parser;
mod retry;
mod source;

pub use parser::{EventStreamParser, RawEvent, StreamMessage};
pub use retry::RetryState;
pub use source::{API_KEY_HEADER, ByteStream, EVENTS_PATH, EventSource, HttpEventSource};

use crate::config::SyncOptions;
use crate::model::{ChangeEvent, ConnectionStatus};
use crate::signals::VisibilitySource;
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// What the streaming client reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamNotification {
    StatusChanged(ConnectionStatus),
    /// A connection attempt failed or an open connection dropped.
    /// `retry_count` is the number of consecutive failures so far.
    Failed { retry_count: u32 },
    Change(ChangeEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            initial_retry_delay: Duration::from_millis(1_000),
            max_retry_delay: Duration::from_millis(30_000),
        }
    }
}

impl From<&SyncOptions> for StreamOptions {
    fn from(options: &SyncOptions) -> Self {
        Self {
            initial_retry_delay: options.initial_retry_delay,
            max_retry_delay: options.max_retry_delay,
        }
    }
}

#[derive(Debug)]
struct ConnectionState {
    status: ConnectionStatus,
    retry: RetryState,
    closed: bool,
    paused: bool,
    /// Token of the in-flight connection or of the pending reconnect timer.
    attempt: Option<CancellationToken>,
    attempts: u64,
}

struct Inner {
    source: Arc<dyn EventSource>,
    visibility: Arc<dyn VisibilitySource>,
    state: Mutex<ConnectionState>,
    notifications: UnboundedSender<StreamNotification>,
    /// Cancelled by `close()`; parent of every attempt token.
    lifetime: CancellationToken,
    watching_visibility: AtomicBool,
}

#[derive(Clone)]
pub struct StreamingClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for StreamingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("StreamingClient")
            .field("source", &self.inner.source)
            .field("status", &state.status)
            .field("retry", &state.retry)
            .field("closed", &state.closed)
            .field("paused", &state.paused)
            .finish()
    }
}

impl StreamingClient {
    pub fn new(
        source: Arc<dyn EventSource>,
        visibility: Arc<dyn VisibilitySource>,
        options: StreamOptions,
    ) -> (Self, UnboundedReceiver<StreamNotification>) {
        let (notifications, receiver) = unbounded_channel();
        let inner = Inner {
            source,
            visibility,
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Disconnected,
                retry: RetryState::new(options.initial_retry_delay, options.max_retry_delay),
                closed: false,
                paused: false,
                attempt: None,
                attempts: 0,
            }),
            notifications,
            lifetime: CancellationToken::new(),
            watching_visibility: AtomicBool::new(false),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.state.lock().retry.retry_count()
    }

    /// Delay that will be applied after the next failure.
    pub fn current_retry_delay(&self) -> Duration {
        self.inner.state.lock().retry.current_delay()
    }

    /// Number of connection attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.inner.state.lock().attempts
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Starts a connection attempt, replacing any previous one.
    ///
    /// Does nothing once closed or while paused. The status is `connecting`
    /// when this returns. Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Drops the connection without scheduling a reconnect.
    pub fn pause(&self) {
        self.inner.pause();
    }

    /// Reconnects after `pause()` with the retry delay back at its minimum.
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Tears everything down. The client never reconnects afterwards.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn reset_retry_count(&self) {
        self.inner.state.lock().retry.reset_count();
    }
}

impl Inner {
    fn notify(&self, notification: StreamNotification) {
        // The owner may have gone away; the client keeps its own state.
        let _ = self.notifications.send(notification);
    }

    fn set_status(&self, state: &mut ConnectionState, status: ConnectionStatus) {
        if state.status == status {
            return;
        }
        debug!(from = %state.status, to = %status, "Connection status changed");
        state.status = status;
        self.notify(StreamNotification::StatusChanged(status));
    }

    fn connect(self: &Arc<Self>) {
        let state = self.state.lock();
        self.start_attempt(state);
    }

    /// Reconnect requested by the backoff timer owning `expected`.
    fn reconnect(self: &Arc<Self>, expected: &CancellationToken) {
        let state = self.state.lock();
        if expected.is_cancelled() {
            return;
        }
        self.start_attempt(state);
    }

    fn start_attempt(self: &Arc<Self>, mut state: MutexGuard<'_, ConnectionState>) {
        if state.closed || state.paused {
            debug!(
                closed = state.closed,
                paused = state.paused,
                "Ignoring connect request"
            );
            return;
        }
        if let Some(previous) = state.attempt.take() {
            previous.cancel();
        }

        let token = self.lifetime.child_token();
        state.attempt = Some(token.clone());
        state.attempts += 1;
        self.set_status(&mut state, ConnectionStatus::Connecting);
        drop(state);

        self.watch_visibility();

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run(token).await });
    }

    fn pause(&self) {
        let mut state = self.state.lock();
        if state.closed || state.paused {
            return;
        }
        debug!("Pausing events stream");
        state.paused = true;
        if let Some(attempt) = state.attempt.take() {
            attempt.cancel();
        }
        self.set_status(&mut state, ConnectionStatus::Disconnected);
    }

    fn resume(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.closed || !state.paused {
            return;
        }
        debug!("Resuming events stream");
        state.paused = false;
        state.retry.reset();
        self.start_attempt(state);
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        debug!("Closing events stream");
        state.closed = true;
        state.paused = false;
        if let Some(attempt) = state.attempt.take() {
            attempt.cancel();
        }
        self.lifetime.cancel();
        self.set_status(&mut state, ConnectionStatus::Disconnected);
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            opened = self.source.open() => opened,
        };

        let mut body = match opened {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to open events stream");
                self.handle_failure(&token);
                return;
            }
        };

        if !self.handle_open(&token) {
            return;
        }

        let mut parser = EventStreamParser::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    for raw in parser.feed(&bytes) {
                        if !self.dispatch(&token, &raw) {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Events stream read failed");
                    break;
                }
                None => {
                    debug!("Events stream ended");
                    break;
                }
            }
        }

        self.handle_failure(&token);
    }

    fn handle_open(&self, token: &CancellationToken) -> bool {
        let mut state = self.state.lock();
        if token.is_cancelled() {
            return false;
        }
        state.retry.reset();
        self.set_status(&mut state, ConnectionStatus::Connected);
        true
    }

    /// Handles one framed event. Returns `false` once the connection has
    /// been cancelled and nothing more may be dispatched from it.
    fn dispatch(&self, token: &CancellationToken, raw: &RawEvent) -> bool {
        if token.is_cancelled() {
            return false;
        }

        let message = match StreamMessage::from_raw(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(event_type = %raw.event_type, error = %e, "Dropping malformed event");
                return true;
            }
        };

        match message {
            StreamMessage::Heartbeat => trace!("Heartbeat received"),
            StreamMessage::ApiKeyRotated {
                valid_until,
                timestamp,
            } => {
                warn!(%valid_until, %timestamp, "API key rotated, the current key stops working at valid_until");
            }
            StreamMessage::Unknown(event_type) => {
                debug!(%event_type, "Ignoring unknown event type");
            }
            StreamMessage::Change(event) => {
                let _state = self.state.lock();
                if token.is_cancelled() {
                    return false;
                }
                let lag_ms = event
                    .parsed_timestamp()
                    .map(|sent| (Utc::now() - sent.with_timezone(&Utc)).num_milliseconds());
                debug!(flag_key = ?event.flag_key(), timestamp = %event.timestamp(), ?lag_ms, "Change event received");
                self.notify(StreamNotification::Change(event));
            }
        }
        true
    }

    fn handle_failure(self: &Arc<Self>, token: &CancellationToken) {
        let mut state = self.state.lock();
        if token.is_cancelled() {
            return;
        }

        self.set_status(&mut state, ConnectionStatus::Error);
        let delay = state.retry.record_failure();
        let retry_count = state.retry.retry_count();
        warn!(
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "Events stream failed, scheduling reconnect"
        );
        self.notify(StreamNotification::Failed { retry_count });
        drop(state);

        let inner = Arc::clone(self);
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = sleep(delay) => inner.reconnect(&token),
            }
        });
    }

    fn watch_visibility(self: &Arc<Self>) {
        if self.watching_visibility.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut visible) = self.visibility.subscribe() else {
            return;
        };

        let inner: Weak<Inner> = Arc::downgrade(self);
        let lifetime = self.lifetime.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = lifetime.cancelled() => break,
                    changed = visible.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let is_visible = *visible.borrow_and_update();
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if is_visible {
                    inner.resume();
                } else {
                    inner.pause();
                }
            }
        });
    }
}
