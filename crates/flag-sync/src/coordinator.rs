//! # Synchronization Coordinator
//!
//! Owns readiness, the flag caches and the choice of refresh mechanism.
//!
//! ## Status
//!
//! * `NOT_READY` - before `initialize()` and after `shutdown()`
//! * `READY` - flags loaded and the refresh channel is healthy
//! * `ERROR` - initialization failed
//! * `STALE` - the events stream is down or the host is offline; cached
//!   values are still served
//!
//! Stream failures move `READY` to `STALE`. Once `max_retries` consecutive
//! failures are seen the polling fallback starts; the next successful stream
//! connection stops it and returns to `READY`.

use crate::cache::{DurableStore, NoopStore, TtlCache};
use crate::config::SyncOptions;
use crate::error::SyncError;
use crate::fetcher::{FlagFetcher, HttpFlagFetcher};
use crate::model::{ChangeEvent, ConnectionStatus, EvaluatedFlag, SyncEvent, SyncStatus};
use crate::poller::{FallbackPoller, PollAction};
use crate::signals::{AlwaysOnline, AlwaysVisible, ConnectivitySource, VisibilitySource};
use crate::stream::{
    EventSource, HttpEventSource, StreamNotification, StreamOptions, StreamingClient,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Collaborators of a [`SyncCoordinator`]. Anything left unset falls back to
/// the HTTP implementations, no durable store and no host signals.
pub struct SyncCoordinatorBuilder {
    options: SyncOptions,
    event_source: Option<Arc<dyn EventSource>>,
    fetcher: Option<Arc<dyn FlagFetcher>>,
    durable: Arc<dyn DurableStore>,
    visibility: Arc<dyn VisibilitySource>,
    connectivity: Arc<dyn ConnectivitySource>,
}

impl SyncCoordinatorBuilder {
    pub fn event_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.event_source = Some(source);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn FlagFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = store;
        self
    }

    pub fn visibility(mut self, visibility: Arc<dyn VisibilitySource>) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivitySource>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn build(self) -> Result<SyncCoordinator, SyncError> {
        self.options.validate()?;

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFlagFetcher::new(&self.options)?),
        };

        let (stream, notifications) = if self.options.streaming {
            let source = match self.event_source {
                Some(source) => source,
                None => Arc::new(HttpEventSource::new(&self.options)?),
            };
            let (client, receiver) = StreamingClient::new(
                source,
                self.visibility,
                StreamOptions::from(&self.options),
            );
            (Some(client), Some(receiver))
        } else {
            (None, None)
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let connectivity = self.connectivity;
        let options = self.options;
        let durable = self.durable;

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| Shared {
            cache: RwLock::new(TtlCache::new(options.cache_ttl)),
            poller: FallbackPoller::new(poll_action(weak.clone()), Arc::clone(&connectivity)),
            options,
            status: Mutex::new(SyncStatus::NotReady),
            durable,
            fetcher,
            connectivity,
            events,
            last_refresh: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        Ok(SyncCoordinator {
            shared,
            stream,
            notifications: Mutex::new(notifications),
            tasks: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }
}

struct Shared {
    options: SyncOptions,
    status: Mutex<SyncStatus>,
    cache: RwLock<TtlCache<EvaluatedFlag>>,
    durable: Arc<dyn DurableStore>,
    fetcher: Arc<dyn FlagFetcher>,
    connectivity: Arc<dyn ConnectivitySource>,
    poller: FallbackPoller,
    events: broadcast::Sender<SyncEvent>,
    /// Completion time of the last successful full refresh.
    last_refresh: Mutex<Option<Instant>>,
    /// Set by `shutdown()`; refreshes finishing afterwards are discarded.
    closed: AtomicBool,
}

pub struct SyncCoordinator {
    shared: Arc<Shared>,
    stream: Option<StreamingClient>,
    notifications: Mutex<Option<UnboundedReceiver<StreamNotification>>>,
    /// Cancels the notification and connectivity tasks.
    tasks: CancellationToken,
    started: AtomicBool,
}

impl fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("status", &self.status())
            .field("stream", &self.stream)
            .field("poller", &self.shared.poller)
            .finish()
    }
}

impl SyncCoordinator {
    pub fn new(options: SyncOptions) -> Result<Self, SyncError> {
        Self::builder(options).build()
    }

    pub fn builder(options: SyncOptions) -> SyncCoordinatorBuilder {
        SyncCoordinatorBuilder {
            options,
            event_source: None,
            fetcher: None,
            durable: Arc::new(NoopStore),
            visibility: Arc::new(AlwaysVisible),
            connectivity: Arc::new(AlwaysOnline),
        }
    }

    pub fn status(&self) -> SyncStatus {
        *self.shared.status.lock()
    }

    /// `None` when streaming is disabled.
    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        self.stream.as_ref().map(StreamingClient::status)
    }

    pub fn stream_retry_count(&self) -> Option<u32> {
        self.stream.as_ref().map(StreamingClient::retry_count)
    }

    pub fn is_polling_active(&self) -> bool {
        self.shared.poller.is_active()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// Loads the flags, then starts the refresh machinery. Calling it again
    /// only reloads the flags.
    ///
    /// A 404 from the evaluation endpoint means no flags exist yet and still
    /// counts as success. Any error leaves the coordinator in `ERROR`.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), SyncError> {
        if self.shared.is_closed() {
            return Err(SyncError::Closed);
        }

        match self.shared.refresh(None).await {
            Ok(count) => {
                info!(flags = count, "Flag synchronization initialized");
                self.shared.set_status(SyncStatus::Ready);
                self.start_background();
                Ok(())
            }
            Err(SyncError::Closed) => Err(SyncError::Closed),
            Err(e) => {
                error!(error = %e, "Failed to initialize flag synchronization");
                self.shared.set_status(SyncStatus::Error);
                Err(e)
            }
        }
    }

    fn start_background(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stream) = &self.stream {
            if let Some(receiver) = self.notifications.lock().take() {
                tokio::spawn(dispatch_notifications(
                    Arc::clone(&self.shared),
                    stream.clone(),
                    receiver,
                    self.tasks.clone(),
                ));
            }
            stream.connect();
        } else if self.shared.options.polling_fallback {
            self.shared.poller.start(self.shared.options.polling_interval);
        }

        if self.shared.options.offline_aware
            && let Some(online) = self.shared.connectivity.subscribe()
        {
            tokio::spawn(watch_connectivity(
                Arc::clone(&self.shared),
                self.stream.clone(),
                online,
                self.tasks.clone(),
            ));
        }
    }

    /// Cached value for `flag_key`.
    ///
    /// Falls back to the durable store on a miss; durable entries older than
    /// the cache TTL are only served while `STALE`.
    pub async fn get(&self, flag_key: &str) -> Option<EvaluatedFlag> {
        if let Some(flag) = self.shared.cache.write().await.get(flag_key) {
            return Some(flag.clone());
        }

        let durable = &self.shared.durable;
        if !durable.is_available() {
            return None;
        }
        let serve_stale = self.status() == SyncStatus::Stale;
        if serve_stale || !durable.is_stale(flag_key, self.shared.options.cache_ttl) {
            return durable.get(flag_key);
        }
        None
    }

    /// Like [`get`](Self::get), but refreshes once first when the last full
    /// refresh is older than the cache TTL and the value is missing.
    pub async fn get_or_refresh(&self, flag_key: &str) -> Option<EvaluatedFlag> {
        if let Some(flag) = self.get(flag_key).await {
            return Some(flag);
        }
        if self.status() != SyncStatus::Ready || !self.shared.refresh_due() {
            return None;
        }
        debug!(flag_key, "Cache miss on expired data, refreshing");
        if let Err(e) = self.shared.refresh(None).await {
            warn!(error = %e, "Refresh after cache miss failed");
            return None;
        }
        self.get(flag_key).await
    }

    /// Full refresh from the evaluation endpoint.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        if self.shared.is_closed() {
            return Err(SyncError::Closed);
        }
        self.shared.refresh(None).await?;
        self.shared.emit(SyncEvent::ConfigurationChanged);
        Ok(())
    }

    /// Stops all network activity and drops cached flags. Safe to call more
    /// than once.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let mut cache = self.shared.cache.write().await;
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!("Already shut down");
            return;
        }

        if let Some(stream) = &self.stream {
            stream.close();
        }
        self.shared.poller.stop();
        self.tasks.cancel();
        cache.invalidate(None);
        drop(cache);
        self.shared.set_status(SyncStatus::NotReady);
        info!("Flag synchronization shut down");
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        if let Some(stream) = &self.stream {
            stream.close();
        }
        self.shared.poller.stop();
        self.tasks.cancel();
    }
}

impl Shared {
    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: SyncStatus) {
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            debug!(from = %*current, to = %status, "Sync status changed");
            *current = status;
        }
        self.emit(SyncEvent::StatusChanged(status));
    }

    fn status(&self) -> SyncStatus {
        *self.status.lock()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn refresh_due(&self) -> bool {
        self.last_refresh
            .lock()
            .is_none_or(|at| at.elapsed() >= self.options.cache_ttl)
    }

    /// Fetches every flag and stores the result. A full refresh (`None`)
    /// replaces the cache contents; a keyed refresh only adds to it.
    ///
    /// Returns [`SyncError::Closed`] without touching either cache when
    /// `shutdown()` ran while the fetch was in flight.
    async fn refresh(&self, flag_key: Option<&str>) -> Result<usize, SyncError> {
        let flags = self.fetcher.fetch_all().await?;
        let count = flags.len();

        // shutdown() flips `closed` while holding the cache lock
        let mut cache = self.cache.write().await;
        if self.is_closed() {
            debug!(flag_key = ?flag_key, "Discarding refresh finished after shutdown");
            return Err(SyncError::Closed);
        }
        if flag_key.is_none() {
            cache.invalidate(None);
            self.durable.invalidate(None);
        }
        for flag in &flags {
            cache.set(flag.key.clone(), flag.clone());
        }
        self.durable.set_all(&flags);
        drop(cache);
        *self.last_refresh.lock() = Some(Instant::now());

        debug!(flag_key = ?flag_key, count, "Flags refreshed");
        Ok(count)
    }

    async fn apply_change(&self, event: &ChangeEvent) {
        self.cache.write().await.handle_change_event(event);
        self.durable.invalidate(event.flag_key());

        if let Some(on_change) = &self.options.on_change {
            on_change(event);
        }
        self.emit(SyncEvent::FlagChanged(event.clone()));

        match self.refresh(event.flag_key()).await {
            Ok(_) => {}
            Err(SyncError::Closed) => return,
            Err(e) if e.is_fatal() => {
                error!(flag_key = ?event.flag_key(), error = %e, "Refresh after change event rejected")
            }
            Err(e) => {
                warn!(flag_key = ?event.flag_key(), error = %e, "Refresh after change event failed")
            }
        }
        self.emit(SyncEvent::ConfigurationChanged);
    }

    async fn handle_notification(&self, notification: StreamNotification, stream: &StreamingClient) {
        match notification {
            StreamNotification::StatusChanged(status) => {
                self.emit(SyncEvent::ConnectionStatusChanged(status));
                if status != ConnectionStatus::Connected {
                    return;
                }
                if self.status() == SyncStatus::Stale {
                    self.set_status(SyncStatus::Ready);
                }
                if self.poller.is_active() {
                    info!("Events stream recovered, stopping polling fallback");
                    self.poller.stop();
                    // Already zero: the client resets its retry state before
                    // reporting `Connected`.
                    stream.reset_retry_count();
                }
            }
            StreamNotification::Failed { retry_count } => {
                if self.status() != SyncStatus::Error {
                    self.set_status(SyncStatus::Stale);
                }
                if retry_count >= self.options.max_retries
                    && self.options.polling_fallback
                    && !self.poller.is_active()
                {
                    warn!(retry_count, "Events stream keeps failing, starting polling fallback");
                    self.poller.start(self.options.polling_interval);
                }
            }
            StreamNotification::Change(event) => self.apply_change(&event).await,
        }
    }

    fn go_offline(&self, stream: Option<&StreamingClient>) {
        info!("Host went offline, pausing synchronization");
        if let Some(stream) = stream {
            stream.pause();
        }
        self.poller.stop();
        if self.status() != SyncStatus::Stale {
            self.set_status(SyncStatus::Stale);
        }
    }

    async fn go_online(&self, stream: Option<&StreamingClient>) {
        info!("Host is back online, resuming synchronization");
        match stream {
            Some(stream) => stream.resume(),
            None if self.options.polling_fallback => {
                self.poller.start(self.options.polling_interval)
            }
            None => {}
        }

        match self.refresh(None).await {
            Ok(_) => {
                if self.status() == SyncStatus::Stale {
                    self.set_status(SyncStatus::Ready);
                }
                self.emit(SyncEvent::ConfigurationChanged);
            }
            Err(SyncError::Closed) => {}
            Err(e) => warn!(error = %e, "Refresh after reconnecting failed"),
        }
    }
}

fn poll_action(shared: Weak<Shared>) -> PollAction {
    Arc::new(move || {
        let shared = shared.clone();
        Box::pin(async move {
            let Some(shared) = shared.upgrade() else {
                return Ok(());
            };
            shared.refresh(None).await?;
            shared.emit(SyncEvent::ConfigurationChanged);
            Ok(())
        })
    })
}

async fn dispatch_notifications(
    shared: Arc<Shared>,
    stream: StreamingClient,
    mut receiver: UnboundedReceiver<StreamNotification>,
    cancel: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            notification = receiver.recv() => match notification {
                Some(notification) => notification,
                None => break,
            },
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shared.handle_notification(notification, &stream) => {}
        }
    }
    debug!("Notification dispatcher stopped");
}

async fn watch_connectivity(
    shared: Arc<Shared>,
    stream: Option<StreamingClient>,
    mut online: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let is_online = *online.borrow_and_update();
        if is_online {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = shared.go_online(stream.as_ref()) => {}
            }
        } else {
            shared.go_offline(stream.as_ref());
        }
    }
    debug!("Connectivity watcher stopped");
}
