//! # Polling Fallback
//!
//! Periodic full refresh used while the events stream is unusable. Started
//! and stopped only by the coordinator; a failed poll is logged and the timer
//! keeps running.

use crate::error::SyncError;
use crate::signals::ConnectivitySource;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type PollFuture = Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send>>;

/// The refresh performed on every tick.
pub type PollAction = Arc<dyn Fn() -> PollFuture + Send + Sync>;

pub struct FallbackPoller {
    action: PollAction,
    connectivity: Arc<dyn ConnectivitySource>,
    running: Mutex<Option<CancellationToken>>,
}

impl fmt::Debug for FallbackPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackPoller")
            .field("active", &self.is_active())
            .finish()
    }
}

impl FallbackPoller {
    pub fn new(action: PollAction, connectivity: Arc<dyn ConnectivitySource>) -> Self {
        Self {
            action,
            connectivity,
            running: Mutex::new(None),
        }
    }

    /// Starts polling every `interval`, first tick one interval from now.
    /// Does nothing if already running.
    pub fn start(&self, interval: Duration) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *running = Some(token.clone());
        debug!(interval_ms = interval.as_millis() as u64, "Polling fallback started");

        let action = Arc::clone(&self.action);
        let connectivity = Arc::clone(&self.connectivity);
        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {}
                }

                if !connectivity.is_online() {
                    debug!("Skipping poll while offline");
                    continue;
                }

                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    result = action() => result,
                };
                if let Err(e) = result {
                    warn!(error = %e, "Fallback poll failed");
                }
            }
        });
    }

    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
            debug!("Polling fallback stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{AlwaysOnline, HostSignal};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_log::test;
    use tokio::time::sleep;

    fn counting_action(fail: bool) -> (PollAction, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let action: PollAction = Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(SyncError::Connection("unreachable".to_string()))
                } else {
                    Ok(())
                }
            })
        });
        (action, calls)
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_ticks_every_interval_until_stopped() {
        let (action, calls) = counting_action(false);
        let poller = FallbackPoller::new(action, Arc::new(AlwaysOnline));

        poller.start(Duration::from_secs(10));
        assert!(poller.is_active());
        sleep(Duration::from_secs(35)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        poller.stop();
        assert!(!poller.is_active());
        sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_start_and_stop_are_idempotent() {
        let (action, calls) = counting_action(false);
        let poller = FallbackPoller::new(action, Arc::new(AlwaysOnline));

        poller.start(Duration::from_secs(10));
        poller.start(Duration::from_secs(1));
        sleep(Duration::from_secs(15)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        poller.stop();
        poller.stop();
        assert!(!poller.is_active());
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_failures_do_not_stop_polling() {
        let (action, calls) = counting_action(true);
        let poller = FallbackPoller::new(action, Arc::new(AlwaysOnline));

        poller.start(Duration::from_secs(1));
        sleep(Duration::from_millis(3_500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(poller.is_active());
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_skips_ticks_while_offline() {
        let (action, calls) = counting_action(false);
        let online = Arc::new(HostSignal::new(false));
        let poller = FallbackPoller::new(action, online.clone());

        poller.start(Duration::from_secs(1));
        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        online.set(true);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
