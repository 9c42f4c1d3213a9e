//! # Host Signals
//!
//! Optional capabilities supplied by the host environment: whether the
//! application is visible (foregrounded) and whether the network is reachable.
//! Platforms without such a signal use [`AlwaysVisible`] / [`AlwaysOnline`],
//! which never report a change.
//!
//! [`HostSignal`] is a ready-made source backed by a `watch` channel; the host
//! flips it from whatever native notification it has.

use std::fmt;
use tokio::sync::watch;

pub trait VisibilitySource: Send + Sync + fmt::Debug {
    /// Receiver yielding `true` while visible. `None` if the platform has no
    /// visibility signal.
    fn subscribe(&self) -> Option<watch::Receiver<bool>>;
}

pub trait ConnectivitySource: Send + Sync + fmt::Debug {
    fn is_online(&self) -> bool;
    /// Receiver yielding `true` while online. `None` if the platform has no
    /// connectivity signal.
    fn subscribe(&self) -> Option<watch::Receiver<bool>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysVisible;

impl VisibilitySource for AlwaysVisible {
    fn subscribe(&self) -> Option<watch::Receiver<bool>> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

impl ConnectivitySource for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }

    fn subscribe(&self) -> Option<watch::Receiver<bool>> {
        None
    }
}

/// A boolean host signal the application updates itself.
#[derive(Debug)]
pub struct HostSignal {
    sender: watch::Sender<bool>,
}

impl HostSignal {
    pub fn new(initial: bool) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Publishes a new value. Subscribers are only woken on an actual change.
    pub fn set(&self, value: bool) {
        self.sender.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
    }

    pub fn get(&self) -> bool {
        *self.sender.borrow()
    }
}

impl VisibilitySource for HostSignal {
    fn subscribe(&self) -> Option<watch::Receiver<bool>> {
        Some(self.sender.subscribe())
    }
}

impl ConnectivitySource for HostSignal {
    fn is_online(&self) -> bool {
        self.get()
    }

    fn subscribe(&self) -> Option<watch::Receiver<bool>> {
        Some(self.sender.subscribe())
    }
}
