use std::time::Duration;

/// Reconnect backoff: the delay doubles after every failure up to `max`, and
/// both delay and count go back to the start on a successful connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    initial_delay: Duration,
    max_delay: Duration,
    current_delay: Duration,
    retry_count: u32,
}

impl RetryState {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            current_delay: initial_delay,
            retry_count: 0,
        }
    }

    /// Records a failure and returns how long to wait before reconnecting.
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.current_delay;
        self.current_delay = (self.current_delay * 2).min(self.max_delay);
        self.retry_count = self.retry_count.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.retry_count = 0;
    }

    pub fn reset_count(&mut self) {
        self.retry_count = 0;
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}
