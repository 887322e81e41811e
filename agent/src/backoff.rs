/// Exponential reconnect backoff: 1s, 2s, 4s, ... up to a cap.
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial.min(max),
        }
    }

    /// Delay before the next attempt; doubles for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.next = self.initial.min(self.max);
    }
}
