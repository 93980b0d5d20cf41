//! Reschedulable deadline for `select!` loops.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// A deadline that can be armed, moved and disarmed between loop turns.
///
/// [`expired`](Self::expired) pends forever while disarmed, so the timer
/// can sit in a `tokio::select!` branch unconditionally.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeadlineTimer {
    deadline: Option<Instant>,
}

impl DeadlineTimer {
    /// A disarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `after` from now. A deadline past the clock's range never fires.
    pub fn arm_in(&mut self, after: Duration) {
        self.deadline = Instant::now().checked_add(after);
    }

    /// Cancel the pending deadline.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Whether a deadline is pending.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Completes when the deadline passes.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
