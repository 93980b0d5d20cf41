//! Ordered command lane into a single task.
//!
//! A lane is the sending half of an unbounded channel whose receiver is
//! owned by exactly one task on one worker. Commands posted through the
//! same lane run strictly in posting order and never overlap, which is what
//! serializes access to a socket without a lock.
//!
//! ```text
//! send() ──┐
//! stop() ──┼─► Lane<T> ─► task on worker N ─► socket
//! timer  ──┘
//! ```

use tokio::sync::mpsc;

use super::Worker;
use crate::error::{PackwireError, Result};

/// Sending side of a command lane.
pub struct Lane<T> {
    worker_id: usize,
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for Lane<T> {
    fn clone(&self) -> Self {
        Self {
            worker_id: self.worker_id,
            tx: self.tx.clone(),
        }
    }
}

impl<T> Lane<T> {
    /// Open a lane bound to `worker`. The receiver must be driven by a task
    /// spawned on that same worker.
    pub fn open(worker: &Worker) -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                worker_id: worker.id(),
                tx,
            },
            rx,
        )
    }

    /// A lane bound to no worker, for tests that never drive it.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { worker_id: 0, tx }, rx)
    }

    /// Queue a command behind everything posted before it.
    ///
    /// # Errors
    ///
    /// `NotReady` once the lane task has exited.
    pub fn post(&self, command: T) -> Result<()> {
        self.tx.send(command).map_err(|_| PackwireError::NotReady)
    }

    /// Whether the lane task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Worker the lane is bound to.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }
}

impl<T> std::fmt::Debug for Lane<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lane")
            .field("worker_id", &self.worker_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
