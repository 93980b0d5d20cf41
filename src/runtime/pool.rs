//! Fixed pool of I/O worker threads.
//!
//! Every worker is one OS thread driving its own current-thread tokio
//! runtime. Sessions and acceptors are bound to one worker for their whole
//! life, so all I/O on a given socket happens on one thread.
//!
//! ```text
//! IoPool ─┬─ packwire-io-0 (current_thread runtime) ─► lanes...
//!         ├─ packwire-io-1 (current_thread runtime) ─► lanes...
//!         └─ packwire-io-N ...
//! ```

use std::cell::Cell;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle as ThreadHandle;

use parking_lot::Mutex;
use tokio::runtime::{Builder, EnterGuard, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::Result;

thread_local! {
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Whether the calling thread is a packwire worker thread.
///
/// Blocking waits must never run here: they would stall every session
/// bound to the worker, including the ones being waited for.
pub fn on_worker_thread() -> bool {
    current_worker_id().is_some()
}

/// Id of the worker running on the calling thread, if any.
pub fn current_worker_id() -> Option<usize> {
    CURRENT_WORKER.with(|w| w.get())
}

/// Handle to one worker of an [`IoPool`].
#[derive(Clone, Debug)]
pub struct Worker {
    id: usize,
    handle: Handle,
}

impl Worker {
    /// Worker index within its pool.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Runtime handle of the worker.
    #[inline]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a task on the worker's runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Enter the worker's runtime context, e.g. to register a socket with
    /// its reactor from a foreign thread.
    pub fn enter(&self) -> EnterGuard<'_> {
        self.handle.enter()
    }
}

struct Running {
    shutdown: oneshot::Sender<()>,
    thread: ThreadHandle<()>,
}

/// Fixed-size pool of worker threads.
pub struct IoPool {
    workers: Vec<Worker>,
    next: AtomicUsize,
    running: Mutex<Vec<Running>>,
}

impl IoPool {
    /// Start `size` worker threads (at least one).
    ///
    /// # Errors
    ///
    /// `Transport` if a runtime or thread cannot be created.
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        let mut running = Vec::with_capacity(size);

        for id in 0..size {
            let runtime = Builder::new_current_thread().enable_all().build()?;
            let handle = runtime.handle().clone();
            let (shutdown, shutdown_rx) = oneshot::channel::<()>();

            let thread = std::thread::Builder::new()
                .name(format!("packwire-io-{}", id))
                .spawn(move || {
                    CURRENT_WORKER.with(|w| w.set(Some(id)));
                    // Sender dropped or signalled: either way the worker exits.
                    let _ = runtime.block_on(shutdown_rx);
                    tracing::trace!("Worker {} exiting", id);
                })?;

            workers.push(Worker { id, handle });
            running.push(Running { shutdown, thread });
        }

        tracing::debug!("Started I/O pool with {} workers", size);

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
            running: Mutex::new(running),
        })
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Pick the next worker, round robin.
    pub fn acquire(&self) -> Worker {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].clone()
    }

    /// Worker with the given id.
    pub fn worker(&self, id: usize) -> Option<&Worker> {
        self.workers.get(id)
    }

    /// Whether [`stop`](Self::stop) has already run.
    pub fn is_stopped(&self) -> bool {
        self.running.lock().is_empty()
    }

    /// Signal every worker to exit and join the threads.
    ///
    /// Tasks still alive on a worker are dropped. When called from a worker
    /// thread the threads are signalled but not joined.
    pub fn stop(&self) {
        let running = std::mem::take(&mut *self.running.lock());
        if running.is_empty() {
            return;
        }

        let join = !on_worker_thread();
        for Running { shutdown, thread } in running {
            let _ = shutdown.send(());
            if join && thread.join().is_err() {
                tracing::error!("I/O worker thread panicked");
            }
        }
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for IoPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoPool")
            .field("size", &self.size())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin() {
        let pool = IoPool::new(3).unwrap();
        let ids: Vec<usize> = (0..6).map(|_| pool.acquire().id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_zero_size_still_has_one_worker() {
        let pool = IoPool::new(0).unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_tasks_run_on_worker_thread() {
        let pool = IoPool::new(2).unwrap();
        let worker = pool.acquire();
        let (tx, rx) = std::sync::mpsc::channel();
        worker.spawn(async move {
            let _ = tx.send((on_worker_thread(), current_worker_id()));
        });
        let (on_worker, id) = rx.recv().unwrap();
        assert!(on_worker);
        assert_eq!(id, Some(worker.id()));
        assert!(!on_worker_thread());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let pool = IoPool::new(2).unwrap();
        pool.stop();
        assert!(pool.is_stopped());
        pool.stop();
    }
}
