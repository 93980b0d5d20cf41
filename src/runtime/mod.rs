//! Worker threads, lanes and timers.
//!
//! - [`IoPool`]: fixed set of worker threads, each with its own runtime
//! - [`Lane`]: ordered command channel into one task on one worker
//! - [`DeadlineTimer`]: reschedulable deadline used by the session and
//!   acceptor loops

mod lane;
mod pool;
mod timer;

pub use lane::Lane;
pub use pool::{current_worker_id, on_worker_thread, IoPool, Worker};
pub use timer::DeadlineTimer;
