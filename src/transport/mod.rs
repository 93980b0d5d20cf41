//! Transport module - sockets, TLS and write batching.
//!
//! Provides:
//! - [`Transport`]: the connected stream a session drives (plain or TLS)
//! - [`Handshake`]: optional step run before a session starts
//! - listener binding with `SO_REUSEADDR` and per-connection socket tuning
//! - vectored batch writes of queued payloads

mod batch;
mod handshake;
mod listener;
mod stream;

pub use batch::{write_batch, MAX_BATCH_SIZE};
pub use handshake::Handshake;
pub use listener::{bind, tune};
pub use stream::Transport;
