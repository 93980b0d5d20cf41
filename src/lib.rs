//! # packwire
//!
//! Asynchronous TCP server and client sessions with pluggable message
//! framing.
//!
//! A server accepts connections on a fixed pool of worker threads. Each
//! connection becomes a [`Session`] bound to one worker; bytes it receives
//! are cut into frames by a [`FrameParser`] and handed to an [`Observer`].
//!
//! ## Architecture
//!
//! - **Runtime**: [`runtime::IoPool`] worker threads, one current-thread
//!   runtime each; every session and acceptor is a task on one of them
//! - **Protocol**: cursor-based receive buffer, frame reassembly and buffer
//!   reuse that never mutates a frame an observer still holds
//! - **Lifecycle**: `Stopped -> Starting -> Started -> Running -> Stopping`,
//!   with a two-phase server shutdown (sessions first, then the listener)
//!
//! ## Example
//!
//! ```no_run
//! use packwire::{Callbacks, Delimited, Server, SessionConfig};
//!
//! fn main() -> packwire::Result<()> {
//!     let server = Server::builder("tcp://127.0.0.1:7000/?silence_timeout=60".parse()?)
//!         .parser(Delimited::lines())
//!         .observer(
//!             Callbacks::new()
//!                 .on_recv(|session, frame| {
//!                     let _ = session.send(frame.to_bytes());
//!                 })
//!                 .on_shutdown(|_| println!("bye")),
//!         )
//!         .build()?;
//!
//!     server.start()?;
//!     server.stop_and_wait();
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `tls`: TLS sessions through `tokio-rustls` ([`ServerBuilder::tls`],
//!   [`ClientBuilder::tls`])

pub mod config;
pub mod error;
pub mod observer;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod transport;

mod acceptor;
mod client;
mod server;

pub use client::{Client, ClientBuilder};
pub use config::SessionConfig;
pub use error::{ErrorKind, PackwireError, Result};
pub use observer::{Callbacks, NoopObserver, Observer};
pub use protocol::{
    Delimited, Frame, FrameParser, LengthPrefixed, ParseOutcome, Passthrough, PrefixWidth,
};
pub use server::{Server, ServerBuilder};
pub use session::{Session, SessionId, SessionManager, State};
