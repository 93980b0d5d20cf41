//! Server builder and lifecycle.
//!
//! The [`ServerBuilder`] collects configuration, observer, frame parser and
//! optional TLS, and starts the worker pool. The [`Server`] owns:
//!
//! 1. the worker pool
//! 2. the acceptor (bound to one worker)
//! 3. the session registry shared by every accepted session
//!
//! # Example
//!
//! ```no_run
//! use packwire::{Callbacks, LengthPrefixed, PrefixWidth, Server, SessionConfig};
//!
//! fn main() -> packwire::Result<()> {
//!     let server = Server::builder(SessionConfig::new("127.0.0.1", 9000))
//!         .parser(LengthPrefixed::new(PrefixWidth::U16))
//!         .observer(Callbacks::new().on_recv(|session, frame| {
//!             let _ = session.send(frame.to_bytes());
//!         }))
//!         .build()?;
//!
//!     let addr = server.start()?;
//!     println!("echoing on {}", addr);
//!     std::thread::sleep(std::time::Duration::from_secs(60));
//!     server.stop_and_wait();
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::acceptor::Acceptor;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::observer::{NoopObserver, Observer};
use crate::protocol::{FrameParser, Passthrough};
use crate::runtime::{on_worker_thread, IoPool};
use crate::session::{SessionContext, SessionManager, State};
use crate::transport::Handshake;

/// Builder for a [`Server`].
pub struct ServerBuilder {
    config: SessionConfig,
    observer: Arc<dyn Observer>,
    parser: Arc<dyn FrameParser>,
    handshake: Handshake,
}

impl ServerBuilder {
    /// Builder with a no-op observer and the [`Passthrough`] parser.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            observer: Arc::new(NoopObserver),
            parser: Arc::new(Passthrough),
            handshake: Handshake::None,
        }
    }

    /// Set the event observer.
    pub fn observer(self, observer: impl Observer) -> Self {
        self.shared_observer(Arc::new(observer))
    }

    /// Set an observer that is also held elsewhere.
    pub fn shared_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Set the frame parser used by every session.
    pub fn parser(mut self, parser: impl FrameParser) -> Self {
        self.parser = Arc::new(parser);
        self
    }

    /// Run a TLS server handshake on every accepted connection.
    #[cfg(feature = "tls")]
    pub fn tls(mut self, config: Arc<tokio_rustls::rustls::ServerConfig>) -> Self {
        self.handshake = Handshake::tls_server(config);
        self
    }

    /// Validate the configuration and start the worker pool.
    ///
    /// The server is not listening until [`Server::start`].
    pub fn build(self) -> Result<Server> {
        self.config.validate()?;
        let pool = Arc::new(IoPool::new(self.config.server_pool_size())?);
        let ctx = Arc::new(SessionContext {
            config: self.config,
            observer: self.observer,
            parser: self.parser,
            handshake: self.handshake,
            manager: SessionManager::new(),
        });
        let acceptor = Acceptor::new(Arc::clone(&ctx), Arc::clone(&pool));
        Ok(Server {
            ctx,
            pool,
            acceptor,
        })
    }
}

/// A listening server.
///
/// Dropping a server that is still running stops it and waits (bounded)
/// for every session to close.
pub struct Server {
    ctx: Arc<SessionContext>,
    pool: Arc<IoPool>,
    acceptor: Acceptor,
}

impl Server {
    /// Start building a server.
    pub fn builder(config: SessionConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// Bind and start accepting. Returns the bound address. A stopped server
    /// can be started again.
    ///
    /// # Errors
    ///
    /// - `NotReady` if already started or still stopping
    /// - `Transport` if binding fails
    /// - `Cancelled` if the observer stopped the server during `on_listen`
    pub fn start(&self) -> Result<SocketAddr> {
        self.acceptor.start()
    }

    /// Begin stopping: every session closes, then the listener.
    /// Non-blocking and idempotent.
    pub fn stop(&self) {
        self.acceptor.stop();
    }

    /// Stop and block until every session and the listener are closed.
    /// Returns whether shutdown completed in time.
    ///
    /// On a worker thread (inside an observer callback) this only begins the
    /// stop and returns.
    pub fn stop_and_wait(&self) -> bool {
        self.acceptor.stop_and_wait(self.shutdown_wait())
    }

    /// Wait until the server is fully stopped.
    pub async fn stopped(&self) {
        self.acceptor.stopped().await;
    }

    /// Acceptor lifecycle state.
    pub fn state(&self) -> State {
        self.acceptor.state()
    }

    /// Whether the server is accepting connections.
    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    /// Address bound by the last successful start.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Number of running sessions.
    pub fn session_count(&self) -> usize {
        self.ctx.manager.len()
    }

    /// Registry of running sessions.
    pub fn sessions(&self) -> &SessionManager {
        &self.ctx.manager
    }

    /// Configuration in use.
    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    /// Number of I/O worker threads.
    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    // Sessions shut down in parallel, each bounded by the forced-close deadline.
    fn shutdown_wait(&self) -> Duration {
        self.ctx.config.handshake_timeout().saturating_mul(2)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.state() != State::Stopped
            && !on_worker_thread()
            && !self.acceptor.stop_and_wait(self.shutdown_wait())
        {
            tracing::warn!("Server dropped before shutdown completed");
        }
        self.acceptor.stop();
        self.pool.stop();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("sessions", &self.session_count())
            .field("workers", &self.worker_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PackwireError;

    fn local() -> SessionConfig {
        SessionConfig::new("127.0.0.1", 0).with_io_pool_size(1)
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = Server::builder(local().with_recv_buffer_size(0)).build();
        assert!(matches!(result, Err(PackwireError::InvalidParameter(_))));
    }

    #[test]
    fn test_build_rejects_unbounded_timeouts() {
        let result = Server::builder(local().with_handshake_timeout(u64::MAX)).build();
        assert!(matches!(result, Err(PackwireError::InvalidParameter(_))));

        let result = Server::builder(local().with_silence_timeout(u64::MAX)).build();
        assert!(matches!(result, Err(PackwireError::InvalidParameter(_))));
    }

    #[test]
    fn test_start_stop_restart() {
        let server = Server::builder(local()).build().unwrap();
        assert_eq!(server.state(), State::Stopped);

        let addr = server.start().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_running());
        assert!(matches!(server.start(), Err(PackwireError::NotReady)));

        assert!(server.stop_and_wait());
        assert_eq!(server.state(), State::Stopped);

        server.start().unwrap();
        assert!(server.stop_and_wait());
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let server = Server::builder(local()).build().unwrap();
        server.stop();
        assert!(server.stop_and_wait());
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_bind_failure_leaves_server_stopped() {
        let first = Server::builder(local()).build().unwrap();
        let addr = first.start().unwrap();

        // SO_REUSEADDR does not allow two listeners on one port.
        let second = Server::builder(SessionConfig::new("127.0.0.1", addr.port()).with_io_pool_size(1))
            .build()
            .unwrap();
        assert!(matches!(second.start(), Err(PackwireError::Transport(_))));
        assert_eq!(second.state(), State::Stopped);
    }
}
