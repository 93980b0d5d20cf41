//! Outbound connections.
//!
//! A [`Client`] runs one session over a connection it opened itself, on its
//! own small worker pool. `on_accept` fires once the connection (and TLS
//! handshake, if any) is established.
//!
//! # Example
//!
//! ```no_run
//! use packwire::{Callbacks, Client, Delimited, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> packwire::Result<()> {
//!     let client = Client::builder(SessionConfig::new("127.0.0.1", 9000))
//!         .parser(Delimited::lines())
//!         .observer(Callbacks::new().on_recv(|_session, frame| {
//!             println!("{}", String::from_utf8_lossy(frame));
//!         }))
//!         .start()
//!         .await?;
//!
//!     client.send("hello\n")?;
//!     client.stop();
//!     client.stopped().await;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::config::SessionConfig;
use crate::error::{PackwireError, Result};
use crate::observer::{NoopObserver, Observer};
use crate::protocol::{FrameParser, Passthrough};
use crate::runtime::{on_worker_thread, IoPool};
use crate::session::{Session, SessionContext, SessionManager, State};
use crate::transport::Handshake;

/// Builder for a [`Client`].
pub struct ClientBuilder {
    config: SessionConfig,
    observer: Arc<dyn Observer>,
    parser: Arc<dyn FrameParser>,
    handshake: Handshake,
}

impl ClientBuilder {
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

    /// Set the frame parser.
    pub fn parser(mut self, parser: impl FrameParser) -> Self {
        self.parser = Arc::new(parser);
        self
    }

    /// Run a TLS client handshake verifying `server_name`.
    #[cfg(feature = "tls")]
    pub fn tls(
        mut self,
        config: Arc<tokio_rustls::rustls::ClientConfig>,
        server_name: &str,
    ) -> Result<Self> {
        self.handshake = Handshake::tls_client(config, server_name)?;
        Ok(self)
    }

    /// Connect and start the session.
    ///
    /// The connect attempt is bounded by the handshake timeout. The returned
    /// client may still be completing its TLS handshake; wait for
    /// `on_accept` before relying on `send`.
    ///
    /// # Errors
    ///
    /// - `InvalidParameter` for an invalid configuration
    /// - `Transport` if the connection cannot be established
    pub async fn start(self) -> Result<Client> {
        self.config.validate()?;
        let pool = IoPool::new(self.config.client_pool_size())?;
        let ctx = Arc::new(SessionContext {
            config: self.config,
            observer: self.observer,
            parser: self.parser,
            handshake: self.handshake,
            manager: SessionManager::new(),
        });

        let worker = pool.acquire();
        let address = ctx.config.address();
        let deadline = ctx.config.handshake_timeout();
        let (tx, rx) = oneshot::channel();
        worker.spawn(async move {
            let connected = match tokio::time::timeout(deadline, TcpStream::connect(&address)).await
            {
                Ok(Ok(stream)) => stream.into_std().map_err(PackwireError::from),
                Ok(Err(e)) => Err(PackwireError::Transport(e)),
                Err(_) => Err(PackwireError::Transport(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", address, deadline),
                ))),
            };
            let _ = tx.send(connected);
        });

        let stream = rx.await.map_err(|_| PackwireError::NotReady)??;
        let session = Session::start(stream, &worker, Arc::clone(&ctx))?;
        tracing::debug!("Client connected to {}", session.peer_addr());

        Ok(Client { session, ctx, pool })
    }
}

/// A connected client.
///
/// Dropping a client that is still connected stops it and waits (bounded)
/// for the close to finish.
pub struct Client {
    session: Session,
    ctx: Arc<SessionContext>,
    pool: IoPool,
}

impl Client {
    /// Start building a client.
    pub fn builder(config: SessionConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// The client's session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Queue `data` for writing. See [`Session::send`].
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.session.send(data)
    }

    /// Session state.
    pub fn state(&self) -> State {
        self.session.state()
    }

    /// Whether the session is running.
    pub fn is_running(&self) -> bool {
        self.session.is_running()
    }

    /// Local address of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.session.local_addr()
    }

    /// Remote address of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.session.peer_addr()
    }

    /// Configuration in use.
    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    /// Begin closing. Non-blocking and idempotent.
    pub fn stop(&self) {
        self.session.stop();
    }

    /// Stop and block the calling thread until closed (bounded by the
    /// forced-close deadline). Returns whether the close completed.
    pub fn stop_and_wait(&self) -> bool {
        self.session.stop();
        self.session.wait_stopped_blocking(self.shutdown_wait())
    }

    /// Wait until the session is fully stopped.
    pub async fn stopped(&self) {
        self.session.stopped().await;
    }

    fn shutdown_wait(&self) -> Duration {
        self.ctx.config
            .handshake_timeout()
            .saturating_add(Duration::from_secs(1))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.state() != State::Stopped && !on_worker_thread() && !self.stop_and_wait() {
            tracing::warn!("Client dropped before its session closed");
        }
        self.session.stop();
        self.pool.stop();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session)
            .finish()
    }
}
