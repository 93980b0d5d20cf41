//! One connection: handle, lifecycle and I/O driver task.
//!
//! A [`Session`] is a cheap, clonable handle. The connection itself is owned
//! by a driver task on one worker, which runs the whole life of the socket:
//!
//! ```text
//! Starting ──handshake──► Started ──on_accept──► Running ──► Stopping ──► Stopped
//!                                   (veto: stop)  │ read ─► reassemble ─► on_recv
//!                                                 │ lane ─► write_batch ─► on_send
//!                                                 │ idle timer
//!                                                 └ cancel token
//! ```
//!
//! Everything touching the socket happens inside that task, so reads,
//! writes and the close sequence never overlap. `send()` only queues onto
//! the session's lane and `stop()` only flips the state and fires the
//! cancellation token.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::state::{State, StateCell};
use super::SessionManager;
use crate::config::SessionConfig;
use crate::error::{PackwireError, Result};
use crate::observer::Observer;
use crate::protocol::{reassemble, Frame, FrameBuffer, FrameParser, Reassembly};
use crate::runtime::{on_worker_thread, DeadlineTimer, Lane, Worker};
use crate::transport::{self, write_batch, Handshake, Transport, MAX_BATCH_SIZE};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything a session needs from its server or client.
pub(crate) struct SessionContext {
    pub(crate) config: SessionConfig,
    pub(crate) observer: Arc<dyn Observer>,
    pub(crate) parser: Arc<dyn FrameParser>,
    pub(crate) handshake: Handshake,
    pub(crate) manager: SessionManager,
}

struct SessionInner {
    id: SessionId,
    state: StateCell,
    lane: Lane<Bytes>,
    cancel: CancellationToken,
    accept_notified: AtomicBool,
    close_notified: AtomicBool,
    connected_at: Instant,
    /// Milliseconds after `connected_at` of the last received bytes.
    last_active: AtomicU64,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl SessionInner {
    fn new(lane: Lane<Bytes>, local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            id: SessionId::next(),
            state: StateCell::new(),
            lane,
            cancel: CancellationToken::new(),
            accept_notified: AtomicBool::new(false),
            close_notified: AtomicBool::new(false),
            connected_at: Instant::now(),
            last_active: AtomicU64::new(0),
            local_addr,
            peer_addr,
        }
    }

    fn touch(&self) {
        let now = self.connected_at.elapsed().as_millis();
        self.last_active
            .store(u64::try_from(now).unwrap_or(u64::MAX), Ordering::Release);
    }

    fn silence_duration(&self) -> Duration {
        let last = Duration::from_millis(self.last_active.load(Ordering::Acquire));
        self.connected_at.elapsed().saturating_sub(last)
    }
}

/// Handle to one connection.
///
/// Clones share the same connection. Holding a handle does not keep the
/// connection open; it stays valid (and reports `Stopped`) after close.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Take ownership of a connected socket and start driving it on `worker`.
    pub(crate) fn start(
        stream: std::net::TcpStream,
        worker: &Worker,
        ctx: Arc<SessionContext>,
    ) -> Result<Session> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        transport::tune(&stream, &ctx.config);
        stream.set_nonblocking(true)?;

        let stream = {
            let _guard = worker.enter();
            TcpStream::from_std(stream)?
        };

        let (lane, rx) = Lane::open(worker);
        let session = Session {
            inner: Arc::new(SessionInner::new(lane, local_addr, peer_addr)),
        };
        session.inner.state.set(State::Starting);

        tracing::debug!(
            "Session {} starting on worker {} ({} -> {})",
            session.id(),
            worker.id(),
            peer_addr,
            local_addr
        );

        let driver = Driver {
            session: session.clone(),
            ctx,
            rx,
        };
        worker.spawn(driver.run(stream));
        Ok(session)
    }

    /// Session not bound to any socket.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
        let (lane, _rx) = Lane::detached();
        Session {
            inner: Arc::new(SessionInner::new(lane, unspecified, unspecified)),
        }
    }

    /// Identifier, unique within the process.
    #[inline]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> State {
        self.inner.state.get()
    }

    /// Whether the session is reading and accepts sends.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    /// Local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Worker thread the session is bound to.
    pub fn worker_id(&self) -> usize {
        self.inner.lane.worker_id()
    }

    /// Time since the connection was taken over.
    pub fn connect_duration(&self) -> Duration {
        self.inner.connected_at.elapsed()
    }

    /// Time since bytes were last received.
    pub fn silence_duration(&self) -> Duration {
        self.inner.silence_duration()
    }

    /// Queue `data` for writing. Completion is reported by
    /// [`Observer::on_send`].
    ///
    /// # Errors
    ///
    /// - `NotReady` if the session is not running
    /// - `InvalidParameter` if `data` is empty
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        if !self.is_running() {
            return Err(PackwireError::NotReady);
        }
        let data = data.into();
        if data.is_empty() {
            return Err(PackwireError::invalid("send payload is empty"));
        }
        self.inner.lane.post(data)
    }

    /// Begin closing the session. Idempotent and non-blocking; safe from any
    /// thread, including inside observer callbacks.
    pub fn stop(&self) {
        if let Some(previous) = self.inner.state.begin_stop() {
            tracing::trace!("Session {} stop requested in state {}", self.id(), previous);
            self.inner.cancel.cancel();
        }
    }

    /// Wait until the session is fully stopped.
    pub async fn stopped(&self) {
        self.inner.state.wait_until(|s| s == State::Stopped).await;
    }

    /// Block the calling thread until the session is stopped or `timeout`
    /// passes. Returns whether it stopped.
    ///
    /// Never blocks on a worker thread: returns the current answer instead.
    pub fn wait_stopped_blocking(&self, timeout: Duration) -> bool {
        if on_worker_thread() {
            tracing::warn!("Refusing to block a worker thread waiting for session {}", self.id());
            return self.state() == State::Stopped;
        }
        self.inner.state.wait_blocking(|s| s == State::Stopped, timeout)
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Session {}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("peer", &self.inner.peer_addr)
            .finish()
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Owns the socket and the receiving end of the session lane.
struct Driver {
    session: Session,
    ctx: Arc<SessionContext>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Driver {
    async fn run(mut self, stream: TcpStream) {
        let mut transport = match self.handshake(stream).await {
            Ok(transport) => transport,
            Err(e) => {
                if !e.is_cancellation() {
                    tracing::warn!(
                        "Session {} handshake with {} failed: {}",
                        self.session.id(),
                        self.session.peer_addr(),
                        e
                    );
                }
                self.close(None, Some(e)).await;
                return;
            }
        };

        let reason = if self.enter_running() {
            Some(self.pump(&mut transport).await)
        } else {
            None
        };

        // Raised only after close so a faulting peer still deregisters.
        let fault = reason
            .as_ref()
            .filter(|e| {
                cfg!(debug_assertions)
                    && self.ctx.config.assert_on_protocol_fault
                    && e.is_protocol_fault()
            })
            .map(|e| format!("session {}: {}", self.session.id(), e));
        self.close(Some(transport), reason).await;
        if let Some(fault) = fault {
            panic!("{}", fault);
        }
    }

    async fn handshake(&self, stream: TcpStream) -> Result<Transport> {
        if self.ctx.handshake.is_none() {
            return Ok(Transport::Plain(stream));
        }

        let deadline = self.ctx.config.handshake_timeout();
        tokio::select! {
            biased;
            _ = self.session.inner.cancel.cancelled() => Err(PackwireError::Cancelled),
            result = tokio::time::timeout(deadline, self.ctx.handshake.establish(stream)) => {
                match result {
                    Ok(established) => established,
                    Err(_) => Err(PackwireError::Handshake(format!(
                        "no handshake within {:?}",
                        deadline
                    ))),
                }
            }
        }
    }

    /// `Starting -> Started -> Running`, with the accept notification in
    /// between. False when the session was stopped along the way.
    fn enter_running(&self) -> bool {
        let session = &self.session;
        let inner = &session.inner;

        if !inner.state.transition(State::Starting, State::Started) {
            return false;
        }

        inner.touch();
        inner.accept_notified.store(true, Ordering::Release);
        self.ctx.observer.on_accept(session);

        if !inner.state.transition(State::Started, State::Running) {
            tracing::debug!("Session {} stopped during accept notification", session.id());
            return false;
        }

        if !self.ctx.manager.register(session) {
            tracing::debug!("Session {} refused: manager is shutting down", session.id());
            session.stop();
            return false;
        }
        true
    }

    /// Read, write and watch for silence until something ends the session.
    /// Returns the reason.
    async fn pump(&mut self, transport: &mut Transport) -> PackwireError {
        let inner = Arc::clone(&self.session.inner);
        let recv_buffer_size = self.ctx.config.recv_buffer_size;
        let silence_timeout = self.ctx.config.silence_timeout();

        let mut buffer = FrameBuffer::new(recv_buffer_size);
        let mut batch: Vec<Bytes> = Vec::with_capacity(MAX_BATCH_SIZE);
        let mut idle = DeadlineTimer::new();
        if let Some(timeout) = silence_timeout {
            idle.arm_in(timeout);
        }

        loop {
            tokio::select! {
                biased;

                _ = inner.cancel.cancelled() => return PackwireError::Cancelled,

                Some(first) = self.rx.recv() => {
                    batch.push(first);
                    while batch.len() < MAX_BATCH_SIZE {
                        match self.rx.try_recv() {
                            Ok(data) => batch.push(data),
                            Err(_) => break,
                        }
                    }

                    let written = tokio::select! {
                        biased;
                        _ = inner.cancel.cancelled() => Err(PackwireError::Cancelled),
                        result = write_batch(transport, &batch) => result.map_err(PackwireError::from),
                    };

                    let error = written.err();
                    for data in batch.drain(..) {
                        self.ctx.observer.on_send(&self.session, &data, error.as_ref());
                    }
                    if let Some(e) = error {
                        return e;
                    }
                }

                _ = idle.expired() => {
                    let Some(timeout) = silence_timeout else {
                        idle.disarm();
                        continue;
                    };
                    let quiet = inner.silence_duration();
                    if quiet < timeout {
                        idle.arm_in(timeout - quiet);
                    } else {
                        tracing::debug!("Session {} silent for {:?}", self.session.id(), quiet);
                        return PackwireError::SilenceTimeout(timeout);
                    }
                }

                read = transport.read(buffer.write_region()) => {
                    let n = match read {
                        Ok(0) => {
                            return PackwireError::Transport(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed by peer",
                            ));
                        }
                        Ok(n) => n,
                        Err(e) => return PackwireError::Transport(e),
                    };
                    buffer.commit(n);
                    inner.touch();

                    let session = &self.session;
                    let observer = &self.ctx.observer;
                    let deliver = |frame: Frame| {
                        observer.on_recv(session, &frame);
                        session.is_running()
                    };

                    match reassemble(buffer, self.ctx.parser.as_ref(), recv_buffer_size, deliver) {
                        Ok(Reassembly::Continue(next)) => buffer = next,
                        Ok(Reassembly::Halted) => return PackwireError::Cancelled,
                        Err(e) => {
                            tracing::error!(
                                "Session {} from {}: {}",
                                self.session.id(),
                                self.session.peer_addr(),
                                e
                            );
                            return e;
                        }
                    }
                }
            }
        }
    }

    /// Shut the socket down (bounded), report leftovers and the close, then
    /// deregister.
    async fn close(mut self, transport: Option<Transport>, reason: Option<PackwireError>) {
        let session = self.session.clone();
        let inner = &session.inner;
        inner.state.begin_stop();
        inner.cancel.cancel();

        if let Some(mut transport) = transport {
            let deadline = self.ctx.config.handshake_timeout();
            match tokio::time::timeout(deadline, transport.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::trace!("Session {} shutdown: {}", session.id(), e),
                Err(_) => tracing::warn!(
                    "Session {} did not shut down within {:?}; forcing close",
                    session.id(),
                    deadline
                ),
            }
        }

        self.rx.close();
        while let Ok(data) = self.rx.try_recv() {
            self.ctx
                .observer
                .on_send(&session, &data, Some(&PackwireError::NotReady));
        }

        let reason = reason.filter(|e| !e.is_cancellation());
        match &reason {
            Some(e) => tracing::debug!("Session {} closed: {}", session.id(), e),
            None => tracing::debug!("Session {} closed", session.id()),
        }

        if inner.accept_notified.load(Ordering::Acquire)
            && !inner.close_notified.swap(true, Ordering::AcqRel)
        {
            self.ctx.observer.on_close(&session, reason.as_ref());
        }

        inner.state.set(State::Stopped);
        self.ctx.manager.remove(&session);
    }
}
