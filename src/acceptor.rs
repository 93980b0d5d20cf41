//! Listening socket, accept loop and two-phase shutdown.
//!
//! The acceptor owns one task on one worker (its lane). Accepted sockets are
//! handed to sessions on workers picked round robin from the pool.
//!
//! Shutdown is a cascade posted through the lane:
//!
//! 1. `Stop`: stop accepting and ask the [`SessionManager`] to stop every
//!    session, with a callback that posts `SessionsDrained` back here.
//! 2. `SessionsDrained`: fire `on_shutdown` (only if the acceptor was
//!    running), close the listener, go to `Stopped`, wake waiters.
//!
//! Every session's `on_close` therefore precedes `on_shutdown`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::error::{is_resource_exhaustion, PackwireError, Result};
use crate::runtime::{on_worker_thread, DeadlineTimer, IoPool, Lane};
use crate::session::{Session, SessionContext, State, StateCell};
use crate::transport;

#[derive(Debug)]
enum Command {
    Accept,
    Stop { previous: State },
    SessionsDrained { previous: State },
}

struct AcceptorInner {
    state: StateCell,
    lane: Mutex<Option<Lane<Command>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    ctx: Arc<SessionContext>,
    pool: Arc<IoPool>,
}

/// TCP acceptor feeding sessions into a pool.
#[derive(Clone)]
pub(crate) struct Acceptor {
    inner: Arc<AcceptorInner>,
}

impl Acceptor {
    pub(crate) fn new(ctx: Arc<SessionContext>, pool: Arc<IoPool>) -> Self {
        Self {
            inner: Arc::new(AcceptorInner {
                state: StateCell::new(),
                lane: Mutex::new(None),
                local_addr: Mutex::new(None),
                ctx,
                pool,
            }),
        }
    }

    pub(crate) fn state(&self) -> State {
        self.inner.state.get()
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Bind, listen, notify `on_listen` and begin accepting.
    ///
    /// # Errors
    ///
    /// - `NotReady` if the acceptor is not stopped
    /// - `Transport` if binding fails
    /// - `Cancelled` if `stop()` was called during `on_listen`
    pub(crate) fn start(&self) -> Result<SocketAddr> {
        let inner = &self.inner;
        if !inner.state.transition(State::Stopped, State::Starting) {
            return Err(PackwireError::NotReady);
        }
        inner.ctx.manager.reopen();

        let address = inner.ctx.config.address();
        let worker = inner.pool.acquire();
        let bound = transport::bind(&address, inner.ctx.config.backlog).and_then(|std_listener| {
            let _guard = worker.enter();
            let listener = TcpListener::from_std(std_listener)?;
            let local_addr = listener.local_addr()?;
            Ok((listener, local_addr))
        });
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                tracing::error!("Failed to listen on {}: {}", address, e);
                inner.state.set(State::Stopped);
                return Err(PackwireError::Transport(e));
            }
        };
        *inner.local_addr.lock() = Some(local_addr);

        let (lane, rx) = Lane::open(&worker);
        {
            let mut slot = inner.lane.lock();
            *slot = Some(lane.clone());
            worker.spawn(accept_loop(Arc::clone(inner), listener, lane.clone(), rx));

            if !inner.state.transition(State::Starting, State::Started) {
                // stop() ran while starting and found no lane to post to.
                let _ = lane.post(Command::Stop {
                    previous: State::Starting,
                });
                return Err(PackwireError::Cancelled);
            }
        }

        tracing::info!("Listening on {}", local_addr);
        inner.ctx.observer.on_listen();

        if !inner.state.transition(State::Started, State::Running) {
            tracing::debug!("Acceptor stopped during listen notification");
            return Err(PackwireError::Cancelled);
        }
        lane.post(Command::Accept)?;
        Ok(local_addr)
    }

    /// Begin the two-phase shutdown. Idempotent and non-blocking.
    pub(crate) fn stop(&self) {
        let slot = self.inner.lane.lock();
        if let Some(previous) = self.inner.state.begin_stop() {
            if let Some(lane) = slot.as_ref() {
                if lane.post(Command::Stop { previous }).is_err() {
                    self.inner.state.set(State::Stopped);
                }
            }
        }
    }

    /// Wait until fully stopped.
    pub(crate) async fn stopped(&self) {
        self.inner.state.wait_until(|s| s == State::Stopped).await;
    }

    /// Stop and block the calling thread until done or `timeout` passes.
    /// Returns whether the acceptor stopped.
    pub(crate) fn stop_and_wait(&self, timeout: Duration) -> bool {
        self.stop();
        if on_worker_thread() {
            tracing::warn!("stop_and_wait called on a worker thread; not waiting");
            return self.state() == State::Stopped;
        }
        self.inner
            .state
            .wait_blocking(|s| s == State::Stopped, timeout)
    }
}

async fn accept_loop(
    inner: Arc<AcceptorInner>,
    listener: TcpListener,
    lane: Lane<Command>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut listener = Some(listener);
    let mut accepting = false;
    let mut backoff = DeadlineTimer::new();
    let backoff_delay = inner.ctx.config.accept_backoff();

    loop {
        tokio::select! {
            biased;

            command = rx.recv() => match command {
                Some(Command::Accept) => accepting = true,
                Some(Command::Stop { previous }) => {
                    accepting = false;
                    backoff.disarm();
                    let lane = lane.clone();
                    inner.ctx.manager.stop_all(move || {
                        let _ = lane.post(Command::SessionsDrained { previous });
                    });
                }
                Some(Command::SessionsDrained { previous }) => {
                    if previous == State::Running {
                        inner.ctx.observer.on_shutdown(None);
                    }
                    drop(listener.take());
                    tracing::info!("Acceptor stopped");
                    inner.state.set(State::Stopped);
                    return;
                }
                None => return,
            },

            _ = backoff.expired() => backoff.disarm(),

            accepted = accept(listener.as_ref()), if accepting && !backoff.is_armed() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if inner.state.get() != State::Running {
                            continue;
                        }
                        let started = stream
                            .into_std()
                            .map_err(PackwireError::from)
                            .and_then(|stream| {
                                Session::start(stream, &inner.pool.acquire(), Arc::clone(&inner.ctx))
                            });
                        match started {
                            Ok(_) => {}
                            Err(PackwireError::Transport(e)) if is_resource_exhaustion(&e) => {
                                tracing::warn!("Cannot start session for {}: {}; backing off", peer, e);
                                backoff.arm_in(backoff_delay);
                            }
                            Err(e) => tracing::warn!("Cannot start session for {}: {}", peer, e),
                        }
                    }
                    Err(e) if is_resource_exhaustion(&e) => {
                        tracing::warn!("Accept failed: {}; retrying in {:?}", e, backoff_delay);
                        backoff.arm_in(backoff_delay);
                    }
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                }
            }
        }
    }
}

async fn accept(
    listener: Option<&TcpListener>,
) -> std::io::Result<(tokio::net::TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
