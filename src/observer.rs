//! Notification sink for listener and session events.
//!
//! Implement [`Observer`] directly, or assemble one from closures with
//! [`Callbacks`]. Every method has a no-op default.
//!
//! Guarantees:
//!
//! - `on_close` fires at most once per session, and only if `on_accept`
//!   fired for it.
//! - `on_shutdown` fires at most once per acceptor stop cycle, only if the
//!   acceptor reached the running state, and only after every session's
//!   `on_close`.
//! - Callbacks run on the worker thread that owns the session or acceptor.
//!   They must not block.
//!
//! # Example
//!
//! ```
//! use packwire::{Callbacks, Observer};
//!
//! let observer = Callbacks::new()
//!     .on_recv(|session, frame| {
//!         let _ = session.send(frame.to_bytes());
//!     })
//!     .on_close(|session, error| {
//!         if let Some(e) = error {
//!             eprintln!("session {} closed: {}", session.id(), e);
//!         }
//!     });
//! Observer::on_listen(&observer);
//! ```

use bytes::Bytes;

use crate::error::PackwireError;
use crate::protocol::Frame;
use crate::session::Session;

/// Receiver of listener and session events.
pub trait Observer: Send + Sync + 'static {
    /// The acceptor is bound and listening. Calling `stop()` here aborts
    /// the start before the first accept.
    fn on_listen(&self) {}

    /// A session finished its handshake. Calling
    /// [`Session::stop`] here vetoes it: the session never runs.
    fn on_accept(&self, _session: &Session) {}

    /// A complete frame arrived. Clone the frame to keep it past the call.
    fn on_recv(&self, _session: &Session, _frame: &Frame) {}

    /// A queued payload was written (`error` is `None`) or dropped.
    fn on_send(&self, _session: &Session, _data: &Bytes, _error: Option<&PackwireError>) {}

    /// The session closed. `error` is `None` for a local stop.
    fn on_close(&self, _session: &Session, _error: Option<&PackwireError>) {}

    /// The acceptor finished shutting down.
    fn on_shutdown(&self, _error: Option<&PackwireError>) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

type ListenFn = Box<dyn Fn() + Send + Sync>;
type SessionFn = Box<dyn Fn(&Session) + Send + Sync>;
type RecvFn = Box<dyn Fn(&Session, &Frame) + Send + Sync>;
type SendFn = Box<dyn Fn(&Session, &Bytes, Option<&PackwireError>) + Send + Sync>;
type CloseFn = Box<dyn Fn(&Session, Option<&PackwireError>) + Send + Sync>;
type ShutdownFn = Box<dyn Fn(Option<&PackwireError>) + Send + Sync>;

/// Closure-based [`Observer`].
#[derive(Default)]
pub struct Callbacks {
    listen: Option<ListenFn>,
    accept: Option<SessionFn>,
    recv: Option<RecvFn>,
    send: Option<SendFn>,
    close: Option<CloseFn>,
    shutdown: Option<ShutdownFn>,
}

impl Callbacks {
    /// Empty set of callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen callback.
    pub fn on_listen<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listen = Some(Box::new(f));
        self
    }

    /// Set the accept callback.
    pub fn on_accept<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.accept = Some(Box::new(f));
        self
    }

    /// Set the frame callback.
    pub fn on_recv<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session, &Frame) + Send + Sync + 'static,
    {
        self.recv = Some(Box::new(f));
        self
    }

    /// Set the send completion callback.
    pub fn on_send<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session, &Bytes, Option<&PackwireError>) + Send + Sync + 'static,
    {
        self.send = Some(Box::new(f));
        self
    }

    /// Set the close callback.
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session, Option<&PackwireError>) + Send + Sync + 'static,
    {
        self.close = Some(Box::new(f));
        self
    }

    /// Set the shutdown callback.
    pub fn on_shutdown<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&PackwireError>) + Send + Sync + 'static,
    {
        self.shutdown = Some(Box::new(f));
        self
    }
}

impl Observer for Callbacks {
    fn on_listen(&self) {
        if let Some(f) = &self.listen {
            f();
        }
    }

    fn on_accept(&self, session: &Session) {
        if let Some(f) = &self.accept {
            f(session);
        }
    }

    fn on_recv(&self, session: &Session, frame: &Frame) {
        if let Some(f) = &self.recv {
            f(session, frame);
        }
    }

    fn on_send(&self, session: &Session, data: &Bytes, error: Option<&PackwireError>) {
        if let Some(f) = &self.send {
            f(session, data, error);
        }
    }

    fn on_close(&self, session: &Session, error: Option<&PackwireError>) {
        if let Some(f) = &self.close {
            f(session, error);
        }
    }

    fn on_shutdown(&self, error: Option<&PackwireError>) {
        if let Some(f) = &self.shutdown {
            f(error);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_listen", &self.listen.is_some())
            .field("on_accept", &self.accept.is_some())
            .field("on_recv", &self.recv.is_some())
            .field("on_send", &self.send.is_some())
            .field("on_close", &self.close.is_some())
            .field("on_shutdown", &self.shutdown.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_callbacks_dispatch() {
        let listens = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));

        let l = Arc::clone(&listens);
        let s = Arc::clone(&shutdowns);
        let callbacks = Callbacks::new()
            .on_listen(move || {
                l.fetch_add(1, Ordering::SeqCst);
            })
            .on_shutdown(move |error| {
                assert!(error.is_none());
                s.fetch_add(1, Ordering::SeqCst);
            });

        Observer::on_listen(&callbacks);
        Observer::on_listen(&callbacks);
        Observer::on_shutdown(&callbacks, None);

        assert_eq!(listens.load(Ordering::SeqCst), 2);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unset_callbacks_are_noops() {
        let callbacks = Callbacks::new();
        Observer::on_listen(&callbacks);
        Observer::on_shutdown(&callbacks, Some(&PackwireError::Cancelled));
        assert!(format!("{:?}", callbacks).contains("on_recv: false"));
    }
}
