//! Registry of running sessions.
//!
//! Sessions register themselves when they reach `Running` and remove
//! themselves after their close notification. [`SessionManager::stop_all`]
//! stops everything and runs a completion callback when the last session is
//! gone, without blocking anyone.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{Session, SessionId};

type DrainedFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Session>,
    closing: bool,
    on_drained: Vec<DrainedFn>,
}

/// Shared registry of running sessions.
#[derive(Clone, Default)]
pub struct SessionManager {
    inner: Arc<Mutex<Registry>>,
}

impl SessionManager {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Returns `false` once [`stop_all`](Self::stop_all) has
    /// begun; the caller must then stop the session itself.
    ///
    /// Registering the same session twice is a no-op.
    pub fn register(&self, session: &Session) -> bool {
        let mut registry = self.inner.lock();
        if registry.closing {
            return false;
        }
        registry
            .sessions
            .entry(session.id())
            .or_insert_with(|| session.clone());
        true
    }

    /// Remove a session. Runs pending `stop_all` callbacks when this was the
    /// last one.
    pub fn remove(&self, session: &Session) {
        let drained = {
            let mut registry = self.inner.lock();
            if registry.sessions.remove(&session.id()).is_none() {
                return;
            }
            if registry.closing && registry.sessions.is_empty() {
                std::mem::take(&mut registry.on_drained)
            } else {
                Vec::new()
            }
        };

        for callback in drained {
            callback();
        }
    }

    /// Stop every registered session and call `on_done` once all of them
    /// have removed themselves. Runs `on_done` immediately when the registry
    /// is empty.
    ///
    /// New registrations are refused until [`reopen`](Self::reopen).
    pub fn stop_all<F>(&self, on_done: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let sessions: Vec<Session> = {
            let mut registry = self.inner.lock();
            registry.closing = true;
            if registry.sessions.is_empty() {
                drop(registry);
                on_done();
                return;
            }
            registry.on_drained.push(Box::new(on_done));
            registry.sessions.values().cloned().collect()
        };

        tracing::debug!("Stopping {} sessions", sessions.len());
        for session in sessions {
            session.stop();
        }
    }

    /// Accept registrations again after a completed `stop_all`.
    pub(crate) fn reopen(&self) {
        let mut registry = self.inner.lock();
        registry.closing = false;
    }

    /// Whether `stop_all` has begun and registrations are refused.
    pub fn is_closing(&self) -> bool {
        self.inner.lock().closing
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a session by id.
    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.inner.lock().sessions.get(&id).cloned()
    }

    /// Snapshot of the registered sessions.
    pub fn sessions(&self) -> Vec<Session> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    /// Queue `data` on every running session. Returns how many accepted it.
    pub fn broadcast(&self, data: impl Into<Bytes>) -> usize {
        let data = data.into();
        self.sessions()
            .iter()
            .filter(|session| session.send(data.clone()).is_ok())
            .count()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.lock();
        f.debug_struct("SessionManager")
            .field("sessions", &registry.sessions.len())
            .field("closing", &registry.closing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_register_is_idempotent() {
        let manager = SessionManager::new();
        let session = Session::detached();
        assert!(manager.register(&session));
        assert!(manager.register(&session));
        assert_eq!(manager.len(), 1);
        assert!(manager.get(session.id()).is_some());
    }

    #[test]
    fn test_stop_all_on_empty_runs_immediately() {
        let manager = SessionManager::new();
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        manager.stop_all(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(manager.is_closing());
    }

    #[test]
    fn test_stop_all_waits_for_last_removal() {
        let manager = SessionManager::new();
        let a = Session::detached();
        let b = Session::detached();
        manager.register(&a);
        manager.register(&b);

        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        manager.stop_all(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(done.load(Ordering::SeqCst), 0);
        manager.remove(&a);
        assert_eq!(done.load(Ordering::SeqCst), 0);
        // unknown session must not count
        manager.remove(&Session::detached());
        assert_eq!(done.load(Ordering::SeqCst), 0);
        manager.remove(&b);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registration_refused_while_closing() {
        let manager = SessionManager::new();
        manager.stop_all(|| {});
        assert!(!manager.register(&Session::detached()));

        manager.reopen();
        assert!(manager.register(&Session::detached()));
    }

    #[test]
    fn test_broadcast_skips_sessions_not_running() {
        let manager = SessionManager::new();
        manager.register(&Session::detached());
        assert_eq!(manager.broadcast(&b"hi"[..]), 0);
    }
}
