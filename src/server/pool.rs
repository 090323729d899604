use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use super::connection::Connection;
use super::session::{Session, SessionContext, SessionId};
use super::url_handler::UrlHandlerFactory;
use super::Shared;

/// What a new session is built from.
pub(crate) struct SessionSetup<'a> {
    pub factories: &'a [Arc<dyn UrlHandlerFactory>],
    pub shared: &'a Arc<Shared>,
    pub config: &'a ServerConfig
}

/// Live sessions in admission order; the head is the oldest.
pub struct SessionPool {
    sessions: Vec<Session>,
    next_id: SessionId
}

impl SessionPool {
    pub fn new() -> SessionPool {
        SessionPool { sessions: Vec::new(), next_id: 1 }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.id()).collect()
    }

    /// Admits `conn` as a new session, evicting the oldest when at capacity.
    ///
    /// Returns `None` (and closes `conn`) when a handler refuses the session.
    pub(crate) fn add_session(&mut self, conn: Connection, setup: &SessionSetup) -> Option<SessionId> {
        let live = self.sessions.iter().filter(|s| !s.is_stopped()).count();
        if live >= setup.config.max_sessions {
            if let Some(oldest) = self.sessions.iter_mut().find(|s| !s.is_stopped()) {
                debug!(session = oldest.id(), "pool full, evicting oldest session");
                oldest.mark_stop();
            }
        }
        self.prune();

        let id = self.next_id;
        self.next_id += 1;
        let context = SessionContext::new(id, setup.shared.clone());
        let session = Session::create(conn, setup.factories, context, setup.config)?;
        self.sessions.push(session);
        Some(id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id() == id)
    }

    pub fn mark_stop(&mut self, id: SessionId) {
        if let Some(session) = self.get_mut(id) {
            session.mark_stop();
        }
    }

    pub fn mark_all(&mut self) {
        self.sessions.iter_mut().for_each(|s| s.mark_stop());
    }

    pub fn has_stopped(&self) -> bool {
        self.sessions.iter().any(|s| s.is_stopped())
    }

    /// Drops every session marked stop, in list order. Returns how many went.
    pub fn prune(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|s| !s.is_stopped());
        before - self.sessions.len()
    }

    /// Sockets of the sessions still eligible for a transaction.
    pub fn poll_targets(&self) -> Vec<(SessionId, RawFd)> {
        self.sessions.iter()
            .filter(|s| !s.is_stopped())
            .map(|s| (s.id(), s.as_raw_fd()))
            .collect()
    }

    /// Services pending pushes; a session whose push fails is marked stop.
    /// Returns the number of sessions so marked.
    pub fn service_pending_sends(&mut self) -> usize {
        let mut failed = 0;
        for session in self.sessions.iter_mut().filter(|s| !s.is_stopped()) {
            if session.context().pending_sends() == 0 {
                continue;
            }
            if let Err(e) = session.service_pending_sends() {
                warn!(session = session.id(), "push failed:{}", e);
                session.mark_stop();
                failed += 1;
            }
        }
        failed
    }
}

impl Default for SessionPool {
    fn default() -> SessionPool {
        SessionPool::new()
    }
}

/// The session pool behind the mutex shared by the serve loop and the send
/// channel. All access is scoped to [`SessionStore::with_lock`].
pub struct SessionStore {
    pool: Mutex<SessionPool>
}

impl SessionStore {
    pub fn new() -> SessionStore {
        SessionStore { pool: Mutex::new(SessionPool::new()) }
    }

    pub fn with_lock<R, F: FnOnce(&mut SessionPool) -> R>(&self, f: F) -> Result<R> {
        let mut pool = self.pool.lock().map_err(|_| ServerError::LockPoisoned)?;
        Ok(f(&mut pool))
    }
}

impl Default for SessionStore {
    fn default() -> SessionStore {
        SessionStore::new()
    }
}
