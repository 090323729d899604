use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use crate::config::ServerConfig;
use super::connection::Connection;
use super::url_handler::{UrlHandler, UrlHandlerFactory};
use super::Shared;

pub type SessionId = u64;

/// A session's handle back to itself and its server.
///
/// Handlers receive one at creation and may clone it onto other threads to
/// request pushes or a server stop.
#[derive(Clone)]
pub struct SessionContext {
    id: SessionId,
    pending: Arc<AtomicUsize>,
    shared: Arc<Shared>
}

impl SessionContext {
    pub(crate) fn new(id: SessionId, shared: Arc<Shared>) -> SessionContext {
        SessionContext { id, pending: Arc::new(AtomicUsize::new(0)), shared }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queues one push to this session, serviced by the send channel.
    pub fn request_send(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.shared.notifier.notify();
    }

    pub fn pending_sends(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn request_server_stop(&self) {
        self.shared.request_stop();
    }
}

/// State of one accepted connection.
///
/// Fields drop in declaration order: handler instances, then buffers, then
/// the socket.
pub struct Session {
    pub(super) handlers: Vec<Box<dyn UrlHandler>>,
    pub(super) line: Vec<u8>,
    pub(super) uri: String,
    pub(super) conn: Connection,
    context: SessionContext,
    stop: bool
}

impl Session {
    pub(crate) fn create(conn: Connection, factories: &[Arc<dyn UrlHandlerFactory>], context: SessionContext, config: &ServerConfig) -> Option<Session> {
        let mut handlers = Vec::with_capacity(factories.len());
        for (index, factory) in factories.iter().enumerate() {
            match factory.create(&context) {
                Some(handler) => handlers.push(handler),
                None => {
                    debug!(session = context.id, handler = index, "handler create failed");
                    return None;
                }
            }
        }
        if let Err(e) = conn.set_read_timeout(config.socket_timeout()) {
            warn!(session = context.id, "error setting receive timeout:{}", e);
            return None;
        }
        Some(Session {
            handlers,
            line: Vec::with_capacity(config.max_line_len),
            uri: String::with_capacity(config.max_uri_len),
            conn,
            context,
            stop: false
        })
    }

    pub fn id(&self) -> SessionId {
        self.context.id
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn mark_stop(&mut self) {
        self.stop = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stop
    }

    /// Runs every handler's push once per outstanding send request.
    pub(crate) fn service_pending_sends(&mut self) -> io::Result<usize> {
        let mut serviced = 0;
        while self.context.pending.load(Ordering::SeqCst) > 0 {
            for handler in self.handlers.iter_mut() {
                handler.push(&mut self.conn)?;
            }
            self.context.pending.fetch_sub(1, Ordering::SeqCst);
            serviced += 1;
        }
        Ok(serviced)
    }
}

impl AsRawFd for Session {
    fn as_raw_fd(&self) -> RawFd {
        self.conn.as_raw_fd()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(session = self.context.id, "session closed");
    }
}
