use std::sync::Arc;
use tracing::debug;
use super::connection::Connection;
use super::response::send_simple_response;
use super::session::SessionContext;
use super::url_handler::{HandlerOutcome, Request, UrlHandler, UrlHandlerFactory};

/// Administrative handler: a request for its path is answered and then stops
/// the whole server.
pub struct ShutdownHandler {
    path: Arc<str>
}

impl ShutdownHandler {
    pub fn new(path: &str) -> ShutdownHandler {
        ShutdownHandler { path: Arc::from(path) }
    }
}

impl UrlHandlerFactory for ShutdownHandler {
    fn create(&self, _session: &SessionContext) -> Option<Box<dyn UrlHandler>> {
        Some(Box::new(ShutdownRequest { path: self.path.clone() }))
    }
}

struct ShutdownRequest {
    path: Arc<str>
}

impl UrlHandler for ShutdownRequest {
    fn process(&mut self, request: &Request<'_>, conn: &mut Connection) -> HandlerOutcome {
        if request.uri != &*self.path {
            return HandlerOutcome::NotHandled;
        }
        let body = b"Stopping";
        if let Err(e) = send_simple_response(conn, 200, Some("text/plain"), body.len(), body) {
            debug!("error acknowledging shutdown:{}", e);
        }
        HandlerOutcome::HandledStop
    }
}
