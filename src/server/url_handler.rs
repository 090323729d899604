use std::io;
use super::connection::Connection;
use super::http::Method;
use super::session::SessionContext;

/// What a handler did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Not this handler's request; the next handler is asked.
    NotHandled,
    /// Response sent, keep the connection.
    Handled,
    /// Close this session. Nothing further is sent.
    ErrorHandled,
    /// Close this session and stop the whole server.
    HandledStop
}

/// A parsed request as handed to [`UrlHandler::process`].
///
/// Any request body (`content_length` bytes) is still unread on the connection;
/// a handler that claims the request owns consuming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub method: Method,
    pub uri: &'a str,
    pub args: Option<&'a str>,
    pub content_length: usize
}

/// Per-session handler instance, created by a [`UrlHandlerFactory`] when a
/// session starts and dropped when it ends.
pub trait UrlHandler: Send {
    /// Called before the header lines of each request are scanned.
    fn start_request(&mut self) {}

    /// Sees every header line of the request, CRLF stripped.
    fn scan_field(&mut self, _method: Method, _uri: &str, _line: &str) {}

    fn process(&mut self, _request: &Request<'_>, _conn: &mut Connection) -> HandlerOutcome {
        HandlerOutcome::NotHandled
    }

    /// Performs one outstanding push requested through
    /// [`SessionContext::request_send`].
    fn push(&mut self, _conn: &mut Connection) -> io::Result<()> {
        Ok(())
    }
}

/// A registered URL handler. Returning `None` from `create` aborts admission
/// of the session.
pub trait UrlHandlerFactory: Send + Sync {
    fn create(&self, session: &SessionContext) -> Option<Box<dyn UrlHandler>>;
}

impl<F> UrlHandlerFactory for F where F: Fn(&SessionContext) -> Option<Box<dyn UrlHandler>> + Send + Sync {
    fn create(&self, session: &SessionContext) -> Option<Box<dyn UrlHandler>> {
        self(session)
    }
}
