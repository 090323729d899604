use std::io::{self, ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace};
use crate::config::ServerConfig;
use super::connection::Connection;
use super::http::{classify, parse_content_length, parse_request_line, receive_line, split_query, BadRequest, LineStatus, LineTag};
use super::response::{send_error_response, ErrorHook};
use super::session::Session;
use super::url_handler::{HandlerOutcome, Request, UrlHandler};

const DRAIN_CHUNK: usize = 32;

/// Whether a session survives its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    Continue,
    Stop
}

pub(crate) struct TransactionContext<'a> {
    pub config: &'a ServerConfig,
    pub stop: &'a AtomicBool,
    pub hook: Option<&'a dyn ErrorHook>
}

/// Receives one request on `session` and dispatches it to the handlers.
pub(crate) fn transact(ctx: &TransactionContext, session: &mut Session) -> Transaction {
    let id = session.id();
    let Session { handlers, line, uri, conn, .. } = session;

    match receive_line(conn, line, ctx.config.max_line_len, ctx.hook) {
        LineStatus::LineReceived => {},
        LineStatus::EndOfHeader => {
            trace!(session = id, "blank line before request line");
            return Transaction::Continue;
        },
        LineStatus::Error => return Transaction::Stop
    }

    let method = match parse_request_line(line, ctx.config.max_uri_len) {
        Ok(request_line) => {
            uri.clear();
            uri.push_str(request_line.uri);
            request_line.method
        },
        Err(BadRequest { status, reason }) => {
            debug!(session = id, status, "bad request:{}", reason);
            let _ = send_error_response(conn, status, ctx.hook);
            return Transaction::Stop;
        }
    };
    let (path, args) = split_query(uri.as_str());

    for handler in handlers.iter_mut() {
        handler.start_request();
    }
    let mut content_length = 0;
    loop {
        match receive_line(conn, line, ctx.config.max_line_len, ctx.hook) {
            LineStatus::EndOfHeader => break,
            LineStatus::Error => return Transaction::Stop,
            LineStatus::LineReceived => {
                if classify(line) == LineTag::ContentLength {
                    content_length = parse_content_length(line);
                }
                let field = String::from_utf8_lossy(&line[..line.len() - 2]);
                for handler in handlers.iter_mut() {
                    handler.scan_field(method, path, &field);
                }
            }
        }
    }

    let request = Request { method, uri: path, args, content_length };
    match dispatch(handlers, &request, conn) {
        HandlerOutcome::Handled => Transaction::Continue,
        HandlerOutcome::NotHandled => {
            debug!(session = id, %method, uri = path, "no handler for request");
            if let Err(e) = drain(conn, content_length) {
                debug!(session = id, "error draining body:{}", e);
                return Transaction::Stop;
            }
            match send_error_response(conn, 404, ctx.hook) {
                Ok(()) => Transaction::Continue,
                Err(e) => {
                    debug!(session = id, "error sending 404:{}", e);
                    Transaction::Stop
                }
            }
        },
        HandlerOutcome::ErrorHandled => Transaction::Stop,
        HandlerOutcome::HandledStop => {
            info!(session = id, uri = path, "handler requested server stop");
            ctx.stop.store(true, Ordering::SeqCst);
            Transaction::Stop
        }
    }
}

/// Offers the request to each handler in registration order until one claims it.
fn dispatch(handlers: &mut [Box<dyn UrlHandler>], request: &Request<'_>, conn: &mut Connection) -> HandlerOutcome {
    for handler in handlers.iter_mut() {
        match handler.process(request, conn) {
            HandlerOutcome::NotHandled => continue,
            outcome => return outcome
        }
    }
    HandlerOutcome::NotHandled
}

/// Consumes exactly `remaining` body bytes.
fn drain<R: Read>(reader: &mut R, mut remaining: usize) -> io::Result<()> {
    let mut chunk = [0u8; DRAIN_CHUNK];
    while remaining > 0 {
        let want = remaining.min(DRAIN_CHUNK);
        match reader.read(&mut chunk[..want]) {
            Ok(0) => return Err(io::Error::new(ErrorKind::UnexpectedEof, "request body truncated")),
            Ok(read) => remaining -= read,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) => return Err(e)
        }
    }
    Ok(())
}
