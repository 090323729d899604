//! An embedded HTTP/1.1 server core.
//!
//! A single serve thread multiplexes a bounded pool of persistent sessions,
//! parses request lines and headers, and offers each request to registered
//! [`UrlHandlerFactory`] instances in order. A second thread delivers pushes
//! that application code requests through a [`SessionContext`].

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

pub mod config;
pub mod error;
#[cfg(feature = "tls")]
pub mod security;
pub mod server;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
#[cfg(feature = "tls")]
pub use security::SecurityContext;
pub use server::connection::Connection;
pub use server::file_system::FileSystemHandler;
pub use server::http::Method;
pub use server::response::{send_chunk, send_error_response, send_response, send_response_chunked, send_simple_response, send_status_line, ErrorHook};
pub use server::shutdown::ShutdownHandler;
pub use server::{HandlerOutcome, Request, ServeState, Server, SessionContext, SessionId, UrlHandler, UrlHandlerFactory};

/// A server running on its own thread, as returned by [`start_server`].
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub server: Arc<Server>,
    handle: Option<JoinHandle<Result<()>>>
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn stop(&self, budget: Duration) -> bool {
        self.server.request_stop(budget)
    }

    /// Waits for the serve thread and returns how the loop ended.
    pub fn join(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(ServerError::Io(io::Error::new(io::ErrorKind::Other, "serve thread panicked")))
            }),
            None => Ok(())
        }
    }
}

/// Binds `address` on the calling thread, then serves on a new one.
pub fn start_server(server: Server, address: &str, backlog: i32) -> Result<ServerHandle> {
    let addr = address.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no address for {}", address)))?;
    let server = Arc::new(server);
    let bound = server.listen(addr, backlog)?;

    let serving = server.clone();
    let handle = Builder::new()
        .name("httpd-serve".to_string())
        .spawn(move || serving.run())
        .map_err(|e| ServerError::Spawn("serve", e))?;
    Ok(ServerHandle { addr: bound, server, handle: Some(handle) })
}
