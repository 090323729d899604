use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("error on bind to {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("error on listen: {0}")]
    Listen(io::Error),
    #[error("error on accept: {0}")]
    Accept(io::Error),
    #[error("readiness wait failed: {0}")]
    Poll(io::Error),
    #[error("wake-up channel failed: {0}")]
    Waker(io::Error),
    #[error("session lock poisoned")]
    LockPoisoned,
    #[error("server is not listening")]
    NotListening,
    #[error("server is already serving")]
    AlreadyServing,
    #[error("error spawning {0} thread: {1}")]
    Spawn(&'static str, io::Error),
    #[cfg(feature = "tls")]
    #[error("error setting up security context: {0}")]
    Security(#[from] openssl::error::ErrorStack),
    #[error("error reading {path}: {source}")]
    Certificate { path: String, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
