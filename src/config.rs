use std::time::Duration;

pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_LINE_LEN: usize = 1024;
pub const DEFAULT_MAX_URI_LEN: usize = 512;
pub const DEFAULT_MAX_SESSIONS: usize = 8;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Limits applied to every session the server admits.
///
/// `max_line_len` counts the terminating CRLF. A zero `recv_timeout` leaves
/// accepted sockets without a receive timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub recv_timeout: Duration,
    pub max_line_len: usize,
    pub max_uri_len: usize,
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            max_uri_len: DEFAULT_MAX_URI_LEN,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl ServerConfig {
    pub fn recv_timeout(mut self, timeout: Duration) -> ServerConfig {
        self.recv_timeout = timeout;
        self
    }

    pub fn max_line_len(mut self, len: usize) -> ServerConfig {
        self.max_line_len = len;
        self
    }

    pub fn max_uri_len(mut self, len: usize) -> ServerConfig {
        self.max_uri_len = len;
        self
    }

    pub fn max_sessions(mut self, sessions: usize) -> ServerConfig {
        self.max_sessions = sessions.max(1);
        self
    }

    /// Socket-level timeout, `None` when disabled.
    pub fn socket_timeout(&self) -> Option<Duration> {
        if self.recv_timeout.is_zero() {
            None
        } else {
            Some(self.recv_timeout)
        }
    }

    /// Bound on a TLS handshake, which runs before the session exists.
    /// Falls back to [`DEFAULT_HANDSHAKE_TIMEOUT`] when receive timeouts are disabled.
    pub fn handshake_timeout(&self) -> Duration {
        self.socket_timeout().unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}
