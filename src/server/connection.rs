use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
#[cfg(feature = "tls")]
use openssl::ssl::SslStream;

/// The byte stream a session transacts on: plain TCP or TLS over TCP.
#[derive(Debug)]
pub enum Connection {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<SslStream<TcpStream>>)
}

impl Connection {
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Connection::Plain(stream) => stream,
            #[cfg(feature = "tls")]
            Connection::Tls(stream) => stream.get_ref()
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_read_timeout(timeout)
    }
}

impl From<TcpStream> for Connection {
    fn from(stream: TcpStream) -> Connection {
        Connection::Plain(stream)
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(stream) => stream.read(buf),
            #[cfg(feature = "tls")]
            Connection::Tls(stream) => stream.read(buf)
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(stream) => stream.write(buf),
            #[cfg(feature = "tls")]
            Connection::Tls(stream) => stream.write(buf)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Plain(stream) => stream.flush(),
            #[cfg(feature = "tls")]
            Connection::Tls(stream) => stream.flush()
        }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.tcp().as_raw_fd()
    }
}
