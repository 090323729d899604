use std::fs::File;
use std::io::Read;
use std::net::TcpStream;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslAcceptor, SslMethod, SslStream};
use openssl::x509::X509;
use tracing::debug;
use crate::error::{Result, ServerError};

/// TLS acceptor used for the per-connection handshake of a secured server.
#[derive(Clone)]
pub struct SecurityContext {
    acceptor: SslAcceptor
}

impl SecurityContext {
    pub fn new(acceptor: SslAcceptor) -> SecurityContext {
        SecurityContext { acceptor }
    }

    pub fn from_pem_files(cert_path: &str, private_key_path: &str) -> Result<SecurityContext> {
        let (pkey, cert) = load_cert(cert_path, private_key_path)?;
        let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
        builder.set_private_key(&pkey)?;
        builder.set_certificate(&cert)?;
        builder.check_private_key()?;
        debug!(cert = cert_path, "security context loaded");
        Ok(SecurityContext { acceptor: builder.build() })
    }

    /// Runs the server side of the handshake on a freshly accepted socket.
    pub fn handshake(&self, stream: TcpStream) -> std::result::Result<SslStream<TcpStream>, String> {
        self.acceptor.accept(stream).map_err(|e| e.to_string())
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>> {
    let mut buff: Vec<u8> = vec![];
    File::open(path)
        .and_then(|mut file| file.read_to_end(&mut buff))
        .map_err(|source| ServerError::Certificate { path: path.to_string(), source })?;
    Ok(buff)
}

fn load_cert(cert_path: &str, private_key_path: &str) -> Result<(PKey<Private>, X509)> {
    let pkey = PKey::private_key_from_pem(&read_pem(private_key_path)?)?;
    let x509 = X509::from_pem(&read_pem(cert_path)?)?;
    Ok((pkey, x509))
}
