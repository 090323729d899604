use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use embedded_httpd::{FileSystemHandler, Server, ServerConfig, ShutdownHandler, UrlHandlerFactory};
use embedded_httpd::config::{DEFAULT_MAX_LINE_LEN, DEFAULT_MAX_SESSIONS, DEFAULT_MAX_URI_LEN};

#[derive(Parser, Debug)]
#[command(name = "embedded-httpd", version = "1.0", about = "A simple web server")]
struct Args {
    #[arg(short = 'a', long, value_name = "BIND_ADDRESS", env = "HTTPD_ADDRESS", default_value = "127.0.0.1")]
    address: String,
    #[arg(short = 'p', long, value_name = "PORT_NUMBER", env = "HTTPD_PORT", default_value_t = 8080)]
    port: u16,
    #[arg(long, default_value_t = 4)]
    backlog: i32,
    #[arg(long, value_name = "CERT_FILE", requires = "pk")]
    cert: Option<String>,
    #[arg(long, value_name = "PRIVATE_KEY_FILE", requires = "cert")]
    pk: Option<String>,
    /// Path that stops the server when requested
    #[arg(long, value_name = "PATH")]
    shutdown_path: Option<String>,
    /// Receive timeout in seconds, 0 to disable
    #[arg(long, value_name = "SECONDS", env = "HTTPD_TIMEOUT", default_value_t = 10)]
    timeout: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_LEN)]
    max_line_len: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_URI_LEN)]
    max_uri_len: usize,
    #[arg(long, env = "HTTPD_MAX_SESSIONS", default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,
    #[arg(value_name = "ROOT_DIRECTORY")]
    root_directory: PathBuf
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    if !args.root_directory.exists() {
        bail!("Root path does not exist: {}", args.root_directory.display());
    }
    let config = ServerConfig::default()
        .recv_timeout(Duration::from_secs(args.timeout))
        .max_line_len(args.max_line_len)
        .max_uri_len(args.max_uri_len)
        .max_sessions(args.max_sessions);

    let mut handlers: Vec<Arc<dyn UrlHandlerFactory>> = vec![];
    if let Some(path) = &args.shutdown_path {
        handlers.push(Arc::new(ShutdownHandler::new(path)));
    }
    handlers.push(Arc::new(FileSystemHandler::new(&args.root_directory)));

    #[allow(unused_mut)]
    let mut server = Server::new(handlers, config)?;
    match (&args.cert, &args.pk) {
        #[cfg(feature = "tls")]
        (Some(cert_path), Some(private_key_path)) => {
            let context = embedded_httpd::SecurityContext::from_pem_files(cert_path, private_key_path)
                .context("Error loading cert")?;
            server.enable_security(context, true);
        },
        #[cfg(not(feature = "tls"))]
        (Some(_), _) | (_, Some(_)) => bail!("built without TLS support"),
        _ => {}
    }

    let addr = (args.address.as_str(), args.port).to_socket_addrs()
        .with_context(|| format!("resolving {}:{}", args.address, args.port))?
        .next()
        .with_context(|| format!("no address for {}:{}", args.address, args.port))?;
    info!(root = %args.root_directory.display(), "binding to:{}", addr);
    server.serve(addr, args.backlog).context("Error serving")?;
    Ok(())
}
