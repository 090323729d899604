use std::fs;
use std::io::{BufRead, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use bufstream::BufStream;
use embedded_httpd::{send_chunk, send_response_chunked, send_simple_response, start_server, Connection, FileSystemHandler, HandlerOutcome, Request, ServeState, Server, ServerConfig, ServerHandle, SessionContext, ShutdownHandler, UrlHandler, UrlHandlerFactory};

const STOP_BUDGET: Duration = Duration::from_secs(5);
const SLOW_HANDLER: Duration = Duration::from_millis(1500);

struct StatusHandler;

impl UrlHandler for StatusHandler {
    fn process(&mut self, request: &Request<'_>, conn: &mut Connection) -> HandlerOutcome {
        match request.uri {
            "/status" => {
                send_simple_response(conn, 200, Some("text/plain"), 2, b"OK").unwrap();
                HandlerOutcome::Handled
            },
            "/args" => {
                let args = request.args.unwrap_or("").as_bytes();
                send_simple_response(conn, 200, Some("text/plain"), args.len(), args).unwrap();
                HandlerOutcome::Handled
            },
            "/length" => {
                let mut body = vec![0; request.content_length];
                conn.read_exact(&mut body).unwrap();
                let length = request.content_length.to_string();
                send_simple_response(conn, 200, Some("text/plain"), length.len(), length.as_bytes()).unwrap();
                HandlerOutcome::Handled
            },
            "/slow" => {
                thread::sleep(SLOW_HANDLER);
                send_simple_response(conn, 200, Some("text/plain"), 2, b"OK").unwrap();
                HandlerOutcome::Handled
            },
            "/chunked" => {
                send_response_chunked(conn, 200, Some("text/plain")).unwrap();
                for chunk in chunks() {
                    send_chunk(conn, chunk.as_bytes()).unwrap();
                }
                send_chunk(conn, b"").unwrap();
                HandlerOutcome::Handled
            },
            _ => HandlerOutcome::NotHandled
        }
    }
}

fn chunks() -> Vec<String> {
    vec!["alpha".to_string(), "beta".repeat(100), "gamma".to_string()]
}

fn status_factory() -> Arc<dyn UrlHandlerFactory> {
    Arc::new(|_: &SessionContext| Some(Box::new(StatusHandler) as Box<dyn UrlHandler>))
}

fn start(handlers: Vec<Arc<dyn UrlHandlerFactory>>, config: ServerConfig) -> ServerHandle {
    start_server(Server::new(handlers, config).unwrap(), "127.0.0.1:0", 4).unwrap()
}

fn connect(handle: &ServerHandle) -> BufStream<TcpStream> {
    let stream = TcpStream::connect(handle.addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    BufStream::new(stream)
}

fn send(stream: &mut BufStream<TcpStream>, request: &str) {
    stream.write_all(request.as_bytes()).unwrap();
    stream.flush().unwrap();
}

/// Reads one Content-Length framed response, returning (head, body).
fn read_response<S: BufRead>(stream: &mut S) -> (String, String) {
    let mut head = String::new();
    let mut length = 0;
    loop {
        let mut line = String::new();
        stream.read_line(&mut line).unwrap();
        if line == "\r\n" || line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            length = value.trim().parse().unwrap();
        }
        head.push_str(&line);
    }
    let mut body = vec![0; length];
    stream.read_exact(&mut body).unwrap();
    (head, String::from_utf8(body).unwrap())
}

fn is_closed(stream: &mut BufStream<TcpStream>) -> bool {
    let mut line = String::new();
    matches!(stream.read_line(&mut line), Ok(0) | Err(_))
}

fn stop(handle: ServerHandle) {
    assert!(handle.stop(STOP_BUDGET));
    handle.join().unwrap();
}

#[test]
fn status_request_gets_exact_wire_response() {
    let handle = start(vec![status_factory()], ServerConfig::default());
    let mut stream = connect(&handle);
    send(&mut stream, "GET /status HTTP/1.1\r\nHost: x\r\n\r\n");

    let expected = "HTTP/1.1 200 OK\r\nContent-Type:text/plain\r\nContent-Length:2\r\n\r\nOK";
    let mut received = vec![0; expected.len()];
    stream.read_exact(&mut received).unwrap();
    assert_eq!(expected, String::from_utf8(received).unwrap());
    stop(handle);
}

#[test]
fn downloads_get_request() {
    let handle = start(vec![status_factory()], ServerConfig::default());
    let url = format!("http://127.0.0.1:{}/status", handle.port());
    let response = reqwest::blocking::get(&url).unwrap();
    assert_eq!(reqwest::StatusCode::OK, response.status());
    assert_eq!("OK", response.text().unwrap());
    stop(handle);
}

#[test]
fn returns_404_on_unknown_path() {
    let handle = start(vec![status_factory()], ServerConfig::default());
    let url = format!("http://127.0.0.1:{}/not-status", handle.port());
    let response = reqwest::blocking::get(&url).unwrap();
    assert_eq!(reqwest::StatusCode::NOT_FOUND, response.status());
    assert_eq!("Failed: 404 Not Found", response.text().unwrap());
    stop(handle);
}

#[test]
fn query_args_reach_handler() {
    let handle = start(vec![status_factory()], ServerConfig::default());
    let url = format!("http://127.0.0.1:{}/args?a=1&b=2", handle.port());
    assert_eq!("a=1&b=2", reqwest::blocking::get(&url).unwrap().text().unwrap());
    stop(handle);
}

#[test]
fn client_body_length_reaches_handler() {
    let handle = start(vec![status_factory()], ServerConfig::default());
    let client = reqwest::blocking::Client::new();
    let base = format!("http://127.0.0.1:{}", handle.port());

    let response = client.post(format!("{}/length", base)).body("hello").send().unwrap();
    assert_eq!("5", response.text().unwrap());
    let response = client.post(format!("{}/unclaimed", base)).body("hello").send().unwrap();
    assert_eq!(reqwest::StatusCode::NOT_FOUND, response.status());
    let _ = response.text().unwrap();
    assert_eq!("OK", client.get(format!("{}/status", base)).send().unwrap().text().unwrap());

    let started = Instant::now();
    stop(handle);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn stop_reports_failure_when_loop_is_busy() {
    let handle = start(vec![status_factory()], ServerConfig::default());
    let mut stream = connect(&handle);
    send(&mut stream, "GET /slow HTTP/1.1\r\n\r\n");
    thread::sleep(Duration::from_millis(300));

    assert!(!handle.stop(Duration::from_millis(100)));
    assert_ne!(ServeState::Idle, handle.server.state());
    assert_eq!("OK", read_response(&mut stream).1);
    assert!(handle.stop(STOP_BUDGET));
    handle.join().unwrap();
}

#[test]
fn persistent_connection_serves_several_requests() {
    let handle = start(vec![status_factory()], ServerConfig::default());
    let mut stream = connect(&handle);
    for _ in 0..3 {
        send(&mut stream, "GET /status HTTP/1.1\r\n\r\n");
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!("OK", body);
    }
    stop(handle);
}

#[test]
fn unclaimed_body_is_drained_before_next_request() {
    let handle = start(vec![status_factory()], ServerConfig::default());
    let mut stream = connect(&handle);
    let body = "x".repeat(100);
    send(&mut stream, &format!("POST /upload HTTP/1.1\r\nContent-Length: 100\r\n\r\n{}GET /status HTTP/1.1\r\n\r\n", body));

    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!("OK", body);
    stop(handle);
}

#[test]
fn overlong_request_line_gets_413_and_close() {
    let handle = start(vec![status_factory()], ServerConfig::default().max_line_len(64));
    let mut stream = connect(&handle);
    send(&mut stream, &format!("GET /{}", "a".repeat(60)));

    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 413 "));
    assert!(is_closed(&mut stream));
    stop(handle);
}

#[test]
fn malformed_request_gets_400_and_close() {
    let handle = start(vec![status_factory()], ServerConfig::default());
    let mut stream = connect(&handle);
    send(&mut stream, "BREW /pot HTTP/1.1\r\n");

    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(is_closed(&mut stream));

    let mut other = connect(&handle);
    send(&mut other, "GET /status HTTP/1.1\r\n\r\n");
    assert_eq!("OK", read_response(&mut other).1);
    stop(handle);
}

#[test]
fn chunked_body_decodes_with_standard_client() {
    let handle = start(vec![status_factory()], ServerConfig::default());
    let client = reqwest::blocking::Client::new();
    let url = format!("http://127.0.0.1:{}/chunked", handle.port());
    for _ in 0..2 {
        let response = client.get(&url).send().unwrap();
        assert_eq!(reqwest::StatusCode::OK, response.status());
        assert_eq!(chunks().concat(), response.text().unwrap());
    }
    stop(handle);
}

#[test]
fn oldest_session_is_evicted_at_capacity() {
    let handle = start(vec![status_factory()], ServerConfig::default().max_sessions(1));
    let mut first = connect(&handle);
    send(&mut first, "GET /status HTTP/1.1\r\n\r\n");
    assert_eq!("OK", read_response(&mut first).1);

    let mut second = connect(&handle);
    send(&mut second, "GET /status HTTP/1.1\r\n\r\n");
    assert_eq!("OK", read_response(&mut second).1);

    assert!(is_closed(&mut first));
    assert_eq!(1, handle.server.session_count().unwrap());
    stop(handle);
}

#[test]
fn shutdown_handler_stops_server_and_closes_sessions() {
    let handle = start(vec![Arc::new(ShutdownHandler::new("/shutdown")) as Arc<dyn UrlHandlerFactory>, status_factory()], ServerConfig::default());
    let server = handle.server.clone();
    let mut idle = connect(&handle);
    send(&mut idle, "GET /status HTTP/1.1\r\n\r\n");
    assert_eq!("OK", read_response(&mut idle).1);

    let mut admin = connect(&handle);
    send(&mut admin, "GET /shutdown HTTP/1.1\r\n\r\n");
    assert_eq!("Stopping", read_response(&mut admin).1);

    handle.join().unwrap();
    assert_eq!(ServeState::Idle, server.state());
    assert!(is_closed(&mut idle));
}

#[test]
fn request_stop_is_idempotent() {
    let handle = start(vec![status_factory()], ServerConfig::default());
    assert!(handle.stop(STOP_BUDGET));
    let started = Instant::now();
    assert!(handle.stop(STOP_BUDGET));
    assert!(started.elapsed() < Duration::from_secs(1));
    handle.join().unwrap();
}

#[test]
fn error_hook_replaces_synthesized_errors() {
    let mut server = Server::new(vec![status_factory()], ServerConfig::default()).unwrap();
    server.set_error_hook(|w: &mut dyn Write, status: u16| {
        status == 404 && w.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length:4\r\n\r\nnope").is_ok()
    });
    let handle = start_server(server, "127.0.0.1:0", 4).unwrap();
    let mut stream = connect(&handle);
    send(&mut stream, "GET /missing HTTP/1.1\r\n\r\n");
    assert_eq!("nope", read_response(&mut stream).1);
    stop(handle);
}

struct EventHandler {
    slot: Arc<Mutex<Option<SessionContext>>>,
    context: SessionContext
}

impl UrlHandler for EventHandler {
    fn process(&mut self, request: &Request<'_>, conn: &mut Connection) -> HandlerOutcome {
        if request.uri != "/events" {
            return HandlerOutcome::NotHandled;
        }
        send_response_chunked(conn, 200, Some("text/plain")).unwrap();
        *self.slot.lock().unwrap() = Some(self.context.clone());
        HandlerOutcome::Handled
    }

    fn push(&mut self, conn: &mut Connection) -> std::io::Result<()> {
        send_chunk(conn, b"tick")
    }
}

#[test]
fn pushes_are_delivered_out_of_band() {
    let slot: Arc<Mutex<Option<SessionContext>>> = Arc::new(Mutex::new(None));
    let factory_slot = slot.clone();
    let factory: Arc<dyn UrlHandlerFactory> = Arc::new(move |context: &SessionContext| {
        Some(Box::new(EventHandler { slot: factory_slot.clone(), context: context.clone() }) as Box<dyn UrlHandler>)
    });
    let handle = start(vec![factory], ServerConfig::default());
    let mut stream = connect(&handle);
    send(&mut stream, "GET /events HTTP/1.1\r\n\r\n");
    let mut line = String::new();
    while line != "\r\n" {
        line.clear();
        stream.read_line(&mut line).unwrap();
    }

    let context = slot.lock().unwrap().clone().unwrap();
    let pusher = thread::spawn(move || {
        context.request_send();
        context.request_send();
    });
    pusher.join().unwrap();

    for _ in 0..2 {
        line.clear();
        stream.read_line(&mut line).unwrap();
        assert_eq!("4\r\n", line);
        line.clear();
        stream.read_line(&mut line).unwrap();
        assert_eq!("tick\r\n", line);
    }
    stop(handle);
}

#[test]
fn serves_single_connection_without_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::new(vec![status_factory()], ServerConfig::default()).unwrap());
    let serving = server.clone();
    let worker = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        serving.serve_connection(stream)
    });

    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut stream = BufStream::new(stream);
    send(&mut stream, "GET /status HTTP/1.1\r\n\r\n");
    assert_eq!("OK", read_response(&mut stream).1);
    drop(stream);

    worker.join().unwrap().unwrap();
    assert_eq!(ServeState::Idle, server.state());
}

#[test]
fn file_system_handler_serves_root() {
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("index.html"), "<h1>hi</h1>").unwrap();
    fs::create_dir(root.path().join("docs")).unwrap();
    fs::write(root.path().join("docs/readme.txt"), "plain").unwrap();
    fs::write(root.path().join("docs/readme.txt.gz"), "zipped").unwrap();
    let handle = start(vec![Arc::new(FileSystemHandler::new(root.path())) as Arc<dyn UrlHandlerFactory>], ServerConfig::default());
    let mut stream = connect(&handle);

    send(&mut stream, "GET / HTTP/1.1\r\n\r\n");
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Content-Type: text/html\r\n"));
    assert!(head.contains("Last-Modified: "));
    assert_eq!("<h1>hi</h1>", body);

    send(&mut stream, "GET /docs/readme.txt HTTP/1.1\r\nAccept-Encoding: gzip, deflate\r\n\r\n");
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Content-Encoding: gzip\r\n"));
    assert_eq!("zipped", body);

    send(&mut stream, "GET /docs/readme.txt HTTP/1.1\r\n\r\n");
    assert_eq!("plain", read_response(&mut stream).1);

    send(&mut stream, "GET /docs/readme.txt HTTP/1.1\r\nIf-Modified-Since: Fri, 01 Jan 2100 00:00:00 GMT\r\n\r\n");
    assert!(read_response(&mut stream).0.starts_with("HTTP/1.1 304 Not Modified\r\n"));

    send(&mut stream, "GET /../secret HTTP/1.1\r\n\r\n");
    assert!(read_response(&mut stream).0.starts_with("HTTP/1.1 404 "));
    stop(handle);
}

#[cfg(feature = "tls")]
mod tls {
    use std::io::{BufReader, Write};
    use std::net::TcpStream;
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode};
    use openssl::x509::{X509NameBuilder, X509};
    use embedded_httpd::{start_server, SecurityContext, Server, ServerConfig};
    use super::{read_response, status_factory, stop};

    fn self_signed_context() -> SecurityContext {
        let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "localhost").unwrap();
        let name = name.build();
        let mut cert = X509::builder().unwrap();
        cert.set_version(2).unwrap();
        cert.set_serial_number(&BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap()).unwrap();
        cert.set_subject_name(&name).unwrap();
        cert.set_issuer_name(&name).unwrap();
        cert.set_pubkey(&pkey).unwrap();
        cert.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        cert.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
        cert.sign(&pkey, MessageDigest::sha256()).unwrap();
        let cert = cert.build();

        let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls()).unwrap();
        acceptor.set_private_key(&pkey).unwrap();
        acceptor.set_certificate(&cert).unwrap();
        SecurityContext::new(acceptor.build())
    }

    #[test]
    fn secure_sessions_survive_failed_handshakes() {
        let mut server = Server::new(vec![status_factory()], ServerConfig::default()).unwrap();
        server.enable_security(self_signed_context(), true);
        assert!(server.is_secure());
        let handle = start_server(server, "127.0.0.1:0", 4).unwrap();

        let mut plain = TcpStream::connect(handle.addr).unwrap();
        plain.write_all(b"GET /status HTTP/1.1\r\n\r\n").unwrap();
        drop(plain);

        let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
        connector.set_verify(SslVerifyMode::NONE);
        let tcp = TcpStream::connect(handle.addr).unwrap();
        tcp.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
        let mut secured = connector.build().connect("localhost", tcp).unwrap();
        secured.write_all(b"GET /status HTTP/1.1\r\n\r\n").unwrap();

        let (head, body) = read_response(&mut BufReader::new(secured));
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!("OK", body);
        stop(handle);
    }

    #[test]
    fn silent_client_is_dropped_after_handshake_timeout() {
        let config = ServerConfig::default().recv_timeout(std::time::Duration::from_secs(1));
        let mut server = Server::new(vec![status_factory()], config).unwrap();
        server.enable_security(self_signed_context(), true);
        let handle = start_server(server, "127.0.0.1:0", 4).unwrap();

        let _silent = TcpStream::connect(handle.addr).unwrap();
        let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
        connector.set_verify(SslVerifyMode::NONE);
        let tcp = TcpStream::connect(handle.addr).unwrap();
        tcp.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
        let mut secured = connector.build().connect("localhost", tcp).unwrap();
        secured.write_all(b"GET /status HTTP/1.1\r\n\r\n").unwrap();

        assert_eq!("OK", read_response(&mut BufReader::new(secured)).1);
        stop(handle);
    }
}
