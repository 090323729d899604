use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
#[cfg(feature = "tls")]
use crate::security::SecurityContext;
use self::connection::Connection;
use self::notify::{Event, Notifier, SendNotifier};
use self::pool::{SessionSetup, SessionStore};
use self::response::ErrorHook;
use self::transaction::{transact, Transaction, TransactionContext};
use self::waker::Waker;

pub use self::session::{SessionContext, SessionId};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeState {
    Idle = 0,
    Listening = 1,
    Serving = 2,
    ShuttingDown = 3
}

impl ServeState {
    fn from_u8(value: u8) -> ServeState {
        match value {
            1 => ServeState::Listening,
            2 => ServeState::Serving,
            3 => ServeState::ShuttingDown,
            _ => ServeState::Idle
        }
    }
}

/// State shared between the server, its sessions and the send channel.
pub(crate) struct Shared {
    pub stop: AtomicBool,
    state: AtomicU8,
    pub waker: Waker,
    pub notifier: Notifier
}

impl Shared {
    pub fn new(notifier: Notifier) -> io::Result<Shared> {
        Ok(Shared {
            stop: AtomicBool::new(false),
            state: AtomicU8::new(ServeState::Idle as u8),
            waker: Waker::new()?,
            notifier
        })
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("error waking serve loop:{}", e);
        }
    }

    fn state(&self) -> ServeState {
        ServeState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ServeState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// An embedded HTTP/1.1 server: a bounded pool of sessions multiplexed on one
/// thread, dispatching requests to registered URL handlers.
pub struct Server {
    config: ServerConfig,
    factories: Vec<Arc<dyn UrlHandlerFactory>>,
    shared: Arc<Shared>,
    sessions: Arc<SessionStore>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    events: Mutex<Option<Receiver<Event>>>,
    error_hook: Option<Arc<dyn ErrorHook>>,
    #[cfg(feature = "tls")]
    security: Option<SecurityContext>,
    security_active: AtomicBool
}

impl Server {
    pub fn new(handlers: Vec<Arc<dyn UrlHandlerFactory>>, config: ServerConfig) -> Result<Server> {
        let (notifier, events) = notify::channel();
        let shared = Shared::new(notifier).map_err(ServerError::Waker)?;
        Ok(Server {
            config,
            factories: handlers,
            shared: Arc::new(shared),
            sessions: Arc::new(SessionStore::new()),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            events: Mutex::new(Some(events)),
            error_hook: None,
            #[cfg(feature = "tls")]
            security: None,
            security_active: AtomicBool::new(false)
        })
    }

    pub fn set_error_hook<H: ErrorHook + 'static>(&mut self, hook: H) {
        let hook: Arc<dyn ErrorHook> = Arc::new(hook);
        self.error_hook = Some(hook);
    }

    /// Installs the TLS context; accepted sockets are secured while active.
    #[cfg(feature = "tls")]
    pub fn enable_security(&mut self, context: SecurityContext, activate: bool) {
        self.security = Some(context);
        self.security_active.store(activate, Ordering::SeqCst);
    }

    pub fn set_security_active(&self, active: bool) {
        self.security_active.store(active, Ordering::SeqCst);
    }

    pub fn is_secure(&self) -> bool {
        #[cfg(feature = "tls")]
        let configured = self.security.is_some();
        #[cfg(not(feature = "tls"))]
        let configured = false;
        configured && self.security_active.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ServeState {
        self.shared.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    pub fn session_count(&self) -> Result<usize> {
        self.sessions.with_lock(|pool| pool.len())
    }

    /// Binds and listens, returning the bound address.
    pub fn listen(&self, addr: SocketAddr, backlog: i32) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        // std picks its own backlog; listen() again to apply ours
        // SAFETY: the descriptor is a bound socket owned by `listener`.
        if unsafe { libc::listen(listener.as_raw_fd(), backlog) } < 0 {
            return Err(ServerError::Listen(io::Error::last_os_error()));
        }
        let local = listener.local_addr()?;
        self.shared.waker.attach(local);
        if self.is_secure() {
            info!(%local, "listening securely");
        } else {
            info!(%local, "listening");
        }
        *self.listener.lock().map_err(|_| ServerError::LockPoisoned)? = Some(listener);
        *self.local_addr.lock().map_err(|_| ServerError::LockPoisoned)? = Some(local);
        // a stop aimed at the previous run must not end this one
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.set_state(ServeState::Listening);
        Ok(local)
    }

    /// Runs the serve loop on the listener from [`Server::listen`] until
    /// stopped. `Ok` means an administrative stop.
    pub fn run(&self) -> Result<()> {
        let listener = self.listener.lock()
            .map_err(|_| ServerError::LockPoisoned)?
            .take()
            .ok_or(ServerError::NotListening)?;
        let send_channel = match self.start_send_channel() {
            Ok(send_channel) => send_channel,
            Err(e) => {
                if let Ok(mut slot) = self.listener.lock() {
                    *slot = Some(listener);
                }
                return Err(e);
            }
        };
        self.shared.set_state(ServeState::Serving);
        let result = self.serve_loop(&listener);
        self.shared.set_state(ServeState::ShuttingDown);
        self.close_sessions();
        self.finish_send_channel(send_channel);
        drop(listener);
        if let Ok(mut addr) = self.local_addr.lock() {
            *addr = None;
        }
        self.finish();
        info!("server stopped");
        result
    }

    pub fn serve(&self, addr: SocketAddr, backlog: i32) -> Result<()> {
        self.listen(addr, backlog)?;
        self.run()
    }

    /// Asks the serve loop to stop and waits up to `budget` for it to exit.
    ///
    /// Returns `true` once the server is idle, including when it already was.
    pub fn request_stop(&self, budget: Duration) -> bool {
        if self.state() == ServeState::Idle {
            return true;
        }
        self.shared.request_stop();
        let deadline = Instant::now() + budget;
        loop {
            if self.state() == ServeState::Idle {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("server did not stop within {:?}", budget);
                return false;
            }
            thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Serves one already-connected socket until it closes, without a listener.
    ///
    /// Fails with [`ServerError::AlreadyServing`] while another serve is running.
    pub fn serve_connection(&self, stream: TcpStream) -> Result<()> {
        let peer = stream.peer_addr()?;
        let send_channel = self.start_send_channel()?;
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.set_state(ServeState::Serving);
        let result = self.serve_single(stream, peer);
        self.shared.set_state(ServeState::ShuttingDown);
        self.close_sessions();
        self.finish_send_channel(send_channel);
        self.finish();
        result
    }

    fn serve_single(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let conn = match self.secure(stream, peer) {
            Some(conn) => conn,
            None => return Ok(())
        };
        let setup = self.session_setup();
        let id = match self.sessions.with_lock(|pool| pool.add_session(conn, &setup))? {
            Some(id) => id,
            None => return Ok(())
        };
        let hook = self.error_hook.as_deref();
        let ctx = TransactionContext { config: &self.config, stop: &self.shared.stop, hook };
        loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            match self.sessions.with_lock(|pool| pool.get_mut(id).map(|session| transact(&ctx, session)))? {
                Some(Transaction::Continue) => continue,
                _ => return Ok(())
            }
        }
    }

    fn finish(&self) {
        self.shared.set_state(ServeState::Idle);
    }

    fn session_setup(&self) -> SessionSetup<'_> {
        SessionSetup { factories: &self.factories, shared: &self.shared, config: &self.config }
    }

    fn start_send_channel(&self) -> Result<SendNotifier> {
        let events = self.events.lock()
            .map_err(|_| ServerError::LockPoisoned)?
            .take()
            .ok_or(ServerError::AlreadyServing)?;
        SendNotifier::start(events, self.shared.clone(), self.sessions.clone())
    }

    fn finish_send_channel(&self, send_channel: SendNotifier) {
        let events = send_channel.stop();
        match self.events.lock() {
            Ok(mut slot) => *slot = events,
            Err(_) => error!("send queue lost, lock poisoned")
        }
    }

    fn close_sessions(&self) {
        if let Err(e) = self.sessions.with_lock(|pool| {
            pool.mark_all();
            pool.prune()
        }) {
            error!("error closing sessions:{}", e);
        }
    }

    fn serve_loop(&self, listener: &TcpListener) -> Result<()> {
        let wake_fd = self.shared.waker.fd();
        let hook = self.error_hook.as_deref();
        let ctx = TransactionContext { config: &self.config, stop: &self.shared.stop, hook };
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(self.config.max_sessions + 2);
        loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                info!("stop requested");
                return Ok(());
            }
            let targets = self.sessions.with_lock(|pool| {
                pool.prune();
                pool.poll_targets()
            })?;

            fds.clear();
            fds.push(poll_fd(listener.as_raw_fd()));
            if let Some(fd) = wake_fd {
                fds.push(poll_fd(fd));
            }
            let first_session = fds.len();
            fds.extend(targets.iter().map(|(_, fd)| poll_fd(*fd)));

            if let Err(e) = wait_readable(&mut fds) {
                error!("readiness wait failed:{}", e);
                return Err(ServerError::Poll(e));
            }
            if wake_fd.is_some() && is_ready(&fds[1]) {
                self.shared.waker.clear().map_err(ServerError::Waker)?;
            }
            if self.shared.stop.load(Ordering::SeqCst) {
                continue;
            }
            if is_ready(&fds[0]) {
                self.accept(listener)?;
            }

            for ((id, _), fd) in targets.iter().zip(&fds[first_session..]) {
                if !is_ready(fd) {
                    continue;
                }
                self.sessions.with_lock(|pool| {
                    if let Some(session) = pool.get_mut(*id) {
                        if !session.is_stopped() && transact(&ctx, session) == Transaction::Stop {
                            session.mark_stop();
                        }
                    }
                })?;
                if self.shared.stop.load(Ordering::SeqCst) {
                    break;
                }
            }
            self.sessions.with_lock(|pool| {
                if pool.has_stopped() {
                    pool.prune();
                }
            })?;
        }
    }

    fn accept(&self, listener: &TcpListener) -> Result<()> {
        match listener.accept() {
            Ok((stream, peer)) => self.admit(stream, peer),
            Err(e) if is_descriptor_exhaustion(&e) => {
                warn!("out of descriptors, connection refused:{}", e);
                Ok(())
            },
            Err(ref e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::ConnectionAborted) => Ok(()),
            Err(e) => {
                error!("accept failed:{}", e);
                Err(ServerError::Accept(e))
            }
        }
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let conn = match self.secure(stream, peer) {
            Some(conn) => conn,
            None => return Ok(())
        };
        let setup = self.session_setup();
        match self.sessions.with_lock(|pool| pool.add_session(conn, &setup))? {
            Some(id) => debug!(session = id, %peer, "session admitted"),
            None => debug!(%peer, "session refused")
        }
        Ok(())
    }

    #[cfg(feature = "tls")]
    fn secure(&self, stream: TcpStream, peer: SocketAddr) -> Option<Connection> {
        let context = match &self.security {
            Some(context) if self.security_active.load(Ordering::SeqCst) => context,
            _ => return Some(Connection::Plain(stream))
        };
        if let Err(e) = stream.set_read_timeout(Some(self.config.handshake_timeout())) {
            warn!(%peer, "error setting handshake timeout:{}", e);
            return None;
        }
        match context.handshake(stream) {
            Ok(secured) => Some(Connection::Tls(Box::new(secured))),
            Err(e) => {
                warn!(%peer, "handshake failed:{}", e);
                None
            }
        }
    }

    #[cfg(not(feature = "tls"))]
    fn secure(&self, stream: TcpStream, _peer: SocketAddr) -> Option<Connection> {
        Some(Connection::Plain(stream))
    }
}

fn poll_fd(fd: RawFd) -> libc::pollfd {
    libc::pollfd { fd, events: libc::POLLIN, revents: 0 }
}

fn is_ready(fd: &libc::pollfd) -> bool {
    fd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0
}

fn is_descriptor_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

/// Blocks until at least one descriptor in `fds` is ready.
fn wait_readable(fds: &mut [libc::pollfd]) -> io::Result<usize> {
    loop {
        // SAFETY: `fds` is a live, exclusively borrowed slice of pollfd.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ready >= 0 {
            return Ok(ready as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub mod connection;
pub mod file_system;
pub mod http;
pub(crate) mod notify;
pub(crate) mod pool;
pub mod response;
pub(crate) mod session;
pub mod shutdown;
pub(crate) mod transaction;
pub mod url_handler;
mod waker;

pub use self::url_handler::{HandlerOutcome, Request, UrlHandler, UrlHandlerFactory};
