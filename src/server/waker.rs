use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// Interrupts a blocked readiness wait in the serve loop.
///
/// Linux signals an eventfd that the loop watches. Other platforms open a
/// throwaway loopback connection to the listening socket instead.
pub struct Waker {
    inner: imp::Waker
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        Ok(Waker { inner: imp::Waker::new()? })
    }

    /// Records the listener address, the wake target of the loopback backend.
    pub fn attach(&self, addr: SocketAddr) {
        self.inner.attach(addr)
    }

    pub fn wake(&self) -> io::Result<()> {
        self.inner.wake()
    }

    /// Descriptor to include in the readiness set, if the backend has one.
    pub fn fd(&self) -> Option<RawFd> {
        self.inner.fd()
    }

    pub fn clear(&self) -> io::Result<()> {
        self.inner.clear()
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use std::io;
    use std::mem;
    use std::net::SocketAddr;
    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    pub struct Waker {
        fd: OwnedFd
    }

    impl Waker {
        pub fn new() -> io::Result<Waker> {
            // SAFETY: eventfd has no memory-safety preconditions.
            let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: fd is a freshly created descriptor owned by nobody else.
            Ok(Waker { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
        }

        pub fn attach(&self, _addr: SocketAddr) {}

        pub fn wake(&self) -> io::Result<()> {
            let one: u64 = 1;
            // SAFETY: writes 8 bytes from a live u64 to a descriptor we own.
            let written = unsafe { libc::write(self.fd.as_raw_fd(), &one as *const u64 as *const libc::c_void, mem::size_of::<u64>()) };
            if written < 0 {
                let err = io::Error::last_os_error();
                // a saturated counter is still signalled
                if err.kind() != io::ErrorKind::WouldBlock {
                    return Err(err);
                }
            }
            Ok(())
        }

        pub fn fd(&self) -> Option<RawFd> {
            Some(self.fd.as_raw_fd())
        }

        pub fn clear(&self) -> io::Result<()> {
            let mut value: u64 = 0;
            // SAFETY: reads 8 bytes into a live u64 from a descriptor we own.
            let read = unsafe { libc::read(self.fd.as_raw_fd(), &mut value as *mut u64 as *mut libc::c_void, mem::size_of::<u64>()) };
            if read < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    return Err(err);
                }
            }
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::io;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
    use std::os::unix::io::RawFd;
    use std::sync::Mutex;
    use std::time::Duration;

    const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

    pub struct Waker {
        target: Mutex<Option<SocketAddr>>
    }

    impl Waker {
        pub fn new() -> io::Result<Waker> {
            Ok(Waker { target: Mutex::new(None) })
        }

        pub fn attach(&self, addr: SocketAddr) {
            let loopback = match addr.ip() {
                ip if !ip.is_unspecified() => ip,
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST)
            };
            if let Ok(mut target) = self.target.lock() {
                *target = Some(SocketAddr::new(loopback, addr.port()));
            }
        }

        pub fn wake(&self) -> io::Result<()> {
            let target = *self.target.lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "waker lock poisoned"))?;
            match target {
                Some(addr) => TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map(drop),
                None => Ok(())
            }
        }

        pub fn fd(&self) -> Option<RawFd> {
            None
        }

        pub fn clear(&self) -> io::Result<()> {
            Ok(())
        }
    }
}
