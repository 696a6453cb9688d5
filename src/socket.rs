//! Socket wrapper (C4): owns exactly one file descriptor, closes it
//! idempotently on drop, and exposes the handful of socket options the
//! reactor cares about. Construction and option-setting follow the
//! `socket2`-backed pattern mio's own `sys::unix::tcp` module uses.

use std::net::TcpStream as StdTcpStream;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket as RawSocket, Type};

use crate::address::{Address, Family};
use crate::config::LISTEN_BACKLOG;
use crate::log_warn;

/// An owned, non-blocking stream or listening socket.
///
/// `Drop` closes the descriptor exactly once; `close()` is also callable
/// directly and is safe to call more than once.
pub struct Socket {
    fd: RawFd,
    closed: bool,
}

impl Socket {
    /// Opens a new non-blocking, close-on-exec stream socket for `family`.
    pub fn new_stream(family: Family) -> std::io::Result<Self> {
        let domain = match family {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        };
        let raw = RawSocket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        raw.set_nonblocking(true)?;
        Ok(Socket {
            fd: raw.into_raw_fd(),
            closed: false,
        })
    }

    /// Wraps an already-open, already-configured fd (e.g. one returned by
    /// `accept4`). Takes ownership.
    ///
    /// # Safety
    /// `fd` must be a valid, open socket descriptor not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Socket { fd, closed: false }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn as_socket2(&self) -> std::mem::ManuallyDrop<RawSocket> {
        std::mem::ManuallyDrop::new(unsafe { RawSocket::from_raw_fd(self.fd) })
    }

    /// Best-effort; logs a warning and continues on failure rather than
    /// failing the whole bind/connect/accept call that caused it.
    pub fn set_reuse_address(&self, on: bool) {
        if let Err(e) = self.as_socket2().set_reuse_address(on) {
            log_warn!("socket: set_reuse_address({on}) failed on fd {}: {e}", self.fd);
        }
    }

    #[cfg(unix)]
    pub fn set_reuse_port(&self, on: bool) {
        if let Err(e) = self.as_socket2().set_reuse_port(on) {
            log_warn!("socket: set_reuse_port({on}) failed on fd {}: {e}", self.fd);
        }
    }

    pub fn set_nodelay(&self, on: bool) {
        if let Err(e) = self.as_socket2().set_tcp_nodelay(on) {
            log_warn!("socket: set_nodelay({on}) failed on fd {}: {e}", self.fd);
        }
    }

    pub fn set_keepalive(&self, on: bool) {
        if on {
            let params = socket2::TcpKeepalive::new().with_time(std::time::Duration::from_secs(60));
            if let Err(e) = self.as_socket2().set_tcp_keepalive(&params) {
                log_warn!("socket: set_keepalive(true) failed on fd {}: {e}", self.fd);
            }
        } else if let Err(e) = self.as_socket2().set_keepalive(false) {
            log_warn!("socket: set_keepalive(false) failed on fd {}: {e}", self.fd);
        }
    }

    pub fn bind(&self, addr: &Address) -> std::io::Result<()> {
        self.as_socket2().bind(&SockAddr::from(addr.socket_addr()))
    }

    pub fn listen(&self, backlog: i32) -> std::io::Result<()> {
        self.as_socket2().listen(backlog)
    }

    pub fn listen_default_backlog(&self) -> std::io::Result<()> {
        self.listen(LISTEN_BACKLOG)
    }

    pub fn connect(&self, addr: &Address) -> std::io::Result<()> {
        match self.as_socket2().connect(&SockAddr::from(addr.socket_addr())) {
            Ok(()) => Ok(()),
            // Non-blocking connect: in-progress is the expected outcome.
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Blocking accept, for use only from within an io_uring completion
    /// handler that already knows the listener is readable. Returns the
    /// accepted fd and peer address.
    pub fn accept(&self) -> std::io::Result<(RawFd, Address)> {
        let (accepted, sockaddr) = self.as_socket2().accept()?;
        let fd = accepted.into_raw_fd();
        let peer = sockaddr
            .as_socket()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "non-IP peer address"))?;
        Ok((fd, Address::from_socket_addr(peer)))
    }

    pub fn local_addr(&self) -> std::io::Result<Address> {
        let addr = self.as_socket2().local_addr()?;
        addr.as_socket()
            .map(Address::from_socket_addr)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "non-IP local address"))
    }

    pub fn peer_addr(&self) -> std::io::Result<Address> {
        let addr = self.as_socket2().peer_addr()?;
        addr.as_socket()
            .map(Address::from_socket_addr)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "non-IP peer address"))
    }

    /// Half-closes the write side. Idempotent: an already-shutdown or
    /// already-closed socket simply reports the underlying errno via the
    /// warning log and returns cleanly.
    pub fn shutdown_write(&self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.as_socket2().shutdown(std::net::Shutdown::Write) {
            if e.raw_os_error() != Some(libc::ENOTCONN) {
                log_warn!("socket: shutdown(write) failed on fd {}: {e}", self.fd);
            }
        }
    }

    /// Closes the descriptor. Safe to call more than once; only the first
    /// call actually issues `close(2)`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        unsafe {
            libc::close(self.fd);
        }
    }

    pub fn take_std_stream(mut self) -> StdTcpStream {
        self.closed = true;
        unsafe { StdTcpStream::from_raw_fd(self.fd) }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listen_connect_accept_roundtrip() {
        let listener = Socket::new_stream(Family::V4).unwrap();
        listener.set_reuse_address(true);
        let addr = Address::new_with_ip("127.0.0.1", 0, false).unwrap();
        listener.bind(&addr).unwrap();
        listener.listen_default_backlog().unwrap();
        let bound = listener.local_addr().unwrap();

        let client = Socket::new_stream(Family::V4).unwrap();
        let _ = client.connect(&bound);

        // Non-blocking accept may race the client's connect; poll briefly.
        let mut accepted = None;
        for _ in 0..2000 {
            match listener.accept() {
                Ok(pair) => {
                    accepted = Some(pair);
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        let (fd, _peer) = accepted.expect("listener never became acceptable");
        unsafe { libc::close(fd) };
    }

    #[test]
    fn close_is_idempotent() {
        let mut s = Socket::new_stream(Family::V4).unwrap();
        s.close();
        s.close();
    }
}
