//! Acceptor (C9): a listening socket registered as a system fd on one
//! manager. On each readiness wakeup it drains every connection the kernel
//! has queued and hands each one to a user-supplied placement callback.

use std::os::fd::RawFd;

use crate::address::{Address, Family};
use crate::config::LISTEN_BACKLOG;
use crate::event::interest;
use crate::event_manager::EventManager;
use crate::socket::Socket;
use crate::{log_error, log_warn};

/// Closure invoked for each accepted connection: `(fd, peer_address)`. Runs
/// on the acceptor's manager thread, synchronously, once per accepted
/// connection — it is responsible for handing the fd off (typically via
/// `run_soon` onto a balanced manager).
pub type NewConnection = Box<dyn FnMut(RawFd, Address) + Send>;

pub struct Acceptor {
    listener: Socket,
    local: Address,
    /// Idle fd held in reserve so a sudden `EMFILE` can still be answered:
    /// close it, accept+immediately drop the pending connection (freeing
    /// the fd table slot would otherwise starve forever), then reopen it.
    idle_fd: Option<RawFd>,
}

impl Acceptor {
    pub fn bind(addr: Address, reuse_port: bool) -> std::io::Result<Self> {
        let family = addr.family();
        let listener = Socket::new_stream(family)?;
        listener.set_reuse_address(true);
        if reuse_port {
            listener.set_reuse_port(true);
        }
        listener.bind(&addr)?;
        listener.listen(LISTEN_BACKLOG)?;
        let local = listener.local_addr()?;
        let idle_fd = open_idle_fd();
        Ok(Acceptor {
            listener,
            local,
            idle_fd,
        })
    }

    pub fn local_addr(&self) -> Address {
        self.local
    }

    pub fn raw_fd(&self) -> RawFd {
        self.listener.raw_fd()
    }

    /// Registers this acceptor's listening socket on `manager`. All
    /// subsequently accepted connections are delivered to `on_new`.
    pub fn register(self, manager: &mut EventManager, mut on_new: NewConnection) {
        let fd = self.listener.raw_fd();
        // `listener` (and `idle_fd`) must outlive every future readiness
        // callback, so they're moved into the closure rather than kept on
        // an `Acceptor` the caller would otherwise have to keep alive.
        let listener = self.listener;
        let mut idle_fd = self.idle_fd;
        manager.register_system_fd(
            fd,
            interest::READ,
            Box::new(move |_now| loop {
                match listener.accept() {
                    Ok((client_fd, peer)) => on_new(client_fd, peer),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                        drain_one_with_idle_fd(&listener, &mut idle_fd);
                        break;
                    }
                    Err(e) => {
                        log_error!("acceptor: accept failed on fd {fd}: {e}");
                        break;
                    }
                }
            }),
        );
    }
}

fn drain_one_with_idle_fd(listener: &Socket, idle_fd: &mut Option<RawFd>) {
    if let Some(fd) = idle_fd.take() {
        unsafe {
            libc::close(fd);
        }
    }
    match listener.accept() {
        Ok((client_fd, _peer)) => {
            log_warn!("acceptor: EMFILE, dropping one pending connection to recover");
            unsafe {
                libc::close(client_fd);
            }
        }
        Err(e) => log_warn!("acceptor: idle-fd recovery accept also failed: {e}"),
    }
    *idle_fd = open_idle_fd();
}

fn open_idle_fd() -> Option<RawFd> {
    let path = std::ffi::CString::new("/dev/null").unwrap();
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        None
    } else {
        Some(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_picks_an_ephemeral_port_and_reports_it() {
        let addr = Address::new_with_ip("127.0.0.1", 0, false).unwrap();
        let acceptor = Acceptor::bind(addr, false).unwrap();
        assert_ne!(acceptor.local_addr().port(), 0);
        assert_eq!(acceptor.local_addr().family(), Family::V4);
    }
}
