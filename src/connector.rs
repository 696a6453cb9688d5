//! Connector (C10): actively dials a remote endpoint, retrying on
//! transient failure with exponential backoff, and detects the
//! self-connect condition the kernel can produce when a client's ephemeral
//! port happens to match the server it's dialing.

use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::address::Address;
use crate::config::ConnectorConfig;
use crate::event::interest;
use crate::event_manager::{EventManager, Handle};
use crate::socket::Socket;
use crate::{log_info, log_warn};

const RETRIABLE_ERRNOS: &[i32] = &[
    libc::EAGAIN,
    libc::EADDRINUSE,
    libc::EADDRNOTAVAIL,
    libc::ECONNREFUSED,
    libc::ENETUNREACH,
];

/// Invoked once a dial succeeds, with the now-established fd and the peer
/// address observed via `getpeername`. The receiver owns the fd from that
/// point on (typically wrapping it in a [`crate::connection::Connection`]
/// via [`EventManager::insert_connection`]).
pub type NewConnection = Box<dyn FnMut(RawFd, Address) + Send>;

struct Shared {
    can_connect: AtomicBool,
    backoff: Mutex<Duration>,
}

/// Drives one outbound connection attempt for a single logical peer.
/// `start`/`stop` may be called repeatedly; each `start` begins a fresh
/// backoff sequence.
pub struct Connector {
    server_addr: Address,
    config: ConnectorConfig,
    shared: Arc<Shared>,
}

impl Connector {
    pub fn new(server_addr: Address, config: ConnectorConfig) -> Self {
        Connector {
            server_addr,
            shared: Arc::new(Shared {
                can_connect: AtomicBool::new(false),
                backoff: Mutex::new(config.initial_backoff),
            }),
            config,
        }
    }

    /// Allows connecting and immediately attempts a dial. Must be called on
    /// `manager`'s own thread.
    pub fn start(&mut self, manager: &mut EventManager, on_connect: NewConnection) {
        self.shared.can_connect.store(true, Ordering::Release);
        *self.shared.backoff.lock().unwrap() = self.config.initial_backoff;
        let on_connect = Arc::new(Mutex::new(on_connect));
        attempt(
            manager,
            self.server_addr,
            self.config,
            Arc::clone(&self.shared),
            on_connect,
        );
    }

    /// Forbids further connects. A dial currently in flight runs to
    /// completion but its result is discarded; no retry is scheduled
    /// afterward.
    pub fn stop(&mut self) {
        self.shared.can_connect.store(false, Ordering::Release);
    }
}

fn attempt(
    manager: &mut EventManager,
    server_addr: Address,
    config: ConnectorConfig,
    shared: Arc<Shared>,
    on_connect: Arc<Mutex<NewConnection>>,
) {
    if !shared.can_connect.load(Ordering::Acquire) {
        return;
    }

    let socket = match Socket::new_stream(server_addr.family()) {
        Ok(s) => s,
        Err(e) => {
            log_warn!("connector: socket() failed: {e}");
            schedule_retry(manager, server_addr, config, shared, on_connect);
            return;
        }
    };

    match socket.connect(&server_addr) {
        Ok(()) => {}
        Err(e) if is_retriable(&e) => {
            schedule_retry(manager, server_addr, config, shared, on_connect);
            return;
        }
        Err(e) => {
            log_warn!("connector: connect to {server_addr} failed fatally: {e}");
            return;
        }
    }

    let fd = socket.raw_fd();
    let handle = manager.handle();
    // Boxed in an `Option` so the callback below can `take()` it out on its
    // one and only firing without itself becoming an `FnOnce` (the fd is
    // unregistered immediately afterward, so a second firing never happens,
    // but the closure's type still has to satisfy `FnMut`).
    let mut socket = Some(socket);

    manager.register_system_fd(
        fd,
        interest::WRITE,
        Box::new(move |_now| {
            let Some(socket) = socket.take() else {
                return;
            };
            // The poller runs this callback inline with no manager access;
            // hop back onto the manager's own task queue to touch the
            // connection/system-fd tables or reschedule a timer.
            let handle_inner = handle.clone();
            let server_addr = server_addr;
            let config = config;
            let shared = Arc::clone(&shared);
            let on_connect = Arc::clone(&on_connect);

            match finish_connect(&socket) {
                Ok(true) => {
                    let peer = socket.peer_addr().unwrap_or(server_addr);
                    // `socket`'s fd now belongs to the caller; stop this
                    // `Socket` value from closing it on drop.
                    mem::forget(socket);
                    handle_inner.run_soon(Box::new(move |mgr| {
                        mgr.unregister_system_fd(fd);
                        (on_connect.lock().unwrap())(fd, peer);
                    }));
                }
                Ok(false) => {
                    log_info!("connector: self-connect detected to {server_addr}, retrying");
                    mem::drop(socket); // closes fd
                    handle_inner.run_soon(Box::new(move |mgr| {
                        mgr.unregister_system_fd(fd);
                        schedule_retry(mgr, server_addr, config, shared, on_connect);
                    }));
                }
                Err(e) => {
                    log_warn!("connector: connect to {server_addr} failed: {e}");
                    mem::drop(socket); // closes fd
                    handle_inner.run_soon(Box::new(move |mgr| {
                        mgr.unregister_system_fd(fd);
                        schedule_retry(mgr, server_addr, config, shared, on_connect);
                    }));
                }
            }
        }),
    );
}

fn schedule_retry(
    manager: &mut EventManager,
    server_addr: Address,
    config: ConnectorConfig,
    shared: Arc<Shared>,
    on_connect: Arc<Mutex<NewConnection>>,
) {
    if !shared.can_connect.load(Ordering::Acquire) {
        return;
    }

    let delay = {
        let mut backoff = shared.backoff.lock().unwrap();
        let current = *backoff;
        *backoff = (current * 2).min(config.max_backoff);
        current
    };

    let handle: Handle = manager.handle();
    manager.run_after(
        delay.as_micros() as i64,
        Box::new(move || {
            let handle_inner = handle.clone();
            let server_addr = server_addr;
            let config = config;
            let shared = Arc::clone(&shared);
            let on_connect = Arc::clone(&on_connect);
            handle_inner.run_soon(Box::new(move |mgr| {
                attempt(mgr, server_addr, config, shared, on_connect);
            }));
        }),
    );
}

/// After a writable completion on an in-progress non-blocking connect:
/// checks `SO_ERROR`, then compares local/peer endpoints to rule out a
/// self-connect. Returns `Ok(true)` on a genuine success, `Ok(false)` on
/// self-connect (caller should close and retry), or the connect error.
fn finish_connect(socket: &Socket) -> std::io::Result<bool> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            socket.raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    if err != 0 {
        return Err(std::io::Error::from_raw_os_error(err));
    }

    let local = socket.local_addr()?;
    let peer = socket.peer_addr()?;
    Ok(!local.same_endpoint(&peer))
}

fn is_retriable(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(code) if RETRIABLE_ERRNOS.contains(&code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_errno_classification() {
        assert!(is_retriable(&std::io::Error::from_raw_os_error(libc::ECONNREFUSED)));
        assert!(!is_retriable(&std::io::Error::from_raw_os_error(libc::EACCES)));
    }

    /// A socket that connects to its own bound address produces the kernel's
    /// self-connect condition (local and peer endpoints identical).
    /// `finish_connect` must tell that apart from a genuine successful dial.
    #[test]
    fn finish_connect_detects_self_connect() {
        let socket = Socket::new_stream(crate::address::Family::V4).unwrap();
        socket.set_reuse_address(true);
        let addr = Address::new_with_ip("127.0.0.1", 0, false).unwrap();
        socket.bind(&addr).unwrap();
        let bound = socket.local_addr().unwrap();

        let _ = socket.connect(&bound);
        let mut result = None;
        for _ in 0..2000 {
            match finish_connect(&socket) {
                Ok(v) => {
                    result = Some(v);
                    break;
                }
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("unexpected connect error: {e}"),
            }
        }
        assert_eq!(result, Some(false), "connecting a socket to itself must be detected");
    }

    #[test]
    fn finish_connect_confirms_genuine_peer() {
        let listener = Socket::new_stream(crate::address::Family::V4).unwrap();
        listener.set_reuse_address(true);
        let addr = Address::new_with_ip("127.0.0.1", 0, false).unwrap();
        listener.bind(&addr).unwrap();
        listener.listen_default_backlog().unwrap();
        let bound = listener.local_addr().unwrap();

        let client = Socket::new_stream(crate::address::Family::V4).unwrap();
        let _ = client.connect(&bound);

        let mut accepted_fd = None;
        for _ in 0..2000 {
            match listener.accept() {
                Ok((fd, _)) => {
                    accepted_fd = Some(fd);
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("{e}"),
            }
        }
        unsafe { libc::close(accepted_fd.unwrap()) };

        let mut result = None;
        for _ in 0..2000 {
            match finish_connect(&client) {
                Ok(v) => {
                    result = Some(v);
                    break;
                }
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(_) => {
                    // The listener closed the accepted fd immediately, so a
                    // reset racing the SO_ERROR check is an acceptable
                    // outcome here too -- either way it isn't self-connect.
                    result = Some(true);
                    break;
                }
            }
        }
        assert_eq!(result, Some(true));
    }
}
