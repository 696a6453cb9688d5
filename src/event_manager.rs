//! Event manager (C8): one poller, one timer set, one `fd -> connection`
//! table, driven by a single OS thread (or the caller's thread, via
//! [`EventManager::work`]).
//!
//! Connections are boxed in their table so the raw pointer the poller keeps
//! into each one's [`EventHandle`](crate::event::EventHandle) stays valid
//! across hash-map rehashes; only the `Box` pointer moves, never the
//! pointee.

use std::collections::{HashMap, HashSet, VecDeque};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::address::Address;
use crate::connection::Connection;
use crate::config::PollerConfig;
use crate::event::EventHandle;
use crate::poller::Poller;
use crate::socket::Socket;
use crate::time::{self, Predicate, Task, TimePoint, TimerSet};
use crate::log_error;

type CrossThreadTask = Box<dyn FnOnce(&mut EventManager) + Send>;

/// A fd the manager dispatches itself rather than handing to a
/// [`Connection`]: the acceptor's listening socket, a connector's
/// in-progress socket, the manager's own cross-thread wakeup eventfd.
struct SystemEntry {
    handle: EventHandle,
    callback: Box<dyn FnMut(TimePoint) + Send>,
}

/// Cloneable cross-thread handle for posting work to and quitting a
/// manager that may be running on another OS thread.
#[derive(Clone)]
pub struct Handle {
    tasks: Arc<Mutex<VecDeque<CrossThreadTask>>>,
    should_quit: Arc<AtomicBool>,
    connection_count: Arc<AtomicUsize>,
    wake_fd: RawFd,
}

impl Handle {
    /// Posts `task` to run on the manager's own thread at the start of its
    /// next iteration, waking it if it is currently blocked in `poll`.
    pub fn run_soon(&self, task: CrossThreadTask) {
        self.tasks.lock().unwrap().push_back(task);
        self.wake();
    }

    pub fn quit(&self) {
        self.should_quit.store(true, Ordering::Release);
        self.wake();
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }
}

pub struct EventManager {
    poller: Poller,
    timers: TimerSet,
    connections: HashMap<RawFd, Box<Connection>>,
    pending_close: HashSet<RawFd>,
    system: HashMap<RawFd, Box<SystemEntry>>,
    tasks: Arc<Mutex<VecDeque<CrossThreadTask>>>,
    should_quit: Arc<AtomicBool>,
    connection_count: Arc<AtomicUsize>,
    wake_fd: RawFd,
}

impl EventManager {
    pub fn new(config: PollerConfig) -> std::io::Result<Self> {
        let poller = Poller::new(config)?;
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut manager = EventManager {
            poller,
            timers: TimerSet::new(),
            connections: HashMap::new(),
            pending_close: HashSet::new(),
            system: HashMap::new(),
            tasks: Arc::new(Mutex::new(VecDeque::new())),
            should_quit: Arc::new(AtomicBool::new(false)),
            connection_count: Arc::new(AtomicUsize::new(0)),
            wake_fd,
        };
        manager.register_wake_fd();
        Ok(manager)
    }

    fn register_wake_fd(&mut self) {
        let mut entry = Box::new(SystemEntry {
            handle: EventHandle::new(self.wake_fd),
            callback: Box::new({
                let fd = self.wake_fd;
                move |_now| {
                    let mut buf = [0u8; 8];
                    unsafe {
                        libc::read(fd, buf.as_mut_ptr().cast(), 8);
                    }
                }
            }),
        });
        entry.handle.enable_read();
        self.poller.add(&mut entry.handle);
        let _ = self.poller.modify(&mut entry.handle);
        self.system.insert(self.wake_fd, entry);
    }

    pub fn handle(&self) -> Handle {
        Handle {
            tasks: Arc::clone(&self.tasks),
            should_quit: Arc::clone(&self.should_quit),
            connection_count: Arc::clone(&self.connection_count),
            wake_fd: self.wake_fd,
        }
    }

    /// Registers a non-[`Connection`] fd (acceptor listener, connector
    /// probe socket) whose readiness the manager should dispatch to
    /// `callback` directly.
    pub fn register_system_fd(&mut self, fd: RawFd, mask: u32, callback: Box<dyn FnMut(TimePoint) + Send>) {
        let mut entry = Box::new(SystemEntry {
            handle: EventHandle::new(fd),
            callback,
        });
        entry.handle.interest_set(mask);
        self.poller.add(&mut entry.handle);
        let _ = self.poller.modify(&mut entry.handle);
        self.system.insert(fd, entry);
    }

    pub fn unregister_system_fd(&mut self, fd: RawFd) {
        if self.system.remove(&fd).is_some() {
            self.poller.remove(fd);
        }
    }

    /// Takes ownership of `socket` and registers its [`EventHandle`] with
    /// the poller. The handle has no interest armed yet at this point (that
    /// happens once the caller calls `on_establish`, which `resync_interests`
    /// picks up at the end of the current tick), so there's nothing for
    /// `modify` to submit here beyond the fd bookkeeping `add` already does.
    /// Does *not* call `on_establish` — the caller is expected to attach
    /// callbacks via [`Self::connection_mut`] and call `on_establish` itself
    /// once they're in place, so `on_connect` never fires before a callback
    /// is attached to receive it. Must be called on this manager's own
    /// thread.
    pub fn insert_connection(&mut self, socket: Socket, local: Address, peer: Address) -> RawFd {
        let fd = socket.raw_fd();
        let mut conn = Box::new(Connection::new(socket, local, peer));
        self.poller.add(conn.event_handle_mut());
        self.connections.insert(fd, conn);
        self.connection_count.store(self.connections.len(), Ordering::Relaxed);
        fd
    }

    pub fn connection_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        self.connections.get_mut(&fd).map(|b| b.as_mut())
    }

    /// Marks `fd` for destruction at the end of the current iteration
    /// rather than immediately, so a callback already running for this
    /// connection never observes its own table entry vanish mid-dispatch.
    pub fn delete_connection(&mut self, fd: RawFd) {
        self.pending_close.insert(fd);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn run_at(&self, deadline: TimePoint, task: Task) {
        self.timers.add(deadline, task);
    }

    pub fn run_after(&self, delay_us: i64, task: Task) {
        self.timers.add(time::now() + delay_us, task);
    }

    pub fn run_every_until(&self, period: std::time::Duration, task: Task, predicate: Predicate) {
        self.timers
            .add_periodic(time::now() + period.as_micros() as i64, period, task, Some(predicate));
    }

    pub fn quit(&self) {
        self.should_quit.store(true, Ordering::Release);
    }

    /// Runs this manager on a newly spawned, named OS thread.
    pub fn run(mut self) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("ringloop-event-manager".into())
            .spawn(move || self.work())
            .expect("failed to spawn event manager thread")
    }

    /// Runs this manager on the caller's thread until `quit()` is called
    /// (from this thread or, via [`Handle::quit`], from another).
    pub fn work(&mut self) {
        let mut active = Vec::new();
        while !self.should_quit.load(Ordering::Acquire) {
            self.tick(&mut active);
        }
        self.teardown();
    }

    fn tick(&mut self, active: &mut Vec<RawFd>) {
        let now = time::now();
        let timeout_ms = self.timers.min_delay_ms(now);
        if let Err(e) = self.poller.poll(timeout_ms, active) {
            log_error!("event manager: poll failed: {e}");
            return;
        }

        for &fd in active.iter() {
            if let Some(conn) = self.connections.get_mut(&fd) {
                conn.dispatch(now);
            } else if let Some(entry) = self.system.get_mut(&fd) {
                let mask = entry.handle.last_mask();
                if mask != 0 {
                    (entry.callback)(now);
                }
            }
        }

        self.drain_timers(now);
        self.drain_pending_close();
        self.drain_tasks();
        self.resync_interests();
    }

    /// Re-arms the poller for every connection whose interest mask changed
    /// this tick. `enable_read`/`enable_write`/`disable_write`/`disable_all`
    /// only flip the bits on the handle itself; a connection with no
    /// outstanding poll submission (freshly established, or one whose prior
    /// poll already completed earlier in this same tick) never gets another
    /// chance to notice the change unless something calls `modify` again.
    fn resync_interests(&mut self) {
        for conn in self.connections.values_mut() {
            if conn.event_handle_mut().take_dirty() {
                let _ = self.poller.modify(conn.event_handle_mut());
            }
        }
    }

    fn drain_timers(&mut self, now: TimePoint) {
        for (deadline, mut task, period_us, mut predicate) in self.timers.drain_expired(now) {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task()));
            if outcome.is_err() {
                log_error!("event manager: timer task panicked");
            }
            if period_us > 0 {
                let should_rearm = predicate.as_mut().map(|p| p()).unwrap_or(true);
                if should_rearm {
                    self.timers.add_periodic(
                        deadline + period_us,
                        std::time::Duration::from_micros(period_us as u64),
                        task,
                        predicate,
                    );
                }
            }
        }
    }

    fn drain_pending_close(&mut self) {
        for fd in self.pending_close.drain() {
            self.poller.remove(fd);
            self.connections.remove(&fd);
        }
        self.connection_count.store(self.connections.len(), Ordering::Relaxed);
    }

    fn drain_tasks(&mut self) {
        let drained: Vec<CrossThreadTask> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for task in drained {
            task(self);
        }
    }

    fn teardown(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            if let Some(mut conn) = self.connections.remove(&fd) {
                conn.force_close();
            }
            self.poller.remove(fd);
        }
        unsafe {
            libc::close(self.wake_fd);
        }
    }
}

impl Drop for EventManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Family;

    fn loopback_pair() -> (Socket, Socket) {
        let listener = Socket::new_stream(Family::V4).unwrap();
        listener.set_reuse_address(true);
        let addr = Address::new_with_ip("127.0.0.1", 0, false).unwrap();
        listener.bind(&addr).unwrap();
        listener.listen_default_backlog().unwrap();
        let bound = listener.local_addr().unwrap();

        let client = Socket::new_stream(Family::V4).unwrap();
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
        let server = unsafe { Socket::from_raw_fd(accepted_fd.unwrap()) };
        (server, client)
    }

    /// Regression test for a bug where `insert_connection` armed the poller
    /// exactly once, while the handle's interest mask was still zero, and
    /// nothing ever re-armed it once `on_establish` enabled read interest --
    /// so no connection ever actually got watched.
    #[test]
    fn establishing_a_connection_arms_the_poller() {
        let manager = EventManager::new(PollerConfig {
            entries_default: 8,
            entries_min: 1,
            ..PollerConfig::default()
        });
        let Ok(mut manager) = manager else { return };

        let (server_sock, _client) = loopback_pair();
        let peer = server_sock.peer_addr().unwrap();
        let local = server_sock.local_addr().unwrap();
        let fd = manager.insert_connection(server_sock, local, peer);
        assert_eq!(manager.poller.outstanding(), 0, "nothing armed before on_establish");

        manager.connection_mut(fd).unwrap().on_establish();
        manager.resync_interests();
        assert_eq!(
            manager.poller.outstanding(),
            1,
            "resync_interests must re-arm the poller once interest becomes non-zero"
        );
    }

    #[test]
    fn run_soon_executes_on_owning_thread_and_quits() {
        let manager = EventManager::new(PollerConfig {
            entries_default: 8,
            entries_min: 1,
            ..PollerConfig::default()
        });
        // Building a real io_uring ring requires kernel support that may be
        // unavailable in arbitrary test sandboxes; skip gracefully if so.
        let Ok(mut manager) = manager else { return };
        let handle = manager.handle();
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_cb = std::sync::Arc::clone(&ran);
        handle.run_soon(Box::new(move |_mgr| {
            ran_cb.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        handle.quit();
        manager.work();
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
