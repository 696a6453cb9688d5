//! Reactor manager (C12): the two user-facing entry points, `Server` and
//! `Client`, that wire C7-C11 together into a running service.

use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use crate::acceptor::Acceptor;
use crate::address::Address;
use crate::balancer::{Balancer, Strategy};
use crate::config::{ConnectorConfig, PollerConfig};
use crate::connection::Connection;
use crate::connector::Connector;
use crate::event_manager::{EventManager, Handle};
use crate::socket::Socket;
use crate::time::TimePoint;
use crate::log_error;

type OnConnect = Arc<dyn Fn(&mut Connection, bool) + Send + Sync>;
type OnMessage = Arc<dyn Fn(&mut Connection, TimePoint) + Send + Sync>;
type OnWriteComplete = Arc<dyn Fn(&mut Connection) + Send + Sync>;
type OnHighWater = Arc<dyn Fn(&mut Connection, usize) + Send + Sync>;
type OnClose = Arc<dyn Fn(&mut Connection) + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    on_connect: Option<OnConnect>,
    on_message: Option<OnMessage>,
    on_write_complete: Option<OnWriteComplete>,
    on_high_water: Option<OnHighWater>,
    on_close: Option<OnClose>,
}

fn apply_callbacks(conn: &mut Connection, callbacks: &Callbacks) {
    if let Some(cb) = callbacks.on_connect.clone() {
        conn.set_on_connect(Box::new(move |c, ok| cb(c, ok)));
    }
    if let Some(cb) = callbacks.on_message.clone() {
        conn.set_on_message(Box::new(move |c, now| cb(c, now)));
    }
    if let Some(cb) = callbacks.on_write_complete.clone() {
        conn.set_on_write_complete(Box::new(move |c| cb(c)));
    }
    if let Some(cb) = callbacks.on_high_water.clone() {
        conn.set_on_high_water(Box::new(move |c, n| cb(c, n)));
    }
    if let Some(cb) = callbacks.on_close.clone() {
        conn.set_on_close(Box::new(move |c| cb(c)));
    }
}

/// Listens on one address and spreads accepted connections across
/// `io_threads` worker managers via a [`Balancer`].
pub struct Server {
    listen_addr: Address,
    reuse_port: bool,
    managers: Vec<EventManager>,
    balancer: Balancer,
    callbacks: Callbacks,
}

impl Server {
    pub fn new(io_threads: usize, listen_addr: Address, should_reuse_port: bool) -> std::io::Result<Self> {
        let io_threads = io_threads.max(1);
        let mut managers = Vec::with_capacity(io_threads);
        for _ in 0..io_threads {
            managers.push(EventManager::new(PollerConfig::default())?);
        }
        let handles: Vec<Handle> = managers.iter().map(|m| m.handle()).collect();
        let balancer = Balancer::new(handles, Strategy::RoundRobin);
        Ok(Server {
            listen_addr,
            reuse_port: should_reuse_port,
            managers,
            balancer,
            callbacks: Callbacks::default(),
        })
    }

    pub fn set_on_connect(&mut self, cb: impl Fn(&mut Connection, bool) + Send + Sync + 'static) {
        self.callbacks.on_connect = Some(Arc::new(cb));
    }

    pub fn set_on_message(&mut self, cb: impl Fn(&mut Connection, TimePoint) + Send + Sync + 'static) {
        self.callbacks.on_message = Some(Arc::new(cb));
    }

    pub fn set_on_write_complete(&mut self, cb: impl Fn(&mut Connection) + Send + Sync + 'static) {
        self.callbacks.on_write_complete = Some(Arc::new(cb));
    }

    pub fn set_on_high_water(&mut self, cb: impl Fn(&mut Connection, usize) + Send + Sync + 'static) {
        self.callbacks.on_high_water = Some(Arc::new(cb));
    }

    pub fn set_on_close(&mut self, cb: impl Fn(&mut Connection) + Send + Sync + 'static) {
        self.callbacks.on_close = Some(Arc::new(cb));
    }

    /// Binds the listener, starts the worker managers (index `1..N`) on
    /// their own threads, and runs manager `0` -- which also hosts the
    /// acceptor -- on the caller's thread until `quit()`. On a fatal bind
    /// or `io_uring` setup failure, returns the error; never calls
    /// `process::exit`.
    pub fn start(mut self) -> std::io::Result<()> {
        let acceptor = Acceptor::bind(self.listen_addr, self.reuse_port)?;
        let mut manager0 = self.managers.remove(0);
        for worker in self.managers.drain(..) {
            worker.run();
        }

        let balancer = Arc::new(self.balancer);
        let callbacks = Arc::new(self.callbacks);

        acceptor.register(
            &mut manager0,
            Box::new(move |fd, peer| {
                let socket = unsafe { Socket::from_raw_fd(fd) };
                let local = socket.local_addr().unwrap_or(peer);
                let target = balancer.pick().clone();
                let callbacks = Arc::clone(&callbacks);
                target.run_soon(Box::new(move |mgr| {
                    let fd = mgr.insert_connection(socket, local, peer);
                    if let Some(conn) = mgr.connection_mut(fd) {
                        apply_callbacks(conn, &callbacks);
                        conn.on_establish();
                    }
                }));
            }),
        );

        manager0.work();
        Ok(())
    }
}

/// A single outbound connection to one server endpoint, redialed with
/// backoff on transient failure by an owned [`Connector`].
pub struct Client {
    handle: Handle,
    connector: Arc<Mutex<Connector>>,
    callbacks: Callbacks,
    active_fd: Arc<Mutex<Option<RawFd>>>,
    should_retry: bool,
}

impl Client {
    /// `manager` is shared: several clients (or a client and a server) may
    /// run on the same [`EventManager`]. `should_retry` governs whether the
    /// client redials automatically after an established connection's peer
    /// closes it; the initial dial always retries through `Connector`'s own
    /// backoff until it either succeeds or `stop()`/`disconnect()` is
    /// called.
    pub fn new(manager: &EventManager, server_addr: Address, should_retry: bool) -> Self {
        Client {
            handle: manager.handle(),
            connector: Arc::new(Mutex::new(Connector::new(server_addr, ConnectorConfig::default()))),
            callbacks: Callbacks::default(),
            active_fd: Arc::new(Mutex::new(None)),
            should_retry,
        }
    }

    pub fn set_on_connect(&mut self, cb: impl Fn(&mut Connection, bool) + Send + Sync + 'static) {
        self.callbacks.on_connect = Some(Arc::new(cb));
    }

    pub fn set_on_message(&mut self, cb: impl Fn(&mut Connection, TimePoint) + Send + Sync + 'static) {
        self.callbacks.on_message = Some(Arc::new(cb));
    }

    pub fn set_on_write_complete(&mut self, cb: impl Fn(&mut Connection) + Send + Sync + 'static) {
        self.callbacks.on_write_complete = Some(Arc::new(cb));
    }

    pub fn set_on_high_water(&mut self, cb: impl Fn(&mut Connection, usize) + Send + Sync + 'static) {
        self.callbacks.on_high_water = Some(Arc::new(cb));
    }

    pub fn set_on_close(&mut self, cb: impl Fn(&mut Connection) + Send + Sync + 'static) {
        self.callbacks.on_close = Some(Arc::new(cb));
    }

    /// Starts dialing. Must be called on the owning manager's thread.
    pub fn connect(&self, manager: &mut EventManager) {
        dial(
            manager,
            Arc::clone(&self.connector),
            self.handle.clone(),
            self.callbacks.clone(),
            Arc::clone(&self.active_fd),
            self.should_retry,
        );
    }

    /// Stops the connector and force-closes the active connection (if any)
    /// without quitting the owning manager's loop. Safe to call from any
    /// thread.
    pub fn stop(&self) {
        self.connector.lock().unwrap().stop();
        let active_fd = Arc::clone(&self.active_fd);
        self.handle.run_soon(Box::new(move |mgr| {
            if let Some(fd) = active_fd.lock().unwrap().take() {
                if let Some(conn) = mgr.connection_mut(fd) {
                    conn.force_close();
                }
                mgr.delete_connection(fd);
            }
        }));
    }

    /// Identical to [`Self::stop`], but also quits the owning manager's
    /// loop -- appropriate when the manager is privately owned by this
    /// client rather than shared.
    pub fn disconnect(&self) {
        self.connector.lock().unwrap().stop();
        let active_fd = Arc::clone(&self.active_fd);
        self.handle.run_soon(Box::new(move |mgr| {
            if let Some(fd) = active_fd.lock().unwrap().take() {
                if let Some(conn) = mgr.connection_mut(fd) {
                    conn.force_close();
                }
                mgr.delete_connection(fd);
            }
            mgr.quit();
        }));
    }
}

/// Starts (or restarts, on redial) one dial attempt through `connector`. On
/// success, hops onto `handle`'s manager to insert the connection, attach
/// callbacks, and call `on_establish`. When `should_retry` is set, layers a
/// close hook onto the new connection that calls back into `dial` once the
/// peer drops it, so the client keeps reconnecting for its whole lifetime
/// rather than just its first attempt.
fn dial(
    manager: &mut EventManager,
    connector: Arc<Mutex<Connector>>,
    handle: Handle,
    callbacks: Callbacks,
    active_fd: Arc<Mutex<Option<RawFd>>>,
    should_retry: bool,
) {
    connector.lock().unwrap().start(
        manager,
        Box::new(move |fd, peer| {
            let socket = unsafe { Socket::from_raw_fd(fd) };
            let local = socket.local_addr().unwrap_or(peer);
            *active_fd.lock().unwrap() = Some(fd);

            let callbacks = callbacks.clone();
            let active_fd = Arc::clone(&active_fd);
            let connector = Arc::clone(&connector);
            let handle = handle.clone();

            handle.run_soon(Box::new(move |mgr| {
                let fd = mgr.insert_connection(socket, local, peer);
                let Some(conn) = mgr.connection_mut(fd) else {
                    return;
                };
                apply_callbacks(conn, &callbacks);

                let active_fd_on_close = Arc::clone(&active_fd);
                let user_close = callbacks.on_close.clone();
                let connector_on_close = Arc::clone(&connector);
                let handle_on_close = handle.clone();
                let callbacks_on_close = callbacks.clone();
                let active_fd_for_redial = Arc::clone(&active_fd);
                conn.set_on_close(Box::new(move |c| {
                    *active_fd_on_close.lock().unwrap() = None;
                    if let Some(cb) = &user_close {
                        cb(c);
                    }
                    if should_retry {
                        let connector = Arc::clone(&connector_on_close);
                        let callbacks = callbacks_on_close.clone();
                        let active_fd = Arc::clone(&active_fd_for_redial);
                        let handle_redial = handle_on_close.clone();
                        handle_on_close.run_soon(Box::new(move |mgr| {
                            dial(mgr, connector, handle_redial, callbacks, active_fd, should_retry);
                        }));
                    }
                }));

                conn.on_establish();
            }));
        }),
    );
}
