//! Connection (C6): owns one socket, one event handle, and the two I/O
//! buffers that back a single TCP peer. State only ever moves forward
//! through `Connecting -> Connected -> Disconnecting -> Disconnected`.
//!
//! A connection is exclusively owned by the [`crate::event_manager::EventManager`]
//! that created it; references handed to user callbacks are valid only for
//! the duration of the callback that receives them.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::address::Address;
use crate::buffer::IoBuffer;
use crate::config::DEFAULT_HIGH_WATER_MARK;
use crate::event::EventHandle;
use crate::socket::Socket;
use crate::time::TimePoint;
use crate::log_warn;

/// Forward-only connection lifecycle. Numeric values are increasing in
/// lifecycle order so `Ordering::Relaxed` loads can be compared with `<`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

type ConnectCallback = Box<dyn FnMut(&mut Connection, bool) + Send>;
type MessageCallback = Box<dyn FnMut(&mut Connection, TimePoint) + Send>;
type WriteCompleteCallback = Box<dyn FnMut(&mut Connection) + Send>;
type HighWaterCallback = Box<dyn FnMut(&mut Connection, usize) + Send>;
type CloseCallback = Box<dyn FnMut(&mut Connection) + Send>;

#[derive(Default)]
struct Callbacks {
    on_connect: Option<ConnectCallback>,
    on_message: Option<MessageCallback>,
    on_write_complete: Option<WriteCompleteCallback>,
    on_high_water: Option<HighWaterCallback>,
    on_close: Option<CloseCallback>,
}

/// One TCP peer hosted by an event manager.
pub struct Connection {
    socket: Socket,
    event: EventHandle,
    input: IoBuffer,
    output: IoBuffer,
    state: AtomicU8,
    local: Address,
    peer: Address,
    high_water_mark: usize,
    fault: bool,
    write_pending: bool,
    callbacks: Callbacks,
    context: Option<Box<dyn std::any::Any + Send>>,
}

impl Connection {
    pub fn new(socket: Socket, local: Address, peer: Address) -> Self {
        let fd = socket.raw_fd();
        Connection {
            socket,
            event: EventHandle::new(fd),
            input: IoBuffer::new(),
            output: IoBuffer::new(),
            state: AtomicU8::new(State::Connecting as u8),
            local,
            peer,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            fault: false,
            write_pending: false,
            callbacks: Callbacks::default(),
            context: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.raw_fd()
    }

    pub fn local_addr(&self) -> Address {
        self.local
    }

    pub fn peer_addr(&self) -> Address {
        self.peer
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn input_buffer(&mut self) -> &mut IoBuffer {
        &mut self.input
    }

    pub fn output_buffer(&mut self) -> &mut IoBuffer {
        &mut self.output
    }

    pub fn event_handle_mut(&mut self) -> &mut EventHandle {
        &mut self.event
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        self.socket.set_nodelay(on);
    }

    pub fn set_high_water_mark(&mut self, bytes: usize) {
        self.high_water_mark = bytes;
    }

    pub fn context(&self) -> Option<&(dyn std::any::Any + Send)> {
        self.context.as_deref()
    }

    pub fn context_mut(&mut self) -> Option<&mut (dyn std::any::Any + Send)> {
        self.context.as_deref_mut()
    }

    pub fn set_context<T: std::any::Any + Send>(&mut self, value: T) {
        self.context = Some(Box::new(value));
    }

    pub fn set_on_connect(&mut self, cb: ConnectCallback) {
        self.callbacks.on_connect = Some(cb);
    }

    pub fn set_on_message(&mut self, cb: MessageCallback) {
        self.callbacks.on_message = Some(cb);
    }

    pub fn set_on_write_complete(&mut self, cb: WriteCompleteCallback) {
        self.callbacks.on_write_complete = Some(cb);
    }

    pub fn set_on_high_water(&mut self, cb: HighWaterCallback) {
        self.callbacks.on_high_water = Some(cb);
    }

    pub fn set_on_close(&mut self, cb: CloseCallback) {
        self.callbacks.on_close = Some(cb);
    }

    fn set_state(&self, new: State) {
        self.state.store(new as u8, Ordering::Relaxed);
    }

    /// Called by the owning manager exactly once, on first registration.
    /// Moves *Connecting* -> *Connected*, fires `on_connect(true)`, and
    /// arms read interest.
    pub fn on_establish(&mut self) {
        if self.state() != State::Connecting {
            return;
        }
        self.set_state(State::Connected);
        if let Some(mut cb) = self.callbacks.on_connect.take() {
            cb(self, true);
            self.callbacks.on_connect = Some(cb);
        }
        self.event.enable_read();
    }

    /// Interprets the event handle's most recent poll mask and runs the
    /// matching path(s) in close > read > write order.
    pub fn dispatch(&mut self, now: TimePoint) {
        let mask = self.event.last_mask();
        if mask & (libc::POLLHUP as u32 | libc::POLLRDHUP as u32) != 0 {
            self.do_close();
            return;
        }
        if mask & (libc::POLLERR as u32 | libc::POLLNVAL as u32) != 0 {
            self.do_error("poller reported POLLERR/POLLNVAL");
            return;
        }
        if mask & crate::event::interest::READ != 0 {
            self.on_read_ready(now);
        }
        if mask & crate::event::interest::WRITE != 0 && self.state() != State::Disconnected {
            self.on_write_ready();
        }
    }

    /// Drives one readiness dispatch: a `Read` completion with `result`
    /// being the raw `read`-style return value (bytes read, `0` for EOF,
    /// or a negative errno).
    pub fn on_read_ready(&mut self, now: TimePoint) {
        if self.fault || self.state() >= State::Disconnecting {
            return;
        }
        match self.input.scatter_read(self.fd()) {
            Ok(0) => self.do_close(),
            Ok(_n) => {
                if let Some(mut cb) = self.callbacks.on_message.take() {
                    cb(self, now);
                    self.callbacks.on_message = Some(cb);
                }
            }
            Err(e) => match e.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => {}
                _ => self.do_error(&format!("read failed: {e}")),
            },
        }
    }

    /// Queues `bytes` for sending. If nothing is already buffered, attempts
    /// an in-line `send` first; any remainder (or the whole payload on
    /// `EWOULDBLOCK`) is appended to the output buffer and write interest
    /// is armed. Crossing `high_water_mark` from below fires
    /// `on_high_water`. No-op if *Disconnected* or faulted.
    pub fn send(&mut self, bytes: &[u8]) {
        if self.fault || self.state() == State::Disconnected {
            return;
        }
        let before = self.output.readable_len();

        if self.output.is_empty() && !self.write_pending {
            match unsafe {
                libc::send(self.fd(), bytes.as_ptr().cast(), bytes.len(), libc::MSG_NOSIGNAL)
            } {
                n if n < 0 => {
                    let err = std::io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => {
                            self.output.append(bytes);
                        }
                        Some(libc::EPIPE) | Some(libc::ECONNRESET) => {
                            self.fault = true;
                            return;
                        }
                        _ => {
                            log_warn!("connection: send failed on fd {}: {err}", self.fd());
                            self.output.append(bytes);
                        }
                    }
                }
                n if (n as usize) < bytes.len() => {
                    self.output.append(&bytes[n as usize..]);
                }
                _ => return,
            }
        } else {
            self.output.append(bytes);
        }

        if !self.output.is_empty() {
            self.write_pending = true;
            self.event.enable_write();
            let after = self.output.readable_len();
            if before < self.high_water_mark && after >= self.high_water_mark {
                if let Some(mut cb) = self.callbacks.on_high_water.take() {
                    cb(self, after);
                    self.callbacks.on_high_water = Some(cb);
                }
            }
        }
    }

    pub fn send_buffer(&mut self, buf: &mut IoBuffer) {
        let bytes = buf.retrieve(buf.readable_len());
        self.send(&bytes);
    }

    /// Drains the output buffer on a `Write` readiness completion.
    pub fn on_write_ready(&mut self) {
        if self.state() == State::Disconnected {
            return;
        }
        match self.output.write_to(self.fd()) {
            Ok(_) => {}
            Err(e) => match e.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => return,
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => {
                    self.fault = true;
                    self.do_close();
                    return;
                }
                _ => {
                    self.do_error(&format!("write failed: {e}"));
                    return;
                }
            },
        }
        if self.output.is_empty() {
            self.write_pending = false;
            self.event.disable_write();
            if let Some(mut cb) = self.callbacks.on_write_complete.take() {
                cb(self);
                self.callbacks.on_write_complete = Some(cb);
            }
            if self.state() == State::Disconnecting {
                self.socket.shutdown_write();
            }
        }
    }

    /// *Connected* -> *Disconnecting*. Shuts the write half down
    /// immediately if nothing is left to drain; otherwise the pending
    /// write's completion will do it.
    pub fn shutdown_write(&mut self) {
        if self.state() != State::Connected {
            return;
        }
        self.set_state(State::Disconnecting);
        if !self.write_pending {
            self.socket.shutdown_write();
        }
    }

    /// Idempotent hard close: moves to *Disconnecting* then runs the close
    /// path immediately regardless of any pending write.
    pub fn force_close(&mut self) {
        if self.state() == State::Disconnected {
            return;
        }
        self.set_state(State::Disconnecting);
        self.do_close();
    }

    fn do_error(&mut self, message: &str) {
        log_warn!("connection: fd {} fault: {message}", self.fd());
        self.do_close();
    }

    /// -> *Disconnected*: disables all interest and fires `on_connect(false)`
    /// then `on_close` exactly once. Does not itself remove the connection
    /// from the owning manager's table — that happens via the manager's
    /// deferred-destruction pass.
    pub fn do_close(&mut self) {
        if self.state() == State::Disconnected {
            return;
        }
        self.set_state(State::Disconnected);
        self.event.disable_all();
        if let Some(mut cb) = self.callbacks.on_connect.take() {
            cb(self, false);
        }
        if let Some(mut cb) = self.callbacks.on_close.take() {
            cb(self);
        }
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

    #[test]
    fn state_machine_moves_forward_only() {
        let (server_sock, _client) = loopback_pair();
        let peer = server_sock.peer_addr().unwrap();
        let local = server_sock.local_addr().unwrap();
        let mut conn = Connection::new(server_sock, local, peer);
        assert_eq!(conn.state(), State::Connecting);
        conn.on_establish();
        assert_eq!(conn.state(), State::Connected);
        conn.on_establish();
        assert_eq!(conn.state(), State::Connected, "on_establish must be idempotent");
        conn.force_close();
        assert_eq!(conn.state(), State::Disconnected);
        conn.on_establish();
        assert_eq!(
            conn.state(),
            State::Disconnected,
            "state must never move backward"
        );
    }

    #[test]
    fn on_close_fires_exactly_once() {
        let (server_sock, _client) = loopback_pair();
        let peer = server_sock.peer_addr().unwrap();
        let local = server_sock.local_addr().unwrap();
        let mut conn = Connection::new(server_sock, local, peer);
        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_cb = std::sync::Arc::clone(&count);
        conn.set_on_close(Box::new(move |_| {
            count_cb.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        conn.force_close();
        conn.force_close();
        conn.do_close();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn send_before_establish_does_not_panic() {
        let (server_sock, _client) = loopback_pair();
        let peer = server_sock.peer_addr().unwrap();
        let local = server_sock.local_addr().unwrap();
        let mut conn = Connection::new(server_sock, local, peer);
        conn.send(b"hello");
    }
}
