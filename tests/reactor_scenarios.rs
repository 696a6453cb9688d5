//! End-to-end scenarios driving a real `EventManager` loop against
//! plain-`std` TCP clients: echo, discard, length-prefixed framing, and
//! output-buffer backpressure.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ringloop::acceptor::Acceptor;
use ringloop::address::Address;
use ringloop::config::PollerConfig;
use ringloop::event_manager::EventManager;
use ringloop::socket::Socket;

/// `None` means this sandbox has no usable `io_uring`; every test bails out
/// early in that case rather than failing.
fn new_manager() -> Option<EventManager> {
    EventManager::new(PollerConfig::default()).ok()
}

fn wait_until(timeout: Duration, mut poll: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if poll() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn echo_round_trip() {
    let Some(mut manager) = new_manager() else {
        return;
    };
    let addr = Address::new_with_ip("127.0.0.1", 0, false).unwrap();
    let acceptor = Acceptor::bind(addr, false).unwrap();
    let local = acceptor.local_addr();
    let handle = manager.handle();

    let accept_handle = handle.clone();
    acceptor.register(
        &mut manager,
        Box::new(move |fd, peer| {
            let socket = unsafe { Socket::from_raw_fd(fd) };
            let local = socket.local_addr().unwrap_or(peer);
            accept_handle.run_soon(Box::new(move |mgr| {
                let fd = mgr.insert_connection(socket, local, peer);
                if let Some(conn) = mgr.connection_mut(fd) {
                    conn.set_on_message(Box::new(move |conn, _now| {
                        let input = conn.input_buffer();
                        let n = input.readable_len();
                        let bytes = input.retrieve(n);
                        conn.send(&bytes);
                    }));
                    conn.on_establish();
                }
            }));
        }),
    );

    let join = manager.run();

    let mut stream = TcpStream::connect(local.socket_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"hello, reactor").unwrap();

    let mut buf = [0u8; 64];
    let mut received = Vec::new();
    while received.len() < b"hello, reactor".len() {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "peer closed before echoing everything back");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, b"hello, reactor");

    handle.quit();
    join.join().unwrap();
}

#[test]
fn discard_round_trip() {
    let Some(mut manager) = new_manager() else {
        return;
    };
    let addr = Address::new_with_ip("127.0.0.1", 0, false).unwrap();
    let acceptor = Acceptor::bind(addr, false).unwrap();
    let local = acceptor.local_addr();
    let handle = manager.handle();

    let received = Arc::new(AtomicUsize::new(0));
    let received_cb = Arc::clone(&received);
    let accept_handle = handle.clone();
    acceptor.register(
        &mut manager,
        Box::new(move |fd, peer| {
            let socket = unsafe { Socket::from_raw_fd(fd) };
            let local = socket.local_addr().unwrap_or(peer);
            let received_cb = Arc::clone(&received_cb);
            accept_handle.run_soon(Box::new(move |mgr| {
                let fd = mgr.insert_connection(socket, local, peer);
                if let Some(conn) = mgr.connection_mut(fd) {
                    conn.set_on_message(Box::new(move |conn, _now| {
                        let input = conn.input_buffer();
                        let n = input.readable_len();
                        let bytes = input.retrieve(n);
                        received_cb.fetch_add(bytes.len(), Ordering::SeqCst);
                    }));
                    conn.on_establish();
                }
            }));
        }),
    );

    let join = manager.run();

    let mut stream = TcpStream::connect(local.socket_addr()).unwrap();
    let payload = vec![7u8; 10_000];
    stream.write_all(&payload).unwrap();
    drop(stream);

    assert!(
        wait_until(Duration::from_secs(5), || received.load(Ordering::SeqCst)
            == payload.len()),
        "server never drained all {} bytes",
        payload.len()
    );

    handle.quit();
    join.join().unwrap();
}

#[test]
fn length_prefixed_framing_survives_partial_reads() {
    let Some(mut manager) = new_manager() else {
        return;
    };
    let addr = Address::new_with_ip("127.0.0.1", 0, false).unwrap();
    let acceptor = Acceptor::bind(addr, false).unwrap();
    let local = acceptor.local_addr();
    let handle = manager.handle();

    let frames: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let frames_cb = Arc::clone(&frames);
    let accept_handle = handle.clone();
    acceptor.register(
        &mut manager,
        Box::new(move |fd, peer| {
            let socket = unsafe { Socket::from_raw_fd(fd) };
            let local = socket.local_addr().unwrap_or(peer);
            let frames_cb = Arc::clone(&frames_cb);
            accept_handle.run_soon(Box::new(move |mgr| {
                let fd = mgr.insert_connection(socket, local, peer);
                if let Some(conn) = mgr.connection_mut(fd) {
                    conn.set_on_message(Box::new(move |conn, _now| loop {
                        let input = conn.input_buffer();
                        let Some(len) = input.peek_u32() else { break };
                        if input.readable_len() < 4 + len as usize {
                            break;
                        }
                        input.retrieve_discard(4);
                        let frame = input.retrieve(len as usize);
                        frames_cb.lock().unwrap().push(frame);
                    }));
                    conn.on_establish();
                }
            }));
        }),
    );

    let join = manager.run();

    let mut stream = TcpStream::connect(local.socket_addr()).unwrap();
    let messages: [&[u8]; 2] = [b"AB", b"length-prefixed-payload"];
    for msg in messages {
        stream.write_all(&(msg.len() as u32).to_be_bytes()).unwrap();
        // Split the payload across two writes so the server must reassemble
        // a frame that arrives in more than one `on_message` dispatch.
        let mid = msg.len() / 2;
        stream.write_all(&msg[..mid]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        stream.write_all(&msg[mid..]).unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(5), || frames.lock().unwrap().len() == messages.len()),
        "server never decoded both frames"
    );
    let decoded = frames.lock().unwrap();
    for (got, want) in decoded.iter().zip(messages.iter()) {
        assert_eq!(got.as_slice(), *want);
    }

    handle.quit();
    join.join().unwrap();
}

#[test]
fn crossing_high_water_mark_fires_callback() {
    let Some(mut manager) = new_manager() else {
        return;
    };
    let addr = Address::new_with_ip("127.0.0.1", 0, false).unwrap();
    let acceptor = Acceptor::bind(addr, false).unwrap();
    let local = acceptor.local_addr();
    let handle = manager.handle();

    let hit_high_water = Arc::new(AtomicBool::new(false));
    let hit_cb = Arc::clone(&hit_high_water);
    let accept_handle = handle.clone();
    acceptor.register(
        &mut manager,
        Box::new(move |fd, peer| {
            let socket = unsafe { Socket::from_raw_fd(fd) };
            let local = socket.local_addr().unwrap_or(peer);
            let hit_cb = Arc::clone(&hit_cb);
            accept_handle.run_soon(Box::new(move |mgr| {
                let fd = mgr.insert_connection(socket, local, peer);
                if let Some(conn) = mgr.connection_mut(fd) {
                    conn.set_high_water_mark(1);
                    conn.set_on_high_water(Box::new(move |_conn, _n| {
                        hit_cb.store(true, Ordering::SeqCst);
                    }));
                    conn.on_establish();
                    // A payload this large can't complete in one inline
                    // `send(2)`, so some of it lands in the output buffer
                    // and immediately crosses the 1-byte high-water mark.
                    conn.send(&vec![0xABu8; 4 * 1024 * 1024]);
                }
            }));
        }),
    );

    let join = manager.run();

    // Connect but never drain -- the point is to let the server's output
    // buffer back up rather than to read anything back.
    let _stream = TcpStream::connect(local.socket_addr()).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || hit_high_water.load(Ordering::SeqCst)),
        "on_high_water never fired"
    );

    handle.quit();
    join.join().unwrap();
}
