use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use hive_io::{round_robin, EventLoop, TcpServer};

#[test]
fn echo_single_reactor() {
    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(&event_loop, "127.0.0.1:0", 0, round_robin()).unwrap();

    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));

    {
        let connected = Arc::clone(&connected);
        let disconnected = Arc::clone(&disconnected);
        server.set_connection_callback(move |conn| {
            connected.fetch_add(1, Ordering::SeqCst);

            let disconnected = Arc::clone(&disconnected);
            conn.set_disconnected_callback(move |_| {
                disconnected.fetch_add(1, Ordering::SeqCst);
            });
        });
    }

    server.set_message_callback(|conn, input| {
        let bytes = input.peek().to_vec();
        input.retrieve_all();
        conn.send(&bytes);
    });

    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    let handle = event_loop.handle();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"hello").unwrap();
        stream.shutdown(Shutdown::Write).unwrap();

        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).unwrap();

        handle.stop();
        echoed
    });

    event_loop.run().unwrap();

    let echoed = client.join().unwrap();
    assert_eq!(echoed, b"hello");
    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
}

#[test]
fn cross_thread_sends_keep_payloads_whole() {
    const THREADS: usize = 4;
    const SENDS_PER_THREAD: usize = 1000;
    const PAYLOAD: usize = 1024;

    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(&event_loop, "127.0.0.1:0", 0, round_robin()).unwrap();

    let (conn_tx, conn_rx) = mpsc::channel();
    let conn_tx = Mutex::new(conn_tx);
    server.set_connection_callback(move |conn| {
        conn_tx.lock().unwrap().send(conn.clone()).ok();
    });
    server.set_message_callback(|_, input| input.retrieve_all());

    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    let handle = event_loop.handle();

    let driver = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        let conn = conn_rx.recv().unwrap();

        let mut senders = Vec::new();
        for t in 0..THREADS {
            let conn = conn.clone();
            senders.push(thread::spawn(move || {
                let payload = vec![t as u8; PAYLOAD];
                for _ in 0..SENDS_PER_THREAD {
                    conn.send(&payload);
                }
            }));
        }

        let total = THREADS * SENDS_PER_THREAD * PAYLOAD;
        let mut received = vec![0u8; total];
        stream.read_exact(&mut received).unwrap();

        for sender in senders {
            sender.join().unwrap();
        }

        // Whole payloads, never interleaved at byte granularity: every
        // 1 KiB frame on the wire holds one sender's byte.
        for frame in received.chunks(PAYLOAD) {
            let first = frame[0];
            assert!((first as usize) < THREADS);
            assert!(frame.iter().all(|&b| b == first));
        }

        handle.stop();
    });

    event_loop.run().unwrap();
    driver.join().unwrap();
}

#[test]
fn force_close_races_pending_writes() {
    const SIZE: usize = 1024 * 1024;

    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(&event_loop, "127.0.0.1:0", 0, round_robin()).unwrap();

    let disconnected = Arc::new(AtomicUsize::new(0));
    let (conn_tx, conn_rx) = mpsc::channel();
    let conn_tx = Mutex::new(conn_tx);
    {
        let disconnected = Arc::clone(&disconnected);
        server.set_connection_callback(move |conn| {
            let disconnected = Arc::clone(&disconnected);
            conn.set_disconnected_callback(move |_| {
                disconnected.fetch_add(1, Ordering::SeqCst);
            });
            conn_tx.lock().unwrap().send(conn.clone()).ok();
        });
    }

    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    let handle = event_loop.handle();

    let driver = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        let conn = conn_rx.recv().unwrap();

        conn.send(&vec![7u8; SIZE]);
        conn.force_close();

        // The peer sees a prefix of the payload (possibly all of it)
        // followed by EOF or a reset; never garbage, never a hang.
        let mut received = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }

        assert!(received.len() <= SIZE);
        assert!(received.iter().all(|&b| b == 7));

        handle.stop();
    });

    event_loop.run().unwrap();
    driver.join().unwrap();

    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
}

#[test]
fn half_close_flushes_pending_output() {
    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(&event_loop, "127.0.0.1:0", 0, round_robin()).unwrap();

    // Reply then half-close from the server side; the client must still
    // receive the full reply before EOF.
    server.set_message_callback(|conn, input| {
        let bytes = input.peek().to_vec();
        input.retrieve_all();
        conn.send(&bytes);
        conn.shutdown_write();
    });

    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    let handle = event_loop.handle();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"ping").unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"ping");

        handle.stop();
    });

    event_loop.run().unwrap();
    client.join().unwrap();
}
