use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::Duration;

use hive_io::{least_connection, round_robin, EventLoop, PollerKind, TcpServer};

#[test]
fn round_robin_follows_construction_order() {
    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(&event_loop, "127.0.0.1:0", 4, round_robin()).unwrap();

    let (owner_tx, owner_rx) = mpsc::channel();
    let owner_tx = Mutex::new(owner_tx);
    server.set_connection_callback(move |conn| {
        owner_tx.lock().unwrap().send(conn.owner_loop()).ok();
    });

    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    let handle = event_loop.handle();

    let driver = thread::spawn(move || {
        let mut streams = Vec::new();
        let mut owners = Vec::new();

        // Serialize the connects so accept order matches connect order.
        for _ in 0..8 {
            streams.push(TcpStream::connect(addr).unwrap());
            owners.push(owner_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }

        handle.stop();
        (streams, owners)
    });

    event_loop.run().unwrap();
    let (_streams, owners) = driver.join().unwrap();

    // Workers 1,2,3,4 then wrapping: 1,2,3,4 again.
    for i in 0..4 {
        assert_eq!(owners[i], owners[i + 4]);
        for j in (i + 1)..4 {
            assert!(owners[i] != owners[j]);
        }
    }

    server.stop();
}

#[test]
fn least_connection_prefers_idle_workers() {
    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(&event_loop, "127.0.0.1:0", 2, least_connection()).unwrap();

    let (owner_tx, owner_rx) = mpsc::channel();
    let owner_tx = Mutex::new(owner_tx);
    server.set_connection_callback(move |conn| {
        owner_tx.lock().unwrap().send(conn.owner_loop()).ok();
    });

    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    let handle = event_loop.handle();

    let driver = thread::spawn(move || {
        let first_stream = TcpStream::connect(addr).unwrap();
        let first = owner_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The first worker now tracks one more channel than the second,
        // so the next connection must land on the other worker.
        let second_stream = TcpStream::connect(addr).unwrap();
        let second = owner_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(first != second);

        drop(first_stream);
        drop(second_stream);
        handle.stop();
    });

    event_loop.run().unwrap();
    driver.join().unwrap();

    server.stop();
}

#[test]
fn echo_multi_reactor() {
    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(&event_loop, "127.0.0.1:0", 2, round_robin()).unwrap();

    server.set_message_callback(|conn, input| {
        let bytes = input.peek().to_vec();
        input.retrieve_all();
        conn.send(&bytes);
    });

    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    let handle = event_loop.handle();

    let driver = thread::spawn(move || {
        let mut clients = Vec::new();
        for i in 0..4u8 {
            clients.push(thread::spawn(move || {
                let payload = vec![i; 8 * 1024];
                let mut stream = TcpStream::connect(addr).unwrap();
                stream.write_all(&payload).unwrap();
                stream.shutdown(Shutdown::Write).unwrap();

                let mut echoed = Vec::new();
                stream.read_to_end(&mut echoed).unwrap();
                assert_eq!(echoed, payload);
            }));
        }

        for client in clients {
            client.join().unwrap();
        }

        handle.stop();
    });

    event_loop.run().unwrap();
    driver.join().unwrap();

    server.stop();
}

// io_uring loops present the same surface; run the echo round trip through
// the completion poller when the kernel provides one.
#[test]
fn echo_completion_poller() {
    let event_loop = match EventLoop::with_poller(PollerKind::Completion) {
        Ok(event_loop) => event_loop,
        Err(_) => return,
    };

    let server = TcpServer::new(&event_loop, "127.0.0.1:0", 0, round_robin()).unwrap();

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
        stream.write_all(b"hello uring").unwrap();
        stream.shutdown(Shutdown::Write).unwrap();

        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).unwrap();

        handle.stop();
        echoed
    });

    event_loop.run().unwrap();

    assert_eq!(client.join().unwrap(), b"hello uring");
}
