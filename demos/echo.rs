use hive_io::{round_robin, EventLoop, TcpServer};

fn main() {
    env_logger::init();

    let event_loop = EventLoop::new().unwrap();

    let server = TcpServer::new(&event_loop, "127.0.0.1:8000", 0, round_robin()).unwrap();

    server.set_connection_callback(|conn| {
        println!(
            "connection from {} on loop {}",
            conn.remote_addr(),
            conn.owner_loop().id()
        );
        conn.set_disconnected_callback(|conn| {
            println!("{} disconnected", conn.remote_addr());
        });
    });

    server.set_message_callback(|conn, input| {
        let bytes = input.peek().to_vec();
        input.retrieve_all();
        conn.send(&bytes);
    });

    server.start().unwrap();
    event_loop.run().unwrap();
}
