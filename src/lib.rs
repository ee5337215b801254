//! A multi-reactor TCP server runtime for Linux.
//!
//! One listening socket feeds a pool of single-threaded event loops. Each
//! loop multiplexes its connections through epoll (readiness) or io_uring
//! (completion), merges cross-thread work submitted through an eventfd with
//! timer expirations from a timerfd, and drives application callbacks with
//! strict one-loop-per-connection semantics.
//!
//! # Example
//!
//! ```no_run
//! use hive_io::{EventLoop, TcpServer, round_robin};
//!
//! let event_loop = EventLoop::new().unwrap();
//!
//! let server = TcpServer::new(&event_loop, "127.0.0.1:8000", 4, round_robin()).unwrap();
//!
//! server.set_message_callback(|conn, input| {
//!     let bytes = input.peek().to_vec();
//!     input.retrieve_all();
//!     conn.send(&bytes);
//! });
//!
//! server.start().unwrap();
//! event_loop.run().unwrap();
//! ```

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)? )) => {{
        let res = unsafe { libc::$fn($($arg,)*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub mod sys;

mod acceptor;
mod buffer;
mod callbacks;
mod channel;
mod connection;
mod context;
mod event_loop;
mod pool;
mod poller;
mod ready;
mod server;
mod timer;
mod token;
mod waker;

pub use buffer::Buffer;

pub use callbacks::{
    ConnectedCallback,
    DisconnectedCallback,
    HighWaterCallback,
    MessageCallback,
    WriteCompleteCallback,
};

pub use connection::{ConnState, TcpConnection};

pub use context::Context;

pub use event_loop::{EventLoop, LoopHandle};

pub use pool::{least_connection, round_robin, LoadBalanceStrategy, LoopPool};

pub use poller::PollerKind;

pub use ready::Ready;

pub use server::TcpServer;

pub use timer::TimerId;

pub use token::Token;
