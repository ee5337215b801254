use std::cell::{Cell, RefCell};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

use crate::acceptor::TcpAcceptor;
use crate::buffer::Buffer;
use crate::callbacks::{self, ConnectedCallback, MessageCallback};
use crate::connection::{establish_connection, TcpConnection};
use crate::event_loop::EventLoop;
use crate::pool::{LoadBalanceStrategy, LoopPool};

/// A multi-reactor TCP server: one acceptor on the base loop, a pool of
/// worker loops, and a connection per accepted socket, owned by whichever
/// loop the balancing strategy picked.
///
/// The server lives on the base loop's thread. Install callbacks before
/// [`start`](TcpServer::start); per-connection callbacks are installed on
/// the connection handle, typically inside the connected callback.
pub struct TcpServer {
    inner: Rc<ServerInner>,
}

struct ServerInner {
    acceptor: Rc<RefCell<TcpAcceptor>>,
    pool: LoopPool,
    started: Cell<bool>,
    connected_callback: RefCell<ConnectedCallback>,
    message_callback: RefCell<MessageCallback>,
}

impl TcpServer {
    /// `addr` is an IPv4 endpoint in `a.b.c.d:port` text form. With
    /// `num_workers == 0` the acceptor and every connection share the base
    /// loop.
    pub fn new(
        base: &EventLoop,
        addr: &str,
        num_workers: usize,
        strategy: LoadBalanceStrategy,
    ) -> io::Result<TcpServer> {
        let listen_addr: SocketAddrV4 = addr.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "listen address must be a.b.c.d:port",
            )
        })?;

        let acceptor = TcpAcceptor::new(base, listen_addr, 1024)?;

        let inner = Rc::new(ServerInner {
            acceptor: Rc::clone(&acceptor),
            pool: LoopPool::new(base, num_workers, strategy),
            started: Cell::new(false),
            connected_callback: RefCell::new(callbacks::default_connected()),
            message_callback: RefCell::new(callbacks::default_message()),
        });

        let weak = Rc::downgrade(&inner);
        acceptor
            .borrow_mut()
            .set_new_connection_callback(Rc::new(move |_, fd, peer| {
                if let Some(server) = weak.upgrade() {
                    server.on_new_connection(fd, peer);
                }
            }));

        Ok(TcpServer { inner })
    }

    pub fn set_connection_callback(&self, callback: impl Fn(&TcpConnection) + Send + Sync + 'static) {
        *self.inner.connected_callback.borrow_mut() = Arc::new(callback);
    }

    pub fn set_message_callback(
        &self,
        callback: impl Fn(&TcpConnection, &mut Buffer) + Send + Sync + 'static,
    ) {
        *self.inner.message_callback.borrow_mut() = Arc::new(callback);
    }

    /// Listens and spawns the worker loops. Bind/listen failures return
    /// upward with nothing running.
    ///
    /// # Panics
    ///
    /// Panics on double start.
    pub fn start(&self) -> io::Result<()> {
        if self.inner.started.get() {
            panic!("server already started");
        }

        self.inner.acceptor.borrow_mut().listen()?;
        self.inner.pool.start();
        self.inner.started.set(true);

        Ok(())
    }

    /// The bound listen address; reports the chosen port after binding
    /// port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.acceptor.borrow().local_addr()
    }

    /// Stops the worker loops and joins their threads. The base loop is
    /// the caller's to stop.
    pub fn stop(&self) {
        self.inner.pool.stop();
    }
}

impl ServerInner {
    fn on_new_connection(&self, fd: RawFd, peer: SocketAddr) {
        let target = self.pool.get_next();

        let connected = self.connected_callback.borrow().clone();
        let message = self.message_callback.borrow().clone();

        // From here the connection belongs to its worker; the server keeps
        // no reference.
        target.run_in_loop(move |event_loop| {
            establish_connection(event_loop, fd, peer, connected, message);
        });
    }
}
