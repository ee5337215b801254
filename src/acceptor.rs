use std::cell::RefCell;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use log::debug;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::poller::PollerKind;
use crate::sys::socket;

pub(crate) type NewConnectionCallback = Rc<dyn Fn(&EventLoop, RawFd, SocketAddr)>;

/// Owns the listening socket on the base loop and emits `(fd, peer)` for
/// every accepted connection.
pub(crate) struct TcpAcceptor {
    base: EventLoop,
    listen_addr: SocketAddrV4,
    channel: Rc<RefCell<Channel>>,
    listening: bool,
    backlog: i32,
    on_connection: NewConnectionCallback,
}

impl TcpAcceptor {
    pub fn new(
        base: &EventLoop,
        listen_addr: SocketAddrV4,
        backlog: i32,
    ) -> io::Result<Rc<RefCell<TcpAcceptor>>> {
        let nonblocking = base.kind() == PollerKind::Readiness;

        let fd = socket::new_stream_socket(nonblocking)?;
        // Other instances in the same process may share the port.
        socket::set_reuseport(fd)?;

        let channel = Rc::new(RefCell::new(Channel::new(fd)));

        let acceptor = Rc::new(RefCell::new(TcpAcceptor {
            base: base.clone(),
            listen_addr,
            channel: Rc::clone(&channel),
            listening: false,
            backlog,
            on_connection: Rc::new(|_, fd, _| {
                // No handler installed: close instead of leaking.
                socket::close(fd);
            }),
        }));

        let weak = Rc::downgrade(&acceptor);
        channel
            .borrow_mut()
            .set_read_callback(Rc::new(move |event_loop: &EventLoop| {
                if let Some(acceptor) = weak.upgrade() {
                    TcpAcceptor::handle_read(&acceptor, event_loop);
                }
            }));

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&mut self, callback: NewConnectionCallback) {
        self.on_connection = callback;
    }

    /// Binds and listens, then registers the read side with the base loop.
    /// Bind and listen failures return upward; a double listen panics.
    pub fn listen(&mut self) -> io::Result<()> {
        if self.listening {
            panic!("acceptor already listening");
        }

        let fd = self.channel.borrow().fd();
        socket::bind_v4(fd, self.listen_addr)?;
        socket::listen(fd, self.backlog)?;

        self.listening = true;
        self.channel.borrow_mut().enable_read(true);
        self.base.update_channel(&self.channel);

        debug!("listening on {}", self.local_addr()?);
        Ok(())
    }

    /// The bound address; reports the chosen port after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        socket::local_addr(self.channel.borrow().fd())
    }

    // Accept failures other than "nothing pending" are fatal: crashing
    // beats a silently wedged acceptor.
    fn handle_read(acceptor: &Rc<RefCell<TcpAcceptor>>, event_loop: &EventLoop) {
        let (fd, channel, on_connection) = {
            let a = acceptor.borrow();
            let fd = a.channel.borrow().fd();
            (fd, Rc::clone(&a.channel), Rc::clone(&a.on_connection))
        };

        match event_loop.kind() {
            PollerKind::Readiness => loop {
                match socket::accept(fd, true) {
                    Ok((conn_fd, peer)) => {
                        debug!("accepted connection from {}", peer);
                        on_connection(event_loop, conn_fd, peer);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("accept: {}", e),
                }
            },
            PollerKind::Completion => {
                // The CQE result is the accepted descriptor.
                let (_, res) = channel.borrow_mut().take_read_carry();
                if res < 0 {
                    panic!("accept: {}", io::Error::from_raw_os_error(-res));
                }

                let conn_fd = res as RawFd;
                let peer = socket::peer_addr(conn_fd).unwrap_or_else(|_| {
                    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
                });

                debug!("accepted connection from {}", peer);
                on_connection(event_loop, conn_fd, peer);

                // Re-arm accept for the next connection.
                let changed = channel.borrow_mut().enable_read(true);
                if changed {
                    event_loop.update_channel(&channel);
                }
            }
        }
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        socket::close(self.channel.borrow().fd());
    }
}
