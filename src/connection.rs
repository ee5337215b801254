use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{error, trace};

use crate::buffer::Buffer;
use crate::callbacks::{
    self, ConnectedCallback, DisconnectedCallback, HighWaterCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::context::Context;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::poller::PollerKind;
use crate::sys::socket;

/// The lifecycle of a connection. Transitions only move forward:
/// Connecting → Connected → {Disconnecting, Disconnected},
/// Disconnecting → Disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
    Disconnected = 4,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            3 => ConnState::Disconnecting,
            4 => ConnState::Disconnected,
            _ => unreachable!("invalid connection state"),
        }
    }
}

// The cross-thread part of a connection. The state cell is written only by
// the owning loop; other threads read it as a snapshot.
struct ConnShared {
    owner: LoopHandle,
    id: u64,
    fd: RawFd,
    remote: SocketAddr,
    state: AtomicU8,
    context: Context,
}

/// A handle to one TCP connection.
///
/// Handles are cheap to clone and safe to use from any thread: every
/// mutating call routes through the owning loop, which is the only thread
/// that touches the connection's buffers and channel. After the connection
/// disconnects, mutating calls become no-ops.
#[derive(Clone)]
pub struct TcpConnection {
    shared: Arc<ConnShared>,
}

// The loop-local half: buffers, channel and callbacks, owned by the loop's
// connection table and never visible off-thread.
pub(crate) struct ConnInner {
    shared: Arc<ConnShared>,
    channel: Rc<RefCell<Channel>>,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    // 0 disables the high-water signal.
    high_water: Cell<usize>,
    connected_callback: RefCell<ConnectedCallback>,
    disconnected_callback: RefCell<DisconnectedCallback>,
    message_callback: RefCell<MessageCallback>,
    write_complete_callback: RefCell<WriteCompleteCallback>,
    high_water_callback: RefCell<HighWaterCallback>,
}

/// Builds the connection on its owning loop, registers it, and fires the
/// connected callback. Runs inside a functor posted to the worker loop by
/// the server.
pub(crate) fn establish_connection(
    event_loop: &EventLoop,
    fd: RawFd,
    peer: SocketAddr,
    connected: ConnectedCallback,
    message: MessageCallback,
) -> TcpConnection {
    let shared = Arc::new(ConnShared {
        owner: event_loop.handle(),
        id: event_loop.alloc_conn_id(),
        fd,
        remote: peer,
        state: AtomicU8::new(ConnState::Connecting as u8),
        context: Context::new(),
    });

    let inner = Rc::new(ConnInner {
        shared: Arc::clone(&shared),
        channel: Rc::new(RefCell::new(Channel::new(fd))),
        input: RefCell::new(Buffer::new()),
        output: RefCell::new(Buffer::new()),
        high_water: Cell::new(0),
        connected_callback: RefCell::new(connected),
        disconnected_callback: RefCell::new(callbacks::default_disconnected()),
        message_callback: RefCell::new(message),
        write_complete_callback: RefCell::new(callbacks::default_write_complete()),
        high_water_callback: RefCell::new(callbacks::default_high_water()),
    });

    {
        let mut channel = inner.channel.borrow_mut();

        let weak = Rc::downgrade(&inner);
        channel.set_read_callback(Rc::new(move |event_loop: &EventLoop| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(event_loop);
            }
        }));

        let weak = Rc::downgrade(&inner);
        channel.set_write_callback(Rc::new(move |event_loop: &EventLoop| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write(event_loop);
            }
        }));

        let weak = Rc::downgrade(&inner);
        channel.set_close_callback(Rc::new(move |event_loop: &EventLoop| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close(event_loop);
            }
        }));

        let weak = Rc::downgrade(&inner);
        channel.set_error_callback(Rc::new(move |event_loop: &EventLoop| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error(event_loop);
            }
        }));
    }

    event_loop.insert_connection(shared.id, Rc::clone(&inner));
    inner.establish(event_loop);

    TcpConnection { shared }
}

impl ConnInner {
    fn handle(&self) -> TcpConnection {
        TcpConnection {
            shared: Arc::clone(&self.shared),
        }
    }

    fn state(&self) -> ConnState {
        ConnState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnState) {
        self.shared.state.store(state as u8, Ordering::SeqCst);
    }

    fn establish(&self, event_loop: &EventLoop) {
        assert_eq!(
            self.state(),
            ConnState::Connecting,
            "establish on an already established connection"
        );
        self.set_state(ConnState::Connected);

        self.channel.borrow_mut().enable_read(false);
        event_loop.update_channel(&self.channel);

        trace!(
            "connection {} from {} established on loop {}",
            self.shared.id,
            self.shared.remote,
            event_loop.id()
        );

        let connected = self.connected_callback.borrow().clone();
        connected(&self.handle());
    }

    fn handle_read(&self, event_loop: &EventLoop) {
        if self.state() == ConnState::Disconnected {
            return;
        }

        let n: isize = match event_loop.kind() {
            PollerKind::Readiness => {
                let result = event_loop.with_scratch(|scratch| {
                    self.input.borrow_mut().read_fd(self.shared.fd, scratch)
                });

                match result {
                    Ok(n) => n as isize,
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted =>
                    {
                        // Spurious wakeup: no bytes, stay registered.
                        return;
                    }
                    Err(e) => {
                        error!("read fd {}: {}", self.shared.fd, e);
                        self.handle_close(event_loop);
                        return;
                    }
                }
            }
            PollerKind::Completion => {
                let (buf, res) = self.channel.borrow_mut().take_read_carry();

                if res == -libc::EAGAIN || res == -libc::EINTR {
                    self.rearm_read(event_loop);
                    return;
                }

                if res > 0 {
                    self.input.borrow_mut().append(&buf[..res as usize]);
                }

                res as isize
            }
        };

        if n > 0 {
            let message = self.message_callback.borrow().clone();
            let handle = self.handle();
            {
                let mut input = self.input.borrow_mut();
                message(&handle, &mut input);
            }

            if self.state() != ConnState::Disconnected {
                self.rearm_read(event_loop);
            }
        } else {
            // 0 is an orderly peer shutdown, a negative completion result
            // an abrupt one; both end the connection.
            self.handle_close(event_loop);
        }
    }

    // The completion poller drops read interest when it submits; put it
    // back so the next turn resubmits. Under the readiness poller the bit
    // never moved and this is free.
    fn rearm_read(&self, event_loop: &EventLoop) {
        let changed = self.channel.borrow_mut().enable_read(false);
        if changed {
            event_loop.update_channel(&self.channel);
        }
    }

    fn handle_write(&self, event_loop: &EventLoop) {
        if self.state() == ConnState::Disconnected {
            return;
        }

        let n: usize = match event_loop.kind() {
            PollerKind::Readiness => {
                if !self.channel.borrow().is_writing() {
                    return;
                }

                let result = {
                    let output = self.output.borrow();
                    socket::write(self.shared.fd, output.peek())
                };

                match result {
                    Ok(n) => n,
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted =>
                    {
                        return;
                    }
                    Err(e) => {
                        error!("write fd {}: {}", self.shared.fd, e);
                        self.handle_close(event_loop);
                        return;
                    }
                }
            }
            PollerKind::Completion => {
                let res = self.channel.borrow_mut().take_write_res();

                if res == -libc::EAGAIN || res == -libc::EINTR {
                    self.stage_pending_write(event_loop);
                    return;
                }

                if res < 0 {
                    error!(
                        "write fd {}: {}",
                        self.shared.fd,
                        io::Error::from_raw_os_error(-res)
                    );
                    self.handle_close(event_loop);
                    return;
                }

                res as usize
            }
        };

        let drained = {
            let mut output = self.output.borrow_mut();
            output.retrieve(n);
            output.readable_bytes() == 0
        };

        if drained {
            if event_loop.kind() == PollerKind::Readiness {
                let changed = self.channel.borrow_mut().disable_write();
                if changed {
                    event_loop.update_channel(&self.channel);
                }
            }

            let write_complete = self.write_complete_callback.borrow().clone();
            write_complete(&self.handle());

            // A deferred half-close waits for the drain.
            if self.state() == ConnState::Disconnecting {
                if let Err(e) = socket::shutdown_write(self.shared.fd) {
                    error!("shutdown fd {}: {}", self.shared.fd, e);
                }
            }
        } else if event_loop.kind() == PollerKind::Completion {
            self.stage_pending_write(event_loop);
        }
        // Readiness: stay write-enabled; level-triggered epoll refires.
    }

    // Stages whatever the output buffer holds for the completion poller's
    // next submission.
    fn stage_pending_write(&self, event_loop: &EventLoop) {
        if self.state() == ConnState::Disconnected {
            return;
        }

        let staged = self.output.borrow().peek().to_vec();
        if staged.is_empty() {
            return;
        }

        let changed = self.channel.borrow_mut().enable_write(staged);
        if changed {
            event_loop.update_channel(&self.channel);
        }
    }

    fn send_in_loop(&self, event_loop: &EventLoop, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }

        let mut remaining: &[u8] = data;

        // Nothing queued or in flight: write directly and buffer only the
        // leftover. Completion loops keep their descriptors blocking, so
        // they always go through the ring instead.
        if event_loop.kind() == PollerKind::Readiness
            && !self.channel.borrow().is_writing()
            && self.output.borrow().readable_bytes() == 0
        {
            match socket::write(self.shared.fd, data) {
                Ok(n) => remaining = &data[n..],
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("write fd {}: {}", self.shared.fd, e);
                    self.handle_close(event_loop);
                    return;
                }
            }
        }

        if remaining.is_empty() {
            let write_complete = self.write_complete_callback.borrow().clone();
            write_complete(&self.handle());
            return;
        }

        let buffered = {
            let mut output = self.output.borrow_mut();
            output.append(remaining);
            output.readable_bytes()
        };

        let high_water = self.high_water.get();
        if high_water > 0 && buffered >= high_water {
            let callback = self.high_water_callback.borrow().clone();
            callback(&self.handle(), buffered);

            // The callback may have torn the connection down.
            if self.state() != ConnState::Connected {
                return;
            }
        }

        let (writing, pending) = {
            let channel = self.channel.borrow();
            (channel.is_writing(), channel.is_write_pending())
        };

        if !writing && !pending {
            let staged = match event_loop.kind() {
                PollerKind::Completion => self.output.borrow().peek().to_vec(),
                PollerKind::Readiness => Vec::new(),
            };

            self.channel.borrow_mut().enable_write(staged);
            event_loop.update_channel(&self.channel);
        }
    }

    fn shutdown_write_in_loop(&self, _event_loop: &EventLoop) {
        if self.state() != ConnState::Connected {
            return;
        }

        self.set_state(ConnState::Disconnecting);

        let (writing, pending) = {
            let channel = self.channel.borrow();
            (channel.is_writing(), channel.is_write_pending())
        };

        // With writes still queued the half-close waits for handle_write's
        // drain; otherwise it happens now.
        if !writing && !pending {
            if let Err(e) = socket::shutdown_write(self.shared.fd) {
                error!("shutdown fd {}: {}", self.shared.fd, e);
            }
        }
    }

    fn force_close_in_loop(&self, event_loop: &EventLoop) {
        match self.state() {
            ConnState::Connecting | ConnState::Connected | ConnState::Disconnecting => {
                self.handle_close(event_loop);
            }
            ConnState::Disconnected => {}
        }
    }

    fn set_keep_alive_in_loop(&self, on: bool) {
        if self.state() == ConnState::Disconnected {
            return;
        }
        if let Err(e) = socket::set_keepalive(self.shared.fd, on) {
            error!("SO_KEEPALIVE fd {}: {}", self.shared.fd, e);
        }
    }

    fn set_no_delay_in_loop(&self, on: bool) {
        if self.state() == ConnState::Disconnected {
            return;
        }
        if let Err(e) = socket::set_nodelay(self.shared.fd, on) {
            error!("TCP_NODELAY fd {}: {}", self.shared.fd, e);
        }
    }

    fn handle_error(&self, _event_loop: &EventLoop) {
        match socket::take_error(self.shared.fd) {
            Ok(Some(e)) => error!("connection {}: {}", self.shared.id, e),
            Ok(None) => {}
            Err(e) => error!("connection {} SO_ERROR: {}", self.shared.id, e),
        }
    }

    fn handle_close(&self, event_loop: &EventLoop) {
        let state = self.state();
        if state == ConnState::Disconnected {
            return;
        }
        // Close can arrive from Connecting when the peer aborts before the
        // connection is established; no connected callback has fired.

        self.set_state(ConnState::Disconnected);
        trace!("connection {} closed (was {:?})", self.shared.id, state);

        if self.channel.borrow().index() >= 0 {
            event_loop.remove_channel(&self.channel);
        }
        socket::close(self.shared.fd);

        // Dropping the table entry is the internal half of the close; the
        // user-visible half follows.
        event_loop.remove_connection(self.shared.id);

        let disconnected = self.disconnected_callback.borrow().clone();
        disconnected(&self.handle());
    }
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        // A loop torn down with live connections still releases their
        // descriptors.
        if self.state() != ConnState::Disconnected {
            socket::close(self.shared.fd);
        }
    }
}

impl TcpConnection {
    // Runs `f` on the owning loop against the live connection, if any.
    fn route(&self, f: impl FnOnce(&EventLoop, &ConnInner) + Send + 'static) {
        let id = self.shared.id;
        self.shared.owner.run_in_loop(move |event_loop| {
            if let Some(conn) = event_loop.connection(id) {
                f(event_loop, &conn);
            }
        });
    }

    /// Queues `bytes` for delivery. The payload is copied before this call
    /// returns, so the caller may reuse its buffer. Sends from one thread
    /// keep their order; sends from different threads interleave only at
    /// whole-payload granularity. There is no cap: the high-water callback
    /// is the only backpressure signal.
    pub fn send(&self, bytes: &[u8]) {
        let data = bytes.to_vec();
        self.route(move |event_loop, conn| conn.send_in_loop(event_loop, &data));
    }

    /// Half-closes the write side once pending output drains; the read
    /// side stays open.
    pub fn shutdown_write(&self) {
        self.route(|event_loop, conn| conn.shutdown_write_in_loop(event_loop));
    }

    /// Closes regardless of pending data. Safe from any thread; the
    /// connection is `Disconnected` by the owning loop's next iteration.
    pub fn force_close(&self) {
        self.route(|event_loop, conn| conn.force_close_in_loop(event_loop));
    }

    pub fn set_keep_alive(&self, on: bool) {
        self.route(move |_, conn| conn.set_keep_alive_in_loop(on));
    }

    pub fn set_no_delay(&self, on: bool) {
        self.route(move |_, conn| conn.set_no_delay_in_loop(on));
    }

    /// Buffered-output threshold for the high-water callback; 0 disables
    /// the signal.
    pub fn set_high_water_mark(&self, bytes: usize) {
        self.route(move |_, conn| conn.high_water.set(bytes));
    }

    pub fn set_disconnected_callback(&self, callback: impl Fn(&TcpConnection) + Send + Sync + 'static) {
        let callback: DisconnectedCallback = Arc::new(callback);
        self.route(move |_, conn| *conn.disconnected_callback.borrow_mut() = callback);
    }

    pub fn set_write_complete_callback(
        &self,
        callback: impl Fn(&TcpConnection) + Send + Sync + 'static,
    ) {
        let callback: WriteCompleteCallback = Arc::new(callback);
        self.route(move |_, conn| *conn.write_complete_callback.borrow_mut() = callback);
    }

    pub fn set_high_water_callback(
        &self,
        callback: impl Fn(&TcpConnection, usize) + Send + Sync + 'static,
    ) {
        let callback: HighWaterCallback = Arc::new(callback);
        self.route(move |_, conn| *conn.high_water_callback.borrow_mut() = callback);
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote
    }

    pub fn fd(&self) -> RawFd {
        self.shared.fd
    }

    /// The loop that owns this connection.
    pub fn owner_loop(&self) -> LoopHandle {
        self.shared.owner.clone()
    }

    /// A snapshot of the connection state.
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// The per-connection key/value context.
    pub fn context(&self) -> &Context {
        &self.shared.context
    }
}

#[cfg(test)]
mod test {
    use super::ConnState;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ConnState::Connecting,
            ConnState::Connected,
            ConnState::Disconnecting,
            ConnState::Disconnected,
        ] {
            assert_eq!(ConnState::from_u8(state as u8), state);
        }
    }
}
