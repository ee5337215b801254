use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::rc::Rc;

use indexmap::IndexMap;
use io_uring::{opcode, squeue, types, IoUring};
use log::trace;
use slab::Slab;

use crate::channel::Channel;
use crate::ready::Ready;
use crate::sys::{Epoll, Events};
use crate::token::Token;

/// Selects which kernel facility a loop multiplexes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerKind {
    /// epoll: the kernel reports descriptors that may be ready.
    Readiness,
    /// io_uring: operations are submitted up front and their completions
    /// reaped.
    Completion,
}

/// The kernel multiplexer behind one loop. Both variants present the same
/// surface: update a channel, remove a channel, and block until at least
/// one channel has active events.
pub(crate) enum Poller {
    Readiness(ReadinessPoller),
    Completion(CompletionPoller),
}

impl Poller {
    pub fn new(kind: PollerKind) -> io::Result<Poller> {
        match kind {
            PollerKind::Readiness => Ok(Poller::Readiness(ReadinessPoller::new()?)),
            PollerKind::Completion => Ok(Poller::Completion(CompletionPoller::new()?)),
        }
    }

    /// Blocks until at least one channel has active events and returns
    /// those channels, their revents already filled in.
    pub fn poll(&mut self) -> io::Result<Vec<Rc<RefCell<Channel>>>> {
        match self {
            Poller::Readiness(p) => p.poll(),
            Poller::Completion(p) => p.poll(),
        }
    }

    /// Registers a new channel (index < 0) or pushes its current interest
    /// set down to the kernel.
    pub fn update(&mut self, channel: &Rc<RefCell<Channel>>) -> io::Result<()> {
        match self {
            Poller::Readiness(p) => p.update(channel),
            Poller::Completion(p) => p.update(channel),
        }
    }

    /// Drops a registered channel. Removing a channel the poller does not
    /// track is a programmer error.
    pub fn remove(&mut self, channel: &Rc<RefCell<Channel>>) -> io::Result<()> {
        match self {
            Poller::Readiness(p) => p.remove(channel),
            Poller::Completion(p) => p.remove(channel),
        }
    }

    pub fn channel_count(&self) -> usize {
        match self {
            Poller::Readiness(p) => p.channels.len(),
            Poller::Completion(p) => p.channels.len(),
        }
    }
}

pub(crate) struct ReadinessPoller {
    epoll: Epoll,
    channels: IndexMap<RawFd, Rc<RefCell<Channel>>>,
    events: Events,
    next_index: i32,
}

impl ReadinessPoller {
    fn new() -> io::Result<ReadinessPoller> {
        Ok(ReadinessPoller {
            epoll: Epoll::new()?,
            channels: IndexMap::new(),
            events: Events::with_capacity(1024),
            next_index: 0,
        })
    }

    fn poll(&mut self) -> io::Result<Vec<Rc<RefCell<Channel>>>> {
        loop {
            match self.epoll.wait(&mut self.events, None) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut active = Vec::with_capacity(self.events.len());

        for i in 0..self.events.len() {
            let (revents, token) = self.events.get(i).unwrap();

            if let Some(channel) = self.channels.get(&(usize::from(token) as RawFd)) {
                channel.borrow_mut().add_revents(revents);
                active.push(Rc::clone(channel));
            }
        }

        // A full array may have truncated this turn's hits.
        if self.events.len() == self.events.capacity() {
            self.events.double();
        }

        Ok(active)
    }

    fn update(&mut self, channel: &Rc<RefCell<Channel>>) -> io::Result<()> {
        let mut c = channel.borrow_mut();
        let fd = c.fd();
        let token = Token(fd as usize);

        if c.index() < 0 {
            self.next_index += 1;
            c.set_index(self.next_index);

            self.epoll.add(fd, token, c.interest())?;
            self.channels.insert(fd, Rc::clone(channel));
        } else {
            self.epoll.modify(fd, token, c.interest())?;
        }

        Ok(())
    }

    fn remove(&mut self, channel: &Rc<RefCell<Channel>>) -> io::Result<()> {
        let mut c = channel.borrow_mut();
        assert!(c.index() >= 0, "remove of an unregistered channel");

        self.epoll.delete(c.fd())?;
        self.channels.swap_remove(&c.fd());
        c.set_index(-1);

        Ok(())
    }
}

const RING_DEPTH: u32 = 4096;
const SUBMIT_BATCH: usize = 4094;
const READ_BUF_SIZE: usize = 1024;

// One in-flight submission. The record owns the operation's buffer for as
// long as the kernel may write into it; the slab key doubles as the CQE
// user_data.
struct OpRecord {
    fd: RawFd,
    op: Ready,
    buf: Vec<u8>,
}

pub(crate) struct CompletionPoller {
    ring: IoUring,
    channels: IndexMap<RawFd, Rc<RefCell<Channel>>>,
    ops: Slab<OpRecord>,
    next_index: i32,
}

impl CompletionPoller {
    fn new() -> io::Result<CompletionPoller> {
        Ok(CompletionPoller {
            ring: IoUring::new(RING_DEPTH)?,
            channels: IndexMap::new(),
            ops: Slab::new(),
            next_index: 0,
        })
    }

    fn poll(&mut self) -> io::Result<Vec<Rc<RefCell<Channel>>>> {
        let Self {
            ring,
            channels,
            ops,
            ..
        } = self;

        // Submission pass: every channel with interest and no operation in
        // flight for that direction gets one submission. The interest bit
        // is toggled off so the next turn resubmits only after user code
        // re-enables it.
        let mut queued = 0;

        for (_, channel) in channels.iter() {
            let mut c = channel.borrow_mut();

            if c.is_reading() && !c.is_read_pending() {
                let fd = c.fd();
                let accept = c.is_accept();
                let buf = if accept {
                    Vec::new()
                } else {
                    vec![0u8; READ_BUF_SIZE]
                };

                let key = ops.insert(OpRecord {
                    fd,
                    op: Ready::readable(),
                    buf,
                });

                let entry = if accept {
                    opcode::Accept::new(types::Fd(fd), ptr::null_mut(), ptr::null_mut())
                        .build()
                        .user_data(key as u64)
                } else {
                    let record = &mut ops[key];
                    opcode::Read::new(
                        types::Fd(fd),
                        record.buf.as_mut_ptr(),
                        record.buf.len() as u32,
                    )
                    .build()
                    .user_data(key as u64)
                };

                push_entry(ring, &entry)?;
                queued += 1;

                c.disable_read();
                c.set_read_pending(true);
            }

            if c.is_writing() && !c.is_write_pending() {
                let fd = c.fd();
                let buf = c.take_staged();

                let key = ops.insert(OpRecord {
                    fd,
                    op: Ready::writable(),
                    buf,
                });

                let record = &ops[key];
                let entry = opcode::Write::new(
                    types::Fd(fd),
                    record.buf.as_ptr(),
                    record.buf.len() as u32,
                )
                .build()
                .user_data(key as u64);

                push_entry(ring, &entry)?;
                queued += 1;

                c.disable_write();
                c.set_write_pending(true);
            }

            if queued >= SUBMIT_BATCH {
                ring.submit()?;
                queued = 0;
            }
        }

        loop {
            match ring.submit_and_wait(1) {
                Ok(_) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        // Reap pass: resolve each completion onto its channel's carry
        // slots. The returned set holds each hit channel once.
        let mut active = Vec::new();

        for cqe in ring.completion() {
            let key = cqe.user_data() as usize;

            let record = match ops.try_remove(key) {
                Some(record) => record,
                None => continue,
            };

            let channel = match channels.get(&record.fd) {
                Some(channel) => channel,
                None => {
                    // The channel went away while the operation was in
                    // flight; the completion lands in the void.
                    trace!("dropping completion for removed fd {}", record.fd);
                    continue;
                }
            };

            let mut c = channel.borrow_mut();
            let was_idle = c.revents().is_empty();

            if record.op.is_readable() {
                c.set_read_pending(false);
                c.set_read_carry(record.buf, cqe.result());
                c.add_revents(Ready::readable());
            } else {
                c.set_write_pending(false);
                c.set_write_res(cqe.result());
                c.add_revents(Ready::writable());
            }

            if was_idle {
                drop(c);
                active.push(Rc::clone(channel));
            }
        }

        Ok(active)
    }

    fn update(&mut self, channel: &Rc<RefCell<Channel>>) -> io::Result<()> {
        let mut c = channel.borrow_mut();

        if c.index() < 0 {
            self.next_index += 1;
            c.set_index(self.next_index);
            self.channels.insert(c.fd(), Rc::clone(channel));
        }

        // Interest changes take effect at the next submission pass; there
        // is no kernel state to modify here.
        Ok(())
    }

    fn remove(&mut self, channel: &Rc<RefCell<Channel>>) -> io::Result<()> {
        let mut c = channel.borrow_mut();
        assert!(c.index() >= 0, "remove of an unregistered channel");

        self.channels.swap_remove(&c.fd());
        c.set_index(-1);

        Ok(())
    }
}

fn push_entry(ring: &mut IoUring, entry: &squeue::Entry) -> io::Result<()> {
    loop {
        let pushed = unsafe { ring.submission().push(entry).is_ok() };
        if pushed {
            return Ok(());
        }

        // Submission queue full: flush it and retry.
        ring.submit()?;
    }
}
