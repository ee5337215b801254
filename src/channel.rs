use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::event_loop::EventLoop;
use crate::ready::Ready;

pub(crate) type EventCallback = Rc<dyn Fn(&EventLoop)>;

/// Binds one file descriptor to an interest set and up to four callbacks.
///
/// A channel is mutated only by its owning loop. The poller index is `-1`
/// until the channel is registered; the completion poller additionally
/// tracks in-flight operations through the pending flags and parks each
/// completed result in the carry slots until the callback consumes it.
pub struct Channel {
    fd: RawFd,

    interest: Ready,
    revents: Ready,

    // -1 while the poller does not track this channel.
    index: i32,

    // Read submissions become accept submissions for a listening socket.
    accept: bool,

    read_pending: bool,
    write_pending: bool,

    // Bytes handed to the completion poller for the next write submission.
    staged: Vec<u8>,

    // Carry slots filled by the completion poller: the buffer and result of
    // the last read (for accept, the result is the accepted descriptor),
    // and the result of the last write.
    read_carry: Vec<u8>,
    read_res: i32,
    write_res: i32,

    read_callback: Option<EventCallback>,
    write_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
}

impl Channel {
    pub(crate) fn new(fd: RawFd) -> Channel {
        Channel {
            fd,
            interest: Ready::empty(),
            revents: Ready::empty(),
            index: -1,
            accept: false,
            read_pending: false,
            write_pending: false,
            staged: Vec::new(),
            read_carry: Vec::new(),
            read_res: 0,
            write_res: 0,
            read_callback: None,
            write_callback: None,
            error_callback: None,
            close_callback: None,
        }
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub(crate) fn interest(&self) -> Ready {
        self.interest
    }

    #[inline]
    pub(crate) fn index(&self) -> i32 {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: i32) {
        self.index = index;
    }

    #[inline]
    pub(crate) fn is_reading(&self) -> bool {
        self.interest.is_readable()
    }

    #[inline]
    pub(crate) fn is_writing(&self) -> bool {
        self.interest.is_writable()
    }

    #[inline]
    pub(crate) fn is_accept(&self) -> bool {
        self.accept
    }

    #[inline]
    pub(crate) fn is_read_pending(&self) -> bool {
        self.read_pending
    }

    #[inline]
    pub(crate) fn is_write_pending(&self) -> bool {
        self.write_pending
    }

    pub(crate) fn set_read_pending(&mut self, pending: bool) {
        self.read_pending = pending;
    }

    pub(crate) fn set_write_pending(&mut self, pending: bool) {
        self.write_pending = pending;
    }

    /// Adds read interest. Returns whether the bit changed; a `false`
    /// return lets the caller skip a no-op poller update.
    pub(crate) fn enable_read(&mut self, accept: bool) -> bool {
        assert!(!self.read_pending, "enable read with a read in flight");

        if self.interest.is_readable() {
            return false;
        }

        self.interest.insert(Ready::readable());
        self.accept = accept;
        true
    }

    pub(crate) fn disable_read(&mut self) -> bool {
        if !self.interest.is_readable() {
            return false;
        }

        self.interest.remove(Ready::readable());
        true
    }

    /// Adds write interest, staging `bytes` for the completion poller's
    /// next submission. Returns whether the bit changed.
    pub(crate) fn enable_write(&mut self, bytes: Vec<u8>) -> bool {
        assert!(!self.write_pending, "enable write with a write in flight");

        if self.interest.is_writable() {
            return false;
        }

        self.interest.insert(Ready::writable());
        self.staged = bytes;
        true
    }

    pub(crate) fn disable_write(&mut self) -> bool {
        if !self.interest.is_writable() {
            return false;
        }

        self.interest.remove(Ready::writable());
        true
    }

    pub(crate) fn take_staged(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.staged)
    }

    #[inline]
    pub(crate) fn revents(&self) -> Ready {
        self.revents
    }

    pub(crate) fn add_revents(&mut self, ready: Ready) {
        self.revents.insert(ready);
    }

    pub(crate) fn set_read_carry(&mut self, buf: Vec<u8>, res: i32) {
        self.read_carry = buf;
        self.read_res = res;
    }

    pub(crate) fn take_read_carry(&mut self) -> (Vec<u8>, i32) {
        let res = self.read_res;
        self.read_res = 0;
        (std::mem::take(&mut self.read_carry), res)
    }

    pub(crate) fn set_write_res(&mut self, res: i32) {
        self.write_res = res;
    }

    pub(crate) fn take_write_res(&mut self) -> i32 {
        let res = self.write_res;
        self.write_res = 0;
        res
    }

    pub(crate) fn set_read_callback(&mut self, cb: EventCallback) {
        self.read_callback = Some(cb);
    }

    pub(crate) fn set_write_callback(&mut self, cb: EventCallback) {
        self.write_callback = Some(cb);
    }

    pub(crate) fn set_error_callback(&mut self, cb: EventCallback) {
        self.error_callback = Some(cb);
    }

    pub(crate) fn set_close_callback(&mut self, cb: EventCallback) {
        self.close_callback = Some(cb);
    }

    /// Dispatches the active events in fixed order: close-only, error,
    /// readable, writable.
    ///
    /// The close callback fires only when the hang-up bit is set without
    /// the readable bit, so a close never races bytes still queued in the
    /// kernel. The revents and callback set are snapshotted before any
    /// callback runs; a callback tearing the channel down mid-dispatch
    /// cannot invalidate the iteration.
    pub(crate) fn handle_event(ch: &Rc<RefCell<Channel>>, event_loop: &EventLoop) {
        let (revents, close_cb, error_cb, read_cb, write_cb) = {
            let mut c = ch.borrow_mut();
            let revents = c.revents;
            c.revents = Ready::empty();
            (
                revents,
                c.close_callback.clone(),
                c.error_callback.clone(),
                c.read_callback.clone(),
                c.write_callback.clone(),
            )
        };

        if revents.is_hup() && !revents.is_readable() {
            if let Some(cb) = close_cb {
                cb(event_loop);
            }
        }

        if revents.is_error() {
            if let Some(cb) = error_cb {
                cb(event_loop);
            }
        }

        if revents.is_readable() {
            if let Some(cb) = read_cb {
                cb(event_loop);
            }
        }

        if revents.is_writable() {
            if let Some(cb) = write_cb {
                cb(event_loop);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::Channel;

    #[test]
    fn enable_reports_transitions() {
        let mut ch = Channel::new(0);

        assert!(ch.enable_read(false));
        assert!(!ch.enable_read(false));
        assert!(ch.is_reading());

        assert!(ch.enable_write(b"abc".to_vec()));
        assert!(!ch.enable_write(Vec::new()));
        assert!(ch.is_writing());
        assert_eq!(ch.take_staged(), b"abc".to_vec());

        assert!(ch.disable_write());
        assert!(!ch.disable_write());
        assert!(!ch.is_writing());

        assert!(ch.disable_read());
        assert!(!ch.disable_read());
    }

    #[test]
    fn starts_unregistered() {
        let ch = Channel::new(3);

        assert_eq!(ch.index(), -1);
        assert_eq!(ch.fd(), 3);
        assert!(ch.revents().is_empty());
    }
}
