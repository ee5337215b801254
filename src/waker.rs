use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::sys::eventfd::EventFd;

/// The cross-thread wakeup for one loop: an eventfd registered readable on
/// that loop, written by any thread that queues work for it.
#[derive(Debug)]
pub(crate) struct Waker {
    inner: EventFd,
}

impl Waker {
    pub fn new(nonblocking: bool) -> io::Result<Waker> {
        let eventfd = EventFd::new(nonblocking)?;

        Ok(Waker { inner: eventfd })
    }

    /// Adds one to the counter. A saturated counter returns `EAGAIN`, which
    /// is swallowed: the loop is already pending wake.
    pub fn wakeup(&self) -> io::Result<()> {
        match self.inner.write(1) {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Drains the 8-byte counter. `EAGAIN` means another drain already won.
    pub fn finish(&self) -> io::Result<()> {
        match self.inner.read() {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::Waker;

    #[test]
    fn saturated_wakeup_is_ok() {
        let waker = Waker::new(true).unwrap();

        waker.inner.write(0xfffffffffffffffe).unwrap();

        // The counter is saturated; another wakeup must still succeed.
        assert!(waker.wakeup().is_ok());
        assert!(waker.finish().is_ok());
        assert!(waker.finish().is_ok());
    }
}
