use std::convert::TryInto;
use std::io::{self, Read};
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use super::fd::FileDesc;

pub const TFD_CLOEXEC: i32 = libc::TFD_CLOEXEC;
pub const TFD_NONBLOCK: i32 = libc::TFD_NONBLOCK;

/// A timer delivered through a file descriptor, on CLOCK_MONOTONIC.
/// view: <http://man7.org/linux/man-pages/man2/timerfd_create.2.html>
#[derive(Debug)]
pub struct TimerFd {
    inner: FileDesc,
}

impl TimerFd {
    /// Create a monotonic timerfd with flags: TFD_CLOEXEC, plus
    /// TFD_NONBLOCK when `nonblocking` is set.
    pub fn new(nonblocking: bool) -> io::Result<TimerFd> {
        let mut flags = TFD_CLOEXEC;
        if nonblocking {
            flags |= TFD_NONBLOCK;
        }

        let timerfd = syscall!(timerfd_create(libc::CLOCK_MONOTONIC, flags))?;
        Ok(TimerFd {
            inner: unsafe { FileDesc::new(timerfd) },
        })
    }

    /// Arms the timer to expire `value` from now, then every `interval`
    /// after that. A zero `value` disarms the timer, per timerfd_settime(2).
    pub fn settime(&self, value: Duration, interval: Duration) -> io::Result<()> {
        let new_value = libc::itimerspec {
            it_interval: duration_to_timespec(interval),
            it_value: duration_to_timespec(value),
        };

        let mut old_value: libc::itimerspec = unsafe { mem::zeroed() };

        syscall!(timerfd_settime(
            self.inner.as_raw_fd(),
            0,
            &new_value,
            &mut old_value
        ))?;

        Ok(())
    }

    /// read(2) If the timer has already expired one or more times since
    /// its settings were last modified using timerfd_settime(), or since
    /// the last successful read(2), then the buffer given to read(2) returns
    /// an unsigned 8-byte integer (uint64_t) containing the number of
    /// expirations that have occurred.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        let temp: u64 = u64::from_ne_bytes(buf);
        Ok(temp)
    }
}

fn duration_to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs().try_into().unwrap(),
        tv_nsec: duration.subsec_nanos().try_into().unwrap(),
    }
}

impl FromRawFd for TimerFd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        TimerFd {
            inner: FileDesc::new(fd),
        }
    }
}

impl IntoRawFd for TimerFd {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
