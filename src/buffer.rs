use std::io;
use std::os::unix::io::RawFd;

const INITIAL_SIZE: usize = 1024;
const GROW_EXTRA: usize = 8 * 1024;

/// A growable byte arena with a read/write cursor pair.
///
/// The readable region is `[read_index, write_index)`; the writable tail is
/// `[write_index, capacity)`. Appending first tries the tail, then compacts
/// the readable bytes down to offset zero, and only then regrows.
///
/// # Examples
///
/// ```
/// use hive_io::Buffer;
///
/// let mut buf = Buffer::new();
/// buf.append(b"hello");
///
/// assert_eq!(buf.readable_bytes(), 5);
/// assert_eq!(buf.peek(), b"hello");
///
/// buf.retrieve(2);
/// assert_eq!(buf.peek(), b"llo");
/// ```
pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            data: vec![0; INITIAL_SIZE],
            read_index: 0,
            write_index: 0,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    /// A view of the readable region. The slice stays valid until the next
    /// mutating call.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// Consumes `n` readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        if self.readable_bytes() < n {
            panic!("retrieve too many bytes");
        }

        self.read_index += n;
        if self.read_index == self.write_index {
            self.read_index = 0;
            self.write_index = 0;
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
    }

    /// Consumes everything readable, returning it as a string. Invalid
    /// UTF-8 is replaced, so protocol code should prefer `peek`/`retrieve`.
    pub fn retrieve_as_string(&mut self) -> String {
        let s = String::from_utf8_lossy(&self.data[self.read_index..self.write_index]).into_owned();
        self.read_index = 0;
        self.write_index = 0;
        s
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let tail = self.data.len() - self.write_index;

        if tail >= bytes.len() {
            self.data[self.write_index..self.write_index + bytes.len()].copy_from_slice(bytes);
            self.write_index += bytes.len();
        } else if self.data.len() >= self.readable_bytes() + bytes.len() {
            // Compact the readable region to offset zero, then append.
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_index..self.write_index, 0);
            self.data[readable..readable + bytes.len()].copy_from_slice(bytes);
            self.read_index = 0;
            self.write_index = readable + bytes.len();
        } else {
            let readable = self.readable_bytes();
            let mut grown = vec![0; readable + bytes.len() + GROW_EXTRA];
            grown[..readable].copy_from_slice(&self.data[self.read_index..self.write_index]);
            grown[readable..readable + bytes.len()].copy_from_slice(bytes);
            self.data = grown;
            self.read_index = 0;
            self.write_index = readable + bytes.len();
        }
    }

    /// Reads from `fd` with a vectored read over the writable tail and
    /// `scratch`, so short reads avoid a second syscall while large reads do
    /// not force pre-allocation. Bytes landing in `scratch` are appended.
    ///
    /// `Ok(0)` means end of stream. `WouldBlock` surfaces unchanged; a
    /// spurious wakeup is the caller's no-op, not an error.
    pub fn read_fd(&mut self, fd: RawFd, scratch: &mut [u8]) -> io::Result<usize> {
        let tail = self.data.len() - self.write_index;

        let iovecs = [
            libc::iovec {
                iov_base: self.data[self.write_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: tail,
            },
            libc::iovec {
                iov_base: scratch.as_mut_ptr() as *mut libc::c_void,
                iov_len: scratch.len(),
            },
        ];

        let n = syscall!(readv(fd, iovecs.as_ptr(), 2))? as usize;

        if n <= tail {
            self.write_index += n;
        } else {
            self.write_index = self.data.len();
            self.append(&scratch[..n - tail]);
        }

        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod test {
    use super::Buffer;

    #[test]
    fn append_and_retrieve() {
        let mut buf = Buffer::new();

        buf.append(b"hive");
        buf.append(b"-io");

        assert_eq!(buf.readable_bytes(), 7);
        assert_eq!(buf.peek(), b"hive-io");

        buf.retrieve(5);
        assert_eq!(buf.peek(), b"io");

        assert_eq!(buf.retrieve_as_string(), "io");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    #[should_panic(expected = "retrieve too many bytes")]
    fn retrieve_past_readable() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(4);
    }

    #[test]
    fn compacts_before_growing() {
        let mut buf = Buffer::new();

        buf.append(&[b'a'; 1000]);
        buf.retrieve(900);

        // 100 readable + 600 appended fits the 1024 backing array only
        // after compaction.
        buf.append(&[b'b'; 600]);

        assert_eq!(buf.readable_bytes(), 700);
        assert_eq!(&buf.peek()[..100], &[b'a'; 100][..]);
        assert_eq!(&buf.peek()[100..], &[b'b'; 600][..]);
    }

    #[test]
    fn grows_when_compaction_is_not_enough() {
        let mut buf = Buffer::new();

        buf.append(&[b'x'; 1000]);
        buf.append(&[b'y'; 2000]);

        assert_eq!(buf.readable_bytes(), 3000);
        assert_eq!(&buf.peek()[..1000], &[b'x'; 1000][..]);
        assert_eq!(&buf.peek()[1000..], &[b'y'; 2000][..]);
    }

    #[test]
    fn append_after_retrieve_all() {
        let mut buf = Buffer::new();

        buf.append(b"first");
        buf.retrieve_all();
        buf.append(b"second");

        assert_eq!(buf.peek(), b"second");
    }

    #[test]
    fn read_fd_spills_into_scratch() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let written = unsafe {
            libc::write(wr, payload.as_ptr() as *const libc::c_void, payload.len())
        };
        assert_eq!(written, payload.len() as isize);

        let mut buf = Buffer::new();
        // Leave the tail at 24 bytes so most of the payload lands in scratch.
        buf.append(&[2u8; 1000]);

        let mut scratch = vec![0u8; 64 * 1024];
        let n = buf.read_fd(rd, &mut scratch).unwrap();

        assert_eq!(n, payload.len());
        assert_eq!(buf.readable_bytes(), 1000 + payload.len());
        assert_eq!(&buf.peek()[1000..], &payload[..]);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
