//! Growable byte buffer with a read cursor and a write cursor.
//!
//! Layout: `[consumed | readable | writable]`. Invariant:
//! `0 <= read_index <= write_index <= capacity`. Writes prefer compacting the
//! consumed prefix over growing; `read_from_fd` uses a scattered read with a
//! 64 KiB stack overflow segment so one syscall can drain a fast peer without
//! keeping every connection's buffer large.

use std::io;
use std::os::fd::RawFd;

const INITIAL_CAPACITY: usize = 1024;
const EXTRA_BUF_SIZE: usize = 65536;

pub struct Buffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            buf: vec![0; capacity],
            read_index: 0,
            write_index: 0,
        }
    }

    /// Bytes available to consume.
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Free space at the tail.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_index
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Read from `fd` into the buffer with `readv(2)`: the storage tail plus
    /// a 64 KiB stack segment. Overflow into the stack segment is appended
    /// afterwards, growing the storage at most once. EAGAIN is surfaced to
    /// the caller so it can retry at the next readiness.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let tail = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.write_index) } as *mut libc::c_void,
                iov_len: tail,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: EXTRA_BUF_SIZE,
            },
        ];
        let n = unsafe { libc::readv(fd, iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= tail {
            self.write_index += n;
        } else {
            self.write_index = self.buf.len();
            self.write(&extra[..n - tail]);
        }
        Ok(n)
    }

    /// Append `data`, compacting or growing as needed. Always accepts all of
    /// `data`; returns its length.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.ensure_writable(data.len());
        self.buf[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.write_index += data.len();
        data.len()
    }

    /// Copy readable bytes into `out` and consume them. Returns the number
    /// of bytes copied.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.readable_bytes());
        out[..n].copy_from_slice(&self.buf[self.read_index..self.read_index + n]);
        self.advance(n);
        n
    }

    /// Borrow the readable region without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    /// Consume `n` bytes. Consuming everything (or more) resets both cursors
    /// to the front so the whole storage becomes writable again.
    pub fn advance(&mut self, n: usize) {
        if n >= self.readable_bytes() {
            self.reset();
        } else {
            self.read_index += n;
        }
    }

    /// Borrow `n` bytes and consume them. Asking for at least the readable
    /// count returns the whole readable region and resets the cursors.
    pub fn next(&mut self, n: usize) -> &[u8] {
        if n >= self.readable_bytes() {
            return self.next_all();
        }
        let start = self.read_index;
        self.read_index += n;
        &self.buf[start..start + n]
    }

    /// Borrow all readable bytes and consume them.
    pub fn next_all(&mut self) -> &[u8] {
        let (start, end) = (self.read_index, self.write_index);
        self.reset();
        &self.buf[start..end]
    }

    /// Offset of the first occurrence of `needle` in the readable region.
    pub fn search(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || needle.len() > self.readable_bytes() {
            return None;
        }
        self.peek()
            .windows(needle.len())
            .position(|window| window == needle)
    }

    /// Reallocate storage to `readable + reserve` bytes, moving the readable
    /// region to the front.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        let mut buf = vec![0; readable + reserve];
        buf[..readable].copy_from_slice(self.peek());
        self.buf = buf;
        self.read_index = 0;
        self.write_index = readable;
    }

    /// Discard all readable bytes and rewind both cursors.
    pub fn reset(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
    }

    fn ensure_writable(&mut self, needed: usize) {
        if self.writable_bytes() >= needed {
            return;
        }
        if self.writable_bytes() + self.read_index >= needed {
            // Compaction suffices: slide the readable region to the front.
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_index..self.write_index, 0);
            self.read_index = 0;
            self.write_index = readable;
        } else {
            self.buf.resize(self.write_index + needed, 0);
        }
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn write_then_next_round_trips() {
        let mut buf = Buffer::new();
        let data = b"the quick brown fox";
        assert_eq!(buf.write(data), data.len());
        assert_eq!(buf.readable_bytes(), data.len());
        assert_eq!(buf.next(data.len()), data.as_slice());
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn writes_accumulate_and_grow() {
        let mut buf = Buffer::with_capacity(16);
        let mut total = 0;
        for i in 0..100u8 {
            total += buf.write(&[i; 37]);
        }
        assert_eq!(buf.readable_bytes(), total);
        assert!(buf.capacity() >= total);
    }

    #[test]
    fn compaction_is_preferred_over_growth() {
        let mut buf = Buffer::with_capacity(64);
        buf.write(&[1; 48]);
        buf.advance(40);
        let cap = buf.capacity();
        // 8 readable, 16 writable, 40 reclaimable: fits after compaction.
        buf.write(&[2; 40]);
        assert_eq!(buf.capacity(), cap);
        assert_eq!(buf.readable_bytes(), 48);
        let readable = buf.next_all().to_vec();
        assert_eq!(&readable[..8], &[1; 8]);
        assert_eq!(&readable[8..], &[2; 40]);
    }

    #[test]
    fn full_consume_resets_cursors() {
        let mut buf = Buffer::new();
        buf.write(b"abcdef");
        buf.advance(3);
        buf.advance(3);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), buf.capacity());
    }

    #[test]
    fn next_overshoot_returns_everything() {
        let mut buf = Buffer::new();
        buf.write(b"xyz");
        assert_eq!(buf.next(1000), b"xyz".as_slice());
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn search_finds_first_match() {
        let mut buf = Buffer::new();
        buf.write(b"GET / HTTP/1.1\r\n\r\nbody");
        assert_eq!(buf.search(b"\r\n"), Some(14));
        assert_eq!(buf.search(b"zebra"), None);
        buf.advance(16);
        assert_eq!(buf.search(b"\r\n"), Some(0));
    }

    #[test]
    fn shrink_keeps_readable() {
        let mut buf = Buffer::with_capacity(4096);
        buf.write(b"keep me");
        buf.shrink(16);
        assert_eq!(buf.capacity(), 7 + 16);
        assert_eq!(buf.peek(), b"keep me");
    }

    #[test]
    fn scattered_read_grows_at_most_once() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let payload = vec![0xabu8; 5000];
        tx.write_all(&payload).unwrap();
        tx.flush().unwrap();

        let mut buf = Buffer::new();
        assert!(buf.capacity() < payload.len());
        let n = buf.read_from_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.readable_bytes(), payload.len());
        assert_eq!(buf.peek(), payload.as_slice());
    }

    #[test]
    fn read_from_fd_surfaces_eagain() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let mut buf = Buffer::new();
        let err = buf.read_from_fd(rx.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn read_copies_out_and_consumes() {
        let mut buf = Buffer::new();
        buf.write(b"hello world");
        let mut out = [0u8; 5];
        assert_eq!(buf.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(buf.peek(), b" world");
    }
}
