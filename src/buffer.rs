//! A growable, prependable byte buffer: the container
//! [`TcpConnection`](crate::tcp_connection::TcpConnection) reads into and
//! writes out of.

use std::io;
use std::os::unix::io::RawFd;

use bytes::{BufMut, BytesMut};

const CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;
/// Stack extra buffer used by `read_fd`'s scatter-gather read, so a single
/// syscall can absorb a read larger than the buffer's current writable tail
/// without unconditionally over-allocating the buffer up front.
const EXTRA_BUFFER_SIZE: usize = 65536;

/// Readable bytes live between `reader_index` and the end of `data`;
/// writable space is whatever's left after that. The region before
/// `reader_index` (initially [`CHEAP_PREPEND`] bytes) is free for a caller
/// to prepend a header into without a second copy.
pub struct Buffer {
    data: BytesMut,
    reader_index: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        let mut data = BytesMut::with_capacity(CHEAP_PREPEND + initial_size);
        data.put_bytes(0, CHEAP_PREPEND);
        Buffer {
            data,
            reader_index: CHEAP_PREPEND,
        }
    }

    pub fn readable(&self) -> usize {
        self.data.len() - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    pub fn peek(&self) -> &[u8] {
        &self.data[self.reader_index..]
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.make_space(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.data.reserve(len);
        } else {
            // Slide the readable region down to the cheap-prepend boundary
            // to reclaim space freed by earlier `retrieve` calls, instead of
            // growing the allocation.
            let readable = self.readable();
            let tail_start = self.reader_index;
            self.data.copy_within(tail_start.., CHEAP_PREPEND);
            self.data.truncate(CHEAP_PREPEND + readable);
            self.reader_index = CHEAP_PREPEND;
        }
    }

    /// Consumes `n` readable bytes (clamped to what's actually readable).
    pub fn retrieve(&mut self, n: usize) {
        let n = n.min(self.readable());
        if n < self.readable() {
            self.reader_index += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.data.truncate(CHEAP_PREPEND);
    }

    /// Consumes and returns all readable bytes.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let bytes = self.peek().to_vec();
        self.retrieve_all();
        bytes
    }

    /// Scatter-gather read from `fd`: one readable-tail iovec plus a 64KiB
    /// on-stack extra buffer, so a single `readv(2)` call can absorb a large
    /// message without first growing the buffer to an arbitrary size. If the
    /// kernel fills the extra buffer, its contents are appended (which grows
    /// the buffer exactly as much as was actually received).
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUFFER_SIZE];
        let writable = self.writable_bytes();
        let base_len = self.data.len();
        // Zero-extend into the writable tail so the iovec below points at
        // real, initialized, in-bounds memory rather than raw spare capacity.
        self.data.resize(base_len + writable, 0);

        let mut iov = [
            libc::iovec {
                iov_base: unsafe { self.data.as_mut_ptr().add(base_len) as *mut libc::c_void },
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra_buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra_buf.len(),
            },
        ];
        let iov_count = if writable < EXTRA_BUFFER_SIZE { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iov_count) };
        if n < 0 {
            self.data.truncate(base_len);
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;

        if n <= writable {
            self.data.truncate(base_len + n);
        } else {
            self.data.truncate(base_len + writable);
            self.append(&extra_buf[..n - writable]);
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
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn new_buffer_invariant_holds() {
        let buf = Buffer::new();
        assert_eq!(buf.readable(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(
            buf.prependable_bytes() + buf.readable() + buf.writable_bytes(),
            buf.data.capacity()
        );
    }

    #[test]
    fn append_then_retrieve_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.readable(), 11);
        assert_eq!(buf.peek(), b"hello world");
        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
        buf.retrieve(5);
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn retrieve_never_overruns_readable() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(100);
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn make_space_reuses_freed_prefix_instead_of_growing() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789abcdef");
        buf.retrieve(16);
        let cap_before = buf.data.capacity();
        buf.append(b"xyz");
        assert_eq!(buf.data.capacity(), cap_before);
        assert_eq!(buf.peek(), b"xyz");
    }

    #[test]
    fn read_fd_amortizes_large_reads_via_extra_buffer() {
        use std::io::Write;
        let (mut reader, mut writer) = {
            let mut fds = [0i32; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            unsafe {
                use std::fs::File;
                use std::os::unix::io::FromRawFd;
                (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1]))
            }
        };
        let payload = vec![7u8; 4096];
        writer.write_all(&payload).unwrap();
        drop(writer);

        let mut buf = Buffer::with_capacity(16);
        let n = buf.read_fd(reader.as_raw_fd()).expect("read_fd");
        assert_eq!(n, payload.len());
        assert_eq!(buf.readable(), payload.len());
        assert_eq!(buf.peek(), payload.as_slice());
    }
}
