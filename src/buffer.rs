// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A growable byte buffer with separate read/write cursors and scatter I/O.
//!
//! Mirrors the read/write-cursor discipline of a classic ring buffer: the
//! readable region is `[read, write)`, the writable region is `[write,
//! capacity)`, and bytes already consumed but still allocated, `[0, read)`,
//! are reclaimed by compaction rather than a fresh allocation whenever
//! possible.

use std::io;
use std::os::fd::RawFd;

/// Extra bytes read in a single [`ByteBuffer::read_fd`] call beyond whatever
/// room currently exists in the writable region, so that one syscall makes
/// forward progress even on a burst larger than the buffer.
const READ_EXTENSION: usize = 65536;

/// A contiguous growable byte buffer with read/write cursors.
///
/// Invariant: `0 <= read <= write <= buf.len()`.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    buf: Vec<u8>,
    read: usize,
    write: usize,
}

impl ByteBuffer {
    /// Creates a buffer with at least `capacity` bytes preallocated.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            read: 0,
            write: 0,
        }
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn readable(&self) -> usize {
        self.write - self.read
    }

    /// Number of bytes that can be written without growing the buffer.
    #[inline]
    pub fn writable(&self) -> usize {
        self.buf.len() - self.write
    }

    /// Number of already-consumed bytes available for reclaiming via compaction.
    #[inline]
    pub fn prependable(&self) -> usize {
        self.read
    }

    /// Borrows the readable region `[read, write)`. Stable until the next
    /// mutating call.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read..self.write]
    }

    /// Advances the read cursor by `n` bytes.
    ///
    /// # Panics
    /// Panics if `n > self.readable()`.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable(), "retrieve past write cursor");
        self.read += n;
        if self.read == self.write {
            // buffer fully drained: reset cursors so future writes don't grow needlessly
            self.read = 0;
            self.write = 0;
        }
    }

    /// Advances the read cursor so that `peek()` would start at `offset`
    /// bytes into the previous readable region.
    pub fn retrieve_until(&mut self, offset: usize) {
        self.retrieve(offset);
    }

    /// Resets both cursors, discarding all buffered data.
    pub fn retrieve_all(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// Drains and returns all readable bytes as an owned buffer.
    pub fn retrieve_all_to_vec(&mut self) -> Vec<u8> {
        let out = self.peek().to_vec();
        self.retrieve_all();
        out
    }

    /// Appends `bytes` to the writable region, growing the buffer if needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        let start = self.write;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        self.write += bytes.len();
    }

    /// Ensures at least `len` writable bytes are available, compacting or
    /// growing as needed.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable() >= len);
    }

    /// Compacts-or-grows so that `len` additional bytes can be written.
    fn make_space(&mut self, len: usize) {
        if self.writable() + self.prependable() < len {
            self.buf.resize(self.write + len + 1, 0);
        } else {
            let readable = self.readable();
            self.buf.copy_within(self.read..self.write, 0);
            self.read = 0;
            self.write = readable;
        }
    }

    /// Scatter-reads from `fd` into the writable region, extended by a 64 KiB
    /// stack buffer so a single syscall makes forward progress even on a
    /// burst larger than the current writable region.
    ///
    /// Never loops: at most one `readv(2)` call. Returns `0` on EOF.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let writable = self.writable();
        let mut extension = [0u8; READ_EXTENSION];

        let n = {
            let mut iov = [
                libc::iovec {
                    iov_base: self.buf[self.write..].as_mut_ptr() as *mut libc::c_void,
                    iov_len: writable,
                },
                libc::iovec {
                    iov_base: extension.as_mut_ptr() as *mut libc::c_void,
                    iov_len: extension.len(),
                },
            ];

            // Safety: both iovec entries point at buffers that are valid and
            // exclusively borrowed for the duration of this syscall.
            let rc = unsafe { libc::readv(fd, iov.as_mut_ptr(), iov.len() as i32) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            rc as usize
        };

        if n <= writable {
            self.write += n;
        } else {
            self.write = self.buf.len();
            self.append(&extension[..n - writable]);
        }

        Ok(n)
    }

    /// Writes the readable region to `fd` in a single `write(2)` call,
    /// advancing the read cursor by however much was written.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.peek();
        if readable.is_empty() {
            return Ok(0);
        }

        // Safety: `readable` points at `self.buf[self.read..self.write]`, a
        // valid, initialized slice for its reported length.
        let rc = unsafe {
            libc::write(
                fd,
                readable.as_ptr() as *const libc::c_void,
                readable.len(),
            )
        };

        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        self.retrieve(rc as usize);
        Ok(rc as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    #[test]
    fn cursors_stay_ordered() {
        let mut buf = ByteBuffer::with_capacity(4);
        assert_eq!(buf.readable(), 0);
        buf.append(b"hello");
        assert_eq!(buf.readable(), 5);
        assert!(buf.writable() <= buf.buf.len());
        buf.retrieve(5);
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn append_then_retrieve_all_round_trips() {
        let mut buf = ByteBuffer::with_capacity(8);
        buf.append(b"abcdef");
        assert_eq!(buf.retrieve_all_to_vec(), b"abcdef");
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn round_trip_arbitrary_chunking() {
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let mut buf = ByteBuffer::with_capacity(16);
        let mut out = Vec::new();

        for chunk in data.chunks(37) {
            buf.append(chunk);
            if buf.readable() > 50 {
                let take = buf.readable() / 2;
                out.extend_from_slice(&buf.peek()[..take]);
                buf.retrieve(take);
            }
        }
        out.extend_from_slice(buf.peek());
        buf.retrieve(buf.readable());

        assert_eq!(out, data);
    }

    #[test]
    fn make_space_compacts_before_growing() {
        let mut buf = ByteBuffer::with_capacity(8);
        buf.append(b"1234");
        buf.retrieve(4);
        // fully drained resets cursors; refill to exercise prependable path
        buf.append(b"abcd");
        buf.retrieve(2);
        buf.append(b"efgh");
        assert_eq!(buf.peek(), b"cdefgh");
    }

    #[test]
    fn read_fd_single_syscall_pulls_full_pipe() {
        let (mut r, mut w) = pipe();
        let payload = vec![7u8; 200_000];
        w.write_all(&payload).unwrap();
        drop(w);

        let mut buf = ByteBuffer::with_capacity(1024);
        let mut total = 0;
        loop {
            let n = buf.read_fd(r.as_raw_fd()).unwrap();
            if n == 0 {
                break;
            }
            total += n;
            buf.retrieve(buf.readable());
        }
        assert_eq!(total, payload.len());
    }

    fn pipe() -> (std::fs::File, std::fs::File) {
        use std::os::fd::FromRawFd;
        let mut fds = [0i32; 2];
        // Safety: `fds` is a valid 2-element array for `pipe(2)` to fill in.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        // Safety: both fds were just returned by a successful `pipe(2)` call
        // and are owned exclusively by this function.
        unsafe {
            (
                std::fs::File::from_raw_fd(fds[0]),
                std::fs::File::from_raw_fd(fds[1]),
            )
        }
    }
}
