//! Per-socket driver: owns the buffers, the in-flight request/response, and
//! the bookkeeping the reactor needs to register/reregister/deregister it
//! with `mio` and to detect an idle peer.

use std::io::{self, ErrorKind};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::Instant;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::buffer::ByteBuffer;
use crate::db::DbPool;
use crate::http::{Request, Response};

const INITIAL_BUFFER_CAPACITY: usize = 4096;

/// A single accepted connection and everything needed to drive it through
/// zero or more keep-alive request/response cycles.
pub struct Connection {
    stream: TcpStream,
    token: Token,
    inbound: ByteBuffer,
    outbound: ByteBuffer,
    request: Request,
    response: Response,
    src_dir: PathBuf,
    closed: bool,
    keep_alive: bool,
    awaiting_response: bool,
    body_offset: usize,
    last_active: Instant,
    /// Bumped every time the connection completes a request/response cycle
    /// or is freshly accepted. A timer scheduled for this connection carries
    /// the generation it was scheduled at; if the generations no longer
    /// match when the timer fires, the connection has made progress since
    /// and the timer is stale and ignored.
    generation: u64,
}

impl Connection {
    /// Wraps a freshly accepted socket. Does not register it with a
    /// `Registry` -- callers do that once, right after construction.
    pub fn new(token: Token, stream: TcpStream, src_dir: PathBuf) -> Self {
        Self {
            stream,
            token,
            inbound: ByteBuffer::with_capacity(INITIAL_BUFFER_CAPACITY),
            outbound: ByteBuffer::with_capacity(INITIAL_BUFFER_CAPACITY),
            request: Request::new(),
            response: Response::new(),
            src_dir,
            closed: false,
            keep_alive: false,
            awaiting_response: false,
            body_offset: 0,
            last_active: Instant::now(),
            generation: 0,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Marks the connection closed without touching the socket. Used by the
    /// reactor when a worker hits an unrecoverable I/O error, or when the
    /// idle timer fires.
    pub fn force_close(&mut self) {
        self.closed = true;
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
        self.generation += 1;
    }

    /// Drains the socket into the inbound buffer, then feeds whatever
    /// arrived to the request parser. A fully parsed request immediately
    /// gets a response assembled into the outbound buffer; a malformed
    /// request line gets a canned 400 and the connection is marked to
    /// close once that response is flushed.
    pub fn on_readable(&mut self, db: &DbPool) -> io::Result<()> {
        loop {
            match self.inbound.read_fd(self.stream.as_raw_fd()) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if self.inbound.readable() == 0 {
            return Ok(());
        }
        self.touch();

        match self.request.parse(&mut self.inbound, db) {
            Ok(true) => {
                self.keep_alive = self.request.is_keep_alive();
                self.build_response(self.request.path().to_string(), -1);
            }
            Ok(false) => {}
            Err(_) => {
                self.keep_alive = false;
                self.build_response(String::new(), 400);
            }
        }

        Ok(())
    }

    fn build_response(&mut self, path: String, code: i32) {
        self.response.reset(self.src_dir.clone(), path, self.keep_alive, code);
        self.response.make_response(&mut self.outbound);
        self.awaiting_response = true;
        self.body_offset = 0;
    }

    /// True while a response is queued (header buffer or body bytes still
    /// need to be flushed). Drives whether `reregister` asks for
    /// `WRITABLE`.
    pub fn wants_write(&self) -> bool {
        self.awaiting_response
    }

    /// Flushes the outbound header buffer and the response body in a single
    /// `writev(2)` call per iteration, per §4.7 -- the header bytes and the
    /// (possibly memory-mapped) body are never copied into one contiguous
    /// buffer just to hand them to `write`. Leaves partial progress in place
    /// across `WouldBlock` so the next writable event picks up where this
    /// one left off.
    pub fn on_writable(&mut self) -> io::Result<()> {
        let fd = self.stream.as_raw_fd();

        loop {
            let header_len = self.outbound.readable();
            let body = self.response.body().as_bytes();
            let body_tail = &body[self.body_offset.min(body.len())..];
            let body_len = body_tail.len();

            if header_len == 0 && body_len == 0 {
                break;
            }

            let iov = [
                libc::iovec {
                    iov_base: self.outbound.peek().as_ptr() as *mut libc::c_void,
                    iov_len: header_len,
                },
                libc::iovec {
                    iov_base: body_tail.as_ptr() as *mut libc::c_void,
                    iov_len: body_len,
                },
            ];

            // Safety: both iovec entries point at slices (`outbound`'s
            // readable region and the response body) that stay valid and
            // unmodified for the duration of this syscall.
            let rc = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as i32) };

            if rc < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    ErrorKind::WouldBlock => return Ok(()),
                    ErrorKind::Interrupted => continue,
                    _ => return Err(err),
                }
            }

            let mut written = rc as usize;
            if written == 0 {
                break;
            }

            let from_header = written.min(header_len);
            self.outbound.retrieve(from_header);
            written -= from_header;
            self.body_offset += written;
        }

        self.awaiting_response = false;
        self.touch();
        if self.keep_alive {
            self.request.reset();
        } else {
            self.closed = true;
        }
        Ok(())
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE)
    }

    pub fn reregister(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = if self.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        registry.reregister(&mut self.stream, self.token, interest)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }
}
