//! The server's single I/O-poll loop.
//!
//! `Reactor` owns the listening socket, the `mio::Poll` registry, and the
//! slab of live connections. It never parses a request or runs a database
//! query itself -- every readable/writable event is handed to the
//! [`WorkerPool`] as a boxed closure over a cloned `Arc<Mutex<Connection>>`,
//! and the worker reports back over a channel (waking the poll loop via a
//! `mio::Waker`) once it's done. This keeps a slow client or a slow query
//! from ever stalling `poll` for every other connection.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::connection::Connection;
use crate::db::DbPool;
use crate::timer::TimerHeap;
use crate::worker_pool::WorkerPool;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);
const MAX_EVENTS: usize = 1024;

/// Everything the reactor needs that isn't the listening address itself.
pub struct ReactorConfig {
    pub thread_count: usize,
    pub idle_timeout: Duration,
    pub src_dir: PathBuf,
}

/// Drives accept/read/write/timeout for every connection on this server.
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    connections: Slab<Arc<Mutex<Connection>>>,
    pool: WorkerPool,
    db: Arc<DbPool>,
    timers: TimerHeap,
    completions: (Sender<Token>, Receiver<Token>),
    waker: Arc<Waker>,
    config: ReactorConfig,
}

impl Reactor {
    /// Binds `addr`, registers it with a fresh `Poll`, and spins up the
    /// worker pool. Does not start serving -- call [`Reactor::run`] for
    /// that.
    pub fn new(addr: std::net::SocketAddr, db: DbPool, config: ReactorConfig) -> std::io::Result<Self> {
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let pool = WorkerPool::new(config.thread_count);

        Ok(Self {
            poll,
            listener,
            connections: Slab::new(),
            pool,
            db: Arc::new(db),
            timers: TimerHeap::new(),
            completions: unbounded(),
            waker,
            config,
        })
    }

    /// Runs the poll loop. Returns only on an unrecoverable `poll` error.
    /// The address the listener actually bound to, useful when `addr` was
    /// given with an ephemeral port (e.g. `:0` in tests).
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(&mut self) -> std::io::Result<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);

        loop {
            let timeout = self.timers.get_next_tick();
            self.poll.poll(&mut events, timeout)?;

            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => self.accept()?,
                    WAKE_TOKEN => self.drain_completions(),
                    token => self.dispatch(token, event.is_readable(), event.is_writable()),
                }
            }
        }
    }

    fn accept(&mut self) -> std::io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let entry = self.connections.vacant_entry();
                    let token = Token(entry.key());
                    let mut connection = Connection::new(token, stream, self.config.src_dir.clone());

                    if connection.register(self.poll.registry()).is_ok() {
                        let conn = Arc::new(Mutex::new(connection));
                        entry.insert(conn.clone());
                        self.schedule_timeout(token, conn);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(conn) = self.connections.get(token.0) else { return };
        let conn = conn.clone();
        let db = self.db.clone();
        let sender = self.completions.0.clone();
        let waker = self.waker.clone();

        self.pool.submit(Box::new(move || {
            if let Ok(mut c) = conn.lock() {
                let result = (|| {
                    if readable {
                        c.on_readable(&db)?;
                    }
                    if writable && !c.is_closed() {
                        c.on_writable()?;
                    }
                    Ok::<(), std::io::Error>(())
                })();

                if result.is_err() {
                    c.force_close();
                }
            }

            let _ = sender.send(token);
            let _ = waker.wake();
        }));
    }

    fn drain_completions(&mut self) {
        loop {
            match self.completions.1.try_recv() {
                Ok(token) => self.finish(token),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn finish(&mut self, token: Token) {
        let Some(conn) = self.connections.get(token.0) else { return };
        let conn = conn.clone();
        let closed = {
            let mut c = conn.lock().unwrap();
            if c.is_closed() {
                let _ = c.deregister(self.poll.registry());
                true
            } else {
                let _ = c.reregister(self.poll.registry());
                false
            }
        };

        if closed {
            self.timers.remove(token.0);
            self.connections.try_remove(token.0);
        } else {
            self.schedule_timeout(token, conn);
        }
    }

    /// (Re)schedules the idle-close timer for `token`, capturing its current
    /// generation so a stale firing (activity already happened, but this
    /// connection hasn't been rescheduled yet) is a no-op.
    fn schedule_timeout(&mut self, token: Token, conn: Arc<Mutex<Connection>>) {
        let generation = conn.lock().unwrap().generation();
        let sender = self.completions.0.clone();
        let waker = self.waker.clone();
        let timeout_conn = conn.clone();

        self.timers.add(
            token.0,
            self.config.idle_timeout,
            Box::new(move || {
                let fired = {
                    let mut c = timeout_conn.lock().unwrap();
                    if c.generation() == generation && !c.is_closed() {
                        c.force_close();
                        true
                    } else {
                        false
                    }
                };
                if fired {
                    let _ = sender.send(token);
                    let _ = waker.wake();
                }
            }),
        );
    }
}
