//! A bounded pool of MySQL sessions and the login/register verification it
//! backs.
//!
//! The pool itself is a `crossbeam-channel` bounded channel used as a
//! semaphore: acquiring a session is a blocking receive (up to a timeout),
//! releasing one is a send performed automatically when a [`DbSession`]
//! drops. This plays the same role the C source's `SqlConnPool` /
//! `SqlConnRAII` pair did, minus the manual mutex and condition variable.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use mysql::prelude::Queryable;
use mysql::{Conn, Opts};

use crate::error::Result;

/// How long `acquire` waits for a free session before giving up. A
/// production deployment would size the pool so this is rarely hit; when it
/// is, the caller treats it the same as any other database unavailability.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded pool of live `mysql::Conn` sessions.
pub struct DbPool {
    sender: Sender<Conn>,
    receiver: Receiver<Conn>,
    acquire_timeout: Duration,
}

impl DbPool {
    /// Opens `size` connections to `url` up front and holds them in the
    /// pool, mirroring the original pool's eager-connect behavior.
    pub fn new(url: &str, size: usize) -> Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = bounded(size);
        let opts = Opts::from_url(url).map_err(mysql::Error::from)?;
        for _ in 0..size {
            sender
                .send(Conn::new(opts.clone())?)
                .expect("channel was just created with capacity for `size` sessions");
        }
        Ok(Self { sender, receiver, acquire_timeout: ACQUIRE_TIMEOUT })
    }

    /// A pool backed by no real connections. `acquire` fails immediately
    /// rather than blocking, which is what a disabled or unreachable
    /// database should look like to callers.
    pub fn empty() -> Self {
        let (sender, receiver) = bounded(1);
        Self { sender, receiver, acquire_timeout: Duration::ZERO }
    }

    /// Waits up to the pool's acquire timeout for a session to free up.
    /// Returns `None` on timeout, which callers treat as a verification
    /// failure rather than an error -- a database hiccup shouldn't turn
    /// into a 500 for every connected client.
    pub fn acquire(&self) -> Option<DbSession<'_>> {
        self.receiver
            .recv_timeout(self.acquire_timeout)
            .ok()
            .map(|conn| DbSession { conn: Some(conn), pool: self })
    }
}

/// An RAII handle on a single pooled connection. Dropping it returns the
/// connection to the pool; it is never closed while the pool is alive.
pub struct DbSession<'a> {
    conn: Option<Conn>,
    pool: &'a DbPool,
}

impl DbSession<'_> {
    fn conn(&mut self) -> &mut Conn {
        self.conn.as_mut().expect("conn is only taken in Drop")
    }
}

impl Drop for DbSession<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = self.pool.sender.send(conn);
        }
    }
}

/// Verifies a login, or registers a new user, against the `user` table.
///
/// `is_login == true`: succeeds iff `name` exists and `pwd` matches.
/// `is_login == false`: succeeds iff `name` is not already taken, inserting
/// the new row as a side effect of success.
///
/// Empty credentials, pool exhaustion, and query failures all resolve to
/// `false` -- none of them panic or propagate, matching the requirement
/// that a single misbehaving login attempt can't take down a connection.
pub fn verify_user(pool: &DbPool, name: &str, pwd: &str, is_login: bool) -> bool {
    if name.is_empty() || pwd.is_empty() {
        return false;
    }

    let Some(mut session) = pool.acquire() else {
        tracing::warn!("database pool exhausted, treating login/register as failed");
        return false;
    };

    match run_verify(session.conn(), name, pwd, is_login) {
        Ok(flag) => flag,
        Err(err) => {
            tracing::warn!(error = %err, "user verification query failed");
            false
        }
    }
}

fn run_verify(conn: &mut Conn, name: &str, pwd: &str, is_login: bool) -> mysql::Result<bool> {
    let existing: Option<(String, String)> = conn.exec_first(
        "SELECT username, password FROM user WHERE username = ? LIMIT 1",
        (name,),
    )?;

    let flag = match existing {
        Some((_, password)) => is_login && pwd == password,
        None => !is_login,
    };

    if !is_login && flag {
        conn.exec_drop(
            "INSERT INTO user(username, password) VALUES (?, ?)",
            (name, pwd),
        )?;
    }

    Ok(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_fails_verification_without_blocking() {
        let pool = DbPool::empty();
        assert!(!verify_user(&pool, "alice", "hunter2", true));
    }

    #[test]
    fn blank_credentials_never_reach_the_pool() {
        let pool = DbPool::empty();
        assert!(!verify_user(&pool, "", "hunter2", true));
        assert!(!verify_user(&pool, "alice", "", false));
    }
}
