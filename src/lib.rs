//! A small, high-concurrency HTTP/1.1 static-file and form server built
//! around a hand-rolled I/O reactor rather than an async runtime.
//!
//! Low-level building blocks ([`buffer`], [`timer`], [`worker_pool`]) sit
//! below the HTTP layer ([`http`]), the database layer ([`db`]), and the
//! per-connection driver ([`connection`]); [`reactor`] ties them together
//! into the server's single poll loop.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod http;
pub mod logging;
pub mod reactor;
pub mod timer;
pub mod worker_pool;

pub use error::{Result, ServerError};
