//! Command-line configuration collaborator.
//!
//! This is the only place the server reads argv. Everything else in the
//! crate takes a [`ServerConfig`] (or its fields) by value or reference.

use std::path::PathBuf;

use clap::Parser;

/// Server configuration, supplied on the command line.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ferrohttpd",
    about = "Small, high-concurrency HTTP/1.1 static file + form server"
)]
pub struct ServerConfig {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 1316)]
    pub port: u16,

    /// Number of worker threads handling parse/response/db work.
    #[arg(long, default_value_t = default_thread_count())]
    pub thread_count: usize,

    /// Idle-connection timeout, in milliseconds.
    #[arg(long, default_value_t = 60_000)]
    pub timeout_ms: u64,

    /// Root directory static files are served from.
    #[arg(long, default_value = "./resources")]
    pub src_dir: PathBuf,

    /// Minimum log level (error, warn, info, debug, trace). Overridden by
    /// `RUST_LOG` if set.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Database host.
    #[arg(long, default_value = "localhost")]
    pub db_host: String,

    /// Database port.
    #[arg(long, default_value_t = 3306)]
    pub db_port: u16,

    /// Database user.
    #[arg(long, default_value = "root")]
    pub db_user: String,

    /// Database password.
    #[arg(long, default_value = "")]
    pub db_pass: String,

    /// Database schema name.
    #[arg(long, default_value = "webserver")]
    pub db_name: String,

    /// Number of pre-opened database sessions held by the `DbPool`.
    #[arg(long, default_value_t = 8)]
    pub db_pool_size: usize,
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl ServerConfig {
    /// Builds the `mysql://` connection URL for this configuration.
    pub fn db_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.db_user, self.db_pass, self.db_host, self.db_port, self.db_name
        )
    }
}
