use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use ferrohttpd::config::ServerConfig;
use ferrohttpd::db::DbPool;
use ferrohttpd::reactor::{Reactor, ReactorConfig};

fn main() -> std::io::Result<()> {
    let config = ServerConfig::parse();
    ferrohttpd::logging::init(&config.log_level);

    let db = match DbPool::new(&config.db_url(), config.db_pool_size) {
        Ok(pool) => pool,
        Err(err) => {
            tracing::warn!(error = %err, "could not reach database, login/register will fail");
            DbPool::empty()
        }
    };

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
    let mut reactor = Reactor::new(
        addr,
        db,
        ReactorConfig {
            thread_count: config.thread_count,
            idle_timeout: Duration::from_millis(config.timeout_ms),
            src_dir: config.src_dir.clone(),
        },
    )?;

    tracing::info!(port = config.port, src_dir = %config.src_dir.display(), "listening");
    reactor.run()
}
