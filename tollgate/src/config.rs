use std::time::Duration;

use clap::Parser;

use tollgate_core::connection::ConnectionOptions;
use tollgate_core::pool::PoolOptions;

/// MySQL reverse proxy: terminates authentication, balances queries
/// over a set of backends, and reuses idle server connections.
#[derive(Parser, Debug, Clone)]
#[command(name = "tollgate", version)]
pub struct Config {
    /// Address the proxy listens on (host:port, [v6]:port, or /path)
    #[arg(long = "proxy-address", default_value = ":4040")]
    pub proxy_address: String,

    /// Comma-separated addresses of the read-write backends
    #[arg(
        long = "proxy-backend-addresses",
        default_value = "127.0.0.1:3306",
        value_delimiter = ','
    )]
    pub backend_addresses: Vec<String>,

    /// Comma-separated addresses of the read-only backends
    #[arg(long = "proxy-read-only-backend-addresses", value_delimiter = ',')]
    pub read_only_backend_addresses: Vec<String>,

    /// Serve new clients off pooled server connections when possible
    #[arg(long = "proxy-pool-connections")]
    pub pool_connections: bool,

    /// Re-authenticate a pooled connection with COM_CHANGE_USER instead
    /// of requiring an exact identity match
    #[arg(long = "proxy-pool-no-change-user", action = clap::ArgAction::SetFalse)]
    pub pool_change_user: bool,

    /// Work around the double-ERR answer of mysqld 5.1.14-5.1.17
    /// (bug #25371) instead of refusing those servers
    #[arg(long = "proxy-fix-bug-25371")]
    pub fix_bug_25371: bool,

    /// Idle connections per user below which no other user may borrow
    #[arg(long = "min-idle-connections", default_value_t = 0)]
    pub min_idle_connections: usize,

    /// Idle connections kept per user before returning ones are closed
    #[arg(long = "max-idle-connections", default_value_t = 8)]
    pub max_idle_connections: usize,

    /// Seconds to wait for a backend to accept a connection (0 = wait
    /// forever)
    #[arg(long = "connect-timeout", default_value_t = 10)]
    pub connect_timeout: u64,

    /// Seconds to wait for a peer to produce data (0 = wait forever)
    #[arg(long = "read-timeout", default_value_t = 0)]
    pub read_timeout: u64,

    /// Seconds to wait for a peer to accept data (0 = wait forever)
    #[arg(long = "write-timeout", default_value_t = 0)]
    pub write_timeout: u64,
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

impl Config {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: seconds(self.connect_timeout),
            read_timeout: seconds(self.read_timeout),
            write_timeout: seconds(self.write_timeout),
            pool_reuse: self.pool_connections,
            pool_change_user: self.pool_change_user,
            fix_bug_25371: self.fix_bug_25371,
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            min_idle_connections: self.min_idle_connections,
            max_idle_connections: self.max_idle_connections,
        }
    }
}
