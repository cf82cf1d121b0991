use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sqlconsole_db::{DEFAULT_MAX_IDLE_CONNS, PgPoolConfig, SqliteOpenMode};

const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "sqlconsole")]
#[command(about = "Ad-hoc SQL console over WebSocket")]
pub struct Args {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// HTTP/WebSocket port
    #[arg(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Postgres URL or key/value DSN, or `sqlite:<path>`.
    /// Falls back to the PG* environment variables when unset.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Open SQLite databases read-only
    #[arg(long, env = "SQLITE_READ_ONLY", default_value = "false")]
    pub sqlite_read_only: bool,

    /// Directory served on every path other than /ws
    #[arg(long, env = "STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    /// Upper bound on open store connections
    #[arg(long, env = "MAX_CONNS", default_value = "16")]
    pub max_conns: usize,

    /// Postgres connections opened at startup
    #[arg(long, env = "MIN_CONNS", default_value = "0")]
    pub min_conns: usize,

    /// Postgres connections kept parked between queries
    #[arg(long, env = "MAX_IDLE_CONNS", default_value_t = DEFAULT_MAX_IDLE_CONNS)]
    pub max_idle_conns: usize,

    /// Close Postgres connections idle for longer than this many seconds
    #[arg(long, env = "CONN_MAX_IDLE_TIME")]
    pub conn_max_idle_time: Option<u64>,

    /// Close Postgres connections older than this many seconds
    #[arg(long, env = "CONN_MAX_LIFETIME")]
    pub conn_max_lifetime: Option<u64>,

    /// Ping Postgres connections idle for longer than this many seconds before reuse
    #[arg(long, env = "HEALTH_CHECK_INTERVAL")]
    pub health_check_interval: Option<u64>,

    /// Extra PEM root certificates for Postgres TLS
    #[arg(long, env = "PGSSLROOTCERT")]
    pub ssl_root_cert: Option<PathBuf>,

    /// Largest accepted WebSocket message, in bytes
    #[arg(long, env = "MAX_MESSAGE_SIZE", default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "JSON_LOGS", default_value = "false")]
    pub json_logs: bool,
}

#[derive(Debug)]
pub enum Backend {
    Postgres(PgPoolConfig),
    Sqlite { path: PathBuf, mode: SqliteOpenMode },
}

impl Args {
    pub fn backend(&self) -> Backend {
        let url = self.database_url.as_deref().filter(|url| !url.is_empty());
        if let Some(path) = url.and_then(sqlite_path) {
            let mode = if self.sqlite_read_only {
                SqliteOpenMode::ReadOnly
            } else {
                SqliteOpenMode::ReadWrite
            };
            return Backend::Sqlite {
                path: PathBuf::from(path),
                mode,
            };
        }
        let mut config = match url {
            Some(url) => PgPoolConfig::new(url.to_string()),
            None => PgPoolConfig::from_env(),
        };
        config.max_conns = self.max_conns.max(1);
        config.min_conns = self.min_conns;
        config.max_idle_conns = Some(self.max_idle_conns);
        config.max_idle = self.conn_max_idle_time.map(Duration::from_secs);
        config.max_lifetime = self.conn_max_lifetime.map(Duration::from_secs);
        config.health_check_interval = self.health_check_interval.map(Duration::from_secs);
        config.ssl_root_cert = self.ssl_root_cert.clone();
        Backend::Postgres(config)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_message_size: self.max_message_size,
            max_frame_size: self.max_message_size,
            ..SessionConfig::default()
        }
    }
}

fn sqlite_path(url: &str) -> Option<&str> {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .filter(|path| !path.is_empty())
}

/// WebSocket upgrade parameters handed to every session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_message_size: usize,
    pub max_frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            write_buffer_size: 1024,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_frame_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}
