//! Configuration handling.
//!
//! Engine and pool options can come from code, from recognized query parameters of the
//! database URL, or from CLI arguments and environment variables (binary only).

use crate::db::resolver::{UrlParts, query_key};
use clap::{Parser, Subcommand};
use std::time::Duration;

pub const DEFAULT_LOG_LEVEL: &str = "info";

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Connection pool configuration, forwarded to the execution engine.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10, or 1 for SQLite)
    pub max_connections: Option<u32>,
    /// Minimum connections in pool (default: 1)
    pub min_connections: Option<u32>,
    /// Idle timeout in seconds (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
    /// Whether to test connections before use (default: true)
    pub test_before_acquire: Option<bool>,
}

impl PoolOptions {
    /// Pool option keys recognized in URL query parameters.
    pub const URL_KEYS: &'static [&'static str] = &[
        "max_connections",
        "min_connections",
        "idle_timeout",
        "acquire_timeout",
        "test_before_acquire",
    ];

    /// Get max_connections with default value based on database type.
    pub fn max_connections_or_default(&self, is_sqlite: bool) -> u32 {
        self.max_connections.unwrap_or(if is_sqlite {
            DEFAULT_MAX_CONNECTIONS_SQLITE
        } else {
            DEFAULT_MAX_CONNECTIONS
        })
    }

    /// Get min_connections with default value, never above the pool maximum.
    pub fn min_connections_or_default(&self, is_sqlite: bool) -> u32 {
        self.min_connections
            .unwrap_or(DEFAULT_MIN_CONNECTIONS)
            .min(self.max_connections_or_default(is_sqlite))
    }

    /// Get idle_timeout with default value.
    pub fn idle_timeout_or_default(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS))
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.acquire_timeout_secs
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        )
    }

    /// Get test_before_acquire with default value.
    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(min) = self.min_connections {
            if min == 0 {
                return Err("min_connections must be greater than 0".to_string());
            }
            if let Some(max) = self.max_connections {
                if min > max {
                    return Err(format!(
                        "min_connections ({}) cannot exceed max_connections ({})",
                        min, max
                    ));
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "max_connections" => self.max_connections = value.parse().ok(),
            "min_connections" => self.min_connections = value.parse().ok(),
            "idle_timeout" => self.idle_timeout_secs = value.parse().ok(),
            "acquire_timeout" => self.acquire_timeout_secs = value.parse().ok(),
            "test_before_acquire" => {
                self.test_before_acquire = if value.eq_ignore_ascii_case("true") {
                    Some(true)
                } else if value.eq_ignore_ascii_case("false") {
                    Some(false)
                } else {
                    None // Invalid value ignored
                }
            }
            _ => {}
        }
    }
}

/// Options applied when the session manager builds its engine.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EngineOptions {
    /// Suppress bound parameter values in statement logs.
    pub hide_parameters: bool,
    /// Transport-level overrides, appended to every candidate URL as query parameters.
    pub connect_args: Vec<(String, String)>,
    /// Pool settings forwarded to the engine.
    pub pool: PoolOptions,
    /// Upper bound for a single statement execution.
    pub query_timeout: Option<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            hide_parameters: true,
            connect_args: Vec::new(),
            pool: PoolOptions::default(),
            query_timeout: None,
        }
    }
}

impl EngineOptions {
    /// Add a transport-level override.
    pub fn connect_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connect_args.push((key.into(), value.into()));
        self
    }

    /// Split recognized pool keys out of `raw_url`.
    ///
    /// Returns the URL with those keys removed (every other parameter is kept verbatim,
    /// in order) and the pool options they described.
    pub fn extract_pool_options(raw_url: &str) -> Result<(String, PoolOptions), String> {
        let mut parts = UrlParts::parse(raw_url);
        let mut pool = PoolOptions::default();

        parts.query.retain(|pair| {
            let key = query_key(pair).to_ascii_lowercase();
            if PoolOptions::URL_KEYS.contains(&key.as_str()) {
                let value = pair.split_once('=').map(|(_, v)| v).unwrap_or("");
                pool.apply(&key, value);
                false
            } else {
                true
            }
        });
        pool.validate()?;

        Ok((parts.render(), pool))
    }
}

/// CLI subcommands.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Print the candidate connection URLs derived from the database URL
    Resolve,
    /// Connect through failover and run `SELECT 1` in a transaction
    Check,
}

/// Configuration for the `ambient-db` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ambient-db",
    about = "Inspect and check task-scoped database connections",
    version,
    author
)]
pub struct Config {
    /// Database URL. Repeated `host=host:port` query parameters enable failover.
    #[arg(short = 'd', long = "database-url", value_name = "URL", env = "AMBIENT_DB_URL")]
    pub database_url: String,

    /// Log bound statement parameters (hidden by default)
    #[arg(long, env = "AMBIENT_DB_SHOW_PARAMETERS")]
    pub show_parameters: bool,

    /// Statement timeout in seconds
    #[arg(long, env = "AMBIENT_DB_QUERY_TIMEOUT")]
    pub query_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = DEFAULT_LOG_LEVEL, env = "AMBIENT_DB_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "AMBIENT_DB_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Build engine options from the CLI flags and the pool keys embedded in the URL.
    pub fn engine_options(&self) -> Result<(String, EngineOptions), String> {
        let (url, pool) = EngineOptions::extract_pool_options(&self.database_url)?;
        let options = EngineOptions {
            hide_parameters: !self.show_parameters,
            pool,
            query_timeout: self.query_timeout.map(Duration::from_secs),
            ..EngineOptions::default()
        };
        Ok((url, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_options_defaults() {
        let opts = EngineOptions::default();
        assert!(opts.hide_parameters);
        assert!(opts.connect_args.is_empty());
        assert!(opts.query_timeout.is_none());

        let opts = opts.connect_arg("application_name", "ambient");
        assert_eq!(
            opts.connect_args,
            vec![("application_name".to_string(), "ambient".to_string())]
        );
    }

    #[test]
    fn test_pool_options_defaults() {
        let opts = PoolOptions::default();
        assert_eq!(opts.max_connections_or_default(false), 10);
        assert_eq!(opts.max_connections_or_default(true), 1);
        assert_eq!(opts.min_connections_or_default(false), 1);
        assert_eq!(opts.idle_timeout_or_default(), Duration::from_secs(600));
        assert_eq!(opts.acquire_timeout_or_default(), Duration::from_secs(30));
        assert!(opts.test_before_acquire_or_default());
    }

    #[test]
    fn test_min_connections_capped_by_max() {
        let opts = PoolOptions {
            min_connections: Some(5),
            ..PoolOptions::default()
        };
        assert_eq!(opts.min_connections_or_default(true), 1);
        assert_eq!(opts.min_connections_or_default(false), 5);
    }

    #[test]
    fn test_extract_pool_options_from_url() {
        let (url, pool) = EngineOptions::extract_pool_options(
            "postgres://u:p@db:5432/app?max_connections=20&sslmode=require&idle_timeout=300",
        )
        .unwrap();
        assert_eq!(url, "postgres://u:p@db:5432/app?sslmode=require");
        assert_eq!(pool.max_connections, Some(20));
        assert_eq!(pool.idle_timeout_secs, Some(300));
        assert!(pool.acquire_timeout_secs.is_none());
    }

    #[test]
    fn test_extract_pool_options_keeps_failover_hosts() {
        let (url, pool) = EngineOptions::extract_pool_options(
            "postgres://u:p@?host=a:1&max_connections=3&host=b:2",
        )
        .unwrap();
        assert_eq!(url, "postgres://u:p@?host=a:1&host=b:2");
        assert_eq!(pool.max_connections, Some(3));
    }

    #[test]
    fn test_extract_pool_options_strips_query_entirely() {
        let (url, _) =
            EngineOptions::extract_pool_options("sqlite:data.db?test_before_acquire=false")
                .unwrap();
        assert_eq!(url, "sqlite:data.db");
    }

    #[test]
    fn test_pool_options_invalid_value_ignored() {
        let (_, pool) =
            EngineOptions::extract_pool_options("mysql://host/db?max_connections=invalid")
                .unwrap();
        assert!(pool.max_connections.is_none());

        let (_, pool) =
            EngineOptions::extract_pool_options("mysql://host/db?test_before_acquire=yes")
                .unwrap();
        assert!(pool.test_before_acquire.is_none());
    }

    #[test]
    fn test_pool_options_validation() {
        let err = EngineOptions::extract_pool_options("mysql://host/db?max_connections=0")
            .unwrap_err();
        assert!(err.contains("max_connections"));

        let err = EngineOptions::extract_pool_options(
            "mysql://host/db?min_connections=10&max_connections=5",
        )
        .unwrap_err();
        assert!(err.contains("cannot exceed"));
    }

    #[test]
    fn test_config_engine_options() {
        let config = Config::parse_from([
            "ambient-db",
            "--database-url",
            "postgres://u@db/app?max_connections=2",
            "--show-parameters",
            "--query-timeout",
            "15",
            "check",
        ]);
        let (url, options) = config.engine_options().unwrap();
        assert_eq!(url, "postgres://u@db/app");
        assert!(!options.hide_parameters);
        assert_eq!(options.pool.max_connections, Some(2));
        assert_eq!(options.query_timeout, Some(Duration::from_secs(15)));
        assert!(matches!(config.command, Command::Check));
    }
}
