//! Ambient DB - command line entry point.
//!
//! `resolve` prints the candidate hosts a database URL expands to; `check` connects
//! through failover and runs `SELECT 1` inside a transaction.

use ambient_db::config::{Command, Config};
use ambient_db::db::{Dao, RawSql, SessionManager, engine_urls, mask_password};
use ambient_db::error::DbError;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn check(config: &Config) -> Result<(), DbError> {
    let (url, options) = config.engine_options().map_err(DbError::configuration)?;
    let manager = SessionManager::connect(&url, options).await?;

    let checked = manager
        .transactional(|| async {
            Dao::new()
                .get_rows_count(&RawSql::new("SELECT 1"))
                .await
        })
        .await;
    manager.close().await;

    checked?;
    info!("Database check passed");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    info!(
        command = ?config.command,
        "Starting ambient-db v{}",
        env!("CARGO_PKG_VERSION")
    );

    let result = match config.command {
        Command::Resolve => {
            let (url, _) = config.engine_options().map_err(DbError::configuration)?;
            for candidate in engine_urls(&url)? {
                println!("{}", mask_password(&candidate));
            }
            Ok(())
        }
        Command::Check => {
            tokio::select! {
                result = check(&config) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    Ok(())
                }
            }
        }
    };

    if let Err(e) = result {
        error!(error = %e, suggestion = ?e.suggestion(), "Command failed");
        return Err(e.into());
    }

    Ok(())
}
