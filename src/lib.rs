//! Ambient DB Library
//!
//! Task-scoped database sessions on top of sqlx: a session manager that binds one
//! session to the running task, a fluent DAO that executes against that ambient
//! session, and multi-host failover when establishing the engine.

pub mod config;
pub mod db;
pub mod error;

pub use config::{Config, EngineOptions, PoolOptions};
pub use db::{Dao, SessionManager};
pub use error::{DbError, DbResult};
