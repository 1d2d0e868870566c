//! Database access layer.
//!
//! This module provides:
//! - Multi-host connection failover
//! - The process-wide engine handle
//! - Task-scoped ambient sessions and the session manager
//! - Statement building over a static schema mapping
//! - The fluent DAO

pub mod ambient;
pub mod dao;
pub mod engine;
pub mod resolver;
pub mod session;
pub mod statement;

pub use ambient::{current_session, lookup, propagate, try_current_session};
pub use dao::Dao;
pub use engine::{Dialect, Engine};
pub use resolver::{engine_urls, establish, mask_password};
pub use session::{ScopeMode, ScopedSession, SessionInfo, SessionManager, SessionState};
pub use statement::{
    Column, ColumnValue, CompiledStatement, Delete, Entity, Executable, Join, OrderBy,
    Predicate, Projection, QualifiedColumn, QueryOption, RawSql, Select, Selectable, Table,
    Update, Value,
};
