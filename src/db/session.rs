//! Scoped sessions and the session manager.
//!
//! A [`ScopedSession`] is one unit of work on a dedicated connection. In
//! [`ScopeMode::Transaction`] the whole scope is one transaction: the closure returning
//! `Ok` commits it and `Err` rolls it back. In [`ScopeMode::Session`] the first statement
//! starts a transaction that stays pending until [`ScopedSession::commit`] (or an inner
//! [`ScopedSession::begin`]) commits it; whatever is still pending when the scope exits
//! is rolled back. The [`SessionManager`] opens sessions around closures and binds them
//! as the ambient session for the closure's duration.
//!
//! Finalization runs on its own spawned task which the scope awaits. Dropping the
//! scope's future while it waits therefore cannot interrupt a commit or rollback halfway,
//! and the binding is always cleared once the connection has been released.

use crate::config::EngineOptions;
use crate::db::ambient::{self, AmbientSlot};
use crate::db::engine::Engine;
use crate::db::resolver::establish;
use crate::db::statement::{CompiledStatement, bind_value};
use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use sqlx::any::{AnyArguments, AnyQueryResult, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, Transaction};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::task::Id;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Callback run after a session finalized successfully.
pub type AfterCommitHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// How a scope treats transaction boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMode {
    /// One transaction spanning the whole scope.
    Transaction,
    /// Transactions start on demand and commit only when asked to.
    Session,
}

/// Lifecycle of a scoped session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Finalizing,
    Closed,
}

enum SessionConn {
    /// No transaction pending; the connection is back in the pool.
    Idle,
    Transaction(Transaction<'static, Any>),
    Released,
}

impl SessionConn {
    /// Take the pending transaction, leaving the session idle.
    fn take_transaction(&mut self) -> Option<Transaction<'static, Any>> {
        match std::mem::replace(self, SessionConn::Idle) {
            SessionConn::Transaction(tx) => Some(tx),
            other => {
                *self = other;
                None
            }
        }
    }

    /// Take the pending transaction for good.
    fn release(&mut self) -> Option<Transaction<'static, Any>> {
        match std::mem::replace(self, SessionConn::Released) {
            SessionConn::Transaction(tx) => Some(tx),
            _ => None,
        }
    }
}

/// Metadata about a session (for logging and inspection).
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Unique session identifier
    pub session_id: String,
    pub mode: ScopeMode,
    pub state: SessionState,
    /// Task that opened the session, `None` for the runtime's root future
    pub owner_task: Option<String>,
    /// When the session was opened (absolute time)
    pub opened_at: DateTime<Utc>,
    /// Seconds since the session was opened
    pub duration_secs: u64,
}

pub struct ScopedSession {
    id: String,
    owner: Option<Id>,
    mode: ScopeMode,
    engine: Engine,
    opened_at: DateTime<Utc>,
    created_at: Instant,
    state: Mutex<SessionState>,
    conn: tokio::sync::Mutex<SessionConn>,
    after_commit: Mutex<Vec<AfterCommitHook>>,
}

impl std::fmt::Debug for ScopedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedSession")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ScopedSession {
    /// Open a session. Transaction scopes start their transaction right away.
    async fn open(engine: Engine, mode: ScopeMode) -> DbResult<Self> {
        let conn = match mode {
            ScopeMode::Transaction => SessionConn::Transaction(engine.begin().await?),
            ScopeMode::Session => SessionConn::Idle,
        };

        let session = Self {
            id: generate_session_id(),
            owner: ambient::current_task(),
            mode,
            engine,
            opened_at: Utc::now(),
            created_at: Instant::now(),
            state: Mutex::new(SessionState::Created),
            conn: tokio::sync::Mutex::new(conn),
            after_commit: Mutex::new(Vec::new()),
        };

        info!(
            session_id = %session.id,
            mode = ?mode,
            dialect = %session.engine.dialect(),
            "Session opened"
        );
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> ScopeMode {
        self.mode
    }

    /// Task that opened this session.
    pub fn owner(&self) -> Option<Id> {
        self.owner
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            mode: self.mode,
            state: self.state(),
            owner_task: self.owner.map(|id| id.to_string()),
            opened_at: self.opened_at,
            duration_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// Register a callback to run once this session has committed.
    ///
    /// Hooks run in registration order after the next successful commit and are
    /// discarded when the session rolls back.
    pub fn run_after_commit<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.after_commit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(move || hook().boxed()));
    }

    fn set_state(&self, next: SessionState) -> SessionState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *state, next)
    }

    fn activate(&self) -> DbResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != SessionState::Created {
            return Err(DbError::missing_session(format!(
                "session {} cannot be entered in state {:?}",
                self.id, *state
            )));
        }
        *state = SessionState::Active;
        Ok(())
    }

    fn ensure_active(&self) -> DbResult<()> {
        match self.state() {
            SessionState::Active => Ok(()),
            state => Err(DbError::missing_session(format!(
                "session {} is not active ({:?})",
                self.id, state
            ))),
        }
    }

    fn take_hooks(&self) -> Vec<AfterCommitHook> {
        std::mem::take(
            &mut *self
                .after_commit
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// The connection of the pending transaction, starting one if the session is idle.
    async fn connection<'a>(&self, conn: &'a mut SessionConn) -> DbResult<&'a mut AnyConnection> {
        if matches!(conn, SessionConn::Idle) {
            *conn = SessionConn::Transaction(self.engine.begin().await?);
            debug!(session_id = %self.id, "Transaction started");
        }
        match conn {
            SessionConn::Transaction(tx) => Ok(&mut **tx),
            _ => Err(DbError::missing_session(format!(
                "session {} has released its connection",
                self.id
            ))),
        }
    }

    // =========================================================================
    // Explicit transaction control (session mode)
    // =========================================================================

    fn ensure_session_mode(&self, operation: &str) -> DbResult<()> {
        match self.mode {
            ScopeMode::Session => Ok(()),
            ScopeMode::Transaction => Err(DbError::validation(format!(
                "cannot {} session {} explicitly: its transaction ends with the scope",
                operation, self.id
            ))),
        }
    }

    /// Commit the pending transaction and run the after-commit hooks registered so far.
    ///
    /// The session stays open and the next statement starts a new transaction.
    pub async fn commit(&self) -> DbResult<()> {
        self.ensure_active()?;
        self.ensure_session_mode("commit")?;

        let hooks = self.take_hooks();
        let pending = self.conn.lock().await.take_transaction();
        if let Some(tx) = pending {
            tx.commit().await.map_err(DbError::from)?;
        }

        debug!(session_id = %self.id, hooks = hooks.len(), "Session committed");
        for hook in hooks {
            hook().await;
        }
        Ok(())
    }

    /// Roll back the pending transaction and discard after-commit hooks.
    pub async fn rollback(&self) -> DbResult<()> {
        self.ensure_active()?;
        self.ensure_session_mode("roll back")?;

        let discarded = self.take_hooks().len();
        let pending = self.conn.lock().await.take_transaction();
        if let Some(tx) = pending {
            tx.rollback().await.map_err(DbError::from)?;
        }
        debug!(session_id = %self.id, discarded_hooks = discarded, "Session rolled back");
        Ok(())
    }

    /// Run `f` as an explicit transaction on this session's connection.
    ///
    /// `Ok` commits and `Err` rolls back, including statements that were already
    /// pending. Inside a transaction scope `f` joins the scope's transaction instead.
    pub async fn begin<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        self.ensure_active()?;
        if self.mode == ScopeMode::Transaction {
            return f().await;
        }

        let outcome = f().await;
        let finished = match &outcome {
            Ok(_) => self.commit().await,
            Err(_) => self.rollback().await,
        };

        match (outcome, finished) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(rollback)) => {
                warn!(session_id = %self.id, error = %rollback, "Rollback failed");
                Err(e)
            }
        }
    }

    // =========================================================================
    // Statement execution
    // =========================================================================

    pub(crate) async fn fetch_all(&self, stmt: &CompiledStatement) -> DbResult<Vec<AnyRow>> {
        self.ensure_active()?;
        let mut guard = self.conn.lock().await;
        let conn = self.connection(&mut guard).await?;
        self.log_statement(stmt);
        let rows = build_query(stmt).fetch(conn).try_collect::<Vec<_>>();
        self.run_with_timeout("query execution", rows).await
    }

    pub(crate) async fn fetch_optional(
        &self,
        stmt: &CompiledStatement,
    ) -> DbResult<Option<AnyRow>> {
        self.ensure_active()?;
        let mut guard = self.conn.lock().await;
        let conn = self.connection(&mut guard).await?;
        self.log_statement(stmt);
        self.run_with_timeout("query execution", build_query(stmt).fetch_optional(conn))
            .await
    }

    pub(crate) async fn execute(&self, stmt: &CompiledStatement) -> DbResult<AnyQueryResult> {
        self.ensure_active()?;
        let mut guard = self.conn.lock().await;
        let conn = self.connection(&mut guard).await?;
        self.log_statement(stmt);
        let result = self
            .run_with_timeout("write operation", build_query(stmt).execute(conn))
            .await?;
        debug!(
            session_id = %self.id,
            rows_affected = result.rows_affected(),
            "Statement executed"
        );
        Ok(result)
    }

    fn log_statement(&self, stmt: &CompiledStatement) {
        if self.engine.hide_parameters() {
            debug!(session_id = %self.id, sql = %stmt.sql, "Executing statement");
        } else {
            debug!(
                session_id = %self.id,
                sql = %stmt.sql,
                params = ?stmt.params,
                "Executing statement"
            );
        }
    }

    async fn run_with_timeout<T, F>(&self, operation: &str, fut: F) -> DbResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match self.engine.query_timeout() {
            Some(limit) => match timeout(limit, fut).await {
                Ok(result) => result.map_err(DbError::from),
                Err(_) => Err(DbError::timeout(operation, limit.as_secs())),
            },
            None => fut.await.map_err(DbError::from),
        }
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Commit or roll back, mark closed, clear the binding, then run hooks.
    ///
    /// `succeeded` commits a transaction scope. A session scope only ever rolls back
    /// what it still has pending.
    async fn finalize(self: Arc<Self>, slot: AmbientSlot, succeeded: bool) -> DbResult<()> {
        self.set_state(SessionState::Finalizing);
        let pending = self.conn.lock().await.release();
        let commit = succeeded && self.mode == ScopeMode::Transaction;

        let result = match pending {
            Some(tx) if commit => tx.commit().await.map_err(DbError::from),
            Some(tx) => tx.rollback().await.map_err(DbError::from),
            None => Ok(()),
        };

        self.set_state(SessionState::Closed);
        slot.clear();

        let hooks = self.take_hooks();

        match &result {
            Ok(()) if commit => {
                debug!(
                    session_id = %self.id,
                    duration_ms = self.created_at.elapsed().as_millis() as u64,
                    hooks = hooks.len(),
                    "Session committed"
                );
                for hook in hooks {
                    hook().await;
                }
            }
            Ok(()) => debug!(
                session_id = %self.id,
                discarded_hooks = hooks.len(),
                "Session closed without commit"
            ),
            Err(e) => warn!(
                session_id = %self.id,
                commit = commit,
                error = %e,
                "Session finalization failed"
            ),
        }

        result
    }

    /// Close a session whose scope was dropped before it could finalize.
    fn abandon(&self) {
        self.set_state(SessionState::Closed);
        let pending = match self.conn.try_lock() {
            Ok(mut guard) => guard.release(),
            Err(_) => None,
        };
        let Some(tx) = pending else {
            return;
        };

        warn!(session_id = %self.id, "Session abandoned before finalization, rolling back");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let id = self.id.clone();
            handle.spawn(async move {
                if let Err(e) = tx.rollback().await {
                    warn!(session_id = %id, error = %e, "Rollback of abandoned session failed");
                }
            });
        }
        // Without a runtime the transaction's own drop queues the rollback.
    }
}

fn build_query(stmt: &CompiledStatement) -> Query<'_, Any, AnyArguments<'_>> {
    stmt.params.iter().fold(sqlx::query(&stmt.sql), bind_value)
}

fn generate_session_id() -> String {
    format!("ses_{}", uuid::Uuid::new_v4().simple())
}

/// Clears the binding and closes the session if the scope's future is dropped before
/// finalization was handed off.
struct ScopeGuard {
    session: Option<Arc<ScopedSession>>,
    slot: AmbientSlot,
}

impl ScopeGuard {
    fn disarm(&mut self) {
        self.session = None;
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.slot.clear();
            session.abandon();
        }
    }
}

async fn run_scope<F, Fut, T, E>(engine: Engine, mode: ScopeMode, f: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<DbError>,
{
    let session = Arc::new(ScopedSession::open(engine, mode).await?);
    session.activate()?;

    let slot = AmbientSlot::bound(session.clone());
    let mut guard = ScopeGuard {
        session: Some(session.clone()),
        slot: slot.clone(),
    };

    let outcome = ambient::scope(slot.clone(), f()).await;
    guard.disarm();

    let finalizer = tokio::spawn(session.finalize(slot, outcome.is_ok()));
    let finalized = match finalizer.await {
        Ok(result) => result,
        Err(e) => Err(DbError::internal(format!(
            "Session finalization task failed: {}",
            e
        ))),
    };

    match (outcome, finalized) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        // The body's error wins; the rollback failure was already logged.
        (Err(e), Err(_)) => Err(e),
    }
}

/// Owns the engine and opens scoped sessions on it.
pub struct SessionManager {
    options: EngineOptions,
    engine: RwLock<Option<Engine>>,
}

impl SessionManager {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            engine: RwLock::new(None),
        }
    }

    /// Create a manager and initialize it in one step.
    pub async fn connect(url: &str, options: EngineOptions) -> DbResult<Self> {
        let manager = Self::new(options);
        manager.initialize(url).await?;
        Ok(manager)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Build the engine through host failover. A previous engine is disposed.
    pub async fn initialize(&self, url: &str) -> DbResult<()> {
        let engine = establish(url, &self.options).await?;
        let previous = self.engine.write().await.replace(engine);
        if let Some(previous) = previous {
            previous.close().await;
        }
        Ok(())
    }

    /// Dispose the engine, releasing pooled connections.
    pub async fn close(&self) {
        let engine = self.engine.write().await.take();
        if let Some(engine) = engine {
            engine.close().await;
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.engine.read().await.is_some()
    }

    pub async fn engine(&self) -> DbResult<Engine> {
        self.engine.read().await.clone().ok_or(DbError::Uninitialized)
    }

    /// Run `f` in a new transaction bound as the ambient session.
    ///
    /// Under an ambient session-mode scope the transaction is opened on that session's
    /// connection instead (see [`ScopedSession::begin`]).
    pub async fn begin_scope<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        if let Some(session) = ambient::try_current_session() {
            if session.mode() == ScopeMode::Session {
                return session.begin(f).await;
            }
        }
        let engine = self.engine().await?;
        run_scope(engine, ScopeMode::Transaction, f).await
    }

    /// Run `f` in a new session-mode scope bound as the ambient session.
    pub async fn session_scope<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        let engine = self.engine().await?;
        run_scope(engine, ScopeMode::Session, f).await
    }

    /// Run `f` in the ambient session if there is one, otherwise in a new transaction.
    pub async fn transactional<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        if ambient::try_current_session().is_some() {
            return f().await;
        }
        self.begin_scope(f).await
    }

    /// Run `f` in the ambient session if there is one, otherwise in a new session.
    pub async fn with_session<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        if ambient::try_current_session().is_some() {
            return f().await;
        }
        self.session_scope(f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    async fn sqlite_manager() -> (SessionManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.db");
        let options = EngineOptions {
            pool: PoolOptions {
                max_connections: Some(4),
                ..PoolOptions::default()
            },
            ..EngineOptions::default()
        };
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let manager = SessionManager::connect(&url, options).await.unwrap();
        (manager, dir)
    }

    #[tokio::test]
    async fn test_uninitialized_manager() {
        let manager = SessionManager::new(EngineOptions::default());
        assert!(!manager.is_initialized().await);
        let err = manager
            .begin_scope(|| async { Ok::<_, DbError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Uninitialized));
    }

    #[tokio::test]
    async fn test_scope_binds_and_closes_session() {
        let (manager, _dir) = sqlite_manager().await;

        let session = manager
            .begin_scope(|| async {
                let session = ambient::current_session()?;
                assert_eq!(session.state(), SessionState::Active);
                assert_eq!(session.mode(), ScopeMode::Transaction);
                assert!(session.id().starts_with("ses_"));
                Ok::<_, DbError>(session)
            })
            .await
            .unwrap();

        assert!(session.is_closed());
        assert_eq!(session.info().state, SessionState::Closed);
        assert!(ambient::try_current_session().is_none());
        manager.close().await;
        assert!(!manager.is_initialized().await);
    }

    #[tokio::test]
    async fn test_after_commit_hooks_run_only_on_commit() {
        let (manager, _dir) = sqlite_manager().await;
        let (tx, rx) = oneshot::channel();

        manager
            .begin_scope(|| async move {
                let session = ambient::current_session()?;
                session.run_after_commit(move || async move {
                    let _ = tx.send("committed");
                });
                Ok::<_, DbError>(())
            })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), "committed");

        let (tx, rx) = oneshot::channel::<&str>();
        let result = manager
            .begin_scope(|| async move {
                let session = ambient::current_session()?;
                session.run_after_commit(move || async move {
                    let _ = tx.send("committed");
                });
                Err::<(), _>(DbError::validation("boom"))
            })
            .await;
        assert!(result.is_err());
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_during_finalization_completes_cleanup() {
        let (manager, _dir) = sqlite_manager().await;
        let manager = Arc::new(manager);
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel();
        let (bound_tx, bound_rx) = oneshot::channel();

        let task = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .begin_scope(|| async move {
                        let session = ambient::current_session()?;
                        let slot = ambient::current_slot().expect("slot is bound");
                        let _ = bound_tx.send((session.clone(), slot));
                        session.run_after_commit(move || async move {
                            let _ = entered_tx.send(());
                            let _ = release_rx.await;
                            let _ = done_tx.send(());
                        });
                        Ok::<_, DbError>(())
                    })
                    .await
            }
        });

        let (session, slot) = bound_rx.await.unwrap();
        entered_rx.await.unwrap();
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let _ = release_tx.send(());
        tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .unwrap()
            .unwrap();

        assert!(session.is_closed());
        assert!(!slot.is_bound());
    }

    #[tokio::test]
    async fn test_cancel_during_body_abandons_session() {
        let (manager, _dir) = sqlite_manager().await;
        let manager = Arc::new(manager);
        let (bound_tx, bound_rx) = oneshot::channel();

        let task = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .begin_scope(|| async move {
                        let session = ambient::current_session()?;
                        let slot = ambient::current_slot().expect("slot is bound");
                        let _ = bound_tx.send((session, slot));
                        std::future::pending::<()>().await;
                        Ok::<_, DbError>(())
                    })
                    .await
            }
        });

        let (session, slot) = bound_rx.await.unwrap();
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert!(session.is_closed());
        assert!(!slot.is_bound());
        let err = session
            .execute(&CompiledStatement {
                sql: "SELECT 1".to_string(),
                params: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(err.is_missing_session());
    }
}
