//! Ambient session registry.
//!
//! Each scope binds its session into a task-local slot for the duration of the scope's
//! body, so code running under the scope finds the session without it being passed
//! around. Nested scopes shadow outer ones and restore them on exit because task-local
//! values are scoped to the future they wrap.
//!
//! A binding remembers which task opened the session. Looking it up from any other task
//! (for instance a child task that received a copy of the binding through
//! [`propagate`]) is rejected: a session's connection is never shared between
//! concurrently running tasks.

use crate::db::session::ScopedSession;
use crate::error::{DbError, DbResult};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::Id;

tokio::task_local! {
    static AMBIENT: AmbientSlot;
}

/// The slot a scope binds its session into.
///
/// Cloning shares the slot, which lets finalization clear the binding from outside the
/// task-local scope.
#[derive(Clone, Default)]
pub(crate) struct AmbientSlot(Arc<Mutex<Option<Arc<ScopedSession>>>>);

impl AmbientSlot {
    pub(crate) fn bound(session: Arc<ScopedSession>) -> Self {
        Self(Arc::new(Mutex::new(Some(session))))
    }

    fn get(&self) -> Option<Arc<ScopedSession>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the binding. Later lookups through this slot see no session.
    pub(crate) fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    #[cfg(test)]
    pub(crate) fn is_bound(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

/// Run `fut` with `slot` as the ambient binding.
pub(crate) async fn scope<F: Future>(slot: AmbientSlot, fut: F) -> F::Output {
    AMBIENT.scope(slot, fut).await
}

/// The slot bound around the caller, if any.
#[cfg(test)]
pub(crate) fn current_slot() -> Option<AmbientSlot> {
    AMBIENT.try_with(AmbientSlot::clone).ok()
}

/// Id of the task polling the caller, `None` outside a spawned task.
pub(crate) fn current_task() -> Option<Id> {
    tokio::task::try_id()
}

fn describe(task: Option<Id>) -> String {
    task.map_or_else(|| "<runtime root>".to_string(), |id| id.to_string())
}

/// Find the session bound to the calling task.
///
/// Returns `Ok(None)` when nothing usable is bound and `allow_missing` is set; otherwise
/// an absent, closed or foreign binding is a `MissingSession` error.
pub fn lookup(allow_missing: bool) -> DbResult<Option<Arc<ScopedSession>>> {
    let missing = |reason: String| {
        if allow_missing {
            Ok(None)
        } else {
            Err(DbError::missing_session(reason))
        }
    };

    let Some(session) = AMBIENT.try_with(AmbientSlot::get).ok().flatten() else {
        return missing("no session is bound to the current task".to_string());
    };

    if session.is_closed() {
        return missing(format!("session {} is already closed", session.id()));
    }

    let current = current_task();
    if session.owner() != current {
        return missing(format!(
            "session {} belongs to task {} but was used from task {}",
            session.id(),
            describe(session.owner()),
            describe(current)
        ));
    }

    Ok(Some(session))
}

/// The session bound to the calling task, or a `MissingSession` error.
pub fn current_session() -> DbResult<Arc<ScopedSession>> {
    lookup(false)?.ok_or_else(|| DbError::missing_session("no session is bound to the current task"))
}

/// The session bound to the calling task, if any.
pub fn try_current_session() -> Option<Arc<ScopedSession>> {
    lookup(true).ok().flatten()
}

/// Carry the caller's binding into `fut`, typically before handing it to
/// `tokio::spawn`.
///
/// The binding is copied, not shared: the child sees the parent's session but lookups
/// from the child's task fail the ownership check, and the parent's scope exit does not
/// depend on the child.
pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    let slot = match AMBIENT.try_with(AmbientSlot::get).ok().flatten() {
        Some(session) => AmbientSlot::bound(session),
        None => AmbientSlot::default(),
    };
    AMBIENT.scope(slot, fut)
}
