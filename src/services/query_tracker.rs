// Query Tracker
//
// Registry of in-flight queries keyed by query id. Entries exist only while a
// query is running; the registration guard removes them on every exit path.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{DatabaseType, QueryStatus};

/// One in-flight query.
///
/// The handle never owns the connection running the query. It only keeps the
/// server session id, which is enough to ask the backend to cancel from a
/// different connection.
#[derive(Debug)]
pub struct QueryHandle {
    pub query_id: Uuid,
    pub profile_id: String,
    pub database_type: DatabaseType,
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    started: Instant,
    cancel_token: CancellationToken,
    claimed: AtomicBool,
    status: Mutex<QueryStatus>,
}

impl QueryHandle {
    fn new(profile_id: &str, database_type: DatabaseType, session_id: Option<String>) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            profile_id: profile_id.to_string(),
            database_type,
            session_id,
            started_at: Utc::now(),
            started: Instant::now(),
            cancel_token: CancellationToken::new(),
            claimed: AtomicBool::new(false),
            status: Mutex::new(QueryStatus::Registered),
        }
    }

    /// Take ownership of the query's outcome. Exactly one caller ever gets `true`.
    pub fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    /// Resolves once cancellation has been requested.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn status(&self) -> QueryStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn transition(&self, next: QueryStatus) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status.can_transition_to(next) {
            *status = next;
            true
        } else {
            false
        }
    }
}

/// Dropping the registration removes the query from the tracker.
pub struct QueryRegistration {
    handle: Arc<QueryHandle>,
    queries: Arc<Mutex<HashMap<Uuid, Arc<QueryHandle>>>>,
}

impl QueryRegistration {
    pub fn handle(&self) -> &Arc<QueryHandle> {
        &self.handle
    }

    pub fn query_id(&self) -> Uuid {
        self.handle.query_id
    }
}

impl Drop for QueryRegistration {
    fn drop(&mut self) {
        let mut queries = self.queries.lock().unwrap_or_else(PoisonError::into_inner);
        queries.remove(&self.handle.query_id);
        tracing::debug!(
            "Deregistered query {} ({:?}, {} ms)",
            self.handle.query_id,
            self.handle.status(),
            self.handle.elapsed().as_millis()
        );
    }
}

/// Snapshot of a running query for status listings.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveQuery {
    pub query_id: Uuid,
    pub profile_id: String,
    pub database_type: DatabaseType,
    pub status: QueryStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct QueryTracker {
    queries: Arc<Mutex<HashMap<Uuid, Arc<QueryHandle>>>>,
}

impl QueryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        profile_id: &str,
        database_type: DatabaseType,
        session_id: Option<String>,
    ) -> QueryRegistration {
        let handle = Arc::new(QueryHandle::new(profile_id, database_type, session_id));
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.query_id, handle.clone());
        tracing::debug!("Registered query {} on '{}'", handle.query_id, profile_id);
        QueryRegistration {
            handle,
            queries: self.queries.clone(),
        }
    }

    pub fn get(&self, query_id: &Uuid) -> Option<Arc<QueryHandle>> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(query_id)
            .cloned()
    }

    /// Claim a running query for cancellation and signal its executor.
    ///
    /// Returns the handle when this call won the claim; `None` when the query
    /// is unknown or has already finished.
    pub fn request_cancel(&self, query_id: &Uuid) -> Option<Arc<QueryHandle>> {
        let handle = self.get(query_id)?;
        if !handle.claim() {
            return None;
        }
        handle.cancel_token.cancel();
        Some(handle)
    }

    pub fn active(&self) -> Vec<ActiveQuery> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|h| ActiveQuery {
                query_id: h.query_id,
                profile_id: h.profile_id.clone(),
                database_type: h.database_type,
                status: h.status(),
                started_at: h.started_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_guard_deregisters() {
        let tracker = QueryTracker::new();
        let registration = tracker.register("sales", DatabaseType::Mssql, Some("55".to_string()));
        let id = registration.query_id();
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get(&id).is_some());

        drop(registration);
        assert!(tracker.is_empty());
        assert!(tracker.get(&id).is_none());
    }

    #[test]
    fn test_cancel_unknown_query() {
        let tracker = QueryTracker::new();
        assert!(tracker.request_cancel(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_only_first_claimant_wins() {
        let tracker = QueryTracker::new();
        let registration = tracker.register("erp", DatabaseType::Hana, None);
        let id = registration.query_id();

        let cancelled = tracker.request_cancel(&id).expect("first cancel wins");
        assert!(cancelled.is_cancelled());
        // the executor and a second cancel both lose
        assert!(!registration.handle().claim());
        assert!(tracker.request_cancel(&id).is_none());
    }

    #[test]
    fn test_completion_blocks_cancel() {
        let tracker = QueryTracker::new();
        let registration = tracker.register("erp", DatabaseType::Hana, None);
        assert!(registration.handle().claim());
        assert!(tracker.request_cancel(&registration.query_id()).is_none());
        assert!(!registration.handle().is_cancelled());
    }

    #[test]
    fn test_status_lifecycle() {
        let tracker = QueryTracker::new();
        let registration = tracker.register("sales", DatabaseType::Mssql, None);
        let handle = registration.handle();
        assert_eq!(handle.status(), QueryStatus::Registered);
        assert!(handle.transition(QueryStatus::Executing));
        assert!(handle.transition(QueryStatus::Completed));
        assert!(!handle.transition(QueryStatus::Cancelled));
        assert_eq!(tracker.active()[0].status, QueryStatus::Completed);
    }
}
