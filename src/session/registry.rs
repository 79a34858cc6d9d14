//! Session registry.
//!
//! The only state shared across sessions. DashMap gives concurrent reads;
//! admission control runs under a create lock so the configured bound is
//! exact under concurrent connects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::state::{SessionState, SessionStateMachine, StateError};
use super::types::{ActivityTracker, SessionInfo};
use crate::ssh::ShellTarget;

/// Registry failure.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session limit reached ({current}/{max})")]
    CapacityExceeded { current: usize, max: usize },

    #[error("registry is draining, not accepting sessions")]
    Draining,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    StateTransition(#[from] StateError),
}

/// One tracked session.
struct SessionEntry {
    target: String,
    state: SessionStateMachine,
    rows: u16,
    cols: u16,
    created_at: DateTime<Utc>,
    activity: Arc<ActivityTracker>,
}

/// Registry of all live sessions.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    max_sessions: usize,
    accepting: AtomicBool,
    // Serializes the admission check against insert.
    create_lock: parking_lot::Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl SessionRegistry {
    /// New registry admitting up to `max_sessions` concurrent sessions.
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            sessions: DashMap::new(),
            max_sessions,
            accepting: AtomicBool::new(true),
            create_lock: parking_lot::Mutex::new(()),
            shutdown_tx,
        }
    }

    /// Number of tracked sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether new sessions are admitted. This is the readiness signal.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Subscribe to the process-wide shutdown signal. Session tasks select
    /// on this so `force_close_all` cancels in-flight I/O, not just new
    /// admissions.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Admit and track a new session.
    ///
    /// # Errors
    /// `CapacityExceeded` at the configured bound, `Draining` once shutdown
    /// has begun.
    pub fn create(
        &self,
        target: &ShellTarget,
        rows: u16,
        cols: u16,
    ) -> Result<(String, Arc<ActivityTracker>), RegistryError> {
        if !self.is_accepting() {
            return Err(RegistryError::Draining);
        }

        let _guard = self.create_lock.lock();

        let current = self.sessions.len();
        if current >= self.max_sessions {
            return Err(RegistryError::CapacityExceeded {
                current,
                max: self.max_sessions,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let activity = Arc::new(ActivityTracker::new());
        let entry = SessionEntry {
            target: target.display(),
            state: SessionStateMachine::new(),
            rows,
            cols,
            created_at: Utc::now(),
            activity: Arc::clone(&activity),
        };

        info!("session {} created for {}", id, entry.target);
        self.sessions.insert(id.clone(), entry);
        Ok((id, activity))
    }

    /// Remove a session and release its bookkeeping. Idempotent.
    pub fn remove(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            info!("session {} removed ({} remaining)", id, self.sessions.len());
        }
    }

    /// Current state of a session.
    #[must_use]
    pub fn state(&self, id: &str) -> Option<SessionState> {
        self.sessions.get(id).map(|e| e.state.state())
    }

    /// Shell open starting.
    ///
    /// # Errors
    /// Unknown id or invalid transition.
    pub fn begin_authentication(&self, id: &str) -> Result<(), RegistryError> {
        self.with_entry(id, |e| e.state.begin_authentication().map_err(Into::into))
    }

    /// Pump starting.
    ///
    /// # Errors
    /// Unknown id or invalid transition.
    pub fn begin_streaming(&self, id: &str) -> Result<(), RegistryError> {
        self.with_entry(id, |e| {
            e.state.begin_streaming()?;
            debug!("session {} streaming", id);
            Ok(())
        })
    }

    /// Termination observed; idempotent.
    ///
    /// # Errors
    /// Unknown id.
    pub fn begin_close(&self, id: &str) -> Result<(), RegistryError> {
        self.with_entry(id, |e| {
            e.state.begin_close();
            Ok(())
        })
    }

    /// Both sides confirmed closed.
    ///
    /// # Errors
    /// Unknown id or the session was never closing.
    pub fn complete_close(&self, id: &str) -> Result<(), RegistryError> {
        self.with_entry(id, |e| e.state.complete_close().map_err(Into::into))
    }

    /// Session failed; idempotent after a close has begun.
    ///
    /// # Errors
    /// Unknown id.
    pub fn fail(&self, id: &str, reason: &str) -> Result<(), RegistryError> {
        self.with_entry(id, |e| {
            warn!("session {} failed: {}", id, reason);
            e.state.fail(reason);
            Ok(())
        })
    }

    /// Record renegotiated terminal dimensions.
    ///
    /// # Errors
    /// Unknown id.
    pub fn update_dimensions(&self, id: &str, rows: u16, cols: u16) -> Result<(), RegistryError> {
        self.with_entry(id, |e| {
            e.rows = rows;
            e.cols = cols;
            Ok(())
        })
    }

    /// Snapshot of one session.
    #[must_use]
    pub fn session_info(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.get(id).map(|e| Self::info_of(id, &e))
    }

    /// Snapshot of every tracked session. Used for limit enforcement
    /// introspection and shutdown logging only.
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|e| Self::info_of(e.key(), e.value()))
            .collect()
    }

    /// Stop accepting sessions and cancel every live one.
    ///
    /// Broadcasts shutdown, then waits up to `grace` for session tasks to
    /// deregister themselves. Sessions still present afterwards are logged
    /// and abandoned rather than blocked on.
    pub async fn force_close_all(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        let live = self.sessions.len();
        info!("force-closing all sessions ({} live)", live);
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + grace;
        while !self.sessions.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if !self.sessions.is_empty() {
            let abandoned: Vec<String> =
                self.sessions.iter().map(|e| e.key().clone()).collect();
            warn!(
                "abandoning {} session(s) after {:?} grace: {:?}",
                abandoned.len(),
                grace,
                abandoned
            );
            self.sessions.clear();
        }
        info!("registry drained");
    }

    fn info_of(id: &str, entry: &SessionEntry) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            target: entry.target.clone(),
            state: entry.state.state(),
            rows: entry.rows,
            cols: entry.cols,
            created_at: entry.created_at,
            idle_secs: entry.activity.idle_for().as_secs(),
        }
    }

    fn with_entry<F>(&self, id: &str, f: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut SessionEntry) -> Result<(), RegistryError>,
    {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;
        f(&mut entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ShellTarget {
        ShellTarget {
            host: "example.com".to_string(),
            port: 22,
            username: "deploy".to_string(),
        }
    }

    #[test]
    fn capacity_bound_is_exact() {
        let registry = SessionRegistry::new(2);
        let (a, _) = registry.create(&target(), 24, 80).unwrap();
        let (_b, _) = registry.create(&target(), 24, 80).unwrap();
        match registry.create(&target(), 24, 80) {
            Err(RegistryError::CapacityExceeded { current: 2, max: 2 }) => {}
            other => panic!("expected CapacityExceeded, got {other:?}"),
        }

        // Removing one frees a slot; the existing session is untouched.
        registry.remove(&a);
        assert!(registry.create(&target(), 24, 80).is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = SessionRegistry::new(4);
        let (id, _) = registry.create(&target(), 24, 80).unwrap();
        registry.remove(&id);
        registry.remove(&id);
        assert!(registry.is_empty());
    }

    #[test]
    fn lifecycle_transitions_through_registry() {
        let registry = SessionRegistry::new(4);
        let (id, _) = registry.create(&target(), 24, 80).unwrap();
        registry.begin_authentication(&id).unwrap();
        registry.begin_streaming(&id).unwrap();
        assert_eq!(registry.state(&id), Some(SessionState::Streaming));
        registry.begin_close(&id).unwrap();
        registry.begin_close(&id).unwrap();
        assert_eq!(registry.state(&id), Some(SessionState::Closing));
    }

    #[tokio::test]
    async fn draining_rejects_new_sessions() {
        let registry = SessionRegistry::new(4);
        registry.force_close_all(Duration::from_millis(10)).await;
        assert!(!registry.is_accepting());
        assert!(matches!(
            registry.create(&target(), 24, 80),
            Err(RegistryError::Draining)
        ));
    }

    #[tokio::test]
    async fn force_close_all_abandons_stragglers() {
        let registry = SessionRegistry::new(4);
        let (_id, _) = registry.create(&target(), 24, 80).unwrap();
        // No task will deregister this entry; the grace must expire.
        registry.force_close_all(Duration::from_millis(100)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_signal_reaches_subscribers() {
        let registry = SessionRegistry::new(4);
        let mut rx = registry.shutdown_signal();
        assert!(!*rx.borrow());
        registry.force_close_all(Duration::from_millis(10)).await;
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn list_reports_every_live_session() {
        let registry = SessionRegistry::new(4);
        let (a, _) = registry.create(&target(), 24, 80).unwrap();
        let (b, _) = registry.create(&target(), 50, 132).unwrap();
        registry.begin_authentication(&b).unwrap();

        let listed = registry.list();
        assert_eq!(listed.len(), 2);
        let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        assert!(ids.contains(&a.as_str()));
        assert!(ids.contains(&b.as_str()));
        let b_info = listed.iter().find(|s| s.id == b).unwrap();
        assert_eq!(b_info.state, SessionState::Authenticating);
        assert_eq!((b_info.rows, b_info.cols), (50, 132));
    }

    #[test]
    fn session_info_is_credential_free() {
        let registry = SessionRegistry::new(4);
        let (id, _) = registry.create(&target(), 24, 80).unwrap();
        let info = registry.session_info(&id).unwrap();
        assert_eq!(info.target, "deploy@example.com:22");
        assert_eq!(info.state, SessionState::Connecting);
    }
}
