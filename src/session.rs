//! Explicit session context handed to every component at construction.
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

use crate::bus::{EventBus, SessionExpired};
use crate::error::SyncError;
use crate::model::UserId;

/// One authenticated session. A new generation is minted on every login.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub viewer_id: UserId,
    pub generation: u64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("viewer_id", &self.viewer_id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct SessionState {
    current: Option<Session>,
    generation: u64,
}

#[derive(Clone, Default)]
pub struct SessionContext {
    inner: Arc<RwLock<SessionState>>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("current", &self.current())
            .finish()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authenticate(&self, token: impl Into<String>, viewer_id: UserId) -> Session {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        state.generation += 1;
        let session = Session {
            token: token.into(),
            viewer_id,
            generation: state.generation,
        };
        state.current = Some(session.clone());
        info!(viewer_id, generation = session.generation, "session established");
        session
    }

    /// Returns true if a session was active.
    pub fn invalidate(&self) -> bool {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let had = state.current.take();
        if let Some(session) = &had {
            info!(viewer_id = session.viewer_id, generation = session.generation, "session ended");
        }
        had.is_some()
    }

    /// Drop the session after the backend refused its credential and tell
    /// subscribers. Only the first caller for a given session publishes.
    pub fn expire(&self, bus: &EventBus) -> bool {
        let viewer_id = self.viewer_id();
        if !self.invalidate() {
            return false;
        }
        bus.publish(SessionExpired { viewer_id });
        true
    }

    pub fn current(&self) -> Option<Session> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }

    pub fn require(&self) -> Result<Session, SyncError> {
        self.current().ok_or(SyncError::AuthenticationRequired)
    }

    pub fn token(&self) -> Option<String> {
        self.current().map(|s| s.token)
    }

    pub fn viewer_id(&self) -> Option<UserId> {
        self.current().map(|s| s.viewer_id)
    }

    pub fn is_authenticated(&self) -> bool {
        self.current().is_some()
    }

    /// Whether `session` is still the live one (not logged out, not replaced).
    pub fn is_current(&self, session: &Session) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .as_ref()
            .map(|s| s.generation == session.generation)
            .unwrap_or(false)
    }
}
