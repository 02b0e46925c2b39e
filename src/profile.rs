//! Cached user profiles.
//!
//! Counters may be adjusted locally after follow actions; a [`ProfileStore::load`]
//! always replaces the cached copy with the server's.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, instrument, warn};

use crate::api::FeedApi;
use crate::bus::EventBus;
use crate::error::{Result, SyncError};
use crate::model::{UserId, UserSummary};
use crate::session::SessionContext;

pub struct ProfileStore {
    api: Arc<dyn FeedApi>,
    session: SessionContext,
    bus: Arc<EventBus>,
    profiles: Mutex<HashMap<UserId, UserSummary>>,
}

impl std::fmt::Debug for ProfileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileStore").finish_non_exhaustive()
    }
}

impl ProfileStore {
    pub fn new(api: Arc<dyn FeedApi>, session: SessionContext, bus: Arc<EventBus>) -> Self {
        Self {
            api,
            session,
            bus,
            profiles: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, UserSummary>> {
        self.profiles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[instrument(skip(self))]
    pub async fn load(&self, user_id: UserId) -> Result<UserSummary> {
        let session = self.session.require()?;
        let result = self.api.user_profile(user_id).await;
        if !self.session.is_current(&session) {
            debug!("session ended during profile fetch; dropping it");
            return Err(SyncError::AuthenticationRequired);
        }
        match result {
            Ok(profile) => {
                self.lock().insert(user_id, profile.clone());
                Ok(profile)
            }
            Err(err) => {
                warn!(%err, "profile fetch failed");
                if err.is_unauthorized() {
                    self.session.expire(&self.bus);
                }
                Err(SyncError::Api(err))
            }
        }
    }

    pub fn get(&self, user_id: UserId) -> Option<UserSummary> {
        self.lock().get(&user_id).cloned()
    }

    /// Apply `f` to the cached profile, if any.
    pub fn update<F>(&self, user_id: UserId, f: F) -> bool
    where
        F: FnOnce(&mut UserSummary),
    {
        match self.lock().get_mut(&user_id) {
            Some(profile) => {
                f(profile);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
