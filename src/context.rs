//! Wiring of one client: session, bus, stores, coordinator, aggregator and
//! the push task.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::{ApiClient, FeedApi};
use crate::bus::EventBus;
use crate::comments::CommentStore;
use crate::config::{Config, ConfigError};
use crate::cursor::{CursorProtocol, FeedKind};
use crate::error::Result;
use crate::model::{FeedEntry, NotificationCategory, NotificationItem, UserId, UserSummary};
use crate::mutation::MutationCoordinator;
use crate::notification::NotificationAggregator;
use crate::profile::ProfileStore;
use crate::push::{run_push_loop, Backoff, PushChannel};
use crate::session::{Session, SessionContext};
use crate::store::FeedStore;

pub struct SyncContext {
    pub session: SessionContext,
    pub bus: Arc<EventBus>,
    pub posts: Arc<FeedStore<FeedEntry>>,
    pub users: Arc<FeedStore<UserSummary>>,
    pub notifications: Arc<FeedStore<NotificationItem>>,
    pub comments: Arc<CommentStore>,
    pub profiles: Arc<ProfileStore>,
    pub mutations: Arc<MutationCoordinator>,
    pub aggregator: Arc<NotificationAggregator>,
    push: Arc<dyn PushChannel>,
    backoff: Backoff,
    push_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("session", &self.session)
            .field("push_running", &self.is_push_running())
            .finish_non_exhaustive()
    }
}

impl SyncContext {
    pub fn new(
        cfg: &Config,
        session: SessionContext,
        api: Arc<dyn FeedApi>,
        push: Arc<dyn PushChannel>,
    ) -> Self {
        let bus = Arc::new(EventBus::new(cfg.feed.event_capacity));
        let protocol = CursorProtocol::new(cfg.feed.page_size, cfg.server_offset());
        let posts = Arc::new(FeedStore::new(
            api.clone(),
            protocol,
            session.clone(),
            bus.clone(),
        ));
        let users = Arc::new(FeedStore::new(
            api.clone(),
            protocol,
            session.clone(),
            bus.clone(),
        ));
        let notifications = Arc::new(FeedStore::new(
            api.clone(),
            protocol,
            session.clone(),
            bus.clone(),
        ));
        let comments = Arc::new(CommentStore::new(api.clone(), session.clone(), bus.clone()));
        let profiles = Arc::new(ProfileStore::new(api.clone(), session.clone(), bus.clone()));
        let mutations = Arc::new(MutationCoordinator::new(
            api.clone(),
            session.clone(),
            bus.clone(),
            posts.clone(),
            users.clone(),
            comments.clone(),
            profiles.clone(),
        ));
        let aggregator = Arc::new(NotificationAggregator::new(api, session.clone(), bus.clone()));
        Self {
            session,
            bus,
            posts,
            users,
            notifications,
            comments,
            profiles,
            mutations,
            aggregator,
            push,
            backoff: Backoff::from_config(&cfg.push),
            push_task: Mutex::new(None),
        }
    }

    /// Build a context talking to the configured HTTP backend.
    pub fn from_config(
        cfg: &Config,
        push: Arc<dyn PushChannel>,
    ) -> std::result::Result<Self, ConfigError> {
        let session = SessionContext::new();
        let api = ApiClient::from_config(cfg, session.clone())?;
        Ok(Self::new(cfg, session, Arc::new(api), push))
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.push_task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear_stores(&self) {
        self.posts.clear();
        self.users.clear();
        self.notifications.clear();
        self.comments.clear();
        self.profiles.clear();
        self.aggregator.reset();
    }

    /// Start a session: state from any previous session is dropped and a
    /// push task is spawned for the new one. Must run inside a tokio runtime.
    pub fn login(&self, token: impl Into<String>, viewer_id: UserId) -> Session {
        if let Some(previous) = self.task().take() {
            previous.abort();
        }
        self.clear_stores();
        let session = self.session.authenticate(token, viewer_id);
        let handle = tokio::spawn(run_push_loop(
            self.push.clone(),
            self.aggregator.clone(),
            self.session.clone(),
            self.bus.clone(),
            session.clone(),
            self.backoff,
        ));
        *self.task() = Some(handle);
        info!(viewer_id, "logged in");
        session
    }

    pub fn logout(&self) {
        if let Some(handle) = self.task().take() {
            handle.abort();
        }
        self.session.invalidate();
        self.clear_stores();
        info!("logged out");
    }

    pub fn is_push_running(&self) -> bool {
        self.task()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Clear a category's unread counter and flag its loaded list items read.
    pub async fn mark_read(&self, category: NotificationCategory) -> Result<()> {
        self.session.require()?;
        let ids: Vec<i64> = self
            .notifications
            .snapshot(FeedKind::Notifications(category))
            .entries
            .iter()
            .filter(|n| !n.read)
            .map(|n| n.id)
            .collect();
        for id in ids {
            self.notifications
                .update(FeedKind::Notifications(category), id, |n| n.read = true);
        }
        self.aggregator.mark_read(category).await
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        if let Some(handle) = self.task().take() {
            handle.abort();
        }
    }
}
