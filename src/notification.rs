//! Unread counters: a server snapshot plus live push increments.
use chrono::NaiveDateTime;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

use crate::api::FeedApi;
use crate::bus::{EventBus, UnreadChanged};
use crate::error::{Result, SyncError};
use crate::model::{NotificationCategory, NotificationEvent, UnreadCounts};
use crate::session::SessionContext;

#[derive(Debug, Default)]
struct Counters {
    counts: UnreadCounts,
    /// Session generation the current counts were seeded for.
    seeded_for: Option<u64>,
    /// Generation of the snapshot fetch in flight.
    fetching: Option<u64>,
    /// Push events received while a snapshot fetch is in flight.
    buffered: Vec<NotificationEvent>,
    /// Categories marked read while a snapshot fetch is in flight.
    cleared: HashSet<NotificationCategory>,
}

impl Counters {
    fn bump(&mut self, category: NotificationCategory) {
        let slot = self.counts.slot_mut(category);
        *slot = slot.saturating_add(1);
    }
}

/// Whether an event that raced a snapshot taken at `snapshot_at` is not
/// already included in it.
fn after_snapshot(event: &NotificationEvent, snapshot_at: Option<NaiveDateTime>) -> bool {
    match (event.created_at, snapshot_at) {
        (Some(created), Some(at)) => created > at,
        _ => true,
    }
}

pub struct NotificationAggregator {
    api: Arc<dyn FeedApi>,
    session: SessionContext,
    bus: Arc<EventBus>,
    state: Mutex<Counters>,
}

impl std::fmt::Debug for NotificationAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationAggregator")
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}

impl NotificationAggregator {
    pub fn new(api: Arc<dyn FeedApi>, session: SessionContext, bus: Arc<EventBus>) -> Self {
        Self {
            api,
            session,
            bus,
            state: Mutex::new(Counters::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, counts: UnreadCounts) {
        self.bus.publish(UnreadChanged { counts });
    }

    /// Seed the counters from the server, once per session.
    pub async fn initialize(&self) -> Result<UnreadCounts> {
        self.fetch_snapshot(false).await
    }

    /// Re-seed the counters; used after the push channel reconnects.
    pub async fn resync(&self) -> Result<UnreadCounts> {
        self.fetch_snapshot(true).await
    }

    #[instrument(skip(self))]
    async fn fetch_snapshot(&self, force: bool) -> Result<UnreadCounts> {
        let session = self.session.require()?;
        {
            let mut state = self.lock();
            if !force && state.seeded_for == Some(session.generation) {
                return Ok(state.counts);
            }
            if state.fetching == Some(session.generation) {
                debug!("snapshot fetch already in flight");
                return Ok(state.counts);
            }
            state.fetching = Some(session.generation);
            state.buffered.clear();
            state.cleared.clear();
        }

        let result = self.api.unread_counts().await;

        let counts = {
            let mut state = self.lock();
            if state.fetching != Some(session.generation) {
                debug!("superseded snapshot fetch; dropping it");
                return Ok(state.counts);
            }
            state.fetching = None;
            let buffered = std::mem::take(&mut state.buffered);
            let cleared = std::mem::take(&mut state.cleared);
            if !self.session.is_current(&session) {
                debug!("session ended during snapshot fetch; dropping it");
                return Ok(state.counts);
            }
            match result {
                Ok(snapshot) => {
                    state.counts = snapshot.data;
                    for category in cleared {
                        *state.counts.slot_mut(category) = 0;
                    }
                    let mut applied = 0;
                    for event in buffered.iter().filter(|e| after_snapshot(e, snapshot.at)) {
                        state.bump(event.category);
                        applied += 1;
                    }
                    state.seeded_for = Some(session.generation);
                    info!(
                        counts = ?state.counts,
                        buffered = buffered.len(),
                        applied,
                        "unread counters seeded"
                    );
                    Ok(state.counts)
                }
                Err(err) => {
                    // Keep the live increments that arrived meanwhile.
                    for event in &buffered {
                        state.bump(event.category);
                    }
                    Err((err, state.counts))
                }
            }
        };

        match counts {
            Ok(counts) => {
                self.announce(counts);
                Ok(counts)
            }
            Err((err, counts)) => {
                warn!(%err, "unread snapshot fetch failed");
                self.announce(counts);
                if err.is_unauthorized() {
                    self.session.expire(&self.bus);
                }
                Err(SyncError::Api(err))
            }
        }
    }

    /// Count one pushed event. The only way counters grow after seeding.
    pub fn on_push_event(&self, event: NotificationEvent) -> UnreadCounts {
        let counts = {
            let mut state = self.lock();
            if state.fetching.is_some() {
                debug!(category = event.category.as_str(), "buffering event during snapshot");
                state.buffered.push(event);
                return state.counts;
            }
            state.bump(event.category);
            state.counts
        };
        self.announce(counts);
        counts
    }

    /// Reset `category` to zero and tell the server. Nothing is sent when the
    /// counter is already zero, and a failed request does not restore it.
    /// While a snapshot fetch is in flight the request is sent even for a
    /// zero counter, since the snapshot may still carry unread items.
    #[instrument(skip(self), fields(category = category.as_str()))]
    pub async fn mark_read(&self, category: NotificationCategory) -> Result<()> {
        self.session.require()?;
        let counts = {
            let mut state = self.lock();
            // A snapshot in flight may still carry this category's count,
            // so the server is told even if the local counter is zero.
            let racing_snapshot = state.fetching.is_some();
            if racing_snapshot {
                state.buffered.retain(|e| e.category != category);
                state.cleared.insert(category);
            }
            if state.counts.get(category) == 0 && !racing_snapshot {
                return Ok(());
            }
            *state.counts.slot_mut(category) = 0;
            state.counts
        };
        self.announce(counts);

        if let Err(err) = self.api.mark_read(category).await {
            warn!(%err, "mark-read failed; counter stays cleared");
            if err.is_unauthorized() {
                self.session.expire(&self.bus);
            }
            return Err(SyncError::Api(err));
        }
        Ok(())
    }

    pub fn counts(&self) -> UnreadCounts {
        self.lock().counts
    }

    pub fn unread(&self, category: NotificationCategory) -> u32 {
        self.lock().counts.get(category)
    }

    pub fn total_unread(&self) -> u32 {
        self.lock().counts.total()
    }

    /// Forget everything; used at logout.
    pub fn reset(&self) {
        *self.lock() = Counters::default();
        self.announce(UnreadCounts::default());
    }
}
