//! Canonical in-memory sequences, one per active feed kind.
//!
//! Every mutation of a sequence happens inside one synchronous critical
//! section; the lock is never held across a network await. Fetch results are
//! tagged with the epoch of the state that issued them, so a response for a
//! state that was reset or torn down in the meantime is dropped.
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

use crate::api::FeedApi;
use crate::bus::{EventBus, FeedUpdated};
use crate::cursor::{Cursor, CursorProtocol, FeedKind, Page, PageItem, PageRequest};
use crate::error::{ApiError, ApiResult, Result, SyncError};
use crate::merge;
use crate::model::{FeedEntry, PostId, Visibility};
use crate::session::SessionContext;

#[derive(Debug)]
struct FeedState<T> {
    entries: Vec<T>,
    cursor: Option<Cursor>,
    exhausted: bool,
    loading_initial: bool,
    loading_more: bool,
    last_error: Option<String>,
    epoch: u64,
}

impl<T> FeedState<T> {
    fn new(epoch: u64) -> Self {
        Self {
            entries: Vec::new(),
            cursor: None,
            exhausted: false,
            loading_initial: false,
            loading_more: false,
            last_error: None,
            epoch,
        }
    }
}

/// Read-only copy of one feed handed to the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSnapshot<T> {
    pub kind: FeedKind,
    pub entries: Vec<T>,
    pub exhausted: bool,
    pub loading_initial: bool,
    pub loading_more: bool,
    /// Set after a failed fetch; the renderer offers a retry.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { appended: usize, exhausted: bool },
    /// Guard hit: nothing to fetch or a fetch for this kind is in flight.
    Skipped,
}

struct Inner<T> {
    states: HashMap<FeedKind, FeedState<T>>,
    next_epoch: u64,
}

impl<T> Inner<T> {
    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}

pub struct FeedStore<T: PageItem> {
    api: Arc<dyn FeedApi>,
    protocol: CursorProtocol,
    session: SessionContext,
    bus: Arc<EventBus>,
    inner: Mutex<Inner<T>>,
}

impl<T: PageItem> std::fmt::Debug for FeedStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedStore")
            .field("protocol", &self.protocol)
            .field("kinds", &self.kinds())
            .finish_non_exhaustive()
    }
}

impl<T: PageItem> FeedStore<T> {
    pub fn new(
        api: Arc<dyn FeedApi>,
        protocol: CursorProtocol,
        session: SessionContext,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            api,
            protocol,
            session,
            bus,
            inner: Mutex::new(Inner {
                states: HashMap::new(),
                next_epoch: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn assert_holds(&self, kind: &FeedKind) {
        assert_eq!(
            kind.item_kind(),
            T::ITEM,
            "feed kind {} used with the wrong store",
            kind
        );
    }

    fn notify(&self, kind: FeedKind) {
        self.bus.publish(FeedUpdated { kind });
    }

    async fn fetch(&self, request: &PageRequest) -> ApiResult<Page<T>> {
        let body = self.api.fetch_page(request).await?;
        self.protocol.decode_page(&request.kind, body)
    }

    fn observe_failure(&self, kind: &FeedKind, err: &ApiError) {
        warn!(%kind, %err, "page fetch failed");
        if err.is_unauthorized() {
            self.session.expire(&self.bus);
        }
    }

    /// Reset `kind` and fetch its first page. A call while another initial
    /// load for the same kind is in flight is a no-op.
    #[instrument(skip_all, fields(kind = %kind))]
    pub async fn load_initial(&self, kind: FeedKind) -> Result<LoadOutcome> {
        self.assert_holds(&kind);
        let (request, epoch) = {
            let mut inner = self.lock();
            if inner
                .states
                .get(&kind)
                .map(|s| s.loading_initial)
                .unwrap_or(false)
            {
                debug!("initial load already in flight");
                return Ok(LoadOutcome::Skipped);
            }
            let epoch = inner.bump_epoch();
            let mut state = FeedState::new(epoch);
            state.loading_initial = true;
            inner.states.insert(kind, state);
            (self.protocol.build_request(&kind, None), epoch)
        };
        self.notify(kind);

        let result = self.fetch(&request).await;

        let outcome = {
            let mut inner = self.lock();
            let Some(state) = inner.states.get_mut(&kind).filter(|s| s.epoch == epoch) else {
                debug!("feed reset while loading; dropping page");
                return Ok(LoadOutcome::Skipped);
            };
            state.loading_initial = false;
            match result {
                Ok(page) => {
                    let raw_len = page.items.len();
                    state.cursor = self.protocol.next_cursor(&kind, &page);
                    state.entries = merge::dedup_append(&[], page.items);
                    state.exhausted = self.protocol.is_exhausted(raw_len);
                    state.last_error = None;
                    Ok(LoadOutcome::Loaded {
                        appended: state.entries.len(),
                        exhausted: state.exhausted,
                    })
                }
                Err(err) => {
                    state.last_error = Some(err.to_string());
                    Err(err)
                }
            }
        };
        self.notify(kind);

        match outcome {
            Ok(outcome) => {
                info!(?outcome, "initial page loaded");
                Ok(outcome)
            }
            Err(err) => {
                self.observe_failure(&kind, &err);
                Err(SyncError::Api(err))
            }
        }
    }

    /// Fetch the page after the current cursor and append its unseen entries.
    #[instrument(skip_all, fields(kind = %kind))]
    pub async fn load_more(&self, kind: FeedKind) -> Result<LoadOutcome> {
        self.assert_holds(&kind);
        let (request, epoch) = {
            let mut inner = self.lock();
            let Some(state) = inner.states.get_mut(&kind) else {
                return Ok(LoadOutcome::Skipped);
            };
            if state.exhausted
                || state.loading_initial
                || state.loading_more
                || state.entries.is_empty()
            {
                return Ok(LoadOutcome::Skipped);
            }
            let Some(cursor) = state.cursor else {
                return Ok(LoadOutcome::Skipped);
            };
            state.loading_more = true;
            (self.protocol.build_request(&kind, Some(cursor)), state.epoch)
        };
        self.notify(kind);

        let result = self.fetch(&request).await;

        let outcome = {
            let mut inner = self.lock();
            let Some(state) = inner.states.get_mut(&kind).filter(|s| s.epoch == epoch) else {
                debug!("feed reset while appending; dropping page");
                return Ok(LoadOutcome::Skipped);
            };
            state.loading_more = false;
            match result {
                Ok(page) => {
                    let raw_len = page.items.len();
                    if let Some(cursor) = self.protocol.next_cursor(&kind, &page) {
                        state.cursor = Some(cursor);
                    }
                    let fresh = merge::dedup_append(&state.entries, page.items);
                    let appended = fresh.len();
                    state.entries.extend(fresh);
                    state.exhausted = self.protocol.is_exhausted(raw_len);
                    state.last_error = None;
                    Ok(LoadOutcome::Loaded {
                        appended,
                        exhausted: state.exhausted,
                    })
                }
                Err(err) => {
                    state.last_error = Some(err.to_string());
                    Err(err)
                }
            }
        };
        self.notify(kind);

        match outcome {
            Ok(outcome) => {
                debug!(?outcome, "page appended");
                Ok(outcome)
            }
            Err(err) => {
                self.observe_failure(&kind, &err);
                Err(SyncError::Api(err))
            }
        }
    }

    /// Insert a server-confirmed entry at the head of a loaded feed.
    /// Returns false if `kind` has no state.
    pub fn prepend(&self, kind: FeedKind, entry: T) -> bool {
        self.assert_holds(&kind);
        let inserted = {
            let mut inner = self.lock();
            match inner.states.get_mut(&kind) {
                Some(state) => {
                    merge::prepend_unique(&mut state.entries, entry.normalize());
                    true
                }
                None => false,
            }
        };
        if inserted {
            self.notify(kind);
        }
        inserted
    }

    /// Remove `id` from every feed holding it. Returns how many feeds changed.
    pub fn remove(&self, id: i64) -> usize {
        let changed: Vec<FeedKind> = {
            let mut inner = self.lock();
            inner
                .states
                .iter_mut()
                .filter(|(_, state)| merge::contains(&state.entries, id))
                .map(|(kind, state)| {
                    state.entries = merge::splice_remove(&state.entries, id);
                    *kind
                })
                .collect()
        };
        for kind in &changed {
            self.notify(*kind);
        }
        changed.len()
    }

    /// Apply `f` to the entry with `id` in `kind`; no-op if it is not loaded there.
    pub fn update<F>(&self, kind: FeedKind, id: i64, f: F) -> bool
    where
        F: FnOnce(&mut T),
    {
        let hit = {
            let mut inner = self.lock();
            match inner
                .states
                .get_mut(&kind)
                .and_then(|s| s.entries.iter_mut().find(|e| e.id() == id))
            {
                Some(entry) => {
                    f(entry);
                    true
                }
                None => false,
            }
        };
        if hit {
            self.notify(kind);
        }
        hit
    }

    /// Apply `f` to every loaded copy of `id`. Returns how many feeds changed.
    pub fn update_everywhere<F>(&self, id: i64, mut f: F) -> usize
    where
        F: FnMut(&mut T),
    {
        let changed: Vec<FeedKind> = {
            let mut inner = self.lock();
            let mut changed = Vec::new();
            for (kind, state) in inner.states.iter_mut() {
                if let Some(entry) = state.entries.iter_mut().find(|e| e.id() == id) {
                    f(entry);
                    changed.push(*kind);
                }
            }
            changed
        };
        for kind in &changed {
            self.notify(*kind);
        }
        changed.len()
    }

    pub fn get(&self, kind: FeedKind, id: i64) -> Option<T> {
        self.lock()
            .states
            .get(&kind)
            .and_then(|s| s.entries.iter().find(|e| e.id() == id).cloned())
    }

    /// Any loaded copy of `id`.
    pub fn find(&self, id: i64) -> Option<T> {
        self.lock()
            .states
            .values()
            .find_map(|s| s.entries.iter().find(|e| e.id() == id).cloned())
    }

    pub fn snapshot(&self, kind: FeedKind) -> FeedSnapshot<T> {
        let inner = self.lock();
        match inner.states.get(&kind) {
            Some(state) => FeedSnapshot {
                kind,
                entries: state.entries.clone(),
                exhausted: state.exhausted,
                loading_initial: state.loading_initial,
                loading_more: state.loading_more,
                last_error: state.last_error.clone(),
            },
            None => FeedSnapshot {
                kind,
                entries: Vec::new(),
                exhausted: false,
                loading_initial: false,
                loading_more: false,
                last_error: None,
            },
        }
    }

    pub fn kinds(&self) -> Vec<FeedKind> {
        self.lock().states.keys().copied().collect()
    }

    /// Drop the state for `kind`; an in-flight response for it is discarded.
    pub fn teardown(&self, kind: FeedKind) -> bool {
        self.lock().states.remove(&kind).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        let n = inner.states.len();
        inner.states.clear();
        debug!(feeds = n, "feed store cleared");
    }
}

/// Partial update of a [`FeedEntry`]. Counters given as deltas clamp at zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryPatch {
    pub liked: Option<bool>,
    pub like_count: Option<i64>,
    pub comment_delta: i64,
    pub repost_delta: i64,
    pub content: Option<Option<String>>,
    pub images: Option<Vec<String>>,
    pub visibility: Option<Visibility>,
    pub edited: Option<bool>,
    pub updated_at: Option<Option<NaiveDateTime>>,
}

impl EntryPatch {
    pub fn like(liked: bool, like_count: i64) -> Self {
        Self {
            liked: Some(liked),
            like_count: Some(like_count),
            ..Default::default()
        }
    }

    pub fn comments(delta: i64) -> Self {
        Self {
            comment_delta: delta,
            ..Default::default()
        }
    }

    pub fn reposts(delta: i64) -> Self {
        Self {
            repost_delta: delta,
            ..Default::default()
        }
    }

    pub fn visibility(visibility: Visibility) -> Self {
        Self {
            visibility: Some(visibility),
            ..Default::default()
        }
    }

    /// The editable fields of a server-returned entry.
    pub fn from_edited(entry: &FeedEntry) -> Self {
        Self {
            content: Some(entry.content.clone()),
            images: Some(entry.images.clone()),
            visibility: Some(entry.visibility),
            edited: Some(entry.edited),
            updated_at: Some(entry.updated_at),
            ..Default::default()
        }
    }

    fn apply_fields(&self, entry: &mut FeedEntry) {
        if let Some(liked) = self.liked {
            entry.liked = liked;
        }
        if let Some(count) = self.like_count {
            entry.like_count = count.max(0);
        }
        entry.comment_count = (entry.comment_count + self.comment_delta).max(0);
        entry.repost_count = (entry.repost_count + self.repost_delta).max(0);
        if let Some(content) = &self.content {
            entry.content = content.clone();
        }
        if let Some(images) = &self.images {
            entry.images = images.clone();
        }
        if let Some(visibility) = self.visibility {
            entry.visibility = visibility;
        }
        if let Some(edited) = self.edited {
            entry.edited = edited;
        }
        if let Some(updated_at) = self.updated_at {
            entry.updated_at = updated_at;
        }
    }

    /// Patch `entry` and, when it quotes the target, the embedded reference.
    pub fn apply(&self, target: PostId, entry: &mut FeedEntry) {
        if entry.id == target {
            self.apply_fields(entry);
        }
        if let Some(reference) = entry.ref_post.as_mut().filter(|r| r.id == target) {
            self.apply_fields(reference);
        }
    }
}

impl FeedStore<FeedEntry> {
    /// Apply `patch` to `id` in `kind`; no-op if it is not loaded there.
    pub fn mutate_entry(&self, kind: FeedKind, id: PostId, patch: &EntryPatch) -> bool {
        self.update(kind, id, |entry| patch.apply(id, entry))
    }

    /// Apply `patch` to every loaded copy of `id`, including quoted references.
    pub fn mutate_everywhere(&self, id: PostId, patch: &EntryPatch) -> usize {
        let changed: Vec<FeedKind> = {
            let mut inner = self.lock();
            let mut changed = Vec::new();
            for (kind, state) in inner.states.iter_mut() {
                let mut touched = false;
                for entry in state.entries.iter_mut() {
                    let quotes = entry.ref_post.as_ref().map(|r| r.id == id).unwrap_or(false);
                    if entry.id == id || quotes {
                        patch.apply(id, entry);
                        touched = true;
                    }
                }
                if touched {
                    changed.push(*kind);
                }
            }
            changed
        };
        for kind in &changed {
            self.notify(*kind);
        }
        changed.len()
    }
}
