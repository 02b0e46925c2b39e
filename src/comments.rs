//! Per-post comment threads and draft input buffers.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, instrument, warn};

use crate::api::FeedApi;
use crate::bus::EventBus;
use crate::error::{Result, SyncError};
use crate::merge;
use crate::model::{Comment, CommentId, PostId};
use crate::session::SessionContext;

#[derive(Debug, Default)]
struct Threads {
    loaded: HashMap<PostId, Vec<Comment>>,
    /// Post id to the session generation whose fetch is in flight.
    loading: HashMap<PostId, u64>,
    drafts: HashMap<PostId, String>,
}

pub struct CommentStore {
    api: Arc<dyn FeedApi>,
    session: SessionContext,
    bus: Arc<EventBus>,
    threads: Mutex<Threads>,
}

impl std::fmt::Debug for CommentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommentStore").finish_non_exhaustive()
    }
}

impl CommentStore {
    pub fn new(api: Arc<dyn FeedApi>, session: SessionContext, bus: Arc<EventBus>) -> Self {
        Self {
            api,
            session,
            bus,
            threads: Mutex::new(Threads::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Threads> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch the thread the first time a post is expanded; later calls return
    /// the cached copy.
    pub async fn load(&self, post_id: PostId) -> Result<Vec<Comment>> {
        if let Some(thread) = self.thread(post_id) {
            return Ok(thread);
        }
        self.refresh(post_id).await
    }

    /// Refetch the thread; the server owns comment ordering.
    #[instrument(skip(self))]
    pub async fn refresh(&self, post_id: PostId) -> Result<Vec<Comment>> {
        let session = self.session.require()?;
        {
            let mut threads = self.lock();
            if threads.loading.get(&post_id) == Some(&session.generation) {
                debug!("thread fetch already in flight");
                return Ok(threads.loaded.get(&post_id).cloned().unwrap_or_default());
            }
            threads.loading.insert(post_id, session.generation);
        }

        let result = self.api.list_comments(post_id).await;

        let mut threads = self.lock();
        if threads.loading.get(&post_id) == Some(&session.generation) {
            threads.loading.remove(&post_id);
        }
        if !self.session.is_current(&session) {
            debug!("session ended during thread fetch; dropping it");
            return Err(SyncError::AuthenticationRequired);
        }
        match result {
            Ok(comments) => {
                let comments = merge::dedup_append(&[], comments);
                threads.loaded.insert(post_id, comments.clone());
                Ok(comments)
            }
            Err(err) => {
                drop(threads);
                warn!(%err, "comment thread fetch failed");
                if err.is_unauthorized() {
                    self.session.expire(&self.bus);
                }
                Err(SyncError::Api(err))
            }
        }
    }

    pub fn thread(&self, post_id: PostId) -> Option<Vec<Comment>> {
        self.lock().loaded.get(&post_id).cloned()
    }

    /// Drop a comment from a loaded thread. Returns false if it was not there.
    pub fn remove(&self, post_id: PostId, comment_id: CommentId) -> bool {
        let mut threads = self.lock();
        match threads.loaded.get_mut(&post_id) {
            Some(thread) if merge::contains(thread, comment_id) => {
                *thread = merge::splice_remove(thread, comment_id);
                true
            }
            _ => false,
        }
    }

    /// Forget the thread and the draft of a deleted post.
    pub fn forget(&self, post_id: PostId) {
        let mut threads = self.lock();
        threads.loaded.remove(&post_id);
        threads.drafts.remove(&post_id);
    }

    pub fn set_draft(&self, post_id: PostId, text: impl Into<String>) {
        self.lock().drafts.insert(post_id, text.into());
    }

    pub fn draft(&self, post_id: PostId) -> String {
        self.lock().drafts.get(&post_id).cloned().unwrap_or_default()
    }

    pub fn clear_draft(&self, post_id: PostId) {
        self.lock().drafts.remove(&post_id);
    }

    pub fn clear(&self) {
        *self.lock() = Threads::default();
    }
}
