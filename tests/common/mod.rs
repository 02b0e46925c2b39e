#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use weibo_sync::api::{FeedApi, Stamped};
use weibo_sync::config::{Api, Config, Feed, Push};
use weibo_sync::cursor::{Cursor, FeedKind, ItemKind, PageRequest};
use weibo_sync::model::{
    Comment, CommentId, FeedEntry, NotificationCategory, NotificationItem, PostDraft, PostEdit,
    PostId, PostType, UnreadCounts, UserId, UserSummary, Visibility,
};
use weibo_sync::push::ChannelPush;
use weibo_sync::session::SessionContext;
use weibo_sync::{ApiError, SyncContext};

pub const VIEWER: UserId = 1;

pub fn base_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
}

pub fn user(id: UserId, username: &str) -> UserSummary {
    UserSummary {
        id,
        username: username.to_string(),
        avatar_url: None,
        bio: None,
        follower_count: 0,
        follow_count: 0,
        friend_count: 0,
        following: false,
        followed: false,
    }
}

/// Post `id` by `author`, created `id` minutes after the base time so that
/// higher ids are newer.
pub fn post(id: PostId, author: UserId) -> FeedEntry {
    FeedEntry {
        id,
        user: user(author, &format!("user{}", author)),
        post_type: PostType::Original,
        content: Some(format!("post {}", id)),
        images: Vec::new(),
        ref_post: None,
        visibility: Visibility::Public,
        liked: false,
        like_count: 0,
        comment_count: 0,
        repost_count: 0,
        created_at: base_time() + ChronoDuration::minutes(id),
        updated_at: None,
        edited: false,
    }
}

/// Posts `1..=n` by user 2, newest first.
pub fn posts(n: i64) -> Vec<FeedEntry> {
    (1..=n).rev().map(|id| post(id, 2)).collect()
}

pub fn comment(id: CommentId, content: &str) -> Comment {
    Comment {
        id,
        content: content.to_string(),
        created_at: base_time(),
        user: user(VIEWER, "viewer"),
    }
}

pub fn notification(id: i64, category: NotificationCategory) -> NotificationItem {
    NotificationItem {
        id,
        category,
        sender: user(2, "user2"),
        post_id: None,
        post_preview: None,
        comment_content: None,
        created_at: base_time() + ChronoDuration::minutes(id),
        read: false,
    }
}

pub fn config() -> Config {
    Config {
        api: Api {
            base_url: "http://localhost:8080".into(),
            timeout_ms: 1_000,
            server_utc_offset_minutes: 0,
        },
        feed: Feed {
            page_size: 10,
            event_capacity: 64,
        },
        push: Push {
            reconnect_delay_ms: 100,
            max_backoff_seconds: 1,
        },
        session: None,
    }
}

pub fn context(backend: Arc<FakeBackend>, push: Arc<ChannelPush>) -> SyncContext {
    SyncContext::new(&config(), SessionContext::new(), backend, push)
}

/// Context with an authenticated session and no push task.
pub fn signed_in(backend: Arc<FakeBackend>) -> SyncContext {
    let ctx = context(backend, Arc::new(ChannelPush::new()));
    ctx.session.authenticate("token", VIEWER);
    ctx
}

#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

/// In-memory backend. Every call is logged by operation name, can be made to
/// fail, and can be held until the test releases it.
#[derive(Default)]
pub struct FakeBackend {
    pub posts: Mutex<Vec<FeedEntry>>,
    pub users: Mutex<Vec<UserSummary>>,
    pub notifications: Mutex<Vec<NotificationItem>>,
    pub comments: Mutex<HashMap<PostId, Vec<Comment>>>,
    pub unread: Mutex<UnreadCounts>,
    pub unread_at: Mutex<Option<NaiveDateTime>>,
    /// Re-return the boundary entry of the previous page.
    pub overlap: AtomicBool,
    next_id: AtomicI64,
    failures: std::sync::Mutex<HashMap<&'static str, VecDeque<ApiError>>>,
    gates: std::sync::Mutex<HashMap<&'static str, Arc<Gate>>>,
    calls: std::sync::Mutex<Vec<&'static str>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let backend = Self::default();
        backend.next_id.store(1000, Ordering::SeqCst);
        Arc::new(backend)
    }

    pub fn with_posts(entries: Vec<FeedEntry>) -> Arc<Self> {
        let backend = Self::new();
        *backend.posts.try_lock().unwrap() = entries;
        backend
    }

    pub fn fail_next(&self, op: &'static str, err: ApiError) {
        self.failures
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Hold the next calls of `op` until [`FakeBackend::release`].
    pub fn hold(&self, op: &'static str) {
        self.gates.lock().unwrap().insert(op, Arc::new(Gate::default()));
    }

    /// Wait until a call of a held `op` is in flight.
    pub async fn entered(&self, op: &'static str) {
        let gate = self.gates.lock().unwrap().get(op).cloned();
        if let Some(gate) = gate {
            gate.entered.notified().await;
        }
    }

    pub fn release(&self, op: &'static str) {
        if let Some(gate) = self.gates.lock().unwrap().remove(op) {
            gate.release.notify_one();
        }
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == op).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    async fn enter(&self, op: &'static str) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(op);
        let gate = self.gates.lock().unwrap().get(op).cloned();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(op)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn mint_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn not_found(what: &str) -> ApiError {
        ApiError::Business {
            code: 3001,
            message: format!("{} not found", what),
        }
    }

    fn before<T, K>(&self, cursor: Option<Cursor>, key: K) -> impl Fn(&T) -> bool
    where
        K: Fn(&T) -> i64,
    {
        let overlap = self.overlap.load(Ordering::SeqCst);
        move |item: &T| match cursor {
            None => true,
            Some(c) if overlap => key(item) <= c.value(),
            Some(c) => key(item) < c.value(),
        }
    }
}

fn millis(at: NaiveDateTime) -> i64 {
    at.and_utc().timestamp_millis()
}

#[async_trait::async_trait]
impl FeedApi for FakeBackend {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Value, ApiError> {
        self.enter("fetch_page").await?;
        let size = request.size as usize;
        match request.kind.item_kind() {
            ItemKind::Post => {
                let posts = self.posts.lock().await;
                let page: Vec<FeedEntry> = match request.cursor {
                    Some(Cursor::Timestamp(_)) => {
                        let keep = self.before(request.cursor, |p: &FeedEntry| millis(p.created_at));
                        posts.iter().filter(|p| keep(p)).take(size).cloned().collect()
                    }
                    _ => {
                        let keep = self.before(request.cursor, |p: &FeedEntry| p.id);
                        posts.iter().filter(|p| keep(p)).take(size).cloned().collect()
                    }
                };
                if let FeedKind::Liked(_) = request.kind {
                    let next = page.last().map(|p| millis(p.created_at));
                    return Ok(json!({ "posts": page, "nextCursor": next }));
                }
                Ok(serde_json::to_value(page).unwrap())
            }
            ItemKind::User => {
                let users = self.users.lock().await;
                let keep = self.before(request.cursor, |u: &UserSummary| u.id);
                let page: Vec<UserSummary> =
                    users.iter().filter(|u| keep(u)).take(size).cloned().collect();
                Ok(serde_json::to_value(page).unwrap())
            }
            ItemKind::Notification => {
                let category = match request.kind {
                    FeedKind::Notifications(c) => c,
                    other => panic!("unexpected kind {}", other),
                };
                let items = self.notifications.lock().await;
                let keep = self.before(request.cursor, |n: &NotificationItem| n.id);
                let page: Vec<NotificationItem> = items
                    .iter()
                    .filter(|n| n.category == category && keep(n))
                    .take(size)
                    .cloned()
                    .collect();
                Ok(serde_json::to_value(page).unwrap())
            }
        }
    }

    async fn create_post(&self, draft: &PostDraft) -> Result<FeedEntry, ApiError> {
        self.enter("create_post").await?;
        let mut posts = self.posts.lock().await;
        let mut entry = post(self.mint_id(), VIEWER);
        entry.content = draft.content.clone();
        entry.images = draft.images.clone();
        entry.visibility = draft.visibility;
        if let Some(ref_id) = draft.ref_post_id {
            let referenced = posts
                .iter()
                .find(|p| p.id == ref_id)
                .cloned()
                .ok_or_else(|| Self::not_found("post"))?;
            entry.post_type = PostType::Repost;
            entry.ref_post = Some(Box::new(referenced));
        }
        posts.insert(0, entry.clone());
        Ok(entry)
    }

    async fn update_post(&self, id: PostId, edit: &PostEdit) -> Result<FeedEntry, ApiError> {
        self.enter("update_post").await?;
        let mut posts = self.posts.lock().await;
        let entry = posts
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| Self::not_found("post"))?;
        entry.content = edit.content.clone();
        entry.images = edit.images.clone();
        entry.visibility = edit.visibility;
        entry.edited = true;
        entry.updated_at = Some(base_time() + ChronoDuration::days(1));
        Ok(entry.clone())
    }

    async fn delete_post(&self, id: PostId) -> Result<(), ApiError> {
        self.enter("delete_post").await?;
        let mut posts = self.posts.lock().await;
        let before = posts.len();
        posts.retain(|p| p.id != id);
        if posts.len() == before {
            return Err(Self::not_found("post"));
        }
        Ok(())
    }

    async fn like_post(&self, id: PostId) -> Result<(), ApiError> {
        self.enter("like_post").await?;
        if let Some(p) = self.posts.lock().await.iter_mut().find(|p| p.id == id) {
            p.liked = true;
            p.like_count += 1;
        }
        Ok(())
    }

    async fn unlike_post(&self, id: PostId) -> Result<(), ApiError> {
        self.enter("unlike_post").await?;
        if let Some(p) = self.posts.lock().await.iter_mut().find(|p| p.id == id) {
            p.liked = false;
            p.like_count -= 1;
        }
        Ok(())
    }

    async fn list_comments(&self, post_id: PostId) -> Result<Vec<Comment>, ApiError> {
        self.enter("list_comments").await?;
        Ok(self
            .comments
            .lock()
            .await
            .get(&post_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_comment(&self, post_id: PostId, content: &str) -> Result<Comment, ApiError> {
        self.enter("create_comment").await?;
        let created = comment(self.mint_id(), content);
        self.comments
            .lock()
            .await
            .entry(post_id)
            .or_default()
            .insert(0, created.clone());
        Ok(created)
    }

    async fn delete_comment(&self, comment_id: CommentId) -> Result<(), ApiError> {
        self.enter("delete_comment").await?;
        for thread in self.comments.lock().await.values_mut() {
            thread.retain(|c| c.id != comment_id);
        }
        Ok(())
    }

    async fn follow(&self, _user_id: UserId) -> Result<(), ApiError> {
        self.enter("follow").await
    }

    async fn unfollow(&self, _user_id: UserId) -> Result<(), ApiError> {
        self.enter("unfollow").await
    }

    async fn user_profile(&self, user_id: UserId) -> Result<UserSummary, ApiError> {
        self.enter("user_profile").await?;
        self.users
            .lock()
            .await
            .iter()
            .find(|u| u.id == user_id)
            .cloned()
            .ok_or_else(|| Self::not_found("user"))
    }

    async fn unread_counts(&self) -> Result<Stamped<UnreadCounts>, ApiError> {
        self.enter("unread_counts").await?;
        Ok(Stamped {
            data: *self.unread.lock().await,
            at: *self.unread_at.lock().await,
        })
    }

    async fn mark_read(&self, category: NotificationCategory) -> Result<(), ApiError> {
        self.enter("mark_read").await?;
        *self.unread.lock().await.slot_mut(category) = 0;
        Ok(())
    }
}
