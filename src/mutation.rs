//! User actions against the backend.
//!
//! Reversible actions (like, visibility) are applied to the stores before the
//! request and rolled back from a snapshot on failure. Destructive or
//! identity-creating actions (delete, edit, comment, post, follow) touch the
//! stores only after the server confirmed them.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::api::FeedApi;
use crate::bus::{EventBus, Notice, PostCreated, PostDeleted, ProfileChanged};
use crate::comments::CommentStore;
use crate::cursor::FeedKind;
use crate::error::{ApiError, Result, SyncError};
use crate::model::{
    Comment, CommentId, FeedEntry, PostDraft, PostEdit, PostId, UserId, UserSummary, Visibility,
    MAX_CONTENT_CHARS, MAX_IMAGES,
};
use crate::profile::ProfileStore;
use crate::session::{Session, SessionContext};
use crate::store::{EntryPatch, FeedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Like,
    Unlike,
    DeletePost,
    DeleteComment,
    UpdateVisibility,
    Edit,
    CreatePost,
    CreateComment,
    Follow,
    Unfollow,
}

impl ActionKind {
    /// Opposite toggles share a slot so a like and an unlike of the same
    /// post can never be in flight together.
    fn slot(self) -> ActionKind {
        match self {
            ActionKind::Unlike => ActionKind::Like,
            ActionKind::Unfollow => ActionKind::Follow,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentState {
    Pending,
    Committed,
    RolledBack,
}

/// An action that has been started and not yet settled.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationIntent {
    pub id: Uuid,
    pub target: i64,
    pub action: ActionKind,
    /// Fields to restore on rollback; `None` for confirm-first actions.
    pub snapshot: Option<EntryPatch>,
    pub state: IntentState,
}

type SlotKey = (i64, ActionKind);

/// Holds a re-entrancy slot until dropped. Dropping a guard that was never
/// settled (the action's future was cancelled) restores the snapshot.
struct IntentGuard<'a> {
    owner: &'a MutationCoordinator,
    key: SlotKey,
    intent: MutationIntent,
}

impl IntentGuard<'_> {
    fn commit(mut self) {
        self.intent.state = IntentState::Committed;
    }

    fn roll_back(mut self) {
        self.restore();
        self.intent.state = IntentState::RolledBack;
    }

    fn restore(&self) {
        if let Some(snapshot) = &self.intent.snapshot {
            self.owner.posts.mutate_everywhere(self.intent.target, snapshot);
        }
    }
}

impl Drop for IntentGuard<'_> {
    fn drop(&mut self) {
        if self.intent.state == IntentState::Pending {
            warn!(intent = %self.intent.id, action = ?self.intent.action, "intent abandoned");
            self.restore();
            self.intent.state = IntentState::RolledBack;
        }
        self.owner.lock().remove(&self.key);
        debug!(
            intent = %self.intent.id,
            target = self.intent.target,
            action = ?self.intent.action,
            state = ?self.intent.state,
            "intent settled"
        );
    }
}

pub struct MutationCoordinator {
    api: Arc<dyn FeedApi>,
    session: SessionContext,
    bus: Arc<EventBus>,
    posts: Arc<FeedStore<FeedEntry>>,
    users: Arc<FeedStore<UserSummary>>,
    comments: Arc<CommentStore>,
    profiles: Arc<ProfileStore>,
    pending: Mutex<HashMap<SlotKey, MutationIntent>>,
}

impl std::fmt::Debug for MutationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("pending", &self.lock().len())
            .finish_non_exhaustive()
    }
}

/// Shared checks for post drafts and edits.
pub fn validate_content(content: Option<&str>, images: &[String]) -> Result<()> {
    let text = content.map(str::trim).unwrap_or_default();
    if text.is_empty() && images.is_empty() {
        return Err(SyncError::Invalid("post needs text or at least one image"));
    }
    if images.len() > MAX_IMAGES {
        return Err(SyncError::Invalid("at most 9 images per post"));
    }
    if content.map(|c| c.chars().count()).unwrap_or(0) > MAX_CONTENT_CHARS {
        return Err(SyncError::Invalid("post text is limited to 5000 characters"));
    }
    Ok(())
}

impl MutationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn FeedApi>,
        session: SessionContext,
        bus: Arc<EventBus>,
        posts: Arc<FeedStore<FeedEntry>>,
        users: Arc<FeedStore<UserSummary>>,
        comments: Arc<CommentStore>,
        profiles: Arc<ProfileStore>,
    ) -> Self {
        Self {
            api,
            session,
            bus,
            posts,
            users,
            comments,
            profiles,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SlotKey, MutationIntent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The in-flight intent occupying the slot of `(target, action)`, if any.
    pub fn pending(&self, target: i64, action: ActionKind) -> Option<MutationIntent> {
        self.lock().get(&(target, action.slot())).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn begin(
        &self,
        target: i64,
        action: ActionKind,
        snapshot: Option<EntryPatch>,
    ) -> Result<IntentGuard<'_>> {
        let key = (target, action.slot());
        let intent = MutationIntent {
            id: Uuid::new_v4(),
            target,
            action,
            snapshot,
            state: IntentState::Pending,
        };
        {
            let mut pending = self.lock();
            if pending.contains_key(&key) {
                debug!(target, ?action, "rejected: same action already pending");
                return Err(SyncError::AlreadyPending);
            }
            pending.insert(key, intent.clone());
        }
        Ok(IntentGuard {
            owner: self,
            key,
            intent,
        })
    }

    fn require_session(&self) -> Result<Session> {
        self.session.require().map_err(|err| self.reject(err))
    }

    /// Surface a failure once to the user. A duplicate click is not a failure.
    fn reject(&self, err: SyncError) -> SyncError {
        if err != SyncError::AlreadyPending {
            self.bus.publish(Notice::error(err.to_string()));
        }
        err
    }

    fn fail(&self, action: ActionKind, err: ApiError) -> SyncError {
        warn!(?action, %err, "mutation failed");
        if err.is_unauthorized() {
            self.session.expire(&self.bus);
        }
        self.reject(SyncError::Api(err))
    }

    fn loaded_post(&self, post_id: PostId) -> Result<FeedEntry> {
        self.posts
            .find(post_id)
            .ok_or_else(|| self.reject(SyncError::NotLoaded(post_id)))
    }

    /// Like or unlike `post_id`. A request for the state the post is already
    /// in is a no-op, unless another like action on it is still pending.
    #[instrument(skip(self))]
    pub async fn set_like(&self, post_id: PostId, liked: bool) -> Result<()> {
        self.require_session()?;
        let entry = self.loaded_post(post_id)?;
        if self.pending(post_id, ActionKind::Like).is_some() {
            return Err(self.reject(SyncError::AlreadyPending));
        }
        if entry.liked == liked {
            return Ok(());
        }
        let action = if liked {
            ActionKind::Like
        } else {
            ActionKind::Unlike
        };
        let snapshot = EntryPatch::like(entry.liked, entry.like_count);
        let guard = self
            .begin(post_id, action, Some(snapshot))
            .map_err(|err| self.reject(err))?;

        let delta = if liked { 1 } else { -1 };
        self.posts
            .mutate_everywhere(post_id, &EntryPatch::like(liked, entry.like_count + delta));

        let res = if liked {
            self.api.like_post(post_id).await
        } else {
            self.api.unlike_post(post_id).await
        };
        match res {
            Ok(()) => {
                guard.commit();
                Ok(())
            }
            Err(err) => {
                guard.roll_back();
                Err(self.fail(action, err))
            }
        }
    }

    /// Flip the viewer's like on `post_id`; returns the new state.
    pub async fn toggle_like(&self, post_id: PostId) -> Result<bool> {
        self.require_session()?;
        let liked = !self.loaded_post(post_id)?.liked;
        self.set_like(post_id, liked).await?;
        Ok(liked)
    }

    #[instrument(skip(self))]
    pub async fn set_visibility(&self, post_id: PostId, visibility: Visibility) -> Result<()> {
        self.require_session()?;
        let entry = self.loaded_post(post_id)?;
        if entry.visibility == visibility {
            return Ok(());
        }
        let guard = self
            .begin(
                post_id,
                ActionKind::UpdateVisibility,
                Some(EntryPatch::visibility(entry.visibility)),
            )
            .map_err(|err| self.reject(err))?;
        self.posts
            .mutate_everywhere(post_id, &EntryPatch::visibility(visibility));

        let edit = PostEdit {
            content: entry.content.clone(),
            images: entry.images.clone(),
            visibility,
        };
        match self.api.update_post(post_id, &edit).await {
            Ok(updated) => {
                guard.commit();
                self.posts
                    .mutate_everywhere(post_id, &EntryPatch::from_edited(&updated));
                Ok(())
            }
            Err(err) => {
                guard.roll_back();
                Err(self.fail(ActionKind::UpdateVisibility, err))
            }
        }
    }

    #[instrument(skip(self, edit))]
    pub async fn edit_post(&self, post_id: PostId, edit: PostEdit) -> Result<FeedEntry> {
        self.require_session()?;
        validate_content(edit.content.as_deref(), &edit.images).map_err(|err| self.reject(err))?;
        let guard = self
            .begin(post_id, ActionKind::Edit, None)
            .map_err(|err| self.reject(err))?;

        match self.api.update_post(post_id, &edit).await {
            Ok(updated) => {
                guard.commit();
                self.posts
                    .mutate_everywhere(post_id, &EntryPatch::from_edited(&updated));
                self.bus.publish(Notice::success("post updated"));
                Ok(updated)
            }
            Err(err) => {
                guard.roll_back();
                Err(self.fail(ActionKind::Edit, err))
            }
        }
    }

    /// Delete a post. It stays in every store until the server confirms.
    #[instrument(skip(self))]
    pub async fn delete_post(&self, post_id: PostId) -> Result<()> {
        let session = self.require_session()?;
        if let Some(entry) = self.posts.find(post_id) {
            if !entry.is_authored_by(session.viewer_id) {
                return Err(self.reject(SyncError::Invalid("only the author can delete a post")));
            }
        }
        let guard = self
            .begin(post_id, ActionKind::DeletePost, None)
            .map_err(|err| self.reject(err))?;

        match self.api.delete_post(post_id).await {
            Ok(()) => {
                guard.commit();
                let feeds = self.posts.remove(post_id);
                self.comments.forget(post_id);
                info!(post_id, feeds, "post deleted");
                self.bus.publish(PostDeleted { post_id });
                self.bus.publish(Notice::success("post deleted"));
                Ok(())
            }
            Err(err) => {
                guard.roll_back();
                Err(self.fail(ActionKind::DeletePost, err))
            }
        }
    }

    /// Publish a new post or, when `draft.ref_post_id` is set, a repost/quote.
    #[instrument(skip(self, draft))]
    pub async fn create_post(&self, mut draft: PostDraft) -> Result<FeedEntry> {
        let session = self.require_session()?;
        if draft.ref_post_id.is_none() {
            validate_content(draft.content.as_deref(), &draft.images)
                .map_err(|err| self.reject(err))?;
        } else if draft.images.len() > MAX_IMAGES
            || draft
                .content
                .as_deref()
                .map(|c| c.chars().count() > MAX_CONTENT_CHARS)
                .unwrap_or(false)
        {
            return Err(self.reject(SyncError::Invalid("repost text or images exceed the limits")));
        }

        // A repost of a repost points at the root.
        if let Some(ref_id) = draft.ref_post_id {
            if let Some(referenced) = self.posts.find(ref_id) {
                draft.ref_post_id = Some(referenced.reference_root());
            }
        }
        let guard = self
            .begin(session.viewer_id, ActionKind::CreatePost, None)
            .map_err(|err| self.reject(err))?;

        match self.api.create_post(&draft).await {
            Ok(created) => {
                guard.commit();
                self.posts.prepend(FeedKind::Global, created.clone());
                self.posts
                    .prepend(FeedKind::UserPosts(session.viewer_id), created.clone());
                if let Some(root) = draft.ref_post_id {
                    self.posts.mutate_everywhere(root, &EntryPatch::reposts(1));
                }
                info!(post_id = created.id, "post created");
                self.bus.publish(PostCreated {
                    entry: created.clone(),
                });
                self.bus.publish(Notice::success("posted"));
                Ok(created)
            }
            Err(err) => {
                guard.roll_back();
                Err(self.fail(ActionKind::CreatePost, err))
            }
        }
    }

    /// Send the draft buffered for `post_id`. The draft is kept on failure.
    #[instrument(skip(self))]
    pub async fn publish_comment(&self, post_id: PostId) -> Result<Comment> {
        self.require_session()?;
        let draft = self.comments.draft(post_id);
        let content = draft.trim();
        if content.is_empty() {
            return Err(self.reject(SyncError::Invalid("comment cannot be empty")));
        }
        let guard = self
            .begin(post_id, ActionKind::CreateComment, None)
            .map_err(|err| self.reject(err))?;

        match self.api.create_comment(post_id, content).await {
            Ok(comment) => {
                guard.commit();
                self.comments.clear_draft(post_id);
                self.posts.mutate_everywhere(post_id, &EntryPatch::comments(1));
                if let Err(err) = self.comments.refresh(post_id).await {
                    warn!(%err, "comment saved but thread refresh failed");
                }
                Ok(comment)
            }
            Err(err) => {
                guard.roll_back();
                Err(self.fail(ActionKind::CreateComment, err))
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn delete_comment(&self, post_id: PostId, comment_id: CommentId) -> Result<()> {
        self.require_session()?;
        let guard = self
            .begin(comment_id, ActionKind::DeleteComment, None)
            .map_err(|err| self.reject(err))?;

        match self.api.delete_comment(comment_id).await {
            Ok(()) => {
                guard.commit();
                self.comments.remove(post_id, comment_id);
                self.posts.mutate_everywhere(post_id, &EntryPatch::comments(-1));
                self.bus.publish(Notice::success("comment deleted"));
                Ok(())
            }
            Err(err) => {
                guard.roll_back();
                Err(self.fail(ActionKind::DeleteComment, err))
            }
        }
    }

    pub async fn follow(&self, user_id: UserId) -> Result<()> {
        self.set_following(user_id, true).await
    }

    pub async fn unfollow(&self, user_id: UserId) -> Result<()> {
        self.set_following(user_id, false).await
    }

    /// Friend counts move only when the target is known to follow the
    /// viewer; a stale `followed` flag drifts until the next profile load.
    #[instrument(skip(self))]
    async fn set_following(&self, user_id: UserId, following: bool) -> Result<()> {
        let session = self.require_session()?;
        if user_id == session.viewer_id {
            return Err(self.reject(SyncError::Invalid("cannot follow yourself")));
        }
        let action = if following {
            ActionKind::Follow
        } else {
            ActionKind::Unfollow
        };
        let guard = self
            .begin(user_id, action, None)
            .map_err(|err| self.reject(err))?;

        let res = if following {
            self.api.follow(user_id).await
        } else {
            self.api.unfollow(user_id).await
        };
        if let Err(err) = res {
            guard.roll_back();
            return Err(self.fail(action, err));
        }
        guard.commit();

        let mutual = self
            .profiles
            .get(user_id)
            .or_else(|| self.users.find(user_id))
            .map(|u| u.followed)
            .unwrap_or(false);
        let delta = if following { 1 } else { -1 };

        let adjust_target = |u: &mut UserSummary| {
            u.following = following;
            u.follower_count = (u.follower_count + delta).max(0);
            if mutual {
                u.friend_count = (u.friend_count + delta).max(0);
            }
        };
        self.profiles.update(user_id, adjust_target);
        self.users.update_everywhere(user_id, adjust_target);

        let adjust_viewer = |u: &mut UserSummary| {
            u.follow_count = (u.follow_count + delta).max(0);
            if mutual {
                u.friend_count = (u.friend_count + delta).max(0);
            }
        };
        self.profiles.update(session.viewer_id, adjust_viewer);
        self.users.update_everywhere(session.viewer_id, adjust_viewer);

        info!(user_id, following, mutual, "relationship changed");
        self.bus.publish(ProfileChanged { user_id });
        self.bus.publish(ProfileChanged {
            user_id: session.viewer_id,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggles_share_a_slot() {
        assert_eq!(ActionKind::Unlike.slot(), ActionKind::Like);
        assert_eq!(ActionKind::Unfollow.slot(), ActionKind::Follow);
        assert_eq!(ActionKind::DeletePost.slot(), ActionKind::DeletePost);
    }

    #[test]
    fn content_rules() {
        assert!(validate_content(Some("hi"), &[]).is_ok());
        assert!(validate_content(None, &["a.png".into()]).is_ok());
        assert_eq!(
            validate_content(Some("   "), &[]),
            Err(SyncError::Invalid("post needs text or at least one image"))
        );
        let ten: Vec<String> = (0..10).map(|i| format!("{}.png", i)).collect();
        assert!(validate_content(Some("x"), &ten).is_err());
        let long = "字".repeat(MAX_CONTENT_CHARS);
        assert!(validate_content(Some(&long), &[]).is_ok());
        let longer = "字".repeat(MAX_CONTENT_CHARS + 1);
        assert!(validate_content(Some(&longer), &[]).is_err());
    }
}
