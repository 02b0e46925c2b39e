use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};

pub type PostId = i64;
pub type UserId = i64;
pub type CommentId = i64;

/// The backend sends `null` for empty lists and unset counters.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    #[default]
    Public,
    Friends,
    Followers,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "PUBLIC",
            Visibility::Friends => "FRIENDS",
            Visibility::Followers => "FOLLOWERS",
            Visibility::Private => "PRIVATE",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostType {
    #[default]
    Original,
    Repost,
    Quote,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NotificationCategory {
    #[serde(alias = "FOLLOW")]
    Follow,
    #[serde(alias = "LIKE")]
    Like,
    #[serde(alias = "COMMENT")]
    Comment,
}

impl NotificationCategory {
    pub const ALL: [NotificationCategory; 3] = [
        NotificationCategory::Follow,
        NotificationCategory::Like,
        NotificationCategory::Comment,
    ];

    /// Lowercase form used by mark-read and the push destinations.
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::Follow => "follow",
            NotificationCategory::Like => "like",
            NotificationCategory::Comment => "comment",
        }
    }

    /// Uppercase form the notification list endpoint expects.
    pub fn as_query(&self) -> &'static str {
        match self {
            NotificationCategory::Follow => "FOLLOW",
            NotificationCategory::Like => "LIKE",
            NotificationCategory::Comment => "COMMENT",
        }
    }
}

/// Lightweight user record returned by relationship lists and profiles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub follower_count: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub follow_count: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub friend_count: i64,
    /// The viewer follows this user.
    #[serde(default, deserialize_with = "null_as_default")]
    pub following: bool,
    /// This user follows the viewer.
    #[serde(default, deserialize_with = "null_as_default")]
    pub followed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    pub id: PostId,
    pub user: UserSummary,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub post_type: PostType,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub images: Vec<String>,
    #[serde(default)]
    pub ref_post: Option<Box<FeedEntry>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub visibility: Visibility,
    #[serde(default, deserialize_with = "null_as_default")]
    pub liked: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub like_count: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub comment_count: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub repost_count: i64,
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(default, alias = "isEdited", deserialize_with = "null_as_default")]
    pub edited: bool,
}

impl FeedEntry {
    /// Collapse any reference chain so the referenced entry is never itself a reference.
    pub fn flatten_reference(mut self) -> Self {
        if let Some(reference) = self.ref_post.as_mut() {
            reference.ref_post = None;
        }
        self
    }

    /// Identity a repost of this entry should point at.
    pub fn reference_root(&self) -> PostId {
        self.ref_post.as_ref().map(|r| r.id).unwrap_or(self.id)
    }

    pub fn is_authored_by(&self, user_id: UserId) -> bool {
        self.user.id == user_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub content: String,
    pub created_at: NaiveDateTime,
    pub user: UserSummary,
}

/// One row of a per-category notification list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationItem {
    pub id: i64,
    #[serde(rename = "type")]
    pub category: NotificationCategory,
    pub sender: UserSummary,
    #[serde(default)]
    pub post_id: Option<PostId>,
    #[serde(default)]
    pub post_preview: Option<String>,
    #[serde(default)]
    pub comment_content: Option<String>,
    pub created_at: NaiveDateTime,
    #[serde(default, deserialize_with = "null_as_default")]
    pub read: bool,
}

/// Payload delivered by a per-category push subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub category: NotificationCategory,
    pub sender_id: UserId,
    #[serde(default)]
    pub post_id: Option<PostId>,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
}

/// Per-category unread counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UnreadCounts {
    #[serde(default)]
    pub follow: u32,
    #[serde(default)]
    pub like: u32,
    #[serde(default)]
    pub comment: u32,
}

impl UnreadCounts {
    pub fn get(&self, category: NotificationCategory) -> u32 {
        match category {
            NotificationCategory::Follow => self.follow,
            NotificationCategory::Like => self.like,
            NotificationCategory::Comment => self.comment,
        }
    }

    pub fn slot_mut(&mut self, category: NotificationCategory) -> &mut u32 {
        match category {
            NotificationCategory::Follow => &mut self.follow,
            NotificationCategory::Like => &mut self.like,
            NotificationCategory::Comment => &mut self.comment,
        }
    }

    pub fn total(&self) -> u32 {
        self.follow
            .saturating_add(self.like)
            .saturating_add(self.comment)
    }
}

/// Body of `POST /posts`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PostDraft {
    pub content: Option<String>,
    pub images: Vec<String>,
    pub visibility: Visibility,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_post_id: Option<PostId>,
}

/// Body of `PUT /posts/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PostEdit {
    pub content: Option<String>,
    pub images: Vec<String>,
    pub visibility: Visibility,
}

pub const MAX_IMAGES: usize = 9;
pub const MAX_CONTENT_CHARS: usize = 5000;
