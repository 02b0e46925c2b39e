//! Per-feed-kind pagination protocol: request building, cursor advancement
//! and exhaustion detection.
use chrono::{FixedOffset, NaiveDateTime, Offset, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

use crate::error::{ApiError, ApiResult};
use crate::merge::Identified;
use crate::model::{FeedEntry, NotificationCategory, NotificationItem, UserId, UserSummary};

pub const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Following,
    Followers,
    Friends,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Following => "following",
            Relation::Followers => "followers",
            Relation::Friends => "friends",
        }
    }
}

/// One independently paginated view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    /// Everyone's newest posts, backed by a recency index.
    Global,
    /// Posts by mutual follows.
    Friends,
    /// Posts by followed users.
    Following,
    UserPosts(UserId),
    Liked(UserId),
    Relations(UserId, Relation),
    Notifications(NotificationCategory),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorShape {
    Identity,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Post,
    User,
    Notification,
}

impl FeedKind {
    pub fn shape(&self) -> CursorShape {
        match self {
            FeedKind::Global | FeedKind::Liked(_) => CursorShape::Timestamp,
            FeedKind::Friends
            | FeedKind::Following
            | FeedKind::UserPosts(_)
            | FeedKind::Relations(..)
            | FeedKind::Notifications(_) => CursorShape::Identity,
        }
    }

    pub fn item_kind(&self) -> ItemKind {
        match self {
            FeedKind::Relations(..) => ItemKind::User,
            FeedKind::Notifications(_) => ItemKind::Notification,
            _ => ItemKind::Post,
        }
    }

    /// Endpoint path relative to the API base URL.
    pub fn path(&self) -> String {
        match self {
            FeedKind::Global => "posts".to_string(),
            FeedKind::Friends => "posts/friends".to_string(),
            FeedKind::Following => "posts/following".to_string(),
            FeedKind::UserPosts(uid) => format!("user/{}/posts", uid),
            FeedKind::Liked(uid) => format!("user/{}/liked", uid),
            FeedKind::Relations(uid, relation) => format!("user/{}/{}", uid, relation.as_str()),
            FeedKind::Notifications(_) => "notification/list".to_string(),
        }
    }

    pub fn cursor_param(&self) -> &'static str {
        match self.shape() {
            CursorShape::Identity => "lastId",
            CursorShape::Timestamp => "cursor",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedKind::Global => write!(f, "global"),
            FeedKind::Friends => write!(f, "friends"),
            FeedKind::Following => write!(f, "following"),
            FeedKind::UserPosts(uid) => write!(f, "user:{}", uid),
            FeedKind::Liked(uid) => write!(f, "liked:{}", uid),
            FeedKind::Relations(uid, relation) => write!(f, "{}:{}", relation.as_str(), uid),
            FeedKind::Notifications(category) => write!(f, "notifications:{}", category.as_str()),
        }
    }
}

/// Opaque position marker; a feed kind only ever uses one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Identity(i64),
    /// Epoch millis in the backend's zone.
    Timestamp(i64),
}

impl Cursor {
    pub fn shape(&self) -> CursorShape {
        match self {
            Cursor::Identity(_) => CursorShape::Identity,
            Cursor::Timestamp(_) => CursorShape::Timestamp,
        }
    }

    pub fn value(&self) -> i64 {
        match self {
            Cursor::Identity(v) | Cursor::Timestamp(v) => *v,
        }
    }
}

/// Everything the network collaborator needs to issue one page fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub kind: FeedKind,
    pub path: String,
    pub size: u32,
    pub cursor: Option<Cursor>,
}

impl PageRequest {
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::with_capacity(3);
        if let FeedKind::Notifications(category) = self.kind {
            query.push(("type", category.as_query().to_string()));
        }
        query.push(("size", self.size.to_string()));
        if let Some(cursor) = self.cursor {
            query.push((self.kind.cursor_param(), cursor.value().to_string()));
        }
        query
    }
}

/// An item type that can be paginated.
pub trait PageItem: Identified + DeserializeOwned + Clone + Send + Sync + 'static {
    const ITEM: ItemKind;

    /// Creation time, required for recency-ordered kinds.
    fn created_at(&self) -> Option<NaiveDateTime> {
        None
    }

    fn normalize(self) -> Self {
        self
    }
}

impl PageItem for FeedEntry {
    const ITEM: ItemKind = ItemKind::Post;

    fn created_at(&self) -> Option<NaiveDateTime> {
        Some(self.created_at)
    }

    fn normalize(self) -> Self {
        self.flatten_reference()
    }
}

impl PageItem for UserSummary {
    const ITEM: ItemKind = ItemKind::User;
}

impl PageItem for NotificationItem {
    const ITEM: ItemKind = ItemKind::Notification;

    fn created_at(&self) -> Option<NaiveDateTime> {
        Some(self.created_at)
    }
}

/// One decoded page; `next_cursor` is set only when the server supplies it.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<Cursor>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LikedPage<T> {
    posts: Option<Vec<T>>,
    next_cursor: Option<i64>,
}

/// Build the request for the page after `cursor`.
///
/// # Panics
/// If `page_size` is zero or `cursor` has the wrong shape for `kind`.
pub fn build_request(kind: &FeedKind, cursor: Option<Cursor>, page_size: u32) -> PageRequest {
    assert!(page_size > 0, "page size must be positive");
    if let Some(cursor) = cursor {
        assert_eq!(
            cursor.shape(),
            kind.shape(),
            "cursor {:?} does not fit feed kind {}",
            cursor,
            kind
        );
    }
    PageRequest {
        kind: *kind,
        path: kind.path(),
        size: page_size,
        cursor,
    }
}

/// The sole exhaustion signal: a short page.
pub fn is_exhausted(page_len: usize, page_size: u32) -> bool {
    page_len < page_size as usize
}

#[derive(Debug, Clone, Copy)]
pub struct CursorProtocol {
    page_size: u32,
    server_offset: FixedOffset,
}

impl Default for CursorProtocol {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE, Utc.fix())
    }
}

impl CursorProtocol {
    pub fn new(page_size: u32, server_offset: FixedOffset) -> Self {
        assert!(page_size > 0, "page size must be positive");
        Self {
            page_size,
            server_offset,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn build_request(&self, kind: &FeedKind, cursor: Option<Cursor>) -> PageRequest {
        build_request(kind, cursor, self.page_size)
    }

    pub fn is_exhausted(&self, page_len: usize) -> bool {
        is_exhausted(page_len, self.page_size)
    }

    /// Epoch millis the backend would compute for a local timestamp.
    pub fn epoch_millis(&self, at: NaiveDateTime) -> i64 {
        at.and_utc().timestamp_millis() - i64::from(self.server_offset.local_minus_utc()) * 1000
    }

    /// # Panics
    /// If a recency-ordered kind is paired with an item that has no creation time.
    pub fn advance_cursor<T: PageItem>(&self, kind: &FeedKind, last: &T) -> Cursor {
        match kind.shape() {
            CursorShape::Identity => Cursor::Identity(last.id()),
            CursorShape::Timestamp => {
                let created = last
                    .created_at()
                    .unwrap_or_else(|| panic!("feed kind {} needs timestamped items", kind));
                Cursor::Timestamp(self.epoch_millis(created))
            }
        }
    }

    /// Cursor to continue from after `page`; `None` for an empty page.
    pub fn next_cursor<T: PageItem>(&self, kind: &FeedKind, page: &Page<T>) -> Option<Cursor> {
        if page.items.is_empty() {
            return None;
        }
        page.next_cursor
            .or_else(|| page.items.last().map(|last| self.advance_cursor(kind, last)))
    }

    /// Interpret a page body (`data` of the envelope) for `kind`.
    pub fn decode_page<T: PageItem>(&self, kind: &FeedKind, body: Value) -> ApiResult<Page<T>> {
        if kind.item_kind() != T::ITEM {
            return Err(ApiError::Decode(format!(
                "feed kind {} does not hold {:?} items",
                kind,
                T::ITEM
            )));
        }
        let (items, next_cursor) = match kind {
            FeedKind::Liked(_) => {
                let liked: LikedPage<T> = serde_json::from_value(body)?;
                (
                    liked.posts.unwrap_or_default(),
                    liked.next_cursor.map(Cursor::Timestamp),
                )
            }
            _ if body.is_null() => (Vec::new(), None),
            _ => (serde_json::from_value::<Vec<T>>(body)?, None),
        };
        Ok(Page {
            items: items.into_iter().map(PageItem::normalize).collect(),
            next_cursor,
        })
    }
}
