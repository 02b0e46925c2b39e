//! Typed publish/subscribe bus for cross-component refresh signals.
//!
//! Each payload type is its own topic: subscribers ask for a `Receiver<T>`
//! and only ever see values of `T`.
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

use crate::cursor::FeedKind;
use crate::model::{FeedEntry, PostId, UnreadCounts, UserId};

pub trait Topic: Clone + Send + 'static {}

/// A feed's snapshot changed; renderers re-read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedUpdated {
    pub kind: FeedKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostCreated {
    pub entry: FeedEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostDeleted {
    pub post_id: PostId,
}

/// A user's profile counters changed locally; views holding it should refetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileChanged {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadChanged {
    pub counts: UnreadCounts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPostAvailable {
    pub entry: FeedEntry,
}

/// The backend refused the credential; the renderer redirects to login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExpired {
    pub viewer_id: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Error,
}

/// Transient user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

impl Topic for FeedUpdated {}
impl Topic for PostCreated {}
impl Topic for PostDeleted {}
impl Topic for ProfileChanged {}
impl Topic for UnreadChanged {}
impl Topic for NewPostAvailable {}
impl Topic for SessionExpired {}
impl Topic for Notice {}

pub struct EventBus {
    capacity: usize,
    topics: Mutex<HashMap<TypeId, Box<dyn Any + Send>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn sender<T: Topic>(&self) -> broadcast::Sender<T> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = topics
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(broadcast::channel::<T>(self.capacity).0));
        match slot.downcast_ref::<broadcast::Sender<T>>() {
            Some(sender) => sender.clone(),
            None => unreachable!("topic slot keyed by its own TypeId"),
        }
    }

    pub fn subscribe<T: Topic>(&self) -> broadcast::Receiver<T> {
        self.sender::<T>().subscribe()
    }

    /// Returns how many subscribers received the event.
    pub fn publish<T: Topic>(&self, event: T) -> usize {
        match self.sender::<T>().send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!(topic = std::any::type_name::<T>(), "no subscribers");
                0
            }
        }
    }
}
