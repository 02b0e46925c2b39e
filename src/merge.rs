//! Pure list primitives shared by the stores. No I/O, no failure modes.
use std::collections::HashSet;

use crate::model::{Comment, FeedEntry, NotificationItem, UserSummary};

/// Stable identity of an item held in a paginated sequence.
pub trait Identified {
    fn id(&self) -> i64;
}

impl Identified for FeedEntry {
    fn id(&self) -> i64 {
        self.id
    }
}

impl Identified for UserSummary {
    fn id(&self) -> i64 {
        self.id
    }
}

impl Identified for NotificationItem {
    fn id(&self) -> i64 {
        self.id
    }
}

impl Identified for Comment {
    fn id(&self) -> i64 {
        self.id
    }
}

/// Entries of `incoming` whose identity is absent from `existing`, in incoming order.
/// Repeats inside `incoming` itself are dropped too.
pub fn dedup_append<T: Identified>(existing: &[T], incoming: Vec<T>) -> Vec<T> {
    let mut seen: HashSet<i64> = existing.iter().map(Identified::id).collect();
    incoming
        .into_iter()
        .filter(|item| seen.insert(item.id()))
        .collect()
}

/// A copy of `sequence` without the item carrying `id`.
pub fn splice_remove<T: Identified + Clone>(sequence: &[T], id: i64) -> Vec<T> {
    sequence.iter().filter(|item| item.id() != id).cloned().collect()
}

/// Put `item` at the head, dropping any older copy with the same identity.
pub fn prepend_unique<T: Identified>(sequence: &mut Vec<T>, item: T) {
    let id = item.id();
    sequence.retain(|existing| existing.id() != id);
    sequence.insert(0, item);
}

pub fn contains<T: Identified>(sequence: &[T], id: i64) -> bool {
    sequence.iter().any(|item| item.id() == id)
}
