mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use common::{notification, posts, signed_in, user, FakeBackend, VIEWER};
use weibo_sync::bus::{FeedUpdated, SessionExpired};
use weibo_sync::cursor::{FeedKind, Relation};
use weibo_sync::model::NotificationCategory;
use weibo_sync::store::LoadOutcome;
use weibo_sync::{ApiError, SyncError};

fn ids<T: weibo_sync::merge::Identified>(items: &[T]) -> Vec<i64> {
    items.iter().map(|i| i.id()).collect()
}

#[tokio::test]
async fn global_timeline_pages_until_short_page() {
    let backend = FakeBackend::with_posts(posts(25));
    let ctx = signed_in(backend.clone());

    let first = ctx.posts.load_initial(FeedKind::Global).await.unwrap();
    assert_eq!(
        first,
        LoadOutcome::Loaded {
            appended: 10,
            exhausted: false
        }
    );

    let second = ctx.posts.load_more(FeedKind::Global).await.unwrap();
    assert_eq!(
        second,
        LoadOutcome::Loaded {
            appended: 10,
            exhausted: false
        }
    );

    let third = ctx.posts.load_more(FeedKind::Global).await.unwrap();
    assert_eq!(
        third,
        LoadOutcome::Loaded {
            appended: 5,
            exhausted: true
        }
    );

    let snapshot = ctx.posts.snapshot(FeedKind::Global);
    assert_eq!(ids(&snapshot.entries), (1..=25).rev().collect::<Vec<_>>());
    assert!(snapshot.exhausted);

    // Exhausted: no further fetch is issued.
    assert_eq!(
        ctx.posts.load_more(FeedKind::Global).await.unwrap(),
        LoadOutcome::Skipped
    );
    assert_eq!(backend.calls("fetch_page"), 3);
}

#[tokio::test]
async fn boundary_repeats_are_not_duplicated() {
    let backend = FakeBackend::with_posts(posts(25));
    backend.overlap.store(true, Ordering::SeqCst);
    let ctx = signed_in(backend.clone());

    ctx.posts.load_initial(FeedKind::Following).await.unwrap();
    let mut rounds = 0;
    loop {
        match ctx.posts.load_more(FeedKind::Following).await.unwrap() {
            LoadOutcome::Skipped => break,
            LoadOutcome::Loaded { .. } => rounds += 1,
        }
        assert!(rounds < 10, "pagination did not terminate");
    }

    let entries = ctx.posts.snapshot(FeedKind::Following).entries;
    let unique: HashSet<i64> = entries.iter().map(|e| e.id).collect();
    assert_eq!(unique.len(), entries.len());
    assert_eq!(entries.len(), 25);
}

#[tokio::test]
async fn load_more_without_initial_page_is_noop() {
    let backend = FakeBackend::with_posts(posts(5));
    let ctx = signed_in(backend.clone());

    assert_eq!(
        ctx.posts.load_more(FeedKind::Friends).await.unwrap(),
        LoadOutcome::Skipped
    );
    assert_eq!(backend.total_calls(), 0);
}

#[tokio::test]
async fn empty_feed_is_exhausted_immediately() {
    let backend = FakeBackend::new();
    let ctx = signed_in(backend.clone());

    let outcome = ctx.posts.load_initial(FeedKind::Friends).await.unwrap();
    assert_eq!(
        outcome,
        LoadOutcome::Loaded {
            appended: 0,
            exhausted: true
        }
    );
    assert_eq!(
        ctx.posts.load_more(FeedKind::Friends).await.unwrap(),
        LoadOutcome::Skipped
    );
}

#[tokio::test]
async fn concurrent_initial_loads_are_coalesced() {
    let backend = FakeBackend::with_posts(posts(12));
    let ctx = signed_in(backend.clone());
    backend.hold("fetch_page");

    let first = ctx.posts.load_initial(FeedKind::Global);
    let second = async {
        backend.entered("fetch_page").await;
        let outcome = ctx.posts.load_initial(FeedKind::Global).await;
        assert!(ctx.posts.snapshot(FeedKind::Global).loading_initial);
        backend.release("fetch_page");
        outcome
    };
    let (first, second) = tokio::join!(first, second);

    assert!(matches!(first.unwrap(), LoadOutcome::Loaded { appended: 10, .. }));
    assert_eq!(second.unwrap(), LoadOutcome::Skipped);
    assert_eq!(backend.calls("fetch_page"), 1);
}

#[tokio::test]
async fn concurrent_appends_are_coalesced() {
    let backend = FakeBackend::with_posts(posts(30));
    let ctx = signed_in(backend.clone());
    ctx.posts.load_initial(FeedKind::Global).await.unwrap();
    backend.hold("fetch_page");

    let first = ctx.posts.load_more(FeedKind::Global);
    let second = async {
        backend.entered("fetch_page").await;
        let outcome = ctx.posts.load_more(FeedKind::Global).await;
        backend.release("fetch_page");
        outcome
    };
    let (first, second) = tokio::join!(first, second);

    assert!(matches!(first.unwrap(), LoadOutcome::Loaded { appended: 10, .. }));
    assert_eq!(second.unwrap(), LoadOutcome::Skipped);
    assert_eq!(ctx.posts.snapshot(FeedKind::Global).entries.len(), 20);
}

#[tokio::test]
async fn reload_discards_a_stale_append() {
    let backend = FakeBackend::with_posts(posts(30));
    let ctx = signed_in(backend.clone());
    ctx.posts.load_initial(FeedKind::Following).await.unwrap();
    backend.hold("fetch_page");

    let append = ctx.posts.load_more(FeedKind::Following);
    let reload = async {
        backend.entered("fetch_page").await;
        // The append is parked at the backend; reset the feed underneath it.
        backend.release("fetch_page");
        ctx.posts.load_initial(FeedKind::Following).await
    };
    let (append, reload) = tokio::join!(append, reload);

    assert_eq!(append.unwrap(), LoadOutcome::Skipped);
    assert!(matches!(reload.unwrap(), LoadOutcome::Loaded { appended: 10, .. }));
    let entries = ctx.posts.snapshot(FeedKind::Following).entries;
    assert_eq!(ids(&entries), (21..=30).rev().collect::<Vec<_>>());
}

#[tokio::test]
async fn failed_page_keeps_entries_and_allows_retry() {
    let backend = FakeBackend::with_posts(posts(25));
    let ctx = signed_in(backend.clone());
    ctx.posts.load_initial(FeedKind::Global).await.unwrap();

    backend.fail_next("fetch_page", ApiError::Transport("timeout".into()));
    let err = ctx.posts.load_more(FeedKind::Global).await.unwrap_err();
    assert_eq!(err, SyncError::Api(ApiError::Transport("timeout".into())));

    let snapshot = ctx.posts.snapshot(FeedKind::Global);
    assert_eq!(snapshot.entries.len(), 10);
    assert!(!snapshot.loading_more);
    assert!(snapshot.last_error.is_some());

    let retry = ctx.posts.load_more(FeedKind::Global).await.unwrap();
    assert!(matches!(retry, LoadOutcome::Loaded { appended: 10, .. }));
    assert!(ctx.posts.snapshot(FeedKind::Global).last_error.is_none());
}

#[tokio::test]
async fn unauthorized_page_ends_the_session() {
    let backend = FakeBackend::with_posts(posts(3));
    let ctx = signed_in(backend.clone());
    let mut expired = ctx.bus.subscribe::<SessionExpired>();

    backend.fail_next("fetch_page", ApiError::Unauthorized);
    let err = ctx.posts.load_initial(FeedKind::Global).await.unwrap_err();
    assert!(err.requires_login());
    assert!(!ctx.session.is_authenticated());
    assert_eq!(
        expired.try_recv().unwrap(),
        SessionExpired {
            viewer_id: Some(VIEWER)
        }
    );
}

#[tokio::test]
async fn liked_feed_follows_server_cursor() {
    let backend = FakeBackend::with_posts(posts(15));
    let ctx = signed_in(backend.clone());

    ctx.posts.load_initial(FeedKind::Liked(VIEWER)).await.unwrap();
    let outcome = ctx.posts.load_more(FeedKind::Liked(VIEWER)).await.unwrap();
    assert_eq!(
        outcome,
        LoadOutcome::Loaded {
            appended: 5,
            exhausted: true
        }
    );
    assert_eq!(ctx.posts.snapshot(FeedKind::Liked(VIEWER)).entries.len(), 15);
}

#[tokio::test]
async fn relation_lists_page_users() {
    let backend = FakeBackend::new();
    *backend.users.lock().await = (1..=12).rev().map(|id| user(id, "someone")).collect();
    let ctx = signed_in(backend.clone());
    let kind = FeedKind::Relations(VIEWER, Relation::Followers);

    ctx.users.load_initial(kind).await.unwrap();
    ctx.users.load_more(kind).await.unwrap();
    let snapshot = ctx.users.snapshot(kind);
    assert_eq!(ids(&snapshot.entries), (1..=12).rev().collect::<Vec<_>>());
    assert!(snapshot.exhausted);
}

#[tokio::test]
async fn notification_lists_are_per_category() {
    let backend = FakeBackend::new();
    *backend.notifications.lock().await = vec![
        notification(5, NotificationCategory::Like),
        notification(4, NotificationCategory::Comment),
        notification(3, NotificationCategory::Like),
    ];
    let ctx = signed_in(backend.clone());
    let kind = FeedKind::Notifications(NotificationCategory::Like);

    ctx.notifications.load_initial(kind).await.unwrap();
    assert_eq!(ids(&ctx.notifications.snapshot(kind).entries), vec![5, 3]);
}

#[tokio::test]
async fn remove_reaches_every_feed() {
    let backend = FakeBackend::with_posts(posts(5));
    let ctx = signed_in(backend.clone());
    ctx.posts.load_initial(FeedKind::Global).await.unwrap();
    ctx.posts.load_initial(FeedKind::Liked(VIEWER)).await.unwrap();
    ctx.posts.load_initial(FeedKind::Friends).await.unwrap();
    let mut updates = ctx.bus.subscribe::<FeedUpdated>();

    assert_eq!(ctx.posts.remove(3), 3);
    for kind in [FeedKind::Global, FeedKind::Liked(VIEWER), FeedKind::Friends] {
        assert_eq!(ids(&ctx.posts.snapshot(kind).entries), vec![5, 4, 2, 1]);
    }
    assert!(updates.try_recv().is_ok());
    assert_eq!(ctx.posts.remove(3), 0);
}

#[tokio::test]
async fn prepend_only_touches_loaded_feeds() {
    let backend = FakeBackend::with_posts(posts(3));
    let ctx = signed_in(backend.clone());
    ctx.posts.load_initial(FeedKind::Global).await.unwrap();

    assert!(ctx.posts.prepend(FeedKind::Global, common::post(99, VIEWER)));
    assert!(!ctx.posts.prepend(FeedKind::UserPosts(VIEWER), common::post(99, VIEWER)));
    assert_eq!(ids(&ctx.posts.snapshot(FeedKind::Global).entries), vec![99, 3, 2, 1]);

    // Prepending a known identity moves it rather than duplicating it.
    assert!(ctx.posts.prepend(FeedKind::Global, common::post(2, 2)));
    assert_eq!(ids(&ctx.posts.snapshot(FeedKind::Global).entries), vec![2, 99, 3, 1]);
}

#[tokio::test]
#[should_panic(expected = "wrong store")]
async fn feed_kind_must_match_store_item() {
    let backend = FakeBackend::new();
    let ctx = signed_in(backend);
    let _ = ctx.users.load_initial(FeedKind::Global).await;
}
