//! Server-initiated event delivery and the loop that feeds it into the
//! aggregator and the bus.
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::bus::{EventBus, NewPostAvailable};
use crate::config;
use crate::error::{ApiError, ApiResult};
use crate::model::{FeedEntry, NotificationCategory, NotificationEvent};
use crate::notification::NotificationAggregator;
use crate::session::{Session, SessionContext};

/// One subscription of the push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushTopic {
    Notifications(NotificationCategory),
    NewPosts,
}

impl PushTopic {
    pub const ALL: [PushTopic; 4] = [
        PushTopic::Notifications(NotificationCategory::Follow),
        PushTopic::Notifications(NotificationCategory::Like),
        PushTopic::Notifications(NotificationCategory::Comment),
        PushTopic::NewPosts,
    ];

    pub fn destination(&self) -> &'static str {
        match self {
            PushTopic::Notifications(NotificationCategory::Follow) => "/user/queue/follow",
            PushTopic::Notifications(NotificationCategory::Like) => "/user/queue/like",
            PushTopic::Notifications(NotificationCategory::Comment) => "/user/queue/comment",
            PushTopic::NewPosts => "/topic/posts",
        }
    }

    pub fn from_destination(destination: &str) -> Option<PushTopic> {
        PushTopic::ALL
            .into_iter()
            .find(|t| t.destination() == destination)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMessage {
    Notification(NotificationEvent),
    NewPost(FeedEntry),
}

impl PushMessage {
    pub fn topic(&self) -> PushTopic {
        match self {
            PushMessage::Notification(event) => PushTopic::Notifications(event.category),
            PushMessage::NewPost(_) => PushTopic::NewPosts,
        }
    }

    /// Decode a message body delivered on `destination`.
    pub fn decode(destination: &str, body: &str) -> ApiResult<PushMessage> {
        match PushTopic::from_destination(destination) {
            Some(PushTopic::Notifications(category)) => {
                let mut event: NotificationEvent = serde_json::from_str(body)?;
                // The destination is authoritative for the category.
                event.category = category;
                Ok(PushMessage::Notification(event))
            }
            Some(PushTopic::NewPosts) => {
                let entry: FeedEntry = serde_json::from_str(body)?;
                Ok(PushMessage::NewPost(entry.flatten_reference()))
            }
            None => Err(ApiError::Decode(format!(
                "unknown push destination {}",
                destination
            ))),
        }
    }
}

#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Open the subscriptions for `session`, authenticating with its bearer
    /// token. The stream ends when the connection drops.
    async fn connect(&self, session: &Session) -> ApiResult<BoxStream<'static, PushMessage>>;
}

#[derive(Debug, Default)]
struct Subscribers {
    live: Vec<mpsc::UnboundedSender<PushMessage>>,
    refusals: VecDeque<ApiError>,
    connects: usize,
}

/// In-process push channel: messages handed to [`ChannelPush::send`] reach
/// every live connection.
#[derive(Debug, Default)]
pub struct ChannelPush {
    inner: Mutex<Subscribers>,
}

impl ChannelPush {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns how many connections received the message.
    pub fn send(&self, message: PushMessage) -> usize {
        let mut inner = self.lock();
        inner.live.retain(|tx| tx.send(message.clone()).is_ok());
        inner.live.len()
    }

    /// Fail the next connection attempt with `err`.
    pub fn refuse_next(&self, err: ApiError) {
        self.lock().refusals.push_back(err);
    }

    /// End every live stream, as a dropped connection would.
    pub fn disconnect_all(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.live.len();
        inner.live.clear();
        n
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn live_connections(&self) -> usize {
        let mut inner = self.lock();
        inner.live.retain(|tx| !tx.is_closed());
        inner.live.len()
    }
}

#[async_trait]
impl PushChannel for ChannelPush {
    async fn connect(&self, session: &Session) -> ApiResult<BoxStream<'static, PushMessage>> {
        let mut inner = self.lock();
        inner.connects += 1;
        if let Some(err) = inner.refusals.pop_front() {
            return Err(err);
        }
        if session.token.is_empty() {
            return Err(ApiError::Unauthorized);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.live.push(tx);
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) }).boxed())
    }
}

/// Capped exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    /// A zero `cap` leaves the delay uncapped.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn from_config(push: &config::Push) -> Self {
        Self::new(
            Duration::from_millis(push.reconnect_delay_ms),
            Duration::from_secs(push.max_backoff_seconds),
        )
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.saturating_mul(1 << attempt.min(10));
        if self.cap.is_zero() {
            delay
        } else {
            delay.min(self.cap)
        }
    }
}

fn dispatch(
    message: PushMessage,
    session: &Session,
    aggregator: &NotificationAggregator,
    bus: &EventBus,
) {
    match message {
        PushMessage::Notification(event) => {
            aggregator.on_push_event(event);
        }
        PushMessage::NewPost(entry) => {
            // The viewer's own posts are already prepended locally.
            if entry.is_authored_by(session.viewer_id) {
                return;
            }
            bus.publish(NewPostAvailable { entry });
        }
    }
}

/// Keep a push connection open for `session` until it stops being the
/// current session. Every successful connection re-seeds the unread
/// counters while events keep flowing into the aggregator.
#[instrument(skip_all, fields(viewer_id = session.viewer_id, generation = session.generation))]
pub async fn run_push_loop(
    channel: Arc<dyn PushChannel>,
    aggregator: Arc<NotificationAggregator>,
    sessions: SessionContext,
    bus: Arc<EventBus>,
    session: Session,
    backoff: Backoff,
) {
    let mut attempt: u32 = 0;
    let mut connected_before = false;

    while sessions.is_current(&session) {
        match channel.connect(&session).await {
            Ok(mut messages) => {
                info!(reconnect = connected_before, "push channel connected");
                attempt = 0;
                let resync = connected_before;
                connected_before = true;

                let mut snapshot = Box::pin(async {
                    if resync {
                        aggregator.resync().await
                    } else {
                        aggregator.initialize().await
                    }
                });
                let mut seeded = false;
                loop {
                    tokio::select! {
                        res = &mut snapshot, if !seeded => {
                            seeded = true;
                            if let Err(err) = res {
                                warn!(%err, "unread snapshot after connect failed");
                            }
                        }
                        next = messages.next() => match next {
                            Some(message) => {
                                if !sessions.is_current(&session) {
                                    debug!("session ended; closing push loop");
                                    return;
                                }
                                dispatch(message, &session, &aggregator, &bus);
                            }
                            None => break,
                        }
                    }
                }
                if !seeded {
                    if let Err(err) = snapshot.await {
                        warn!(%err, "unread snapshot after connect failed");
                    }
                }
                warn!("push channel dropped");
            }
            Err(ApiError::Unauthorized) => {
                warn!("push handshake rejected the credential");
                sessions.expire(&bus);
                return;
            }
            Err(err) => {
                warn!(%err, attempt, "push connect failed");
            }
        }

        if !sessions.is_current(&session) {
            break;
        }
        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(?delay, "reconnecting after delay");
        tokio::time::sleep(delay).await;
    }
    info!("push loop stopped");
}
