//! Network collaborator: the REST endpoints the sync layer consumes.
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{Config, ConfigError};
use crate::cursor::PageRequest;
use crate::error::{ApiError, ApiResult};
use crate::model::{
    Comment, CommentId, FeedEntry, NotificationCategory, PostDraft, PostEdit, PostId,
    UnreadCounts, UserId, UserSummary,
};
use crate::session::SessionContext;

pub mod model;

pub use model::{Envelope, Stamped};

#[async_trait]
pub trait FeedApi: Send + Sync {
    /// Raw `data` of one page; interpretation belongs to the cursor protocol.
    async fn fetch_page(&self, request: &PageRequest) -> ApiResult<Value>;

    async fn create_post(&self, draft: &PostDraft) -> ApiResult<FeedEntry>;

    async fn update_post(&self, id: PostId, edit: &PostEdit) -> ApiResult<FeedEntry>;

    async fn delete_post(&self, id: PostId) -> ApiResult<()>;

    async fn like_post(&self, id: PostId) -> ApiResult<()>;

    async fn unlike_post(&self, id: PostId) -> ApiResult<()>;

    async fn list_comments(&self, post_id: PostId) -> ApiResult<Vec<Comment>>;

    async fn create_comment(&self, post_id: PostId, content: &str) -> ApiResult<Comment>;

    async fn delete_comment(&self, comment_id: CommentId) -> ApiResult<()>;

    async fn follow(&self, user_id: UserId) -> ApiResult<()>;

    async fn unfollow(&self, user_id: UserId) -> ApiResult<()>;

    async fn user_profile(&self, user_id: UserId) -> ApiResult<UserSummary>;

    async fn unread_counts(&self) -> ApiResult<Stamped<UnreadCounts>>;

    async fn mark_read(&self, category: NotificationCategory) -> ApiResult<()>;
}

/// JSON-over-HTTP implementation of [`FeedApi`].
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    session: SessionContext,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(base_url: Url, timeout: Duration, session: SessionContext) -> ApiResult<Self> {
        let http = Client::builder()
            .user_agent("weibo-sync/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            session,
        })
    }

    pub fn from_config(cfg: &Config, session: SessionContext) -> Result<Self, ConfigError> {
        let base_url = cfg.base_url()?;
        Self::new(base_url, cfg.request_timeout(), session)
            .map_err(|_| ConfigError::Invalid("api settings do not produce an HTTP client"))
    }

    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> ApiResult<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .map_err(|e| ApiError::Transport(format!("invalid endpoint {}: {}", path, e)))?;
        let mut builder = self
            .http
            .request(method, endpoint)
            .header("Content-Type", "application/json");
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(token) = self.session.token() {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Ok(builder.build()?)
    }

    async fn execute(&self, request: reqwest::Request) -> ApiResult<Envelope> {
        debug!(method = %request.method(), url = %request.url(), "sending request");
        let res = self.http.execute(request).await?;
        let status = res.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(%status, "credential rejected");
            return Err(ApiError::Unauthorized);
        }

        let text = res.text().await?;
        if !status.is_success() {
            // Business failures may still arrive wrapped in an envelope.
            if let Ok(envelope) = serde_json::from_str::<Envelope>(&text) {
                if envelope.code != 0 {
                    envelope.into_data()?;
                }
            }
            warn!(%status, body = %text, "request failed");
            return Err(ApiError::Transport(format!("http {}", status)));
        }

        Ok(serde_json::from_str(&text)?)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> ApiResult<Stamped<T>> {
        let request = self.build_request(method, path, query, body)?;
        self.execute(request).await?.decode()
    }
}

#[async_trait]
impl FeedApi for ApiClient {
    async fn fetch_page(&self, request: &PageRequest) -> ApiResult<Value> {
        let query = request.query();
        let page: Stamped<Value> = self.call(Method::GET, &request.path, &query, None).await?;
        Ok(page.data)
    }

    async fn create_post(&self, draft: &PostDraft) -> ApiResult<FeedEntry> {
        let body = serde_json::to_value(draft)?;
        let created: Stamped<FeedEntry> = self.call(Method::POST, "posts", &[], Some(&body)).await?;
        Ok(created.data.flatten_reference())
    }

    async fn update_post(&self, id: PostId, edit: &PostEdit) -> ApiResult<FeedEntry> {
        let body = serde_json::to_value(edit)?;
        let updated: Stamped<FeedEntry> = self
            .call(Method::PUT, &format!("posts/{}", id), &[], Some(&body))
            .await?;
        Ok(updated.data.flatten_reference())
    }

    async fn delete_post(&self, id: PostId) -> ApiResult<()> {
        self.call::<Value>(Method::DELETE, &format!("posts/{}", id), &[], None)
            .await
            .map(|_| ())
    }

    async fn like_post(&self, id: PostId) -> ApiResult<()> {
        self.call::<Value>(Method::POST, &format!("posts/{}/like", id), &[], None)
            .await
            .map(|_| ())
    }

    async fn unlike_post(&self, id: PostId) -> ApiResult<()> {
        self.call::<Value>(Method::DELETE, &format!("posts/{}/like", id), &[], None)
            .await
            .map(|_| ())
    }

    async fn list_comments(&self, post_id: PostId) -> ApiResult<Vec<Comment>> {
        let comments: Stamped<Option<Vec<Comment>>> = self
            .call(Method::GET, &format!("posts/{}/comments", post_id), &[], None)
            .await?;
        Ok(comments.data.unwrap_or_default())
    }

    async fn create_comment(&self, post_id: PostId, content: &str) -> ApiResult<Comment> {
        let body = json!({ "content": content });
        let created: Stamped<Comment> = self
            .call(Method::POST, &format!("posts/{}/comments", post_id), &[], Some(&body))
            .await?;
        Ok(created.data)
    }

    async fn delete_comment(&self, comment_id: CommentId) -> ApiResult<()> {
        self.call::<Value>(Method::DELETE, &format!("comments/{}", comment_id), &[], None)
            .await
            .map(|_| ())
    }

    async fn follow(&self, user_id: UserId) -> ApiResult<()> {
        self.call::<Value>(Method::POST, &format!("follow/{}", user_id), &[], None)
            .await
            .map(|_| ())
    }

    async fn unfollow(&self, user_id: UserId) -> ApiResult<()> {
        self.call::<Value>(Method::DELETE, &format!("follow/{}", user_id), &[], None)
            .await
            .map(|_| ())
    }

    async fn user_profile(&self, user_id: UserId) -> ApiResult<UserSummary> {
        let profile: Stamped<UserSummary> = self
            .call(Method::GET, &format!("user/{}", user_id), &[], None)
            .await?;
        Ok(profile.data)
    }

    async fn unread_counts(&self) -> ApiResult<Stamped<UnreadCounts>> {
        self.call(Method::GET, "notification/unread-count", &[], None)
            .await
    }

    async fn mark_read(&self, category: NotificationCategory) -> ApiResult<()> {
        let query = [("type", category.as_str().to_string())];
        self.call::<Value>(Method::POST, "notification/mark-read", &query, None)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{build_request, Cursor, FeedKind};

    fn client(session: SessionContext) -> ApiClient {
        let base = Url::parse("http://localhost:8080/").unwrap();
        ApiClient::new(base, Duration::from_secs(5), session).unwrap()
    }

    #[test]
    fn build_request_sets_bearer_when_logged_in() {
        let session = SessionContext::new();
        session.authenticate("token", 1);
        let request = client(session)
            .build_request(Method::POST, "posts/9/like", &[], None)
            .unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().path(), "/posts/9/like");
        let headers = request.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
        assert_eq!(
            headers
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
    }

    #[test]
    fn build_request_without_session_has_no_bearer() {
        let request = client(SessionContext::new())
            .build_request(Method::GET, "posts", &[], None)
            .unwrap();
        assert!(request.headers().get("Authorization").is_none());
    }

    #[test]
    fn page_request_query_is_encoded() {
        let page = build_request(&FeedKind::Global, Some(Cursor::Timestamp(1700)), 10);
        let query = page.query();
        let request = client(SessionContext::new())
            .build_request(Method::GET, &page.path, &query, None)
            .unwrap();
        assert_eq!(request.url().path(), "/posts");
        assert_eq!(request.url().query(), Some("size=10&cursor=1700"));
    }

    #[test]
    fn mark_read_uses_lowercase_category() {
        let query = [("type", NotificationCategory::Comment.as_str().to_string())];
        let request = client(SessionContext::new())
            .build_request(Method::POST, "notification/mark-read", &query, None)
            .unwrap();
        assert_eq!(request.url().query(), Some("type=comment"));
    }
}
