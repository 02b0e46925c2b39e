//! Failure taxonomy shared by every component.
use thiserror::Error;

/// Business code the backend uses for an expired bearer token.
pub const TOKEN_EXPIRED_CODE: i32 = 2001;

/// A request that reached (or tried to reach) the backend and did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("authentication expired or missing")]
    Unauthorized,
    #[error("{message}")]
    Business { code: i32, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// Outcome of a store, coordinator or aggregator operation that did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("please log in first")]
    AuthenticationRequired,
    #[error("the same action is already in progress")]
    AlreadyPending,
    #[error("{0}")]
    Invalid(&'static str),
    #[error("entry {0} is not loaded")]
    NotLoaded(i64),
    #[error(transparent)]
    Api(#[from] ApiError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Rejected before any store mutation or network call.
    pub fn is_precondition(&self) -> bool {
        !matches!(self, SyncError::Api(_))
    }

    /// Either an explicit precondition or a credential the backend refused.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            SyncError::AuthenticationRequired | SyncError::Api(ApiError::Unauthorized)
        )
    }
}
