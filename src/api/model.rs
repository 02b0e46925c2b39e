use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ApiError, ApiResult, TOKEN_EXPIRED_CODE};

/// `{ code, message, data, timestamp }` wrapper around every response.
#[derive(Deserialize, Debug)]
pub struct Envelope {
    pub code: i32,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<NaiveDateTime>,
}

/// A payload together with the server time it was produced at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamped<T> {
    pub data: T,
    pub at: Option<NaiveDateTime>,
}

impl Envelope {
    /// Succeeds only for `code == 0`.
    pub fn into_data(self) -> ApiResult<(Value, Option<NaiveDateTime>)> {
        match self.code {
            0 => Ok((self.data, self.timestamp)),
            TOKEN_EXPIRED_CODE => Err(ApiError::Unauthorized),
            code => Err(ApiError::Business {
                code,
                message: self
                    .message
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| format!("request failed with code {}", code)),
            }),
        }
    }

    pub fn decode<T: DeserializeOwned>(self) -> ApiResult<Stamped<T>> {
        let (data, at) = self.into_data()?;
        let data = serde_json::from_value(data)?;
        Ok(Stamped { data, at })
    }
}
