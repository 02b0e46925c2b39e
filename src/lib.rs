//! Client-side synchronization core for a microblog: paginated feeds,
//! optimistic mutations and unread notification counters.
pub mod api;
pub mod bus;
pub mod comments;
pub mod config;
pub mod context;
pub mod cursor;
pub mod error;
pub mod merge;
pub mod model;
pub mod mutation;
pub mod notification;
pub mod profile;
pub mod push;
pub mod session;
pub mod store;

pub use context::SyncContext;
pub use error::{ApiError, Result, SyncError};
