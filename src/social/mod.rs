//! Boundary to the social platform hosting the contest posts.

pub mod memory;
pub mod x;

use std::{error::Error as StdError, time::Duration, time::SystemTime};

use futures::future::BoxFuture;
use thiserror::Error;

pub use memory::MemorySocialClient;
pub use x::{XClient, XConfig};

/// Result alias for social API calls.
pub type SocialResult<T> = Result<T, SocialError>;

/// A reply to a contest post, as delivered by the platform.
///
/// The feed is at-least-once: the same reply may be delivered on several polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReply {
    /// Account that wrote the reply.
    pub author_id: String,
    /// Handle of the author, when expanded by the platform.
    pub author_username: Option<String>,
    /// Platform id of the reply.
    pub external_id: String,
    /// Reply body.
    pub text: String,
    /// Publication time.
    pub timestamp: SystemTime,
}

/// Public profile data used by the engagement rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    /// Platform id.
    pub id: String,
    /// Handle without the leading `@`.
    pub username: String,
    /// Display name.
    pub name: Option<String>,
    /// Follower count at fetch time.
    pub followers_count: u64,
    /// Account creation time.
    pub created_at: Option<SystemTime>,
    /// Verified badge.
    pub verified: bool,
}

/// Failures surfaced by a [`SocialClient`].
#[derive(Debug, Error)]
pub enum SocialError {
    /// The platform throttled us; `retry_after` comes from the reset header when present.
    #[error("rate limited by the social platform")]
    RateLimited { retry_after: Option<Duration> },
    /// Credentials were rejected or lack the required scope.
    #[error("social platform rejected our credentials (HTTP {status})")]
    Unauthorized { status: u16 },
    /// The request never produced a response.
    #[error("social platform unreachable: {message}")]
    Network {
        message: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    /// The platform answered with an unexpected status.
    #[error("social platform returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
    /// The response body did not match the expected shape.
    #[error("failed to decode social platform response: {message}")]
    Decode { message: String },
}

impl SocialError {
    /// Wrap a transport failure.
    pub fn network(source: impl StdError + Send + Sync + 'static) -> Self {
        SocialError::Network {
            message: source.to_string(),
            source: Box::new(source),
        }
    }

    /// Whether the call may succeed if repeated later. Auth failures never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            SocialError::RateLimited { .. } | SocialError::Network { .. } => true,
            SocialError::Api { status, .. } => *status >= 500,
            SocialError::Unauthorized { .. } | SocialError::Decode { .. } => false,
        }
    }
}

/// Operations the lifecycle needs from the social platform.
pub trait SocialClient: Send + Sync {
    /// Publish a top-level post and return its id.
    fn post(&self, text: String) -> BoxFuture<'static, SocialResult<String>>;
    /// Reply to `post_id` and return the id of the reply.
    fn reply(&self, post_id: String, text: String) -> BoxFuture<'static, SocialResult<String>>;
    /// Every reply currently visible in the conversation started by `post_id`.
    fn fetch_replies(&self, post_id: String) -> BoxFuture<'static, SocialResult<Vec<RawReply>>>;
    /// Public profile of `user_id`.
    fn fetch_user(&self, user_id: String) -> BoxFuture<'static, SocialResult<UserInfo>>;
}
