//! In-process social platform used for dry runs and tests.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::info;

use super::{RawReply, SocialClient, SocialError, SocialResult, UserInfo};

/// A message published through [`MemorySocialClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPost {
    /// Id handed back to the caller.
    pub id: String,
    /// Message body.
    pub text: String,
    /// Parent post for replies.
    pub in_reply_to: Option<String>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    posts: DashMap<String, PublishedPost>,
    replies: DashMap<String, Vec<RawReply>>,
    users: DashMap<String, UserInfo>,
    fetch_failures: AtomicU32,
    fetch_calls: AtomicU32,
    user_failures: AtomicU32,
    reject_publishing: AtomicBool,
}

/// [`SocialClient`] that keeps everything in memory.
///
/// Published posts are logged and recorded; replies and profiles are seeded by
/// the caller.
#[derive(Clone, Default)]
pub struct MemorySocialClient {
    inner: Arc<Inner>,
}

impl MemorySocialClient {
    /// Empty platform.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `reply` visible under `post_id`.
    pub fn add_reply(&self, post_id: &str, reply: RawReply) {
        self.inner
            .replies
            .entry(post_id.to_owned())
            .or_default()
            .push(reply);
    }

    /// Register a profile returned by `fetch_user`.
    pub fn add_user(&self, user: UserInfo) {
        self.inner.users.insert(user.id.clone(), user);
    }

    /// Fail the next `count` reply fetches with a rate-limit error.
    pub fn fail_next_fetches(&self, count: u32) {
        self.inner.fetch_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` profile lookups with a rate-limit error.
    pub fn fail_next_user_lookups(&self, count: u32) {
        self.inner.user_failures.store(count, Ordering::SeqCst);
    }

    /// Reject every `post`/`reply` call with a server error while `reject` is set.
    pub fn reject_publishing(&self, reject: bool) {
        self.inner.reject_publishing.store(reject, Ordering::SeqCst);
    }

    /// Number of `fetch_replies` calls so far, failed ones included.
    pub fn fetch_calls(&self) -> u32 {
        self.inner.fetch_calls.load(Ordering::SeqCst)
    }

    /// Everything published so far, in publication order.
    pub fn published(&self) -> Vec<PublishedPost> {
        let mut posts: Vec<_> = self
            .inner
            .posts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        posts.sort_by_key(|post| post.id.parse::<u64>().unwrap_or(u64::MAX));
        posts
    }

    /// Replies published under `post_id`.
    pub fn replies_to(&self, post_id: &str) -> Vec<PublishedPost> {
        self.published()
            .into_iter()
            .filter(|post| post.in_reply_to.as_deref() == Some(post_id))
            .collect()
    }

    fn publish(&self, text: String, in_reply_to: Option<String>) -> SocialResult<String> {
        if self.inner.reject_publishing.load(Ordering::SeqCst) {
            return Err(SocialError::Api {
                status: 503,
                message: "publishing disabled".into(),
            });
        }
        let id = (self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        info!(post_id = %id, in_reply_to = ?in_reply_to, %text, "dry-run publish");
        self.inner.posts.insert(
            id.clone(),
            PublishedPost {
                id: id.clone(),
                text,
                in_reply_to,
            },
        );
        Ok(id)
    }

    fn replies(&self, post_id: &str) -> SocialResult<Vec<RawReply>> {
        self.inner.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.inner.fetch_failures) {
            return Err(SocialError::RateLimited { retry_after: None });
        }
        Ok(self
            .inner
            .replies
            .get(post_id)
            .map(|replies| replies.value().clone())
            .unwrap_or_default())
    }
}

/// Consume one injected failure, if any are left.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

impl SocialClient for MemorySocialClient {
    fn post(&self, text: String) -> BoxFuture<'static, SocialResult<String>> {
        let result = self.publish(text, None);
        Box::pin(async move { result })
    }

    fn reply(&self, post_id: String, text: String) -> BoxFuture<'static, SocialResult<String>> {
        let result = self.publish(text, Some(post_id));
        Box::pin(async move { result })
    }

    fn fetch_replies(&self, post_id: String) -> BoxFuture<'static, SocialResult<Vec<RawReply>>> {
        let result = self.replies(&post_id);
        Box::pin(async move { result })
    }

    fn fetch_user(&self, user_id: String) -> BoxFuture<'static, SocialResult<UserInfo>> {
        let result = if take_failure(&self.inner.user_failures) {
            Err(SocialError::RateLimited { retry_after: None })
        } else {
            self.inner
                .users
                .get(&user_id)
                .map(|user| user.value().clone())
                .ok_or(SocialError::Api {
                    status: 404,
                    message: format!("user `{user_id}` not found"),
                })
        };
        Box::pin(async move { result })
    }
}
