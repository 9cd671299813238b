//! X (Twitter) API v2 adapter.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::debug;

use super::{RawReply, SocialClient, SocialError, SocialResult, UserInfo};

const DEFAULT_API_BASE: &str = "https://api.x.com/2";
/// Largest page accepted by the recent-search endpoint.
const SEARCH_PAGE_SIZE: u32 = 100;
/// Upper bound on followed `next_token` links per fetch.
const MAX_SEARCH_PAGES: usize = 10;

/// Missing credentials for the X adapter.
#[derive(Debug, Error)]
pub enum XConfigError {
    /// Required environment variable is missing or empty.
    #[error("missing X environment variable `{var}`")]
    MissingEnvVar {
        /// Name of the variable.
        var: &'static str,
    },
}

/// Credentials and endpoint of the X API.
#[derive(Debug, Clone)]
pub struct XConfig {
    /// Root of the v2 API.
    pub api_base: String,
    /// App-only token used for reads.
    pub bearer_token: String,
    /// User-context OAuth 2.0 token used to publish as the bot.
    pub user_access_token: String,
    /// Account id of the bot itself.
    pub user_id: String,
}

impl XConfig {
    /// Read `X_BEARER_TOKEN`, `X_USER_ACCESS_TOKEN` and `X_USER_ID` (all required)
    /// and the optional `X_API_BASE`.
    pub fn from_env() -> Result<Self, XConfigError> {
        fn required(var: &'static str) -> Result<String, XConfigError> {
            std::env::var(var)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .ok_or(XConfigError::MissingEnvVar { var })
        }

        Ok(Self {
            api_base: std::env::var("X_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_owned()),
            bearer_token: required("X_BEARER_TOKEN")?,
            user_access_token: required("X_USER_ACCESS_TOKEN")?,
            user_id: required("X_USER_ID")?,
        })
    }
}

/// [`SocialClient`] backed by the X API v2.
#[derive(Clone)]
pub struct XClient {
    client: Client,
    config: Arc<XConfig>,
}

#[derive(Serialize)]
struct CreatePostBody<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<ReplySettings<'a>>,
}

#[derive(Serialize)]
struct ReplySettings<'a> {
    in_reply_to_tweet_id: &'a str,
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: Option<T>,
}

#[derive(Deserialize)]
struct CreatedPost {
    id: String,
}

#[derive(Deserialize)]
struct SearchPage {
    #[serde(default)]
    data: Vec<ApiPost>,
    #[serde(default)]
    includes: Option<SearchIncludes>,
    #[serde(default)]
    meta: Option<SearchMeta>,
}

#[derive(Deserialize)]
struct ApiPost {
    id: String,
    text: String,
    author_id: Option<String>,
    created_at: Option<String>,
}

#[derive(Deserialize, Default)]
struct SearchIncludes {
    #[serde(default)]
    users: Vec<ApiUser>,
}

#[derive(Deserialize)]
struct SearchMeta {
    next_token: Option<String>,
}

#[derive(Deserialize)]
struct ApiUser {
    id: String,
    username: String,
    name: Option<String>,
    created_at: Option<String>,
    #[serde(default)]
    verified: bool,
    public_metrics: Option<PublicMetrics>,
}

#[derive(Deserialize)]
struct PublicMetrics {
    #[serde(default)]
    followers_count: u64,
}

impl XClient {
    /// Build a client over a pooled HTTP connection.
    pub fn new(config: XConfig) -> SocialResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(SocialError::network)?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    /// Account id of the bot, used to ignore its own replies.
    pub fn account_id(&self) -> &str {
        &self.config.user_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn send<T: DeserializeOwned>(request: RequestBuilder) -> SocialResult<T> {
        let response = request.send().await.map_err(SocialError::network)?;
        let response = check_status(response).await?;
        response.json::<T>().await.map_err(|err| SocialError::Decode {
            message: err.to_string(),
        })
    }

    async fn create_post(&self, text: String, in_reply_to: Option<String>) -> SocialResult<String> {
        let body = CreatePostBody {
            text: &text,
            reply: in_reply_to.as_deref().map(|id| ReplySettings {
                in_reply_to_tweet_id: id,
            }),
        };
        let request = self
            .client
            .post(self.url("tweets"))
            .bearer_auth(&self.config.user_access_token)
            .json(&body);

        let envelope: DataEnvelope<CreatedPost> = Self::send(request).await?;
        let created = envelope.data.ok_or_else(|| SocialError::Decode {
            message: "post creation response has no `data`".into(),
        })?;
        debug!(post_id = %created.id, in_reply_to = ?in_reply_to, "published post");
        Ok(created.id)
    }

    async fn search_conversation(&self, post_id: String) -> SocialResult<Vec<RawReply>> {
        let query = format!("conversation_id:{post_id}");
        let page_size = SEARCH_PAGE_SIZE.to_string();
        let mut replies = Vec::new();
        let mut next_token: Option<String> = None;

        for _ in 0..MAX_SEARCH_PAGES {
            let mut params = vec![
                ("query", query.as_str()),
                ("max_results", page_size.as_str()),
                ("tweet.fields", "author_id,created_at,conversation_id"),
                ("expansions", "author_id"),
                ("user.fields", "username"),
            ];
            if let Some(token) = next_token.as_deref() {
                params.push(("next_token", token));
            }

            let request = self
                .client
                .get(self.url("tweets/search/recent"))
                .bearer_auth(&self.config.bearer_token)
                .query(&params);
            let page: SearchPage = Self::send(request).await?;

            let users = page.includes.unwrap_or_default().users;
            for post in page.data {
                replies.push(into_raw_reply(post, &users)?);
            }

            next_token = page.meta.and_then(|meta| meta.next_token);
            if next_token.is_none() {
                break;
            }
        }

        debug!(post_id = %post_id, count = replies.len(), "fetched conversation replies");
        Ok(replies)
    }

    async fn lookup_user(&self, user_id: String) -> SocialResult<UserInfo> {
        let request = self
            .client
            .get(self.url(&format!("users/{user_id}")))
            .bearer_auth(&self.config.bearer_token)
            .query(&[("user.fields", "created_at,public_metrics,verified")]);

        let envelope: DataEnvelope<ApiUser> = Self::send(request).await?;
        let user = envelope.data.ok_or_else(|| SocialError::Api {
            status: StatusCode::NOT_FOUND.as_u16(),
            message: format!("user `{user_id}` not found"),
        })?;

        Ok(UserInfo {
            created_at: user.created_at.as_deref().map(parse_timestamp).transpose()?,
            followers_count: user
                .public_metrics
                .map(|metrics| metrics.followers_count)
                .unwrap_or_default(),
            id: user.id,
            username: user.username,
            name: user.name,
            verified: user.verified,
        })
    }
}

impl SocialClient for XClient {
    fn post(&self, text: String) -> BoxFuture<'static, SocialResult<String>> {
        let client = self.clone();
        Box::pin(async move { client.create_post(text, None).await })
    }

    fn reply(&self, post_id: String, text: String) -> BoxFuture<'static, SocialResult<String>> {
        let client = self.clone();
        Box::pin(async move { client.create_post(text, Some(post_id)).await })
    }

    fn fetch_replies(&self, post_id: String) -> BoxFuture<'static, SocialResult<Vec<RawReply>>> {
        let client = self.clone();
        Box::pin(async move { client.search_conversation(post_id).await })
    }

    fn fetch_user(&self, user_id: String) -> BoxFuture<'static, SocialResult<UserInfo>> {
        let client = self.clone();
        Box::pin(async move { client.lookup_user(user_id).await })
    }
}

/// Map HTTP failures onto [`SocialError`] kinds.
async fn check_status(response: Response) -> SocialResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(SocialError::RateLimited {
            retry_after: rate_limit_reset(&response),
        }),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SocialError::Unauthorized {
            status: status.as_u16(),
        }),
        _ => {
            let message = response.text().await.unwrap_or_default();
            Err(SocialError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Time left until the `x-rate-limit-reset` epoch, if the header is present.
fn rate_limit_reset(response: &Response) -> Option<Duration> {
    let reset = response
        .headers()
        .get("x-rate-limit-reset")?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()?;
    let reset_at = UNIX_EPOCH + Duration::from_secs(reset);
    Some(reset_at.duration_since(SystemTime::now()).unwrap_or_default())
}

fn into_raw_reply(post: ApiPost, users: &[ApiUser]) -> SocialResult<RawReply> {
    let author_id = post.author_id.ok_or_else(|| SocialError::Decode {
        message: format!("reply `{}` has no author_id", post.id),
    })?;
    let created_at = post.created_at.ok_or_else(|| SocialError::Decode {
        message: format!("reply `{}` has no created_at", post.id),
    })?;
    let author_username = users
        .iter()
        .find(|user| user.id == author_id)
        .map(|user| user.username.clone());

    Ok(RawReply {
        timestamp: parse_timestamp(&created_at)?,
        author_id,
        author_username,
        external_id: post.id,
        text: post.text,
    })
}

fn parse_timestamp(value: &str) -> SocialResult<SystemTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map(SystemTime::from)
        .map_err(|err| SocialError::Decode {
            message: format!("invalid timestamp `{value}`: {err}"),
        })
}
