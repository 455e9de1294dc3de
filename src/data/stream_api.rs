use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use crate::data::types::{LiveRule, StreamRule};

const POST_FIELDS: &str = "created_at,author_id,public_metrics,referenced_tweets,entities";
const USER_FIELDS: &str = "username,verified,public_metrics";

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("rate limited (reset at {reset_at:?})")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    #[error("HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream ended")]
    Ended,
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        StreamError::Transport(e.to_string())
    }
}

pub type ChunkStream = BoxStream<'static, Result<Vec<u8>, StreamError>>;

/// Management side of the filtered stream
#[async_trait]
pub trait RulesApi: Send + Sync {
    async fn get_rules(&self) -> Result<Vec<LiveRule>, StreamError>;
    /// Add all rules in one call
    async fn add_rules(&self, rules: &[StreamRule]) -> Result<(), StreamError>;
    /// Delete all rule ids in one call
    async fn delete_rules(&self, ids: &[String]) -> Result<(), StreamError>;
}

/// Consumption side of the filtered stream
#[async_trait]
pub trait PostSource: Send + Sync {
    async fn connect(&self) -> Result<ChunkStream, StreamError>;
}

pub struct XStreamClient {
    client: Client,
    base_url: String,
    bearer_token: String,
}

#[derive(Debug, Deserialize)]
struct RulesResponse {
    #[serde(default)]
    data: Vec<LiveRule>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct AddRulesBody<'a> {
    add: &'a [StreamRule],
}

#[derive(Debug, Serialize)]
struct DeleteRulesBody<'a> {
    delete: DeleteIds<'a>,
}

#[derive(Debug, Serialize)]
struct DeleteIds<'a> {
    ids: &'a [String],
}

impl XStreamClient {
    pub fn new(base_url: String, bearer_token: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token,
        }
    }

    fn rules_url(&self) -> String {
        format!("{}/tweets/search/stream/rules", self.base_url)
    }

    async fn post_rules<T: Serialize + Sync>(&self, body: &T) -> Result<(), StreamError> {
        let response = self.client
            .post(self.rules_url())
            .bearer_auth(&self.bearer_token)
            .json(body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let parsed: RulesResponse = response.json().await?;
        if !parsed.errors.is_empty() {
            tracing::warn!(errors = ?parsed.errors, "rules endpoint reported errors");
        }
        Ok(())
    }
}

#[async_trait]
impl RulesApi for XStreamClient {
    async fn get_rules(&self) -> Result<Vec<LiveRule>, StreamError> {
        let response = self.client
            .get(self.rules_url())
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;
        let response = check_status(response).await?;

        let parsed: RulesResponse = response.json().await?;
        Ok(parsed.data)
    }

    async fn add_rules(&self, rules: &[StreamRule]) -> Result<(), StreamError> {
        self.post_rules(&AddRulesBody { add: rules }).await
    }

    async fn delete_rules(&self, ids: &[String]) -> Result<(), StreamError> {
        self.post_rules(&DeleteRulesBody { delete: DeleteIds { ids } }).await
    }
}

#[async_trait]
impl PostSource for XStreamClient {
    async fn connect(&self) -> Result<ChunkStream, StreamError> {
        let url = format!("{}/tweets/search/stream", self.base_url);

        let response = self.client
            .get(url)
            .bearer_auth(&self.bearer_token)
            .query(&[
                ("tweet.fields", POST_FIELDS),
                ("expansions", "author_id"),
                ("user.fields", USER_FIELDS),
            ])
            .send()
            .await?;
        let response = check_status(response).await?;

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(StreamError::from))
            .boxed())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let reset_at = response
            .headers()
            .get("x-rate-limit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_reset_hint);
        return Err(StreamError::RateLimited { reset_at });
    }

    let body = response.text().await.unwrap_or_default();
    Err(StreamError::Http { status, body })
}

/// Parse the epoch-seconds reset header
pub fn parse_reset_hint(raw: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = raw.trim().parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}
