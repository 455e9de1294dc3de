//! Line decoder for the filtered stream.
//!
//! The stream body is newline-delimited JSON with blank keep-alive lines.
//! Chunk boundaries from the transport are arbitrary, so [`LineDecoder`]
//! buffers partial lines between pushes. Nothing here touches the network.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use crate::data::types::{Engagement, InboundPost, ReferencedPost, RuleTag};

/// Lines longer than this are dropped rather than buffered forever
const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has neither data nor errors")]
    Empty,

    #[error("invalid created_at timestamp: {0}")]
    Timestamp(String),

    #[error("line is not valid UTF-8")]
    Utf8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Post {
        post: InboundPost,
        /// Markets whose rules matched, deduplicated, in tag order
        market_ids: Vec<String>,
    },
    Errors(Vec<String>),
}

#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
    overflowed: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every complete non-blank line it finishes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, DecodeError>> {
        let mut lines = Vec::new();

        for &byte in chunk {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.buf);
                if std::mem::take(&mut self.overflowed) {
                    continue;
                }
                match String::from_utf8(line) {
                    Ok(s) => {
                        let trimmed = s.trim();
                        if !trimmed.is_empty() {
                            lines.push(Ok(trimmed.to_string()));
                        }
                    }
                    Err(_) => lines.push(Err(DecodeError::Utf8)),
                }
            } else if self.buf.len() >= MAX_LINE_BYTES {
                self.overflowed = true;
                self.buf.clear();
            } else if !self.overflowed {
                self.buf.push(byte);
            }
        }

        lines
    }
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    data: Option<WirePost>,
    #[serde(default)]
    includes: WireIncludes,
    #[serde(default)]
    matching_rules: Vec<WireMatchingRule>,
    #[serde(default)]
    errors: Vec<WireError>,
}

#[derive(Debug, Deserialize)]
struct WirePost {
    id: String,
    text: String,
    #[serde(default)]
    author_id: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    public_metrics: WirePostMetrics,
    #[serde(default)]
    referenced_tweets: Vec<WireReference>,
    #[serde(default)]
    entities: WireEntities,
}

#[derive(Debug, Default, Deserialize)]
struct WirePostMetrics {
    #[serde(default)]
    like_count: u64,
    #[serde(default)]
    retweet_count: u64,
    #[serde(default)]
    reply_count: u64,
    #[serde(default)]
    quote_count: u64,
}

#[derive(Debug, Deserialize)]
struct WireReference {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireEntities {
    #[serde(default)]
    cashtags: Vec<serde_json::Value>,
    #[serde(default)]
    urls: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct WireIncludes {
    #[serde(default)]
    users: Vec<WireUser>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    verified: bool,
    #[serde(default)]
    public_metrics: WireUserMetrics,
}

#[derive(Debug, Default, Deserialize)]
struct WireUserMetrics {
    #[serde(default)]
    followers_count: u64,
}

#[derive(Debug, Deserialize)]
struct WireMatchingRule {
    #[serde(default)]
    tag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// Parse one stream line into an event
pub fn parse_line(line: &str, received_at: DateTime<Utc>) -> Result<StreamEvent, DecodeError> {
    let msg: WireMessage = serde_json::from_str(line)?;

    let Some(data) = msg.data else {
        if msg.errors.is_empty() {
            return Err(DecodeError::Empty);
        }
        let errors = msg
            .errors
            .into_iter()
            .map(|e| match (e.title, e.detail) {
                (Some(t), Some(d)) => format!("{}: {}", t, d),
                (Some(t), None) => t,
                (None, Some(d)) => d,
                (None, None) => "unknown stream error".to_string(),
            })
            .collect();
        return Ok(StreamEvent::Errors(errors));
    };

    let created_at = match data.created_at {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| DecodeError::Timestamp(raw))?,
        None => received_at,
    };

    let author_id = data.author_id.unwrap_or_default();
    let author = msg.includes.users.iter().find(|u| u.id == author_id);

    let mut market_ids: Vec<String> = Vec::new();
    for rule in &msg.matching_rules {
        if let Some(tag) = rule.tag.as_deref().and_then(RuleTag::parse) {
            if !market_ids.contains(&tag.market_id) {
                market_ids.push(tag.market_id);
            }
        }
    }

    let post = InboundPost {
        id: data.id,
        text: data.text,
        created_at,
        author_handle: author.and_then(|u| u.username.clone()),
        author_followers: author.map_or(0, |u| u.public_metrics.followers_count),
        author_verified: author.map_or(false, |u| u.verified),
        author_id,
        engagement: Engagement {
            likes: data.public_metrics.like_count,
            reposts: data.public_metrics.retweet_count,
            replies: data.public_metrics.reply_count,
            quotes: data.public_metrics.quote_count,
        },
        referenced: data
            .referenced_tweets
            .into_iter()
            .map(|r| ReferencedPost { kind: r.kind, id: r.id })
            .collect(),
        entity_cashtags: data.entities.cashtags.len() as u32,
        entity_urls: data.entities.urls.len() as u32,
    };

    Ok(StreamEvent::Post { post, market_ids })
}
