use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

/// Trailing window of posts per author, used for dilution.
///
/// Built by the caller from the market's recent history and extended
/// with the batch being folded in. A post id is counted once no matter
/// how many times it is observed.
#[derive(Debug, Clone)]
pub struct AuthorActivity {
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    posts: HashMap<String, HashSet<String>>,
}

impl AuthorActivity {
    pub fn new(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            since: now - window,
            until: now,
            posts: HashMap::new(),
        }
    }

    /// Record a post; posts older than the window are ignored and
    /// future-dated posts count as posted now
    pub fn observe(&mut self, post_id: &str, author_id: &str, created_at: DateTime<Utc>) {
        if created_at.min(self.until) < self.since {
            return;
        }
        self.posts
            .entry(author_id.to_string())
            .or_default()
            .insert(post_id.to_string());
    }

    pub fn count(&self, author_id: &str) -> usize {
        self.posts.get(author_id).map_or(0, |p| p.len())
    }
}
