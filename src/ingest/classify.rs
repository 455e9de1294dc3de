use once_cell::sync::Lazy;
use regex::Regex;
use crate::data::types::{InboundPost, PostFeatures};

static CASHTAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|[^\w$])\$[A-Za-z][A-Za-z0-9_]{0,11}\b").unwrap());
static URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").unwrap());
static HASHTAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\s)#\w+").unwrap());
static MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|[^\w])@\w+").unwrap());
static NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostKind {
    /// Plain repost of someone else's post; stored but never scored
    Retweet,
    Quote,
    Original,
}

impl PostKind {
    pub fn is_retweet(self) -> bool {
        self == PostKind::Retweet
    }
}

pub fn classify(post: &InboundPost) -> PostKind {
    let quoted = post.referenced.iter().any(|r| r.kind == "quoted");
    let retweeted = post.referenced.iter().any(|r| r.kind == "retweeted");

    if post.text.trim_start().starts_with("RT @") {
        return PostKind::Retweet;
    }
    if retweeted && !quoted {
        return PostKind::Retweet;
    }
    if quoted {
        PostKind::Quote
    } else {
        PostKind::Original
    }
}

/// Text features; counts take the larger of the platform entities and the regex scan
pub fn extract_features(post: &InboundPost) -> PostFeatures {
    let text = &post.text;

    PostFeatures {
        text_length: text.chars().count(),
        cashtag_count: post.entity_cashtags.max(CASHTAG.find_iter(text).count() as u32),
        url_count: post.entity_urls.max(URL.find_iter(text).count() as u32),
        has_hashtag: HASHTAG.is_match(text),
        has_mention: MENTION.is_match(text),
        has_numeric: NUMERIC.is_match(text),
        log_followers: (post.author_followers as f64).ln_1p(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::{Engagement, ReferencedPost};
    use chrono::Utc;

    fn post(text: &str, refs: &[&str]) -> InboundPost {
        InboundPost {
            id: "1".to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
            author_id: "a".to_string(),
            author_handle: None,
            author_followers: 0,
            author_verified: false,
            engagement: Engagement::default(),
            referenced: refs
                .iter()
                .map(|k| ReferencedPost { kind: k.to_string(), id: "9".to_string() })
                .collect(),
            entity_cashtags: 0,
            entity_urls: 0,
        }
    }

    #[test]
    fn test_textual_retweet() {
        assert_eq!(classify(&post("RT @someone: big news", &[])), PostKind::Retweet);
        assert_eq!(classify(&post("  RT @someone: big news", &[])), PostKind::Retweet);
        assert_eq!(classify(&post("ART @someone", &[])), PostKind::Original);
    }

    #[test]
    fn test_marker_retweet_vs_quote() {
        assert_eq!(classify(&post("big news", &["retweeted"])), PostKind::Retweet);
        assert_eq!(classify(&post("my take", &["quoted"])), PostKind::Quote);
        assert_eq!(classify(&post("my take", &["retweeted", "quoted"])), PostKind::Quote);
        assert_eq!(classify(&post("reply", &["replied_to"])), PostKind::Original);
    }

    #[test]
    fn test_spam_features() {
        let p = post("$BTC $ETH $SOL $DOGE to the moon https://a.co/1 https://b.co/2 #crypto @pump", &[]);
        let f = extract_features(&p);

        assert_eq!(f.cashtag_count, 4);
        assert_eq!(f.url_count, 2);
        assert!(f.has_hashtag);
        assert!(f.has_mention);
        assert!(f.has_numeric);
    }

    #[test]
    fn test_prices_are_not_cashtags() {
        let f = extract_features(&post("costs $5 or $10.50", &[]));
        assert_eq!(f.cashtag_count, 0);
        assert!(!f.has_hashtag);
    }

    #[test]
    fn test_entities_win_when_larger() {
        let mut p = post("short link", &[]);
        p.entity_urls = 3;
        p.author_followers = 999;

        let f = extract_features(&p);
        assert_eq!(f.url_count, 3);
        assert!((f.log_followers - 1000f64.ln()).abs() < 1e-12);
        assert_eq!(f.text_length, 10);
    }
}
