use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Probability vector keyed by outcome id.
pub type Probabilities = BTreeMap<String, f64>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outcome {
    pub id: String,
    pub label: String,
    pub prior_probability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub question: String,
    pub outcomes: Vec<Outcome>,
    pub rule_templates: Vec<String>,
    pub active: bool,
}

impl Market {
    /// Check the outcome set is usable by the engine
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.outcomes.len() < 2 {
            anyhow::bail!("market {} has {} outcomes, need at least 2", self.id, self.outcomes.len());
        }

        let mut seen = std::collections::HashSet::new();
        for outcome in &self.outcomes {
            if !seen.insert(outcome.id.as_str()) {
                anyhow::bail!("market {} has duplicate outcome id {}", self.id, outcome.id);
            }
            if !outcome.prior_probability.is_finite() || outcome.prior_probability < 0.0 {
                anyhow::bail!(
                    "market {} outcome {} has invalid prior {}",
                    self.id, outcome.id, outcome.prior_probability
                );
            }
        }

        Ok(())
    }

    pub fn priors(&self) -> Probabilities {
        self.outcomes
            .iter()
            .map(|o| (o.id.clone(), o.prior_probability))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketProbabilityState {
    pub market_id: String,
    pub probabilities: Probabilities,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbabilitySnapshot {
    pub market_id: String,
    pub probabilities: Probabilities,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Engagement {
    pub likes: u64,
    pub reposts: u64,
    pub replies: u64,
    pub quotes: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SpamFeatures {
    pub cashtag_count: u32,
    pub url_count: u32,
}

/// Per-outcome score from the scoring collaborator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Score {
    pub relevance: f64,
    pub stance: f64,
    pub strength: f64,
    pub credibility: f64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 { 1.0 }

impl Score {
    /// relevance × strength × credibility × confidence, each clamped to [0, 1]
    pub fn semantic_strength(&self) -> f64 {
        clamp_unit(self.relevance)
            * clamp_unit(self.strength)
            * clamp_unit(self.credibility)
            * clamp_unit(self.confidence)
    }

    pub fn clamped_stance(&self) -> f64 {
        if self.stance.is_finite() {
            self.stance.clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn is_finite(&self) -> bool {
        self.relevance.is_finite()
            && self.stance.is_finite()
            && self.strength.is_finite()
            && self.credibility.is_finite()
            && self.confidence.is_finite()
    }
}

pub fn clamp_unit(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// A post plus its per-outcome scores, as consumed by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidencePost {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub author_id: String,
    pub author_followers: u64,
    pub author_verified: bool,
    pub engagement: Engagement,
    pub features: SpamFeatures,
    /// Missing outcome = no evidence for that outcome
    pub scores: BTreeMap<String, Score>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamRule {
    pub value: String,
    pub tag: String,
}

/// A rule as reported by the stream provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveRule {
    pub id: String,
    pub value: String,
    #[serde(default)]
    pub tag: Option<String>,
}

/// `market:<id>:<index>` tag identifying which market template produced a rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleTag {
    pub market_id: String,
    pub template_index: usize,
}

impl RuleTag {
    const PREFIX: &'static str = "market:";

    pub fn new(market_id: impl Into<String>, template_index: usize) -> Self {
        Self {
            market_id: market_id.into(),
            template_index,
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        let rest = tag.strip_prefix(Self::PREFIX)?;
        let (market_id, index) = rest.rsplit_once(':')?;
        if market_id.is_empty() {
            return None;
        }
        let template_index = index.parse().ok()?;
        Some(Self::new(market_id, template_index))
    }
}

impl fmt::Display for RuleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", Self::PREFIX, self.market_id, self.template_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencedPost {
    pub kind: String,
    pub id: String,
}

/// A post as received from the filtered stream, before classification
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPost {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub author_id: String,
    pub author_handle: Option<String>,
    pub author_followers: u64,
    pub author_verified: bool,
    pub engagement: Engagement,
    pub referenced: Vec<ReferencedPost>,
    pub entity_cashtags: u32,
    pub entity_urls: u32,
}

/// Derived text features stored with each raw post
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PostFeatures {
    pub text_length: usize,
    pub cashtag_count: u32,
    pub url_count: u32,
    pub has_hashtag: bool,
    pub has_mention: bool,
    pub has_numeric: bool,
    pub log_followers: f64,
}

impl PostFeatures {
    pub fn spam(&self) -> SpamFeatures {
        SpamFeatures {
            cashtag_count: self.cashtag_count,
            url_count: self.url_count,
        }
    }
}
