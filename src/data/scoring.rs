use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use crate::data::types::{Market, Score};

#[derive(Debug, thiserror::Error)]
pub enum ScoreError {
    #[error("scorer request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("scorer returned HTTP {0}")]
    Status(StatusCode),

    #[error("malformed scorer response: {0}")]
    Malformed(String),

    #[error("scorer response failed validation: {0}")]
    Schema(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct OutcomeRef {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreRequest {
    pub question: String,
    pub outcomes: Vec<OutcomeRef>,
    pub post_text: String,
    pub author_handle: Option<String>,
}

impl ScoreRequest {
    pub fn new(market: &Market, post_text: &str, author_handle: Option<&str>) -> Self {
        Self {
            question: market.question.clone(),
            outcomes: market
                .outcomes
                .iter()
                .map(|o| OutcomeRef { id: o.id.clone(), label: o.label.clone() })
                .collect(),
            post_text: post_text.to_string(),
            author_handle: author_handle.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoreResponse {
    pub scores: Vec<OutcomeScore>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutcomeScore {
    pub outcome_id: String,
    #[serde(flatten)]
    pub score: Score,
    #[serde(default)]
    pub stance_label: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Validated per-outcome scores for one post
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoredOutcomes {
    pub scores: BTreeMap<String, Score>,
    pub labels: BTreeMap<String, ScoreLabels>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreLabels {
    pub stance_label: Option<String>,
    pub rationale: Option<String>,
}

/// The external text-scoring collaborator
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, request: &ScoreRequest) -> Result<ScoreResponse, ScoreError>;
}

pub struct HttpScorer {
    client: Client,
    url: String,
    api_key: String,
}

impl HttpScorer {
    pub fn new(url: String, api_key: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, api_key })
    }
}

#[async_trait]
impl Scorer for HttpScorer {
    async fn score(&self, request: &ScoreRequest) -> Result<ScoreResponse, ScoreError> {
        let response = self.client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScoreError::Status(status));
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| ScoreError::Malformed(e.to_string()))
    }
}

/// Keep only finite scores for outcomes the market actually has.
///
/// A response that leaves nothing usable is a schema violation.
pub fn validate_response(market: &Market, response: ScoreResponse) -> Result<ScoredOutcomes, ScoreError> {
    let mut out = ScoredOutcomes::default();

    for entry in response.scores {
        if !market.outcomes.iter().any(|o| o.id == entry.outcome_id) {
            tracing::debug!(market_id = %market.id, outcome_id = %entry.outcome_id, "score for unknown outcome dropped");
            continue;
        }
        if !entry.score.is_finite() {
            return Err(ScoreError::Schema(format!("non-finite score for outcome {}", entry.outcome_id)));
        }
        if out.scores.contains_key(&entry.outcome_id) {
            return Err(ScoreError::Schema(format!("duplicate score for outcome {}", entry.outcome_id)));
        }

        out.labels.insert(entry.outcome_id.clone(), ScoreLabels {
            stance_label: entry.stance_label,
            rationale: entry.rationale,
        });
        out.scores.insert(entry.outcome_id, entry.score);
    }

    if out.scores.is_empty() {
        return Err(ScoreError::Schema("no scores for known outcomes".to_string()));
    }

    Ok(out)
}
