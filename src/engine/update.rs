use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::data::types::{clamp_unit, EvidencePost, Probabilities};
use crate::engine::activity::AuthorActivity;
use crate::engine::params::EngineParams;

pub struct UpdateRequest<'a> {
    pub prior: &'a Probabilities,
    pub previous: Option<&'a Probabilities>,
    pub posts: &'a [EvidencePost],
    /// Recent posts per author; the batch is added on top
    pub activity: &'a AuthorActivity,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Diagnostics {
    pub accepted_posts: usize,
    pub rejected_posts: usize,
    pub w_batch: f64,
    pub beta: f64,
    pub temperature: f64,
    pub floor: f64,
}

#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub probabilities: Probabilities,
    pub diagnostics: Diagnostics,
}

/// Why a post did or did not contribute to a batch
#[derive(Debug, Clone, Copy, PartialEq)]
enum Verdict {
    Stale,
    NoScores,
    BelowGate,
    Accepted {
        /// Wp, the post's contribution to the batch mass
        weight: f64,
        /// M × A × D × S
        factor: f64,
    },
}

/// Evidence-weighted probability update.
///
/// Pure and deterministic: the same request always yields the same
/// outcome. Callers must serialize calls per market.
#[derive(Debug, Clone, Default)]
pub struct ProbabilityEngine {
    params: EngineParams,
}

impl ProbabilityEngine {
    pub fn new(params: EngineParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    pub fn update(&self, req: UpdateRequest<'_>) -> UpdateOutcome {
        let p = &self.params;
        let ids: Vec<&String> = req.prior.keys().collect();
        let k = ids.len().max(1);
        let floor = p.floor(k);

        // 1. Normalize inputs
        let prior: Vec<f64> = ids.iter().map(|id| req.prior[*id]).collect();
        let prior = self.clamp_normalize(&prior);
        let previous = match req.previous {
            Some(prev) => {
                let values: Vec<f64> = ids
                    .iter()
                    .map(|id| prev.get(*id).copied().unwrap_or(p.prior_min))
                    .collect();
                self.clamp_normalize(&values)
            }
            None => prior,
        };

        // 2. Author activity over the trailing window, batch included
        let mut activity = req.activity.clone();
        for post in req.posts {
            activity.observe(&post.id, &post.author_id, post.created_at);
        }

        // 3. Per-post weights and per-outcome deltas
        let sqrt_k = (k as f64).sqrt();
        let mut delta = vec![0.0; ids.len()];
        let mut w_batch = 0.0;
        let mut accepted_posts = 0;

        for post in req.posts {
            let verdict = self.weigh(post, &activity, req.now);
            let (weight, factor) = match verdict {
                Verdict::Accepted { weight, factor } => (weight, factor),
                rejected => {
                    tracing::debug!(post_id = %post.id, ?rejected, "post rejected");
                    continue;
                }
            };

            for (i, id) in ids.iter().enumerate() {
                if let Some(score) = post.scores.get(*id) {
                    let sem = score.semantic_strength();
                    let stance = score.clamped_stance();
                    delta[i] += (p.stance_gain * stance).tanh()
                        * sem.powf(p.signal_exponent)
                        * factor
                        / sqrt_k;
                }
            }

            w_batch += weight;
            accepted_posts += 1;
        }

        // 4. Blend into new probabilities
        let temperature = p.base_temperature * (1.0 + p.temperature_boost / (1.0 + w_batch).sqrt());
        let beta = 1.0 - (-w_batch / p.beta_scale).exp();

        let inst_logits: Vec<f64> = centered_logits(&previous)
            .iter()
            .zip(&delta)
            .map(|(l, d)| (l + d) / temperature)
            .collect();
        let p_inst = softmax(&inst_logits);

        let mut blended: Vec<f64> = previous
            .iter()
            .zip(&p_inst)
            .map(|(prev, inst)| (1.0 - beta) * prev + beta * inst)
            .collect();
        floor_normalize(&mut blended, floor);

        let probabilities = ids
            .iter()
            .zip(blended)
            .map(|(id, value)| ((*id).clone(), value))
            .collect();

        UpdateOutcome {
            probabilities,
            diagnostics: Diagnostics {
                accepted_posts,
                rejected_posts: req.posts.len() - accepted_posts,
                w_batch,
                beta,
                temperature,
                floor,
            },
        }
    }

    fn weigh(&self, post: &EvidencePost, activity: &AuthorActivity, now: DateTime<Utc>) -> Verdict {
        let p = &self.params;

        // Future-dated posts count as brand new
        let age_secs = ((now - post.created_at).num_milliseconds() as f64 / 1000.0).max(0.0);
        if age_secs > p.max_age_hours * 3600.0 {
            return Verdict::Stale;
        }

        let grace_secs = p.grace_minutes * 60.0;
        let in_grace = age_secs <= grace_secs;
        let decay = if in_grace {
            1.0
        } else {
            0.5_f64.powf((age_secs - grace_secs) / (p.half_life_hours * 3600.0))
        };

        let e = &post.engagement;
        let raw_engagement = e.likes as f64
            + 2.0 * e.reposts as f64
            + 1.5 * e.replies as f64
            + 2.5 * e.quotes as f64;
        let engagement_sig = sigmoid((raw_engagement.ln_1p() - p.engagement_center) / p.engagement_scale);
        let reach_sig = sigmoid(((post.author_followers as f64).ln_1p() - p.reach_center) / p.reach_scale);
        let verified = if post.author_verified { p.verified_boost } else { 1.0 };
        let multiplier = (0.75 + 0.25 * reach_sig) * (0.85 + 0.15 * engagement_sig) * verified;

        let n = activity.count(&post.author_id).max(1);
        let dilution = p
            .dilution_min
            .max(1.0 / (1.0 + p.dilution_rate * (n - 1) as f64).sqrt());

        let mut spam = 1.0;
        if post.features.cashtag_count >= p.cashtag_hard_limit {
            spam *= p.cashtag_hard_penalty;
        } else if post.features.cashtag_count >= p.cashtag_soft_limit {
            spam *= p.cashtag_soft_penalty;
        }
        if post.features.url_count >= p.url_limit {
            spam *= p.url_penalty;
        }

        let mut scored = false;
        let mut max_relevance: f64 = 0.0;
        let mut max_credibility: f64 = 0.0;
        let mut z_post: f64 = 0.0;
        for score in post.scores.values() {
            scored = true;
            max_relevance = max_relevance.max(clamp_unit(score.relevance));
            max_credibility = max_credibility.max(clamp_unit(score.credibility));
            z_post = z_post.max(score.semantic_strength() * score.clamped_stance().abs());
        }
        if !scored {
            return Verdict::NoScores;
        }

        let factor = multiplier * dilution * decay * spam;
        let weight = z_post.powf(p.signal_exponent) * factor;

        let passes = if in_grace {
            max_relevance >= p.grace_min_relevance && z_post >= p.grace_min_signal
        } else {
            max_relevance >= p.min_relevance
                && max_credibility >= p.min_credibility
                && weight >= p.min_weight
        };

        if passes {
            Verdict::Accepted { weight, factor }
        } else {
            Verdict::BelowGate
        }
    }

    fn clamp_normalize(&self, values: &[f64]) -> Vec<f64> {
        let clamped: Vec<f64> = values
            .iter()
            .map(|v| if v.is_finite() { v.clamp(self.params.prior_min, 1.0) } else { self.params.prior_min })
            .collect();
        let sum: f64 = clamped.iter().sum();
        clamped.iter().map(|v| v / sum).collect()
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn centered_logits(probs: &[f64]) -> Vec<f64> {
    let logs: Vec<f64> = probs.iter().map(|p| p.ln()).collect();
    let mean = logs.iter().sum::<f64>() / logs.len().max(1) as f64;
    logs.iter().map(|l| l - mean).collect()
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// Raise every value to at least `floor` and rescale the rest so the
/// vector sums to 1 without pushing anything back under the floor.
fn floor_normalize(values: &mut [f64], floor: f64) {
    let k = values.len();
    if k == 0 {
        return;
    }
    if floor * k as f64 >= 1.0 {
        values.iter_mut().for_each(|v| *v = 1.0 / k as f64);
        return;
    }

    for v in values.iter_mut() {
        if !v.is_finite() || *v < 0.0 {
            *v = 0.0;
        }
    }

    let mut pinned = vec![false; k];
    loop {
        let pinned_count = pinned.iter().filter(|p| **p).count();
        let free_mass = 1.0 - floor * pinned_count as f64;
        let free_sum: f64 = values
            .iter()
            .zip(&pinned)
            .filter(|(_, p)| !**p)
            .map(|(v, _)| *v)
            .sum();

        if free_sum <= 0.0 {
            let share = free_mass / (k - pinned_count) as f64;
            for (v, p) in values.iter_mut().zip(&pinned) {
                *v = if *p { floor } else { share };
            }
            return;
        }

        let scale = free_mass / free_sum;
        let mut changed = false;
        for (v, p) in values.iter().zip(pinned.iter_mut()) {
            if !*p && v * scale < floor {
                *p = true;
                changed = true;
            }
        }

        if !changed {
            for (v, p) in values.iter_mut().zip(&pinned) {
                *v = if *p { floor } else { *v * scale };
            }
            return;
        }
    }
}
