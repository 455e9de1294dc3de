use serde::Deserialize;

/// Tunables for the probability update engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineParams {
    pub prior_min: f64,
    pub max_age_hours: f64,
    pub grace_minutes: f64,
    pub half_life_hours: f64,
    pub author_window_hours: i64,

    pub engagement_center: f64,
    pub engagement_scale: f64,
    pub reach_center: f64,
    pub reach_scale: f64,
    pub verified_boost: f64,

    pub dilution_rate: f64,
    pub dilution_min: f64,

    pub cashtag_soft_limit: u32,
    pub cashtag_soft_penalty: f64,
    pub cashtag_hard_limit: u32,
    pub cashtag_hard_penalty: f64,
    pub url_limit: u32,
    pub url_penalty: f64,

    pub grace_min_relevance: f64,
    pub grace_min_signal: f64,
    pub min_relevance: f64,
    pub min_credibility: f64,
    pub min_weight: f64,

    pub signal_exponent: f64,
    pub stance_gain: f64,
    pub base_temperature: f64,
    pub temperature_boost: f64,
    pub beta_scale: f64,

    pub floor_min: f64,
    pub floor_mass: f64,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            prior_min: 1e-6,
            max_age_hours: 72.0,
            grace_minutes: 5.0,
            half_life_hours: 6.0,
            author_window_hours: 24,

            // log1p(weighted engagement) of ~3 is a couple dozen interactions
            engagement_center: 3.0,
            engagement_scale: 1.5,
            // log1p(followers) of ~7 is about a thousand followers
            reach_center: 7.0,
            reach_scale: 2.0,
            verified_boost: 1.2,

            dilution_rate: 0.75,
            dilution_min: 0.35,

            cashtag_soft_limit: 4,
            cashtag_soft_penalty: 0.75,
            cashtag_hard_limit: 6,
            cashtag_hard_penalty: 0.55,
            url_limit: 2,
            url_penalty: 0.85,

            grace_min_relevance: 0.1,
            grace_min_signal: 0.025,
            min_relevance: 0.2,
            min_credibility: 0.15,
            min_weight: 0.018,

            signal_exponent: 1.15,
            stance_gain: 1.6,
            base_temperature: 1.0,
            temperature_boost: 0.6,
            beta_scale: 0.65,

            floor_min: 0.001,
            floor_mass: 0.01,
        }
    }
}

impl EngineParams {
    /// Minimum probability granted to each of `k` outcomes
    pub fn floor(&self, k: usize) -> f64 {
        self.floor_min.max(self.floor_mass / k.max(1) as f64)
    }
}
