use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use crate::data::types::{EvidencePost, Market, MarketProbabilityState};
use crate::engine::{AuthorActivity, ProbabilityEngine, UpdateOutcome, UpdateRequest};
use crate::execution::persistence::StateStore;
use crate::monitoring::logger::CsvLogger;

/// Applies scored evidence to a market's stored probabilities.
///
/// Updates for the same market run one at a time; different markets
/// proceed in parallel.
pub struct MarketUpdater {
    engine: ProbabilityEngine,
    store: Arc<StateStore>,
    csv: Option<CsvLogger>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MarketUpdater {
    pub fn new(engine: ProbabilityEngine, store: Arc<StateStore>, csv: Option<CsvLogger>) -> Self {
        Self {
            engine,
            store,
            csv,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, market_id: &str) -> Arc<Mutex<()>> {
        // Clone out so the shard lock is released before awaiting
        let entry = self.locks.entry(market_id.to_string()).or_default();
        Arc::clone(entry.value())
    }

    /// Fold `posts` into the market's state and persist the result.
    ///
    /// Nothing is written when the batch accepts no posts.
    pub async fn apply(&self, market: &Market, posts: Vec<EvidencePost>) -> Result<UpdateOutcome> {
        let lock = self.lock_for(&market.id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let window = Duration::hours(self.engine.params().author_window_hours);
        let previous = self.store.load_state(&market.id)?;

        let mut activity = AuthorActivity::new(now, window);
        for seen in self.store.recent_scored_authors(&market.id, now - window)? {
            activity.observe(&seen.post_id, &seen.author_id, seen.created_at);
        }

        let prior = market.priors();
        let outcome = self.engine.update(UpdateRequest {
            prior: &prior,
            previous: previous.as_ref().map(|s| &s.probabilities),
            posts: &posts,
            activity: &activity,
            now,
        });

        let diagnostics = &outcome.diagnostics;
        if diagnostics.accepted_posts == 0 {
            debug!(market_id = %market.id, rejected = diagnostics.rejected_posts, "no evidence accepted");
            return Ok(outcome);
        }

        let state = MarketProbabilityState {
            market_id: market.id.clone(),
            probabilities: outcome.probabilities.clone(),
            updated_at: now,
        };
        let snapshot = self
            .store
            .save_state(&state, diagnostics)
            .with_context(|| format!("Failed to save state for market {}", market.id))?;

        info!(
            market_id = %market.id,
            accepted = diagnostics.accepted_posts,
            w_batch = diagnostics.w_batch,
            beta = diagnostics.beta,
            "probabilities updated: {:?}",
            snapshot.probabilities
        );

        if let Some(csv) = &self.csv {
            if let Err(e) = csv.log_update(&snapshot, diagnostics) {
                warn!("Failed to write CSV update log: {}", e);
            }
        }

        Ok(outcome)
    }
}
