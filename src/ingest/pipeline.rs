use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use crate::data::cache::MarketCache;
use crate::data::scoring::{validate_response, ScoreRequest, Scorer};
use crate::data::types::{EvidencePost, InboundPost, Market, PostFeatures};
use crate::engine::Diagnostics;
use crate::execution::persistence::StateStore;
use crate::ingest::classify::{classify, extract_features};
use crate::ingest::updater::MarketUpdater;
use crate::monitoring::metrics::{Counter, IngestMetrics};

/// A decoded post and the markets whose rules it matched
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub post: InboundPost,
    pub market_ids: Vec<String>,
}

/// What happened to a post for one market
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Duplicate,
    Retweet,
    /// Market missing or no longer active
    UnknownMarket,
    /// Scoring failed or returned nothing usable
    Unscored,
    Applied(Diagnostics),
}

pub struct IngestPipeline {
    store: Arc<StateStore>,
    scorer: Arc<dyn Scorer>,
    updater: Arc<MarketUpdater>,
    markets: MarketCache,
    metrics: Arc<IngestMetrics>,
    /// Nudged when a post arrives for a market that is gone
    sync_trigger: Option<Arc<Notify>>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<StateStore>,
        scorer: Arc<dyn Scorer>,
        updater: Arc<MarketUpdater>,
        markets: MarketCache,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self { store, scorer, updater, markets, metrics, sync_trigger: None }
    }

    pub fn with_sync_trigger(mut self, trigger: Arc<Notify>) -> Self {
        self.sync_trigger = Some(trigger);
        self
    }

    /// Run a post through every market it matched
    pub async fn process(&self, job: IngestJob) -> Vec<(String, Disposition)> {
        let features = extract_features(&job.post);
        let mut results = Vec::with_capacity(job.market_ids.len());

        for market_id in &job.market_ids {
            match self.process_for_market(&job.post, &features, market_id).await {
                Ok(disposition) => {
                    debug!(post_id = %job.post.id, market_id = %market_id, ?disposition, "post processed");
                    results.push((market_id.clone(), disposition));
                }
                Err(e) => {
                    error!(post_id = %job.post.id, market_id = %market_id, "Failed to process post: {:#}", e);
                }
            }
        }

        results
    }

    async fn process_for_market(
        &self,
        post: &InboundPost,
        features: &PostFeatures,
        market_id: &str,
    ) -> Result<Disposition> {
        if self.store.raw_post_exists(market_id, &post.id)? {
            self.metrics.incr(Counter::Duplicates);
            return Ok(Disposition::Duplicate);
        }

        let Some(market) = self.market(market_id)? else {
            // A live rule still points here; let rule sync catch up
            if let Some(trigger) = &self.sync_trigger {
                trigger.notify_one();
            }
            return Ok(Disposition::UnknownMarket);
        };

        let kind = classify(post);
        // Insert is the real dedup point when two workers race on one post
        if !self.store.insert_raw_post(market_id, post, kind.is_retweet(), features)? {
            self.metrics.incr(Counter::Duplicates);
            return Ok(Disposition::Duplicate);
        }
        self.store.increment_post_count(market_id)?;

        if kind.is_retweet() {
            self.metrics.incr(Counter::Retweets);
            return Ok(Disposition::Retweet);
        }

        let request = ScoreRequest::new(&market, &post.text, post.author_handle.as_deref());
        let scored = match self.scorer.score(&request).await.and_then(|r| validate_response(&market, r)) {
            Ok(scored) => scored,
            Err(e) => {
                self.metrics.incr(Counter::ScoreFailures);
                warn!(post_id = %post.id, market_id = %market_id, "Scoring failed, post left unscored: {}", e);
                return Ok(Disposition::Unscored);
            }
        };
        self.metrics.incr(Counter::Scored);
        self.store.insert_scored_post(market_id, &post.id, &scored)?;

        let evidence = EvidencePost {
            id: post.id.clone(),
            created_at: post.created_at,
            author_id: post.author_id.clone(),
            author_followers: post.author_followers,
            author_verified: post.author_verified,
            engagement: post.engagement,
            features: features.spam(),
            scores: scored.scores,
        };

        let outcome = self.updater.apply(&market, vec![evidence]).await?;
        if outcome.diagnostics.accepted_posts > 0 {
            self.metrics.incr(Counter::Updates);
        }
        Ok(Disposition::Applied(outcome.diagnostics))
    }

    fn market(&self, market_id: &str) -> Result<Option<Arc<Market>>> {
        // Only the definition is cached; status is read fresh so a closed
        // market stops taking evidence immediately
        if !self.store.is_market_active(market_id)? {
            self.markets.invalidate(market_id);
            return Ok(None);
        }

        if let Some(market) = self.markets.get(market_id) {
            if market.active {
                return Ok(Some(market));
            }
        }

        let Some(market) = self.store.get_market(market_id)? else {
            return Ok(None);
        };
        let market = self.markets.insert(market);
        Ok(market.active.then_some(market))
    }
}

/// Process jobs with at most `max_in_flight` running at once.
///
/// Stops taking new jobs on shutdown or when the queue closes, then gives
/// in-flight jobs `grace` to finish before abandoning them.
pub async fn run_workers(
    pipeline: Arc<IngestPipeline>,
    mut jobs: mpsc::Receiver<IngestJob>,
    max_in_flight: usize,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_in_flight = max_in_flight.max(1);
    let mut in_flight = JoinSet::new();

    loop {
        if in_flight.len() >= max_in_flight {
            if let Some(Err(e)) = in_flight.join_next().await {
                error!("Ingest worker task failed: {}", e);
            }
            continue;
        }

        tokio::select! {
            Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = done {
                    error!("Ingest worker task failed: {}", e);
                }
            }
            job = jobs.recv() => match job {
                Some(job) => {
                    let pipeline = Arc::clone(&pipeline);
                    in_flight.spawn(async move {
                        pipeline.process(job).await;
                    });
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    jobs.close();
    let pending = in_flight.len();
    if pending > 0 {
        info!("Waiting up to {:?} for {} in-flight posts", grace, pending);
    }

    let drained = tokio::time::timeout(grace, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await
    .is_ok();

    if !drained {
        warn!("Abandoning {} in-flight posts after grace period", in_flight.len());
        in_flight.abort_all();
    }

    info!("Ingest workers stopped");
}
