use anyhow::Result;
use prometheus::{IntCounter, Registry};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Received,
    DecodeErrors,
    Duplicates,
    Retweets,
    Scored,
    ScoreFailures,
    Updates,
    Reconnects,
}

impl Counter {
    const ALL: [Counter; 8] = [
        Counter::Received,
        Counter::DecodeErrors,
        Counter::Duplicates,
        Counter::Retweets,
        Counter::Scored,
        Counter::ScoreFailures,
        Counter::Updates,
        Counter::Reconnects,
    ];

    fn name_and_help(self) -> (&'static str, &'static str) {
        match self {
            Counter::Received => ("evidence_posts_received_total", "Posts decoded from the stream"),
            Counter::DecodeErrors => ("evidence_decode_errors_total", "Stream lines that failed to decode"),
            Counter::Duplicates => ("evidence_duplicate_posts_total", "Posts already stored for a market"),
            Counter::Retweets => ("evidence_retweets_total", "Retweets stored without scoring"),
            Counter::Scored => ("evidence_posts_scored_total", "Posts scored successfully"),
            Counter::ScoreFailures => ("evidence_score_failures_total", "Posts left unscored"),
            Counter::Updates => ("evidence_probability_updates_total", "Updates that accepted evidence"),
            Counter::Reconnects => ("evidence_stream_reconnects_total", "Stream reconnect attempts"),
        }
    }
}

/// Process-wide ingest counters, registered in their own prometheus registry
pub struct IngestMetrics {
    registry: Registry,
    counters: [IntCounter; 8],
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub decode_errors: u64,
    pub duplicates: u64,
    pub retweets: u64,
    pub scored: u64,
    pub score_failures: u64,
    pub updates: u64,
    pub reconnects: u64,
}

impl IngestMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let mut counters = Vec::with_capacity(Counter::ALL.len());
        for counter in Counter::ALL {
            let (name, help) = counter.name_and_help();
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            counters.push(c);
        }
        let counters = counters
            .try_into()
            .map_err(|_| anyhow::anyhow!("counter table size mismatch"))?;

        Ok(Self { registry, counters })
    }

    fn counter(&self, counter: Counter) -> &IntCounter {
        &self.counters[counter as usize]
    }

    pub fn incr(&self, counter: Counter) {
        self.counter(counter).inc();
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counter(counter).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every counter
    pub fn gather_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.get(Counter::Received),
            decode_errors: self.get(Counter::DecodeErrors),
            duplicates: self.get(Counter::Duplicates),
            retweets: self.get(Counter::Retweets),
            scored: self.get(Counter::Scored),
            score_failures: self.get(Counter::ScoreFailures),
            updates: self.get(Counter::Updates),
            reconnects: self.get(Counter::Reconnects),
        }
    }
}

/// Log a counter summary every `every` until shutdown
pub async fn run_reporter(metrics: Arc<IngestMetrics>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let s = metrics.snapshot();
                info!(
                    received = s.received,
                    duplicates = s.duplicates,
                    retweets = s.retweets,
                    scored = s.scored,
                    score_failures = s.score_failures,
                    updates = s.updates,
                    decode_errors = s.decode_errors,
                    reconnects = s.reconnects,
                    "ingest metrics"
                );
                match metrics.gather_text() {
                    Ok(text) => debug!("{}", text),
                    Err(e) => warn!("Failed to encode metrics: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = IngestMetrics::new().unwrap();
        metrics.incr(Counter::Scored);
        metrics.incr(Counter::Scored);
        metrics.incr(Counter::Retweets);

        let s = metrics.snapshot();
        assert_eq!(s.scored, 2);
        assert_eq!(s.retweets, 1);
        assert_eq!(s.received, 0);
    }

    #[test]
    fn test_counters_exported_through_registry() {
        let metrics = IngestMetrics::new().unwrap();
        metrics.incr(Counter::Reconnects);

        let families = metrics.registry().gather();
        assert_eq!(families.len(), Counter::ALL.len());

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("evidence_stream_reconnects_total 1"));
        assert!(text.contains("evidence_posts_scored_total 0"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = IngestMetrics::new().unwrap();
        let b = IngestMetrics::new().unwrap();
        a.incr(Counter::Updates);
        assert_eq!(b.get(Counter::Updates), 0);
    }
}
