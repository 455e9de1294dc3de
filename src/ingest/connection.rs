use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use crate::data::decoder::{parse_line, LineDecoder, StreamEvent};
use crate::data::stream_api::{ChunkStream, PostSource, StreamError};
use crate::ingest::pipeline::IngestJob;
use crate::monitoring::metrics::{Counter, IngestMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Backoff,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Fixed wait after a failed connect that was not rate limited
    pub retry_delay: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub rate_limit_floor: Duration,
    /// Silence longer than this counts as a disconnect
    pub stall_timeout: Duration,
    pub jitter: bool,
}

impl ReconnectPolicy {
    /// How long to wait before the next connect attempt.
    ///
    /// `disconnects` is the number of consecutive sessions that dropped
    /// after connecting, and only matters when `was_streaming` is set.
    pub fn delay_for(
        &self,
        error: &StreamError,
        was_streaming: bool,
        disconnects: u32,
        now: DateTime<Utc>,
    ) -> Duration {
        match error {
            StreamError::RateLimited { reset_at } => rate_limit_wait(*reset_at, now, self.rate_limit_floor),
            _ if was_streaming || matches!(error, StreamError::Ended) => self.backoff(disconnects),
            _ => self.retry_delay,
        }
    }

    fn backoff(&self, disconnects: u32) -> Duration {
        let exp = disconnects.saturating_sub(1).min(16);
        let delay = self.reconnect_base.saturating_mul(1 << exp).min(self.reconnect_max);

        if self.jitter {
            // Up to 25% on top
            let extra = delay.mul_f64(0.25 * rand::thread_rng().gen::<f64>());
            delay + extra
        } else {
            delay
        }
    }
}

/// Time until the provider's reset instant, never less than `floor`
pub fn rate_limit_wait(reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>, floor: Duration) -> Duration {
    reset_at
        .and_then(|reset| (reset - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
        .max(floor)
}

enum SessionEnd {
    Shutdown,
    Failed { error: StreamError, delivered: bool },
}

/// Owns the single filtered-stream connection for a credential set
pub struct StreamConsumer<S> {
    source: S,
    policy: ReconnectPolicy,
    state: ConnectionState,
    metrics: Arc<IngestMetrics>,
}

impl<S: PostSource> StreamConsumer<S> {
    pub fn new(source: S, policy: ReconnectPolicy, metrics: Arc<IngestMetrics>) -> Self {
        Self {
            source,
            policy,
            state: ConnectionState::Disconnected,
            metrics,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            info!("Stream connection: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Connect, stream, back off, repeat until shutdown or the job queue closes
    pub async fn run(&mut self, jobs: mpsc::Sender<IngestJob>, mut shutdown: watch::Receiver<bool>) {
        let mut disconnects: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.transition(ConnectionState::Connecting);
            let connected = tokio::select! {
                result = self.source.connect() => result,
                _ = shutdown.changed() => break,
            };

            let (error, was_streaming) = match connected {
                Ok(stream) => {
                    self.transition(ConnectionState::Streaming);
                    match self.consume(stream, &jobs, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Failed { error, delivered } => {
                            if delivered {
                                disconnects = 0;
                            }
                            disconnects += 1;
                            (error, true)
                        }
                    }
                }
                Err(error) => (error, false),
            };

            self.metrics.incr(Counter::Reconnects);
            let delay = self.policy.delay_for(&error, was_streaming, disconnects, Utc::now());
            self.transition(ConnectionState::Backoff);
            warn!("Stream failure: {} (retrying in {:?})", error, delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.transition(ConnectionState::Disconnected);
    }

    async fn consume(
        &mut self,
        mut stream: ChunkStream,
        jobs: &mpsc::Sender<IngestJob>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut decoder = LineDecoder::new();
        let mut delivered = false;

        loop {
            let next = tokio::select! {
                next = tokio::time::timeout(self.policy.stall_timeout, stream.next()) => next,
                _ = shutdown.changed() => return SessionEnd::Shutdown,
            };

            let chunk = match next {
                Err(_) => {
                    return SessionEnd::Failed {
                        error: StreamError::Transport(format!("no data for {:?}", self.policy.stall_timeout)),
                        delivered,
                    };
                }
                Ok(None) => return SessionEnd::Failed { error: StreamError::Ended, delivered },
                Ok(Some(Err(error))) => return SessionEnd::Failed { error, delivered },
                Ok(Some(Ok(chunk))) => chunk,
            };
            delivered = true;

            for line in decoder.push(&chunk) {
                let event = line.and_then(|l| parse_line(&l, Utc::now()));
                match event {
                    Ok(StreamEvent::Post { post, market_ids }) => {
                        self.metrics.incr(Counter::Received);
                        if market_ids.is_empty() {
                            debug!(post_id = %post.id, "post matched no market rules");
                            continue;
                        }
                        // Waits when the queue is full
                        if jobs.send(IngestJob { post, market_ids }).await.is_err() {
                            return SessionEnd::Shutdown;
                        }
                    }
                    Ok(StreamEvent::Errors(errors)) => {
                        warn!(?errors, "stream reported errors");
                    }
                    Err(e) => {
                        self.metrics.incr(Counter::DecodeErrors);
                        warn!("Dropping undecodable stream line: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            retry_delay: Duration::from_millis(5),
            reconnect_base: Duration::from_millis(1),
            reconnect_max: Duration::from_millis(8),
            rate_limit_floor: Duration::from_millis(5),
            stall_timeout: Duration::from_secs(5),
            jitter: false,
        }
    }

    #[test]
    fn test_rate_limit_waits_for_reset() {
        let p = ReconnectPolicy { rate_limit_floor: Duration::from_secs(5), ..policy() };
        let now = Utc::now();

        let far = StreamError::RateLimited { reset_at: Some(now + ChronoDuration::seconds(90)) };
        assert_eq!(p.delay_for(&far, false, 0, now), Duration::from_secs(90));

        let near = StreamError::RateLimited { reset_at: Some(now + ChronoDuration::seconds(1)) };
        assert_eq!(p.delay_for(&near, false, 0, now), Duration::from_secs(5));

        let past = StreamError::RateLimited { reset_at: Some(now - ChronoDuration::seconds(30)) };
        assert_eq!(p.delay_for(&past, false, 0, now), Duration::from_secs(5));

        let unknown = StreamError::RateLimited { reset_at: None };
        assert_eq!(p.delay_for(&unknown, false, 0, now), Duration::from_secs(5));
    }

    #[test]
    fn test_disconnect_backoff_grows_and_caps() {
        let p = policy();
        let now = Utc::now();
        let delays: Vec<Duration> = (1..=6)
            .map(|n| p.delay_for(&StreamError::Ended, true, n, now))
            .collect();

        assert_eq!(delays[0], Duration::from_millis(1));
        assert_eq!(delays[1], Duration::from_millis(2));
        assert_eq!(delays[2], Duration::from_millis(4));
        assert_eq!(delays[5], Duration::from_millis(8));
    }

    #[test]
    fn test_other_failures_use_fixed_delay() {
        let p = policy();
        let err = StreamError::Http { status: reqwest::StatusCode::SERVICE_UNAVAILABLE, body: String::new() };
        assert_eq!(p.delay_for(&err, false, 3, Utc::now()), Duration::from_millis(5));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let p = ReconnectPolicy { jitter: true, reconnect_base: Duration::from_millis(100), reconnect_max: Duration::from_secs(1), ..policy() };
        for _ in 0..50 {
            let d = p.delay_for(&StreamError::Ended, true, 1, Utc::now());
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(125));
        }
    }

    /// Replays scripted sessions, then refuses further connections
    struct ScriptedSource {
        sessions: Mutex<VecDeque<Vec<&'static str>>>,
        connects: Mutex<usize>,
    }

    #[async_trait]
    impl PostSource for &ScriptedSource {
        async fn connect(&self) -> Result<ChunkStream, StreamError> {
            *self.connects.lock().unwrap() += 1;
            match self.sessions.lock().unwrap().pop_front() {
                Some(chunks) => Ok(stream::iter(chunks.into_iter().map(|c| Ok::<_, StreamError>(c.as_bytes().to_vec()))).boxed()),
                None => Err(StreamError::Http { status: reqwest::StatusCode::SERVICE_UNAVAILABLE, body: String::new() }),
            }
        }
    }

    const POST_A: &str = "{\"data\":{\"id\":\"1\",\"text\":\"a\",\"author_id\":\"u\"},\"matching_rules\":[{\"id\":\"r\",\"tag\":\"market:m1:0\"}]}\n";
    const POST_B: &str = "{\"data\":{\"id\":\"2\",\"text\":\"b\",\"author_id\":\"u\"},\"matching_rules\":[{\"id\":\"r\",\"tag\":\"market:m2:0\"}]}\n";

    #[tokio::test]
    async fn test_reconnects_after_disconnect_and_delivers() {
        let source = ScriptedSource {
            sessions: Mutex::new(VecDeque::from(vec![
                vec!["{\"data\":{\"id\":\"1\",", "\"text\":\"a\",\"author_id\":\"u\"},\"matching_rules\":[{\"id\":\"r\",\"tag\":\"market:m1:0\"}]}\n", "garbage\n"],
                vec!["\r\n", POST_B],
            ])),
            connects: Mutex::new(0),
        };
        let metrics = Arc::new(IngestMetrics::new().unwrap());
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut consumer = StreamConsumer::new(&source, policy(), Arc::clone(&metrics));
        let run = consumer.run(tx, shutdown_rx);
        let collect = async {
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            shutdown_tx.send(true).unwrap();
            (first, second)
        };

        let (_, (first, second)) = tokio::join!(run, collect);

        assert_eq!(first.post.id, "1");
        assert_eq!(first.market_ids, vec!["m1".to_string()]);
        assert_eq!(second.post.id, "2");
        assert!(*source.connects.lock().unwrap() >= 2);
        assert_eq!(metrics.snapshot().decode_errors, 1);
        assert_eq!(consumer.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stops_when_queue_closes() {
        let source = ScriptedSource {
            sessions: Mutex::new(VecDeque::from(vec![vec![POST_A, POST_A]])),
            connects: Mutex::new(0),
        };
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut consumer = StreamConsumer::new(&source, policy(), Arc::new(IngestMetrics::new().unwrap()));
        consumer.run(tx, shutdown_rx).await;

        assert_eq!(*source.connects.lock().unwrap(), 1);
    }
}
