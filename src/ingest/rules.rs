use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use crate::data::stream_api::{RulesApi, StreamError};
use crate::data::types::{LiveRule, Market, RuleTag, StreamRule};
use crate::execution::persistence::StateStore;
use crate::ingest::connection::rate_limit_wait;

/// One rule per template of every active market
pub fn desired_rules(markets: &[Market]) -> Vec<StreamRule> {
    markets
        .iter()
        .filter(|m| m.active)
        .flat_map(|m| {
            m.rule_templates
                .iter()
                .enumerate()
                .filter(|(_, value)| !value.trim().is_empty())
                .map(move |(i, value)| StreamRule {
                    value: value.trim().to_string(),
                    tag: RuleTag::new(m.id.clone(), i).to_string(),
                })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDiff {
    pub to_add: Vec<StreamRule>,
    /// Provider rule ids
    pub to_delete: Vec<String>,
}

impl RuleDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_delete.is_empty()
    }
}

/// Diff by tag and query.
///
/// A desired rule already live with the same query is never re-added. A
/// live rule whose template changed is deleted and re-added with the new
/// query. Live rules with a market tag that is no longer desired are
/// deleted; rules without a market tag were not created here and are left
/// alone.
pub fn diff_rules(live: &[LiveRule], desired: &[StreamRule]) -> RuleDiff {
    let desired_by_tag: HashMap<&str, &str> = desired
        .iter()
        .map(|r| (r.tag.as_str(), r.value.as_str()))
        .collect();

    let current: HashSet<(&str, &str)> = live
        .iter()
        .filter_map(|r| r.tag.as_deref().map(|tag| (tag, r.value.as_str())))
        .filter(|(tag, value)| desired_by_tag.get(tag) == Some(value))
        .collect();

    let mut seen = HashSet::new();
    let to_add = desired
        .iter()
        .filter(|r| !current.contains(&(r.tag.as_str(), r.value.as_str())))
        .filter(|r| seen.insert(r.tag.as_str()))
        .cloned()
        .collect();

    let to_delete = live
        .iter()
        .filter(|r| match r.tag.as_deref() {
            Some(tag) => {
                RuleTag::parse(tag).is_some() && desired_by_tag.get(tag) != Some(&r.value.as_str())
            }
            None => false,
        })
        .map(|r| r.id.clone())
        .collect();

    RuleDiff { to_add, to_delete }
}

pub struct RuleSynchronizer<A> {
    api: A,
}

impl<A: RulesApi> RuleSynchronizer<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    /// Bring live rules in line with `markets`; at most one add and one delete call
    pub async fn sync(&self, markets: &[Market]) -> Result<RuleDiff, StreamError> {
        let live = self.api.get_rules().await?;
        let diff = diff_rules(&live, &desired_rules(markets));

        if diff.is_empty() {
            debug!(live = live.len(), "stream rules already in sync");
            return Ok(diff);
        }

        if !diff.to_delete.is_empty() {
            self.api.delete_rules(&diff.to_delete).await?;
            info!(count = diff.to_delete.len(), "deleted stale stream rules");
        }
        if !diff.to_add.is_empty() {
            self.api.add_rules(&diff.to_add).await?;
            info!(count = diff.to_add.len(), "added stream rules");
        }

        Ok(diff)
    }
}

/// Fingerprint of what the rule set depends on
pub fn market_fingerprint(markets: &[Market]) -> BTreeSet<(String, Vec<String>)> {
    markets
        .iter()
        .filter(|m| m.active)
        .map(|m| (m.id.clone(), m.rule_templates.clone()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct SyncSchedule {
    pub interval: Duration,
    pub market_poll: Duration,
    /// Pause after a failed sync that was not rate limited
    pub retry_delay: Duration,
    pub rate_limit_floor: Duration,
}

impl SyncSchedule {
    fn pause_after(&self, error: &StreamError) -> Duration {
        match error {
            StreamError::RateLimited { reset_at } => rate_limit_wait(*reset_at, Utc::now(), self.rate_limit_floor),
            _ => self.retry_delay,
        }
    }
}

/// Run rule sync on startup, on every interval tick, whenever `trigger`
/// fires, and whenever the active market set changes between polls.
///
/// After a failure nothing is attempted until the pause has passed; a
/// rate-limited endpoint is left alone until its reset instant.
pub async fn run_sync_loop<A: RulesApi>(
    sync: RuleSynchronizer<A>,
    store: Arc<StateStore>,
    schedule: SyncSchedule,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(schedule.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut poll = tokio::time::interval(schedule.market_poll);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The interval's first tick already covers startup
    poll.tick().await;
    let mut last_fingerprint = None;

    loop {
        let reason = tokio::select! {
            _ = interval.tick() => "interval",
            _ = trigger.notified() => "trigger",
            _ = poll.tick() => {
                let fingerprint = match store.active_markets() {
                    Ok(markets) => market_fingerprint(&markets),
                    Err(e) => {
                        warn!("Failed to poll active markets: {:#}", e);
                        continue;
                    }
                };
                if last_fingerprint.as_ref() == Some(&fingerprint) {
                    continue;
                }
                "markets changed"
            }
            _ = shutdown.changed() => break,
        };

        let markets = match store.active_markets() {
            Ok(markets) => markets,
            Err(e) => {
                error!("Failed to load active markets for rule sync: {:#}", e);
                continue;
            }
        };

        match sync.sync(&markets).await {
            Ok(diff) => {
                debug!(reason, added = diff.to_add.len(), deleted = diff.to_delete.len(), "rule sync complete");
                last_fingerprint = Some(market_fingerprint(&markets));
            }
            Err(e) => {
                let pause = schedule.pause_after(&e);
                warn!(reason, "Rule sync failed, pausing {:?}: {}", pause, e);
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    info!("Rule sync loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::Mutex;
    use crate::data::types::Outcome;

    /// In-memory rules endpoint that records every call
    #[derive(Default)]
    struct FakeRulesApi {
        rules: Mutex<Vec<LiveRule>>,
        next_id: Mutex<u64>,
        get_calls: Mutex<usize>,
        add_calls: Mutex<usize>,
        delete_calls: Mutex<usize>,
        /// When set, every GET answers 429 with this reset instant
        rate_limited_until: Mutex<Option<DateTime<Utc>>>,
    }

    impl FakeRulesApi {
        fn tags(&self) -> Vec<String> {
            self.rules.lock().unwrap().iter().filter_map(|r| r.tag.clone()).collect()
        }
    }

    #[async_trait]
    impl RulesApi for &FakeRulesApi {
        async fn get_rules(&self) -> Result<Vec<LiveRule>, StreamError> {
            *self.get_calls.lock().unwrap() += 1;
            if let Some(reset_at) = *self.rate_limited_until.lock().unwrap() {
                return Err(StreamError::RateLimited { reset_at: Some(reset_at) });
            }
            Ok(self.rules.lock().unwrap().clone())
        }

        async fn add_rules(&self, rules: &[StreamRule]) -> Result<(), StreamError> {
            *self.add_calls.lock().unwrap() += 1;
            let mut live = self.rules.lock().unwrap();
            let mut next = self.next_id.lock().unwrap();
            for rule in rules {
                *next += 1;
                live.push(LiveRule { id: next.to_string(), value: rule.value.clone(), tag: Some(rule.tag.clone()) });
            }
            Ok(())
        }

        async fn delete_rules(&self, ids: &[String]) -> Result<(), StreamError> {
            *self.delete_calls.lock().unwrap() += 1;
            self.rules.lock().unwrap().retain(|r| !ids.contains(&r.id));
            Ok(())
        }
    }

    fn market(id: &str, templates: &[&str]) -> Market {
        Market {
            id: id.to_string(),
            question: "?".to_string(),
            outcomes: vec![
                Outcome { id: "y".to_string(), label: "Yes".to_string(), prior_probability: 0.5 },
                Outcome { id: "n".to_string(), label: "No".to_string(), prior_probability: 0.5 },
            ],
            rule_templates: templates.iter().map(|t| t.to_string()).collect(),
            active: true,
        }
    }

    fn live(id: &str, tag: Option<&str>) -> LiveRule {
        LiveRule { id: id.to_string(), value: "x".to_string(), tag: tag.map(str::to_string) }
    }

    #[test]
    fn test_desired_rules_tagging() {
        let mut inactive = market("m2", &["ignored"]);
        inactive.active = false;
        let rules = desired_rules(&[market("m1", &["a", " ", "b"]), inactive]);

        let tags: Vec<&str> = rules.iter().map(|r| r.tag.as_str()).collect();
        assert_eq!(tags, vec!["market:m1:0", "market:m1:2"]);
    }

    #[test]
    fn test_diff_adds_missing_and_deletes_stale() {
        let desired = desired_rules(&[market("m1", &["a", "b"])]);
        let live_rules = vec![
            LiveRule { id: "1".to_string(), value: "a".to_string(), tag: Some("market:m1:0".to_string()) },
            live("2", Some("market:gone:0")),
            live("3", Some("handmade")),
            live("4", None),
        ];

        let diff = diff_rules(&live_rules, &desired);

        assert_eq!(diff.to_add.len(), 1);
        assert_eq!(diff.to_add[0].tag, "market:m1:1");
        assert_eq!(diff.to_delete, vec!["2".to_string()]);
    }

    #[test]
    fn test_diff_replaces_rule_with_changed_query() {
        let desired = desired_rules(&[market("m1", &["alice OR bob"])]);
        let live_rules = vec![LiveRule {
            id: "7".to_string(),
            value: "alice".to_string(),
            tag: Some("market:m1:0".to_string()),
        }];

        let diff = diff_rules(&live_rules, &desired);

        assert_eq!(diff.to_delete, vec!["7".to_string()]);
        assert_eq!(diff.to_add.len(), 1);
        assert_eq!(diff.to_add[0].value, "alice OR bob");
    }

    #[tokio::test]
    async fn test_sync_applies_template_edit() {
        let api = FakeRulesApi::default();
        let sync = RuleSynchronizer::new(&api);

        sync.sync(&[market("m1", &["alice"])]).await.unwrap();
        sync.sync(&[market("m1", &["alice OR bob"])]).await.unwrap();

        let live = api.rules.lock().unwrap().clone();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].value, "alice OR bob");
        assert_eq!(*api.delete_calls.lock().unwrap(), 1);
        assert_eq!(*api.add_calls.lock().unwrap(), 2);

        let again = sync.sync(&[market("m1", &["alice OR bob"])]).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let api = FakeRulesApi::default();
        let sync = RuleSynchronizer::new(&api);
        let markets = vec![market("m1", &["a", "b"]), market("m2", &["c"])];

        let first = sync.sync(&markets).await.unwrap();
        assert_eq!(first.to_add.len(), 3);
        assert_eq!(*api.add_calls.lock().unwrap(), 1);

        let second = sync.sync(&markets).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(*api.add_calls.lock().unwrap(), 1);
        assert_eq!(*api.delete_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sync_removes_deactivated_market_in_one_call() {
        let api = FakeRulesApi::default();
        let sync = RuleSynchronizer::new(&api);

        sync.sync(&[market("m1", &["a"]), market("m2", &["b", "c"])]).await.unwrap();
        let diff = sync.sync(&[market("m1", &["a"])]).await.unwrap();

        assert_eq!(diff.to_delete.len(), 2);
        assert_eq!(*api.delete_calls.lock().unwrap(), 1);
        let remaining: Vec<Option<String>> = api.rules.lock().unwrap().iter().map(|r| r.tag.clone()).collect();
        assert_eq!(remaining, vec![Some("market:m1:0".to_string())]);
    }

    #[test]
    fn test_fingerprint_tracks_templates() {
        let a = market_fingerprint(&[market("m1", &["a"])]);
        let b = market_fingerprint(&[market("m1", &["a", "b"])]);
        assert_ne!(a, b);
        assert_eq!(a, market_fingerprint(&[market("m1", &["a"])]));
    }

    fn schedule(market_poll: Duration) -> SyncSchedule {
        SyncSchedule {
            interval: Duration::from_secs(3600),
            market_poll,
            retry_delay: Duration::from_millis(10),
            rate_limit_floor: Duration::from_millis(10),
        }
    }

    fn store_with(markets: &[Market]) -> Arc<StateStore> {
        let store = Arc::new(StateStore::in_memory().unwrap());
        for m in markets {
            store.upsert_market(m).unwrap();
        }
        store
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_loop_syncs_on_trigger() {
        let api = FakeRulesApi::default();
        let store = store_with(&[market("m1", &["a"])]);
        let trigger = Arc::new(Notify::new());
        let (tx, rx) = watch::channel(false);

        let run = run_sync_loop(
            RuleSynchronizer::new(&api),
            Arc::clone(&store),
            schedule(Duration::from_secs(3600)),
            Arc::clone(&trigger),
            rx,
        );
        let drive = async {
            wait_for(|| api.tags() == vec!["market:m1:0".to_string()]).await;
            store.upsert_market(&market("m2", &["b"])).unwrap();
            trigger.notify_one();
            wait_for(|| api.tags().len() == 2).await;
            tx.send(true).unwrap();
        };
        tokio::join!(run, drive);

        assert_eq!(api.tags(), vec!["market:m1:0".to_string(), "market:m2:0".to_string()]);
    }

    #[tokio::test]
    async fn test_loop_syncs_when_active_markets_change() {
        let api = FakeRulesApi::default();
        let store = store_with(&[market("m1", &["a"]), market("m2", &["b"])]);
        let (tx, rx) = watch::channel(false);

        let run = run_sync_loop(
            RuleSynchronizer::new(&api),
            Arc::clone(&store),
            schedule(Duration::from_millis(20)),
            Arc::new(Notify::new()),
            rx,
        );
        let drive = async {
            wait_for(|| api.tags().len() == 2).await;
            store.set_market_active("m1", false).unwrap();
            wait_for(|| api.tags().len() == 1).await;
            tx.send(true).unwrap();
        };
        tokio::join!(run, drive);

        assert_eq!(api.tags(), vec!["market:m2:0".to_string()]);
        assert_eq!(*api.delete_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_markets_do_not_resync_on_poll() {
        let api = FakeRulesApi::default();
        let store = store_with(&[market("m1", &["a"])]);
        let (tx, rx) = watch::channel(false);

        let run = run_sync_loop(
            RuleSynchronizer::new(&api),
            store,
            schedule(Duration::from_millis(10)),
            Arc::new(Notify::new()),
            rx,
        );
        let drive = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            tx.send(true).unwrap();
        };
        tokio::join!(run, drive);

        assert_eq!(*api.get_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_sync_waits_for_reset() {
        let api = FakeRulesApi::default();
        *api.rate_limited_until.lock().unwrap() = Some(Utc::now() + chrono::Duration::seconds(600));
        let store = store_with(&[market("m1", &["a"])]);
        let trigger = Arc::new(Notify::new());
        let (tx, rx) = watch::channel(false);

        let run = run_sync_loop(
            RuleSynchronizer::new(&api),
            store,
            schedule(Duration::from_millis(10)),
            Arc::clone(&trigger),
            rx,
        );
        let drive = async {
            for _ in 0..20 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                trigger.notify_one();
            }
            tx.send(true).unwrap();
        };
        // Shutdown must still interrupt the long pause
        tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(run, drive) })
            .await
            .unwrap();

        assert_eq!(*api.get_calls.lock().unwrap(), 1);
        assert_eq!(*api.add_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_sync_retries_after_delay() {
        let api = FakeRulesApi::default();
        *api.rate_limited_until.lock().unwrap() = Some(Utc::now() - chrono::Duration::seconds(1));
        let store = store_with(&[market("m1", &["a"])]);
        let trigger = Arc::new(Notify::new());
        let (tx, rx) = watch::channel(false);

        let run = run_sync_loop(
            RuleSynchronizer::new(&api),
            store,
            schedule(Duration::from_secs(3600)),
            Arc::clone(&trigger),
            rx,
        );
        let drive = async {
            wait_for(|| *api.get_calls.lock().unwrap() == 1).await;
            *api.rate_limited_until.lock().unwrap() = None;
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.notify_one();
            wait_for(|| !api.tags().is_empty()).await;
            tx.send(true).unwrap();
        };
        tokio::join!(run, drive);

        assert_eq!(api.tags(), vec!["market:m1:0".to_string()]);
    }
}
