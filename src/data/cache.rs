use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use crate::data::types::Market;

/// Markets (question + outcome set) looked up while scoring posts
pub struct MarketCache {
    cache: DashMap<String, CachedMarket>,
    ttl: Duration,
}

struct CachedMarket {
    market: Arc<Market>,
    timestamp: Instant,
}

impl MarketCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
        }
    }

    pub fn insert(&self, market: Market) -> Arc<Market> {
        let market = Arc::new(market);
        self.cache.insert(market.id.clone(), CachedMarket {
            market: Arc::clone(&market),
            timestamp: Instant::now(),
        });
        market
    }

    /// Get market if not expired (evict on read)
    pub fn get(&self, market_id: &str) -> Option<Arc<Market>> {
        let entry = self.cache.get(market_id)?;
        if entry.timestamp.elapsed() > self.ttl {
            drop(entry); // Drop the read lock
            self.cache.remove(market_id);
            None
        } else {
            Some(Arc::clone(&entry.market))
        }
    }

    pub fn invalidate(&self, market_id: &str) {
        self.cache.remove(market_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn market(id: &str) -> Market {
        Market {
            id: id.to_string(),
            question: "?".to_string(),
            outcomes: vec![],
            rule_templates: vec![],
            active: true,
        }
    }

    #[test]
    fn test_cache_insert_and_get() {
        let cache = MarketCache::new(Duration::from_secs(60));
        cache.insert(market("m1"));

        assert_eq!(cache.get("m1").map(|m| m.id.clone()), Some("m1".to_string()));
        assert!(cache.get("m2").is_none());
    }

    #[test]
    fn test_cache_ttl_expiration() {
        let cache = MarketCache::new(Duration::from_millis(50));
        cache.insert(market("m1"));
        assert!(cache.get("m1").is_some());

        thread::sleep(Duration::from_millis(80));

        assert!(cache.get("m1").is_none());
        assert!(cache.cache.is_empty());
    }

    #[test]
    fn test_invalidate() {
        let cache = MarketCache::new(Duration::from_secs(60));
        cache.insert(market("m1"));
        cache.insert(market("m2"));
        cache.invalidate("m1");
        assert!(cache.get("m1").is_none());
        assert!(cache.get("m2").is_some());
    }
}
