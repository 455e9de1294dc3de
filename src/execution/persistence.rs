use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};
use crate::data::scoring::ScoredOutcomes;
use crate::data::types::{
    InboundPost, Market, MarketProbabilityState, Outcome, PostFeatures, Probabilities,
    ProbabilitySnapshot,
};
use crate::engine::Diagnostics;

/// Durable market state, posts and probability history
pub struct StateStore {
    conn: Mutex<Connection>,
}

/// Author activity row used to rebuild the dilution window
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorPost {
    pub post_id: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
}

impl StateStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS markets (
                id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                rule_templates TEXT NOT NULL DEFAULT '[]',
                post_count INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL
            );

            CREATE TABLE IF NOT EXISTS outcomes (
                market_id TEXT NOT NULL,
                outcome_id TEXT NOT NULL,
                label TEXT NOT NULL,
                prior_probability REAL NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (market_id, outcome_id),
                FOREIGN KEY(market_id) REFERENCES markets(id)
            );

            CREATE TABLE IF NOT EXISTS raw_posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                market_id TEXT NOT NULL,
                post_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                author_handle TEXT,
                author_followers INTEGER NOT NULL,
                author_verified INTEGER NOT NULL,
                text TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL,
                received_at TIMESTAMP NOT NULL,
                is_retweet INTEGER NOT NULL,
                metrics TEXT NOT NULL,
                features TEXT NOT NULL,
                UNIQUE(market_id, post_id)
            );

            CREATE TABLE IF NOT EXISTS scored_posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                market_id TEXT NOT NULL,
                post_id TEXT NOT NULL,
                outcome_id TEXT NOT NULL,
                relevance REAL NOT NULL,
                stance REAL NOT NULL,
                strength REAL NOT NULL,
                credibility REAL NOT NULL,
                confidence REAL NOT NULL,
                semantic_strength REAL NOT NULL,
                signed_signal REAL NOT NULL,
                stance_label TEXT,
                rationale TEXT,
                scored_at TIMESTAMP NOT NULL,
                UNIQUE(market_id, post_id, outcome_id)
            );

            CREATE TABLE IF NOT EXISTS market_state (
                market_id TEXT PRIMARY KEY,
                probabilities TEXT NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );

            CREATE TABLE IF NOT EXISTS probability_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                market_id TEXT NOT NULL,
                probabilities TEXT NOT NULL,
                diagnostics TEXT NOT NULL,
                timestamp TIMESTAMP NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_markets_status ON markets(status);
            CREATE INDEX IF NOT EXISTS idx_raw_posts_market_created ON raw_posts(market_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_scored_posts_market ON scored_posts(market_id);
            CREATE INDEX IF NOT EXISTS idx_snapshots_market_ts ON probability_snapshots(market_id, timestamp);
            "#
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("database mutex poisoned"))
    }

    /// Insert or replace a market and its outcome set
    pub fn upsert_market(&self, market: &Market) -> Result<()> {
        market.validate()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO markets (id, question, status, rule_templates, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                question = excluded.question,
                status = excluded.status,
                rule_templates = excluded.rule_templates",
            params![
                market.id,
                market.question,
                status_str(market.active),
                serde_json::to_string(&market.rule_templates)?,
                ts(Utc::now()),
            ],
        )?;

        tx.execute("DELETE FROM outcomes WHERE market_id = ?1", params![market.id])?;
        for (position, outcome) in market.outcomes.iter().enumerate() {
            tx.execute(
                "INSERT INTO outcomes (market_id, outcome_id, label, prior_probability, position)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![market.id, outcome.id, outcome.label, outcome.prior_probability, position as i64],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn set_market_active(&self, market_id: &str, active: bool) -> Result<()> {
        self.conn()?.execute(
            "UPDATE markets SET status = ?1 WHERE id = ?2",
            params![status_str(active), market_id],
        )?;
        Ok(())
    }

    pub fn active_markets(&self) -> Result<Vec<Market>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM markets WHERE status = 'active' ORDER BY id"
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut markets = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(market) = load_market(&conn, &id)? {
                markets.push(market);
            }
        }
        Ok(markets)
    }

    pub fn get_market(&self, market_id: &str) -> Result<Option<Market>> {
        let conn = self.conn()?;
        load_market(&conn, market_id)
    }

    /// Current status without loading outcomes; unknown markets are inactive
    pub fn is_market_active(&self, market_id: &str) -> Result<bool> {
        let status: Option<String> = self
            .conn()?
            .query_row(
                "SELECT status FROM markets WHERE id = ?1",
                params![market_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref() == Some(status_str(true)))
    }

    pub fn raw_post_exists(&self, market_id: &str, post_id: &str) -> Result<bool> {
        let exists: bool = self.conn()?.query_row(
            "SELECT EXISTS(SELECT 1 FROM raw_posts WHERE market_id = ?1 AND post_id = ?2)",
            params![market_id, post_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Store a raw post; returns false if this market already has it
    pub fn insert_raw_post(
        &self,
        market_id: &str,
        post: &InboundPost,
        is_retweet: bool,
        features: &PostFeatures,
    ) -> Result<bool> {
        let inserted = self.conn()?.execute(
            "INSERT OR IGNORE INTO raw_posts
                (market_id, post_id, author_id, author_handle, author_followers, author_verified,
                 text, created_at, received_at, is_retweet, metrics, features)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                market_id,
                post.id,
                post.author_id,
                post.author_handle,
                post.author_followers as i64,
                post.author_verified,
                post.text,
                ts(post.created_at),
                ts(Utc::now()),
                is_retweet,
                serde_json::to_string(&post.engagement)?,
                serde_json::to_string(features)?,
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn count_raw_posts(&self, market_id: &str) -> Result<usize> {
        let count: usize = self.conn()?.query_row(
            "SELECT COUNT(*) FROM raw_posts WHERE market_id = ?1",
            params![market_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Bump the running post counter; unknown markets report 0
    pub fn increment_post_count(&self, market_id: &str) -> Result<u64> {
        let count: Option<i64> = self.conn()?.query_row(
            "UPDATE markets SET post_count = post_count + 1 WHERE id = ?1 RETURNING post_count",
            params![market_id],
            |row| row.get(0),
        ).optional()?;
        Ok(count.unwrap_or(0) as u64)
    }

    pub fn post_count(&self, market_id: &str) -> Result<u64> {
        let count: Option<i64> = self.conn()?.query_row(
            "SELECT post_count FROM markets WHERE id = ?1",
            params![market_id],
            |row| row.get(0),
        ).optional()?;
        Ok(count.unwrap_or(0) as u64)
    }

    pub fn insert_scored_post(&self, market_id: &str, post_id: &str, scored: &ScoredOutcomes) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let scored_at = ts(Utc::now());

        for (outcome_id, score) in &scored.scores {
            let labels = scored.labels.get(outcome_id);
            let semantic = score.semantic_strength();
            tx.execute(
                "INSERT OR REPLACE INTO scored_posts
                    (market_id, post_id, outcome_id, relevance, stance, strength, credibility,
                     confidence, semantic_strength, signed_signal, stance_label, rationale, scored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    market_id,
                    post_id,
                    outcome_id,
                    score.relevance,
                    score.stance,
                    score.strength,
                    score.credibility,
                    score.confidence,
                    semantic,
                    score.clamped_stance() * semantic,
                    labels.and_then(|l| l.stance_label.as_deref()),
                    labels.and_then(|l| l.rationale.as_deref()),
                    scored_at,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Scored posts for a market created at or after `since`
    pub fn recent_scored_authors(&self, market_id: &str, since: DateTime<Utc>) -> Result<Vec<AuthorPost>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT r.post_id, r.author_id, r.created_at
             FROM raw_posts r
             JOIN scored_posts s ON s.market_id = r.market_id AND s.post_id = r.post_id
             WHERE r.market_id = ?1 AND r.created_at >= ?2"
        )?;

        let rows = stmt.query_map(params![market_id, ts(since)], |row| {
            let created_at: String = row.get(2)?;
            Ok(AuthorPost {
                post_id: row.get(0)?,
                author_id: row.get(1)?,
                created_at: parse_ts(2, &created_at)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.into())
    }

    pub fn load_state(&self, market_id: &str) -> Result<Option<MarketProbabilityState>> {
        let row: Option<(String, String)> = self.conn()?.query_row(
            "SELECT probabilities, updated_at FROM market_state WHERE market_id = ?1",
            params![market_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ).optional()?;

        let Some((probabilities, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(MarketProbabilityState {
            market_id: market_id.to_string(),
            probabilities: serde_json::from_str(&probabilities)?,
            updated_at: parse_ts(1, &updated_at)?,
        }))
    }

    /// Replace the current state and append a snapshot in one transaction.
    ///
    /// The snapshot timestamp never goes backwards for a market.
    pub fn save_state(&self, state: &MarketProbabilityState, diagnostics: &Diagnostics) -> Result<ProbabilitySnapshot> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let last: Option<String> = tx.query_row(
            "SELECT MAX(timestamp) FROM probability_snapshots WHERE market_id = ?1",
            params![state.market_id],
            |row| row.get(0),
        )?;
        let timestamp = match last {
            Some(raw) => parse_ts(0, &raw)?.max(state.updated_at),
            None => state.updated_at,
        };

        let probabilities = serde_json::to_string(&state.probabilities)?;
        tx.execute(
            "INSERT INTO market_state (market_id, probabilities, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(market_id) DO UPDATE SET
                probabilities = excluded.probabilities,
                updated_at = excluded.updated_at",
            params![state.market_id, probabilities, ts(timestamp)],
        )?;
        tx.execute(
            "INSERT INTO probability_snapshots (market_id, probabilities, diagnostics, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![state.market_id, probabilities, serde_json::to_string(diagnostics)?, ts(timestamp)],
        )?;

        tx.commit()?;

        Ok(ProbabilitySnapshot {
            market_id: state.market_id.clone(),
            probabilities: state.probabilities.clone(),
            timestamp,
        })
    }

    pub fn snapshots(&self, market_id: &str) -> Result<Vec<ProbabilitySnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT probabilities, timestamp FROM probability_snapshots
             WHERE market_id = ?1 ORDER BY id"
        )?;

        let rows = stmt.query_map(params![market_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (probabilities, timestamp) = row?;
            let probabilities: Probabilities = serde_json::from_str(&probabilities)?;
            snapshots.push(ProbabilitySnapshot {
                market_id: market_id.to_string(),
                probabilities,
                timestamp: parse_ts(1, &timestamp)?,
            });
        }
        Ok(snapshots)
    }
}

fn load_market(conn: &Connection, market_id: &str) -> Result<Option<Market>> {
    let row: Option<(String, String, String)> = conn.query_row(
        "SELECT question, status, rule_templates FROM markets WHERE id = ?1",
        params![market_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    ).optional()?;

    let Some((question, status, rule_templates)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT outcome_id, label, prior_probability FROM outcomes
         WHERE market_id = ?1 ORDER BY position"
    )?;
    let outcomes = stmt
        .query_map(params![market_id], |row| {
            Ok(Outcome {
                id: row.get(0)?,
                label: row.get(1)?,
                prior_probability: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(Market {
        id: market_id.to_string(),
        question,
        outcomes,
        rule_templates: serde_json::from_str(&rule_templates)
            .with_context(|| format!("Bad rule templates for market {}", market_id))?,
        active: status == "active",
    }))
}

fn status_str(active: bool) -> &'static str {
    if active { "active" } else { "inactive" }
}

/// Fixed-width RFC 3339 so timestamps compare correctly as text
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

/// Log what the store holds at startup
pub fn report_state(store: &StateStore) -> Result<()> {
    use tracing::info;

    let markets = store.active_markets()?;
    info!("Found {} active markets", markets.len());

    for market in &markets {
        let state = store.load_state(&market.id)?;
        info!(
            "Active market: id={}, outcomes={}, templates={}, posts={}, has_state={}",
            market.id,
            market.outcomes.len(),
            market.rule_templates.len(),
            store.post_count(&market.id)?,
            state.is_some()
        );
    }

    Ok(())
}
