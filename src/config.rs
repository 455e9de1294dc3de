use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;
use crate::engine::EngineParams;
use crate::ingest::connection::ReconnectPolicy;
use crate::ingest::rules::SyncSchedule;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub system: SystemConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub engine: EngineParams,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_rule_sync_interval")]
    pub rule_sync_interval_secs: u64,
    #[serde(default = "default_market_poll_interval")]
    pub market_poll_interval_secs: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_secs: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,
    #[serde(default = "default_rate_limit_floor")]
    pub rate_limit_floor_secs: u64,
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_outcome_cache_ttl")]
    pub outcome_cache_ttl_secs: u64,
    #[serde(default = "default_scorer_timeout")]
    pub scorer_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub csv_logging: bool,
    pub csv_log_path: String,
    #[serde(default = "default_metrics_interval")]
    pub metrics_log_interval_secs: u64,
}

fn default_rule_sync_interval() -> u64 { 300 }
fn default_market_poll_interval() -> u64 { 30 }
fn default_retry_delay() -> u64 { 5 }
fn default_reconnect_base() -> u64 { 1 }
fn default_reconnect_max() -> u64 { 60 }
fn default_rate_limit_floor() -> u64 { 5 }
fn default_stall_timeout() -> u64 { 60 }
fn default_queue_capacity() -> usize { 256 }
fn default_max_in_flight() -> usize { 8 }
fn default_shutdown_grace() -> u64 { 10 }
fn default_outcome_cache_ttl() -> u64 { 60 }
fn default_scorer_timeout() -> u64 { 20 }
fn default_metrics_interval() -> u64 { 60 }

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            rule_sync_interval_secs: default_rule_sync_interval(),
            market_poll_interval_secs: default_market_poll_interval(),
            retry_delay_secs: default_retry_delay(),
            reconnect_base_secs: default_reconnect_base(),
            reconnect_max_secs: default_reconnect_max(),
            rate_limit_floor_secs: default_rate_limit_floor(),
            stall_timeout_secs: default_stall_timeout(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_in_flight: default_max_in_flight(),
            shutdown_grace_secs: default_shutdown_grace(),
            outcome_cache_ttl_secs: default_outcome_cache_ttl(),
            scorer_timeout_secs: default_scorer_timeout(),
        }
    }
}

impl StreamConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            reconnect_base: Duration::from_secs(self.reconnect_base_secs),
            reconnect_max: Duration::from_secs(self.reconnect_max_secs),
            rate_limit_floor: Duration::from_secs(self.rate_limit_floor_secs),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            jitter: true,
        }
    }

    pub fn sync_schedule(&self) -> SyncSchedule {
        SyncSchedule {
            interval: Duration::from_secs(self.rule_sync_interval_secs),
            market_poll: Duration::from_secs(self.market_poll_interval_secs),
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            rate_limit_floor: Duration::from_secs(self.rate_limit_floor_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub x_bearer_token: String,
    pub x_api_base_url: String,
    pub scorer_api_url: String,
    pub scorer_api_key: String,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Intervals that drive `tokio::time::interval` or a timeout must be non-zero
    fn validate(&self) -> Result<()> {
        let intervals = [
            ("stream.rule_sync_interval_secs", self.stream.rule_sync_interval_secs),
            ("stream.market_poll_interval_secs", self.stream.market_poll_interval_secs),
            ("stream.stall_timeout_secs", self.stream.stall_timeout_secs),
            ("monitoring.metrics_log_interval_secs", self.monitoring.metrics_log_interval_secs),
        ];
        for (name, secs) in intervals {
            if secs == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        Ok(())
    }
}

impl EnvConfig {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            x_bearer_token: std::env::var("X_BEARER_TOKEN")
                .context("X_BEARER_TOKEN not set")?,
            x_api_base_url: std::env::var("X_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.twitter.com/2".to_string()),
            scorer_api_url: std::env::var("SCORER_API_URL")
                .context("SCORER_API_URL not set")?,
            scorer_api_key: std::env::var("SCORER_API_KEY")
                .context("SCORER_API_KEY not set")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse(
            r#"
            [system]
            database_path = "worker.db"

            [monitoring]
            csv_logging = false
            csv_log_path = "updates.csv"
            "#,
        )
        .unwrap();

        assert_eq!(config.stream.rule_sync_interval_secs, 300);
        assert_eq!(config.ingest.queue_capacity, 256);
        assert_eq!(config.monitoring.metrics_log_interval_secs, 60);
        assert_eq!(config.engine.max_age_hours, 72.0);

        let policy = config.stream.reconnect_policy();
        assert_eq!(policy.rate_limit_floor, Duration::from_secs(5));
        assert_eq!(policy.stall_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_overrides() {
        let config = Config::parse(
            r#"
            [system]
            database_path = ":memory:"

            [stream]
            reconnect_max_secs = 120

            [ingest]
            max_in_flight = 2

            [engine]
            half_life_hours = 3.0

            [monitoring]
            csv_logging = true
            csv_log_path = "updates.csv"
            "#,
        )
        .unwrap();

        assert_eq!(config.stream.reconnect_max_secs, 120);
        assert_eq!(config.stream.retry_delay_secs, 5);
        assert_eq!(config.ingest.max_in_flight, 2);
        assert_eq!(config.engine.half_life_hours, 3.0);
        assert_eq!(config.engine.grace_minutes, 5.0);
        assert_eq!(config.stream.sync_schedule().interval, Duration::from_secs(300));
        assert_eq!(config.stream.sync_schedule().retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for section in [
            "[stream]\nrule_sync_interval_secs = 0",
            "[stream]\nmarket_poll_interval_secs = 0",
            "[stream]\nstall_timeout_secs = 0",
        ] {
            let contents = format!(
                "[system]\ndatabase_path = \"x.db\"\n{}\n[monitoring]\ncsv_logging = false\ncsv_log_path = \"x\"",
                section
            );
            let err = Config::parse(&contents).unwrap_err();
            assert!(err.to_string().contains("greater than zero"), "{}", err);
        }

        let err = Config::parse(
            "[system]\ndatabase_path = \"x.db\"\n[monitoring]\ncsv_logging = false\ncsv_log_path = \"x\"\nmetrics_log_interval_secs = 0",
        )
        .unwrap_err();
        assert!(err.to_string().contains("metrics_log_interval_secs"));
    }

    #[test]
    fn test_missing_system_section_fails() {
        assert!(Config::parse("[monitoring]\ncsv_logging = false\ncsv_log_path = \"x\"").is_err());
    }
}
