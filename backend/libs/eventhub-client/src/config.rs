//! Environment-driven configuration for the event hub client

use chrono_tz::Tz;
use std::fmt;
use std::time::Duration;
use tracing::info;

use crate::error::{EventHubError, EventHubResult};

/// Runtime configuration for publishers and subscribers
#[derive(Clone)]
pub struct EventHubConfig {
    /// PostgreSQL connection URL (accepts `postgres://`, `postgresql://` and
    /// the legacy `postgis://` scheme, normalized to `postgres://`)
    pub database_url: String,
    /// Display/ambient timezone for timestamps written to logs and results
    pub time_zone: Tz,
    /// How long the Listener blocks waiting for a notification before polling again
    pub select_timeout: Duration,
    /// Whether subscribe() backfills events missed while the subscriber was absent
    pub process_missed_events: bool,
    pub pool_max_connections: u32,
    pub pool_acquire_timeout: Duration,
    pub pool_idle_timeout: Duration,
    /// How long a Processing lease is trusted before a peer may steal it
    pub processing_timeout: Duration,
    /// How often the Replay Worker re-scans for failed/stuck events
    pub reprocessing_interval: Duration,
}

impl fmt::Debug for EventHubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHubConfig")
            .field("database_url", &"[REDACTED]")
            .field("time_zone", &self.time_zone)
            .field("select_timeout", &self.select_timeout)
            .field("process_missed_events", &self.process_missed_events)
            .field("pool_max_connections", &self.pool_max_connections)
            .field("pool_acquire_timeout", &self.pool_acquire_timeout)
            .field("pool_idle_timeout", &self.pool_idle_timeout)
            .field("processing_timeout", &self.processing_timeout)
            .field("reprocessing_interval", &self.reprocessing_interval)
            .finish()
    }
}

impl EventHubConfig {
    /// Build configuration from the environment, loading a `.env` file first if present
    ///
    /// Required: `EVENTHUB_DATABASE_URL`. Everything else falls back to the
    /// defaults documented on the individual fields above.
    pub fn from_env() -> EventHubResult<Self> {
        let _ = dotenv::dotenv();

        let raw_url = std::env::var("EVENTHUB_DATABASE_URL").map_err(|_| {
            EventHubError::Config("EVENTHUB_DATABASE_URL environment variable not set".into())
        })?;
        let database_url = normalize_dsn(&raw_url);

        let time_zone = std::env::var("TIME_ZONE")
            .ok()
            .and_then(|v| v.parse::<Tz>().ok())
            .unwrap_or(chrono_tz::Australia::Perth);

        Ok(Self {
            database_url,
            time_zone,
            select_timeout: Duration::from_secs(env_u64("EVENTHUB_SELECT_TIMEOUT_SECS", 5)),
            process_missed_events: env_bool("EVENTHUB_PROCESS_MISSED_EVENTS", true),
            pool_max_connections: env_u64("EVENTHUB_POOL_MAX_CONNECTIONS", 3) as u32,
            pool_acquire_timeout: Duration::from_secs(env_u64(
                "EVENTHUB_POOL_ACQUIRE_TIMEOUT_SECS",
                5,
            )),
            pool_idle_timeout: Duration::from_secs(env_u64(
                "EVENTHUB_POOL_IDLE_TIMEOUT_SECS",
                300,
            )),
            processing_timeout: Duration::from_secs(env_u64(
                "EVENTHUB_PROCESSING_TIMEOUT_SECS",
                3600,
            )),
            reprocessing_interval: Duration::from_secs(env_u64(
                "EVENTHUB_REPROCESSING_INTERVAL_SECS",
                300,
            )),
        })
    }

    /// Log the resolved configuration (database_url redacted)
    pub fn log_config(&self) {
        let local_time = crate::time::now(self.time_zone);
        info!(
            time_zone = %self.time_zone,
            local_time = %local_time.to_rfc3339(),
            select_timeout_secs = self.select_timeout.as_secs(),
            process_missed_events = self.process_missed_events,
            pool_max_connections = self.pool_max_connections,
            processing_timeout_secs = self.processing_timeout.as_secs(),
            reprocessing_interval_secs = self.reprocessing_interval.as_secs(),
            "event hub configuration loaded"
        );
    }

    /// Translate this config into a `db_pool::DbConfig` for pool construction
    pub fn to_db_config(&self, service_name: &str) -> db_pool::DbConfig {
        db_pool::DbConfig {
            service_name: service_name.to_string(),
            database_url: self.database_url.clone(),
            max_connections: self.pool_max_connections,
            min_connections: 1,
            connect_timeout_secs: 5,
            acquire_timeout_secs: self.pool_acquire_timeout.as_secs(),
            idle_timeout_secs: self.pool_idle_timeout.as_secs(),
            max_lifetime_secs: 1800,
        }
    }
}

fn normalize_dsn(raw: &str) -> String {
    if let Some(rest) = raw.strip_prefix("postgis://") {
        format!("postgres://{rest}")
    } else {
        raw.to_string()
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn defaults_without_overrides() {
        std::env::remove_var("EVENTHUB_SELECT_TIMEOUT_SECS");
        std::env::remove_var("EVENTHUB_PROCESS_MISSED_EVENTS");
        std::env::remove_var("TIME_ZONE");
        std::env::set_var("EVENTHUB_DATABASE_URL", "postgres://localhost/eventhub_test");

        let config = EventHubConfig::from_env().unwrap();
        assert_eq!(config.select_timeout, Duration::from_secs(5));
        assert!(config.process_missed_events);
        assert_eq!(config.time_zone, chrono_tz::Australia::Perth);
        assert_eq!(config.processing_timeout, Duration::from_secs(3600));
        assert_eq!(config.reprocessing_interval, Duration::from_secs(300));

        std::env::remove_var("EVENTHUB_DATABASE_URL");
    }

    #[test]
    #[serial_test::serial]
    fn missing_database_url_is_an_error() {
        std::env::remove_var("EVENTHUB_DATABASE_URL");
        assert!(EventHubConfig::from_env().is_err());
    }

    #[test]
    fn postgis_scheme_is_normalized() {
        assert_eq!(
            normalize_dsn("postgis://user@host/db"),
            "postgres://user@host/db"
        );
        assert_eq!(
            normalize_dsn("postgres://user@host/db"),
            "postgres://user@host/db"
        );
    }
}
