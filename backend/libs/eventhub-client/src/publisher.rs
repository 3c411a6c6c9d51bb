//! Publisher (C3)
//!
//! Inserting an event does not itself emit the channel notification — a
//! database trigger does that after insert (see the crate's `migrations/`).

use sqlx::PgPool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{EventHubError, EventHubResult};
use crate::metrics;
use crate::models::{Category, Event};
use crate::retry::{retry_with, RetryConfig};

/// Registers (or finds) a publisher and event type on construction, then
/// inserts events under them with bounded retry.
pub struct Publisher {
    pool: PgPool,
    name: String,
    event_type: String,
    retry_config: RetryConfig,
}

impl Publisher {
    /// `category` governs whether the constructor may create missing rows:
    /// `Managed` publishers/event-types must already exist.
    pub async fn new(
        pool: PgPool,
        publisher: impl Into<String>,
        event_type: impl Into<String>,
        category: Category,
    ) -> EventHubResult<Self> {
        let name = publisher.into();
        let event_type = event_type.into();

        if category == Category::Managed {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM event_type WHERE publisher = $1 AND name = $2)",
            )
            .bind(&name)
            .bind(&event_type)
            .fetch_one(&pool)
            .await?;
            if !exists {
                return Err(EventHubError::Config(format!(
                    "managed publisher/event-type {name}.{event_type} does not exist"
                )));
            }
        } else {
            sqlx::query(
                "INSERT INTO publisher (name, category) VALUES ($1, $2)
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(&name)
            .bind(category as i16)
            .execute(&pool)
            .await?;

            sqlx::query(
                "INSERT INTO event_type (name, publisher, category) VALUES ($1, $2, $3)
                 ON CONFLICT (publisher, name) DO NOTHING",
            )
            .bind(&event_type)
            .bind(&name)
            .bind(category as i16)
            .execute(&pool)
            .await?;
        }

        Ok(Self {
            pool,
            name,
            event_type,
            retry_config: RetryConfig {
                retry: 3,
                retry_interval: Duration::from_secs(1),
                retry_message: Some("publish failed, retrying".into()),
            },
        })
    }

    /// Insert one event under this publisher/event-type, with bounded retry.
    pub async fn publish(&self, payload: serde_json::Value) -> EventHubResult<Event> {
        let cancel = CancellationToken::new();
        retry_with(self.retry_config.clone(), &cancel, || {
            self.publish_once(&payload)
        })
        .await
        .map_err(|e| match e {
            crate::retry::RetryError::Cancelled => {
                EventHubError::Config("publish cancelled".into())
            }
            crate::retry::RetryError::MaxRetriesExceeded(_, err) => err,
        })
    }

    async fn publish_once(&self, payload: &serde_json::Value) -> EventHubResult<Event> {
        let host = hostname();

        let mut tx = self.pool.begin().await?;

        if !payload.is_null() {
            sqlx::query(
                "UPDATE event_type SET sample = $1, modified = now()
                 WHERE publisher = $2 AND name = $3 AND sample IS NULL",
            )
            .bind(payload)
            .bind(&self.name)
            .bind(&self.event_type)
            .execute(&mut *tx)
            .await?;
        }

        let event: Event = sqlx::query_as(
            "INSERT INTO event (publisher, event_type, source, payload)
             VALUES ($1, $2, $3, $4)
             RETURNING id, publisher, event_type, source, publish_time, payload, active",
        )
        .bind(&self.name)
        .bind(&self.event_type)
        .bind(&host)
        .bind(payload)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        metrics::EVENTS_PUBLISHED
            .with_label_values(&[&self.name, &self.event_type])
            .inc();

        debug!(
            publisher = %self.name,
            event_type = %self.event_type,
            event_id = event.id,
            "published event"
        );

        Ok(event)
    }
}

fn hostname() -> String {
    hostname_impl().unwrap_or_else(|| "unknown".to_string())
}

#[cfg(unix)]
fn hostname_impl() -> Option<String> {
    std::env::var("HOSTNAME").ok().or_else(|| {
        std::process::Command::new("hostname")
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .map(|s| s.trim().to_string())
    })
}

#[cfg(not(unix))]
fn hostname_impl() -> Option<String> {
    std::env::var("HOSTNAME").ok()
}

pub fn log_ready(publisher: &str, event_type: &str) {
    info!(publisher, event_type, "publisher ready");
}
