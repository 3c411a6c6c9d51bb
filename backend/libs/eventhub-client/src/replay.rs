//! Replay worker (C5): periodically re-enqueues failed/stuck events for
//! every subscribed event type that opted in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::with_task_scope;
use crate::models::EventStatus;

pub struct ReplayHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl ReplayHandle {
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.join.await;
    }
}

/// `tick_for_each_channel` is invoked once per registered channel on every
/// reprocessing interval; it re-enqueues that channel's failed/stuck events.
pub fn spawn<F, Fut>(reprocessing_interval: Duration, tick_for_each_channel: F) -> ReplayHandle
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    let join = tokio::spawn(with_task_scope(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut elapsed = Duration::ZERO;

        loop {
            ticker.tick().await;
            if shutdown_clone.load(Ordering::SeqCst) {
                break;
            }

            elapsed += Duration::from_secs(1);
            if elapsed >= reprocessing_interval {
                elapsed = Duration::ZERO;
                debug!("replay worker tick");
                tick_for_each_channel().await;
            }
        }
    }));

    ReplayHandle { shutdown, join }
}

/// Find event ids that should be replayed for one `(subscriber, publisher,
/// event_type)`: status Failed/Timeout, or stuck Processing past the
/// timeout.
pub async fn find_replayable_events(
    pool: &PgPool,
    subscriber: &str,
    publisher: &str,
    event_type: &str,
    processing_timeout: Duration,
) -> Result<Vec<i64>, sqlx::Error> {
    let cutoff = crate::time::now_utc() - chrono::Duration::from_std(processing_timeout).unwrap();

    sqlx::query_scalar(
        "SELECT event FROM subscribed_event
         WHERE subscriber = $1 AND publisher = $2 AND event_type = $3
           AND (
               status = $4
               OR status = $5
               OR (status = $6 AND process_start_time < $7)
           )
         ORDER BY event ASC",
    )
    .bind(subscriber)
    .bind(publisher)
    .bind(event_type)
    .bind(EventStatus::Failed as i16)
    .bind(EventStatus::Timeout as i16)
    .bind(EventStatus::Processing as i16)
    .bind(cutoff)
    .fetch_all(pool)
    .await
}
