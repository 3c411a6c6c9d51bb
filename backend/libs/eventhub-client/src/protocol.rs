//! Processing protocol (C8): database-backed lease acquisition, callback
//! invocation, status transition, history archival, watermark advance.
//!
//! Never propagates a callback failure to its caller — every outcome is
//! either "handled" (including "handled by someone else") or a signal to the
//! Worker to retry the same item later.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use sqlx::PgPool;
use tracing::{debug, error, warn};

use crate::callback::EventCallback;
use crate::error::EventHubResult;
use crate::metrics;
use crate::models::{Event, EventStatus, SubscribedEvent, SubscribedEventType};

/// Result of a single processing attempt, as seen by the Worker loop.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// This call completed the work, or observed it already done/in-flight
    /// elsewhere. The Worker should drop the item.
    Handled,
    /// The lease was grabbed out from under us before we could proceed.
    /// The Worker should re-enqueue at the tail.
    Retry,
}

fn process_id() -> i32 {
    std::process::id() as i32
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Run the processing protocol for one event against one subscription.
///
/// `sub_type` is refreshed in place when the watermark advances (either by
/// us or, if we lose the race, by re-reading the current row).
pub async fn process_event(
    pool: &PgPool,
    sub_type: &mut SubscribedEventType,
    event: &Event,
    callback: &Arc<dyn EventCallback>,
    processing_timeout: Duration,
) -> EventHubResult<Outcome> {
    let host = hostname();
    let pid = process_id();
    let channel = sub_type.channel();

    let inserted: Option<SubscribedEvent> = sqlx::query_as(
        "INSERT INTO subscribed_event
             (subscriber, publisher, event_type, event, process_host, process_pid, process_times, process_start_time, status)
         VALUES ($1, $2, $3, $4, $5, $6, 1, now(), 0)
         ON CONFLICT (subscriber, publisher, event_type, event) DO NOTHING
         RETURNING id, subscriber, publisher, event_type, event, process_host, process_pid,
                   process_times, process_start_time, process_end_time, status, result",
    )
    .bind(&sub_type.subscriber)
    .bind(&sub_type.publisher)
    .bind(&sub_type.event_type)
    .bind(event.id)
    .bind(&host)
    .bind(pid)
    .fetch_optional(pool)
    .await?;

    let created = inserted.is_some();

    let existing = match inserted {
        Some(row) => row,
        None => {
            sqlx::query_as(
                "SELECT id, subscriber, publisher, event_type, event, process_host, process_pid,
                        process_times, process_start_time, process_end_time, status, result
                 FROM subscribed_event
                 WHERE subscriber = $1 AND publisher = $2 AND event_type = $3 AND event = $4",
            )
            .bind(&sub_type.subscriber)
            .bind(&sub_type.publisher)
            .bind(&sub_type.event_type)
            .bind(event.id)
            .fetch_one(pool)
            .await?
        }
    };

    if !created {
        let status = EventStatus::try_from(existing.status).ok();
        let timed_out = existing
            .process_start_time
            .map(|start| crate::time::now_utc() - start > chrono::Duration::from_std(processing_timeout).unwrap())
            .unwrap_or(false);

        match status {
            Some(EventStatus::Succeed) => {
                debug!(event_id = event.id, channel = %channel, "already succeeded, skipping");
                return Ok(Outcome::Handled);
            }
            Some(EventStatus::Processing) if !timed_out => {
                debug!(event_id = event.id, channel = %channel, "lease held by another process");
                metrics::record_lease_contention(&sub_type.subscriber, &channel);
                return Ok(Outcome::Handled);
            }
            Some(EventStatus::Failed) | Some(EventStatus::Timeout) => {}
            Some(EventStatus::Processing) => {
                // timed out — treat the stale holder as dead and reclaim
            }
            None => {
                warn!(event_id = event.id, status = existing.status, "unknown status code, reprocessing");
            }
        }

        // Steal the lease with a conditional update on `process_times`.
        let stolen: Option<SubscribedEvent> = sqlx::query_as(
            "UPDATE subscribed_event
             SET process_host = $1, process_pid = $2, process_times = $3,
                 process_start_time = now(), process_end_time = NULL, status = 0, result = NULL
             WHERE id = $4 AND process_times = $5
             RETURNING id, subscriber, publisher, event_type, event, process_host, process_pid,
                       process_times, process_start_time, process_end_time, status, result",
        )
        .bind(&host)
        .bind(pid)
        .bind(existing.process_times + 1)
        .bind(existing.id)
        .bind(existing.process_times)
        .fetch_optional(pool)
        .await?;

        if stolen.is_none() {
            debug!(event_id = event.id, channel = %channel, "lost the lease race");
            metrics::record_lease_contention(&sub_type.subscriber, &channel);
            return Ok(Outcome::Handled);
        }

        // Archive the prior attempt, rewriting a stale Processing to Timeout.
        let archived_status = match status {
            Some(EventStatus::Processing) => EventStatus::Timeout as i16,
            _ => existing.status,
        };
        sqlx::query(
            "INSERT INTO event_processing_history
                 (subscribed_event, process_host, process_pid, process_start_time, process_end_time, status, result)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(existing.id)
        .bind(&existing.process_host)
        .bind(existing.process_pid)
        .bind(existing.process_start_time)
        .bind(existing.process_end_time)
        .bind(archived_status)
        .bind(&existing.result)
        .execute(pool)
        .await?;
    }

    let call_result = AssertUnwindSafe(callback.call(event, sub_type.parameters.as_ref()))
        .catch_unwind()
        .await;

    let (status, result_text, outcome_label) = match call_result {
        Ok(Ok(value)) => (EventStatus::Succeed, Some(value.to_string()), "succeed"),
        Ok(Err(err)) => (EventStatus::Failed, Some(err.to_string()), "failed"),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(event_id = event.id, channel = %channel, panic = %message, "callback panicked");
            (EventStatus::Failed, Some(message), "failed")
        }
    };

    sqlx::query(
        "UPDATE subscribed_event SET process_end_time = now(), status = $1, result = $2
         WHERE subscriber = $3 AND publisher = $4 AND event_type = $5 AND event = $6",
    )
    .bind(status as i16)
    .bind(&result_text)
    .bind(&sub_type.subscriber)
    .bind(&sub_type.publisher)
    .bind(&sub_type.event_type)
    .bind(event.id)
    .execute(pool)
    .await?;

    metrics::record_dispatch(&sub_type.subscriber, &channel, outcome_label);

    if created {
        let advanced: Option<(i64,)> = sqlx::query_as(
            "UPDATE subscribed_event_type
             SET last_dispatched_event = $1, last_dispatched_time = now()
             WHERE id = $2 AND (last_dispatched_event IS NULL OR last_dispatched_event < $1)
             RETURNING last_dispatched_event",
        )
        .bind(event.id)
        .bind(sub_type.id)
        .fetch_optional(pool)
        .await?;

        match advanced {
            Some((new_watermark,)) => {
                sub_type.last_dispatched_event = Some(new_watermark);
                sub_type.last_dispatched_time = Some(crate::time::now_utc());
            }
            None => {
                // Another process advanced the watermark further; refresh.
                if let Some(refreshed) = sqlx::query_as::<_, SubscribedEventType>(
                    "SELECT id, subscriber, publisher, event_type, category, processing_module,
                            parameters, replay_missed_events, replay_failed_events,
                            last_dispatched_event, last_dispatched_time, last_listening_time,
                            creator, created, modifier, modified
                     FROM subscribed_event_type WHERE id = $1",
                )
                .bind(sub_type.id)
                .fetch_optional(pool)
                .await?
                {
                    *sub_type = refreshed;
                }
            }
        }
    }

    Ok(Outcome::Handled)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked with a non-string payload".to_string()
    }
}
