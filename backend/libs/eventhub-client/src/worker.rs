//! Per-event-type worker (C4): a serial FIFO of event ids dispatched through
//! the processing protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::callback::EventCallback;
use crate::connection::with_task_scope;
use crate::models::{Event, SubscribedEventType};
use crate::protocol::{self, Outcome};

const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle to a running Worker task: the queue sender plus a join handle and
/// shutdown flag so the Subscriber Supervisor can own its lifecycle.
pub struct WorkerHandle {
    sender: mpsc::UnboundedSender<i64>,
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn enqueue(&self, event_id: i64) {
        let _ = self.sender.send(event_id);
    }

    /// Clone of this worker's queue sender, handed to the Listener's shared
    /// channel registry so notifications route straight to this worker.
    pub fn sender(&self) -> mpsc::UnboundedSender<i64> {
        self.sender.clone()
    }

    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    /// Signal shutdown and wait for the task to drain and exit.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.join.await;
    }
}

/// Spawn a Worker task for one `(subscriber, publisher, event_type)` channel.
pub fn spawn(
    pool: PgPool,
    mut sub_type: SubscribedEventType,
    callback: Arc<dyn EventCallback>,
    processing_timeout: Duration,
) -> WorkerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<i64>();
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    let join = tokio::spawn(with_task_scope(async move {
        let channel = sub_type.channel();
        debug!(channel = %channel, "worker started");

        loop {
            if shutdown_clone.load(Ordering::SeqCst) {
                break;
            }

            let next = tokio::time::timeout(DEQUEUE_TIMEOUT, rx.recv()).await;
            let event_id = match next {
                Ok(Some(id)) => id,
                Ok(None) => break, // sender dropped, supervisor is gone
                Err(_timeout) => continue,
            };

            let event: Option<Event> = match sqlx::query_as(
                "SELECT id, publisher, event_type, source, publish_time, payload, active
                 FROM event WHERE id = $1",
            )
            .bind(event_id)
            .fetch_optional(&pool)
            .await
            {
                Ok(event) => event,
                Err(err) => {
                    error!(event_id, error = %err, "failed to load event, re-enqueueing");
                    let _ = tx.send(event_id);
                    continue;
                }
            };

            let Some(event) = event else {
                warn!(event_id, channel = %channel, "event row vanished, dropping");
                continue;
            };

            match protocol::process_event(&pool, &mut sub_type, &event, &callback, processing_timeout).await
            {
                Ok(Outcome::Handled) => {}
                Ok(Outcome::Retry) => {
                    let _ = tx.send(event_id);
                }
                Err(err) => {
                    error!(event_id, channel = %channel, error = %err, "processing protocol failed, re-enqueueing");
                    let _ = tx.send(event_id);
                }
            }
        }

        debug!(channel = %channel, "worker shut down");
    }));

    WorkerHandle {
        sender: tx,
        shutdown,
        join,
    }
}
