//! Active-connection wrapper: liveness probing plus a reentrant "active
//! context" scope, in a pooled and a single-connection flavor.
//!
//! The probe-then-reconnect dance exists because a pooled or long-lived
//! connection can look open while the TCP peer is long gone; every database
//! touch in this crate goes through one of these two wrappers first.

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::cell::Cell;
use std::future::Future;
use tracing::{debug, warn};

use crate::error::{EventHubError, EventHubResult};

tokio::task_local! {
    static ACTIVE_DEPTH: Cell<u32>;
}

/// Run `fut` inside a fresh active-context depth counter for this task.
///
/// Every long-lived loop (Listener, Worker, Replay Worker) wraps its whole
/// body in this once, then calls [`active_context`] freely from inside —
/// nested acquisitions become no-ops instead of re-opening the connection.
pub async fn with_task_scope<F: Future>(fut: F) -> F::Output {
    ACTIVE_DEPTH.scope(Cell::new(0), fut).await
}

#[async_trait]
pub trait IsActive {
    /// Probe the connection; true iff it is open and answers a trivial query.
    async fn is_active(&mut self) -> bool;

    /// Ensure the connection is open, reconnecting if necessary.
    async fn active_connect(&mut self) -> EventHubResult<()>;
}

/// RAII guard for an active-context scope. Dropping it decrements the
/// task-local depth; only the outermost guard's drop actually matters.
pub struct ActiveContextGuard {
    _private: (),
}

impl Drop for ActiveContextGuard {
    fn drop(&mut self) {
        let _ = ACTIVE_DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Enter a reentrant active-context scope against `target`, connecting on
/// first entry (depth 0) and doing nothing but bumping the counter on
/// re-entry.
pub async fn active_context<T: IsActive + ?Sized>(
    target: &mut T,
) -> EventHubResult<ActiveContextGuard> {
    let depth = ACTIVE_DEPTH.try_with(|d| d.get()).unwrap_or(0);
    if depth == 0 {
        target.active_connect().await?;
    }
    let _ = ACTIVE_DEPTH.try_with(|d| d.set(d.get() + 1));
    Ok(ActiveContextGuard { _private: () })
}

/// A dedicated (non-pooled) connection, used by the Listener to hold the
/// `LISTEN`/`NOTIFY` socket for the lifetime of a subscription.
pub struct ActiveConnection {
    database_url: String,
    listener: Option<PgListener>,
}

impl ActiveConnection {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            listener: None,
        }
    }

    pub fn listener_mut(&mut self) -> Option<&mut PgListener> {
        self.listener.as_mut()
    }

    /// Issue `LISTEN` for `channel` on the open connection.
    pub async fn listen(&mut self, channel: &str) -> EventHubResult<()> {
        match self.listener.as_mut() {
            Some(listener) => listener.listen(channel).await.map_err(EventHubError::Database),
            None => Err(EventHubError::Config("listener connection not open".into())),
        }
    }

    /// Best-effort `UNLISTEN` for `channel`. A closed connection has nothing
    /// to unlisten from, so that case is not an error.
    pub async fn unlisten(&mut self, channel: &str) -> EventHubResult<()> {
        match self.listener.as_mut() {
            Some(listener) => listener.unlisten(channel).await.map_err(EventHubError::Database),
            None => Ok(()),
        }
    }

    /// Discard the connection if it's inactive; returns whether it was discarded.
    pub async fn clean_if_inactive(&mut self) -> bool {
        if !self.is_active().await {
            debug!("discarding inactive listener connection");
            self.listener = None;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl IsActive for ActiveConnection {
    async fn is_active(&mut self) -> bool {
        match &mut self.listener {
            Some(listener) => sqlx::query("SELECT 1").execute(listener).await.is_ok(),
            None => false,
        }
    }

    async fn active_connect(&mut self) -> EventHubResult<()> {
        if self.listener.is_some() {
            if self.is_active().await {
                return Ok(());
            }
            warn!("listener connection went stale, reconnecting");
            self.listener = None;
        }

        match PgListener::connect(&self.database_url).await {
            Ok(listener) => {
                self.listener = Some(listener);
                Ok(())
            }
            Err(first_err) => {
                // One retry on a fresh attempt before giving up, matching
                // the original reused-connection-failure recovery path.
                match PgListener::connect(&self.database_url).await {
                    Ok(listener) => {
                        self.listener = Some(listener);
                        Ok(())
                    }
                    Err(_) => Err(EventHubError::Database(first_err)),
                }
            }
        }
    }
}

/// A pooled connection, used by the Publisher, the per-event-type Worker,
/// the Processing Protocol, and the Replay Worker.
pub struct PooledActiveConnection {
    pool: PgPool,
}

impl PooledActiveConnection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Probe the pool; sqlx's `test_before_acquire` already evicts broken
    /// connections on acquire, so there is nothing further to discard here —
    /// this exists to report health the same way the single-connection
    /// variant does.
    pub async fn clean_if_inactive(&mut self) -> bool {
        !self.is_active().await
    }
}

#[async_trait]
impl IsActive for PooledActiveConnection {
    async fn is_active(&mut self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn active_connect(&mut self) -> EventHubResult<()> {
        if self.is_active().await {
            Ok(())
        } else {
            Err(EventHubError::Config(
                "database pool is not accepting connections".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nested_active_context_only_connects_once() {
        struct Counter {
            connects: u32,
        }

        #[async_trait]
        impl IsActive for Counter {
            async fn is_active(&mut self) -> bool {
                true
            }
            async fn active_connect(&mut self) -> EventHubResult<()> {
                self.connects += 1;
                Ok(())
            }
        }

        with_task_scope(async {
            let mut counter = Counter { connects: 0 };
            let outer = active_context(&mut counter).await.unwrap();
            let inner = active_context(&mut counter).await.unwrap();
            assert_eq!(counter.connects, 1);
            drop(inner);
            drop(outer);
        })
        .await;
    }
}
