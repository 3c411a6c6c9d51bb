//! Listener (C6): owns the dedicated `LISTEN`/`NOTIFY` connection, demuxes
//! notifications to the right Worker's queue.
//!
//! Any failure invalidates the connection and is handed to the retry
//! harness (unbounded, 2s interval); re-entering the loop triggers the
//! `on_reconnect` hook, which re-issues `LISTEN` for every channel currently
//! registered with the Subscriber Supervisor.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::connection::{active_context, with_task_scope, ActiveConnection};
use crate::error::{EventHubError, EventHubResult};
use crate::metrics;
use crate::retry::{retry_with, RetryConfig};

/// Shared registry the Supervisor keeps in sync with its Worker map; the
/// Listener only ever reads from it.
pub type ChannelSenders = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<i64>>>>;

pub type ReconnectHook =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = EventHubResult<()>> + Send>> + Send + Sync>;

/// A request to add or drop a channel subscription on the live connection,
/// issued outside the reconnect path (new subscribe()/unsubscribe() calls
/// while the Listener is already up).
enum ListenCommand {
    Listen(String),
    Unlisten(String),
}

pub struct ListenerHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
    command_tx: mpsc::UnboundedSender<ListenCommand>,
}

impl ListenerHandle {
    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    /// Ask the Listener to issue `LISTEN` for a newly registered channel
    /// without waiting for the next reconnect. Best-effort: dropped silently
    /// if the Listener task has already exited.
    pub fn request_listen(&self, channel: &str) {
        let _ = self.command_tx.send(ListenCommand::Listen(channel.to_string()));
    }

    /// Ask the Listener to issue `UNLISTEN` for a channel being dropped.
    /// Best-effort, same as [`Self::request_listen`].
    pub fn request_unlisten(&self, channel: &str) {
        let _ = self.command_tx.send(ListenCommand::Unlisten(channel.to_string()));
    }

    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.join.await;
    }
}

#[derive(serde::Deserialize)]
struct NotifyPayload {
    id: i64,
}

pub fn spawn(
    database_url: String,
    subscriber: String,
    senders: ChannelSenders,
    on_reconnect: ReconnectHook,
    select_timeout: Duration,
) -> ListenerHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<ListenCommand>();

    let join = tokio::spawn(with_task_scope(async move {
        let cancel = CancellationToken::new();
        let mut connection = ActiveConnection::new(database_url);

        loop {
            if shutdown_clone.load(Ordering::SeqCst) {
                break;
            }

            let retry_config = RetryConfig {
                retry: -1,
                retry_interval: Duration::from_secs(2),
                retry_message: Some(format!("listener for {subscriber} lost connection")),
            };

            let result = retry_with(retry_config, &cancel, || {
                run_once(
                    &mut connection,
                    &senders,
                    &on_reconnect,
                    &subscriber,
                    select_timeout,
                    &shutdown_clone,
                    &mut command_rx,
                )
            })
            .await;

            match result {
                Ok(()) => break, // shutdown requested from inside the loop
                Err(crate::retry::RetryError::Cancelled) => break,
                Err(crate::retry::RetryError::MaxRetriesExceeded(_, _)) => unreachable!(
                    "listener retry is unbounded and never exhausts"
                ),
            }
        }

        debug!(subscriber = %subscriber, "listener shut down");
    }));

    ListenerHandle {
        shutdown,
        join,
        command_tx,
    }
}

async fn run_once(
    connection: &mut ActiveConnection,
    senders: &ChannelSenders,
    on_reconnect: &ReconnectHook,
    subscriber: &str,
    select_timeout: Duration,
    shutdown: &Arc<AtomicBool>,
    command_rx: &mut mpsc::UnboundedReceiver<ListenCommand>,
) -> EventHubResult<()> {
    let guard = active_context(connection).await?;
    on_reconnect().await?;
    metrics::record_reconnect(subscriber);

    // Drain requests queued while disconnected; the bulk re-listen below
    // already reflects the Supervisor's current channel set, so just
    // discard instead of replaying them against the fresh connection.
    while command_rx.try_recv().is_ok() {}

    let channels: Vec<String> = senders.read().await.keys().cloned().collect();
    for channel in &channels {
        connection.listen(channel).await?;
    }

    loop {
        if shutdown.load(Ordering::SeqCst) {
            drop(guard);
            return Ok(());
        }

        while let Ok(command) = command_rx.try_recv() {
            match command {
                ListenCommand::Listen(channel) => {
                    if let Err(err) = connection.listen(&channel).await {
                        warn!(channel = %channel, error = %err, "failed to listen on newly registered channel");
                    }
                }
                ListenCommand::Unlisten(channel) => {
                    if let Err(err) = connection.unlisten(&channel).await {
                        warn!(channel = %channel, error = %err, "failed to unlisten channel");
                    }
                }
            }
        }

        let listener = connection
            .listener_mut()
            .ok_or_else(|| EventHubError::Config("listener connection not open".into()))?;

        let notification = tokio::time::timeout(select_timeout, listener.recv()).await;

        match notification {
            Err(_timeout) => continue,
            Ok(Err(err)) => {
                warn!(subscriber, error = %err, "listener connection failed");
                connection.clean_if_inactive().await;
                return Err(EventHubError::Database(err));
            }
            Ok(Ok(notification)) => {
                let channel = notification.channel().to_string();
                let payload = notification.payload();

                let senders = senders.read().await;
                let Some(sender) = senders.get(&channel) else {
                    debug!(channel = %channel, "notification on channel with no active worker, dropping");
                    continue;
                };

                match serde_json::from_str::<NotifyPayload>(payload) {
                    Ok(parsed) => {
                        let _ = sender.send(parsed.id);
                    }
                    Err(err) => {
                        error!(channel = %channel, payload, error = %err, "malformed notification payload, dropping");
                    }
                }
            }
        }
    }
}
