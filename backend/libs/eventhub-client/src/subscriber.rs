//! Subscriber Supervisor (C7): lifecycle owner for a subscriber's listening
//! connection, its per-channel workers, the Listener and the Replay Worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::callback::{CallbackRegistry, EventCallback};
use crate::config::EventHubConfig;
use crate::error::{EventHubError, EventHubResult};
use crate::listener::{self, ChannelSenders, ListenerHandle};
use crate::metrics;
use crate::models::{Category, Event, SubscribedEventType};
use crate::replay::{self, ReplayHandle};
use crate::worker::{self, WorkerHandle};

struct ChannelEntry {
    sub_type: SubscribedEventType,
    callback: Arc<dyn EventCallback>,
    /// `None` after a `close()`/`unsubscribe(remove=false)` that kept the
    /// entry around for a later `start()` to resume.
    worker: Option<WorkerHandle>,
}

struct Runtime {
    listener: ListenerHandle,
    replay: ReplayHandle,
}

struct Inner {
    name: String,
    category: Category,
    pool: PgPool,
    config: EventHubConfig,
    callbacks: RwLock<CallbackRegistry>,
    channels: RwLock<HashMap<String, ChannelEntry>>,
    senders: ChannelSenders,
    runtime: Mutex<Option<Runtime>>,
    shutdown: AtomicBool,
}

/// A subscriber and everything it has subscribed to. Cheaply `Clone`able —
/// clones share the same underlying state, the way a handle does.
#[derive(Clone)]
pub struct Subscriber(Arc<Inner>);

impl Subscriber {
    /// Lazily create/find the subscriber row, then auto-subscribe every
    /// active Managed event type registered for it. Auto-subscribe failures
    /// are logged and skipped, not fatal.
    pub async fn new(
        pool: PgPool,
        config: EventHubConfig,
        name: impl Into<String>,
        category: Category,
        callbacks: CallbackRegistry,
    ) -> EventHubResult<Self> {
        let name = name.into();

        sqlx::query(
            "INSERT INTO subscriber (name, category) VALUES ($1, $2)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(&name)
        .bind(category as i16)
        .execute(&pool)
        .await?;

        let subscriber = Self(Arc::new(Inner {
            name,
            category,
            pool,
            config,
            callbacks: RwLock::new(callbacks),
            channels: RwLock::new(HashMap::new()),
            senders: Arc::new(RwLock::new(HashMap::new())),
            runtime: Mutex::new(None),
            shutdown: AtomicBool::new(true),
        }));

        subscriber.auto_subscribe_managed().await;
        Ok(subscriber)
    }

    async fn auto_subscribe_managed(&self) {
        let rows: Result<Vec<SubscribedEventType>, sqlx::Error> = sqlx::query_as(
            "SELECT id, subscriber, publisher, event_type, category, processing_module,
                    parameters, replay_missed_events, replay_failed_events,
                    last_dispatched_event, last_dispatched_time, last_listening_time,
                    creator, created, modifier, modified
             FROM subscribed_event_type
             WHERE subscriber = $1 AND category = $2",
        )
        .bind(&self.0.name)
        .bind(Category::Managed as i16)
        .fetch_all(&self.0.pool)
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                warn!(subscriber = %self.0.name, error = %err, "failed to enumerate managed subscriptions");
                return;
            }
        };

        for row in rows {
            let module_name = row.processing_module.map(|id| id.to_string());
            let callback = match &module_name {
                Some(_) => self.resolve_managed_callback(&row).await,
                None => Err(EventHubError::Config(format!(
                    "managed subscription {} has no processing module",
                    row.channel()
                ))),
            };

            match callback {
                Ok(callback) => {
                    if let Err(err) = self
                        .subscribe(&row.publisher, &row.event_type, Some(callback), true, true)
                        .await
                    {
                        warn!(channel = %row.channel(), error = %err, "auto-subscribe failed");
                    }
                }
                Err(err) => {
                    warn!(channel = %row.channel(), error = %err, "could not resolve managed callback");
                }
            }
        }
    }

    async fn resolve_managed_callback(
        &self,
        row: &SubscribedEventType,
    ) -> EventHubResult<Arc<dyn EventCallback>> {
        let module_id = row
            .processing_module
            .ok_or_else(|| EventHubError::Config("missing processing_module".into()))?;

        let module_name: String =
            sqlx::query_scalar("SELECT name FROM event_processing_module WHERE id = $1")
                .bind(module_id)
                .fetch_one(&self.0.pool)
                .await?;

        self.0.callbacks.read().await.get(&module_name)
    }

    /// Register a subscription and start (or keep alive) its Worker.
    ///
    /// Callback resolution precedence branches on the persisted subscription
    /// row's own category (it may predate, and differ from, this
    /// `Subscriber` instance's category), not the instance's category:
    /// `auto` requires a provided callback; `Programmatic` requires a
    /// caller-provided callback; `Managed` always uses the registered
    /// processing module and ignores `callback`; everything else prefers
    /// `callback`, falling back to a module lookup.
    pub async fn subscribe(
        &self,
        publisher: &str,
        event_type: &str,
        callback: Option<Arc<dyn EventCallback>>,
        resubscribe: bool,
        auto: bool,
    ) -> EventHubResult<(SubscribedEventType, bool)> {
        let channel = format!("{publisher}.{event_type}");

        let (mut sub_type, created) = self
            .upsert_subscribed_event_type(publisher, event_type, self.0.category)
            .await?;

        let category = Category::try_from(sub_type.category).map_err(EventHubError::Config)?;

        let resolved_callback = if auto {
            callback.ok_or_else(|| EventHubError::MissingCallback {
                subscriber: self.0.name.clone(),
                publisher: publisher.to_string(),
                event_type: event_type.to_string(),
            })?
        } else {
            match category {
                Category::Programmatic => callback.ok_or_else(|| EventHubError::MissingCallback {
                    subscriber: self.0.name.clone(),
                    publisher: publisher.to_string(),
                    event_type: event_type.to_string(),
                })?,
                Category::Managed => self.resolve_managed_callback(&sub_type).await?,
                _ => match callback {
                    Some(cb) => cb,
                    None => self
                        .resolve_managed_callback(&sub_type)
                        .await
                        .unwrap_or_else(|_| default_logging_callback()),
                },
            }
        };

        self.ensure_worker(&channel, &sub_type, resolved_callback.clone()).await;

        if resubscribe {
            self.ensure_listening_connection().await?;
        }

        if sub_type.replay_failed_events {
            self.replay_failed_for_channel(&sub_type).await?;
        }

        if self.0.config.process_missed_events && sub_type.replay_missed_events {
            self.replay_missed_for_channel(&mut sub_type).await?;
        }

        sqlx::query("UPDATE subscribed_event_type SET last_listening_time = now() WHERE id = $1")
            .bind(sub_type.id)
            .execute(&self.0.pool)
            .await?;
        sub_type.last_listening_time = Some(crate::time::now_utc());

        info!(channel = %channel, subscriber = %self.0.name, "subscribed");

        Ok((sub_type, created))
    }

    async fn upsert_subscribed_event_type(
        &self,
        publisher: &str,
        event_type: &str,
        category: Category,
    ) -> EventHubResult<(SubscribedEventType, bool)> {
        let inserted: Option<SubscribedEventType> = sqlx::query_as(
            "INSERT INTO subscribed_event_type (subscriber, publisher, event_type, category)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (subscriber, publisher, event_type) DO NOTHING
             RETURNING id, subscriber, publisher, event_type, category, processing_module,
                       parameters, replay_missed_events, replay_failed_events,
                       last_dispatched_event, last_dispatched_time, last_listening_time,
                       creator, created, modifier, modified",
        )
        .bind(&self.0.name)
        .bind(publisher)
        .bind(event_type)
        .bind(category as i16)
        .fetch_optional(&self.0.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row, true));
        }

        let row: SubscribedEventType = sqlx::query_as(
            "SELECT id, subscriber, publisher, event_type, category, processing_module,
                    parameters, replay_missed_events, replay_failed_events,
                    last_dispatched_event, last_dispatched_time, last_listening_time,
                    creator, created, modifier, modified
             FROM subscribed_event_type
             WHERE subscriber = $1 AND publisher = $2 AND event_type = $3",
        )
        .bind(&self.0.name)
        .bind(publisher)
        .bind(event_type)
        .fetch_one(&self.0.pool)
        .await?;

        Ok((row, false))
    }

    async fn ensure_worker(
        &self,
        channel: &str,
        sub_type: &SubscribedEventType,
        callback: Arc<dyn EventCallback>,
    ) {
        let mut channels = self.0.channels.write().await;

        let needs_new = match channels.get(channel) {
            Some(entry) => !entry.worker.as_ref().is_some_and(|w| w.is_alive()),
            None => true,
        };

        if needs_new {
            if let Some(entry) = channels.remove(channel) {
                if let Some(worker) = entry.worker {
                    worker.shutdown().await;
                }
            }

            let worker = worker::spawn(
                self.0.pool.clone(),
                sub_type.clone(),
                callback.clone(),
                self.0.config.processing_timeout,
            );

            self.0
                .senders
                .write()
                .await
                .insert(channel.to_string(), worker.sender());

            channels.insert(
                channel.to_string(),
                ChannelEntry {
                    sub_type: sub_type.clone(),
                    callback,
                    worker: Some(worker),
                },
            );

            // The listener may already be running for earlier subscriptions;
            // tell it about this channel instead of waiting for a reconnect.
            if let Some(runtime) = self.0.runtime.lock().await.as_ref() {
                runtime.listener.request_listen(channel);
            }
        } else if let Some(entry) = channels.get_mut(channel) {
            entry.sub_type = sub_type.clone();
        }

        metrics::set_active_workers(&self.0.name, channels.len() as i64);
    }

    async fn ensure_listening_connection(&self) -> EventHubResult<()> {
        let mut runtime = self.0.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }

        self.0.shutdown.store(false, Ordering::SeqCst);

        let inner = self.0.clone();
        let reconnect_hook: crate::listener::ReconnectHook = Arc::new(move || {
            let inner = inner.clone();
            Box::pin(async move {
                let subscriber = Subscriber(inner);
                subscriber.resubscribe_all().await
            })
        });

        let listener = listener::spawn(
            self.0.config.database_url.clone(),
            self.0.name.clone(),
            self.0.senders.clone(),
            reconnect_hook,
            self.0.config.select_timeout,
        );

        let inner_for_replay = self.0.clone();
        let replay = replay::spawn(self.0.config.reprocessing_interval, move || {
            let inner = inner_for_replay.clone();
            async move {
                let subscriber = Subscriber(inner);
                subscriber.replay_all_failed().await;
            }
        });

        *runtime = Some(Runtime { listener, replay });
        Ok(())
    }

    async fn resubscribe_all(&self) -> EventHubResult<()> {
        let channels: Vec<(String, String)> = self
            .0
            .channels
            .read()
            .await
            .values()
            .map(|entry| (entry.sub_type.publisher.clone(), entry.sub_type.event_type.clone()))
            .collect();

        for (publisher, event_type) in channels {
            let callback = self
                .0
                .channels
                .read()
                .await
                .get(&format!("{publisher}.{event_type}"))
                .map(|e| e.callback.clone());

            Box::pin(self.subscribe(&publisher, &event_type, callback, false, false)).await?;
        }
        Ok(())
    }

    async fn replay_failed_for_channel(&self, sub_type: &SubscribedEventType) -> EventHubResult<()> {
        let ids = replay::find_replayable_events(
            &self.0.pool,
            &self.0.name,
            &sub_type.publisher,
            &sub_type.event_type,
            self.0.config.processing_timeout,
        )
        .await?;

        let channel = sub_type.channel();
        let channels = self.0.channels.read().await;
        if let Some(entry) = channels.get(&channel) {
            for id in ids {
                entry.worker_enqueue(id);
            }
        }
        Ok(())
    }

    async fn replay_missed_for_channel(&self, sub_type: &mut SubscribedEventType) -> EventHubResult<()> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM event
             WHERE publisher = $1 AND event_type = $2
               AND ($3::bigint IS NULL OR id > $3)
             ORDER BY id ASC",
        )
        .bind(&sub_type.publisher)
        .bind(&sub_type.event_type)
        .bind(sub_type.last_dispatched_event)
        .fetch_all(&self.0.pool)
        .await?;

        let channel = sub_type.channel();
        let channels = self.0.channels.read().await;
        if let Some(entry) = channels.get(&channel) {
            for id in &rows {
                entry.worker_enqueue(*id);
            }
        }
        Ok(())
    }

    async fn replay_all_failed(&self) {
        let channels: Vec<SubscribedEventType> = self
            .0
            .channels
            .read()
            .await
            .values()
            .map(|e| e.sub_type.clone())
            .collect();

        for sub_type in channels {
            if sub_type.replay_failed_events {
                if let Err(err) = self.replay_failed_for_channel(&sub_type).await {
                    warn!(channel = %sub_type.channel(), error = %err, "replay scan failed");
                }
            }
        }
    }

    /// Best-effort `UNLISTEN`, shut down the Worker, and (if `remove`) drop
    /// the channel entry from the map entirely. When `remove` is false the
    /// entry (subscription row, callback) stays in the map with its worker
    /// cleared, so a later `start()` resumes the same subscriptions via the
    /// Listener's reconnect hook.
    pub async fn unsubscribe(&self, publisher: &str, event_type: &str, remove: bool) -> bool {
        let channel = format!("{publisher}.{event_type}");

        let worker = {
            let mut channels = self.0.channels.write().await;
            if remove {
                match channels.remove(&channel) {
                    Some(entry) => entry.worker,
                    None => return false,
                }
            } else {
                match channels.get_mut(&channel) {
                    Some(entry) => entry.worker.take(),
                    None => return false,
                }
            }
        };

        self.0.senders.write().await.remove(&channel);

        if let Some(runtime) = self.0.runtime.lock().await.as_ref() {
            runtime.listener.request_unlisten(&channel);
        }

        if let Some(worker) = worker {
            worker.shutdown().await;
        }

        true
    }

    pub async fn start(&self) -> EventHubResult<()> {
        self.0.shutdown.store(false, Ordering::SeqCst);
        self.ensure_listening_connection().await
    }

    pub async fn shutdown(&self) {
        self.0.shutdown.store(true, Ordering::SeqCst);
        if let Some(runtime) = self.0.runtime.lock().await.take() {
            runtime.replay.shutdown().await;
            runtime.listener.shutdown().await;
        }
        self.close().await;
    }

    /// Unsubscribe every channel but keep the entries in the map (`remove =
    /// false`) so a subsequent `start()` resumes the same subscriptions.
    async fn close(&self) {
        let channels: Vec<String> = self.0.channels.read().await.keys().cloned().collect();
        for channel in channels {
            if let Some((publisher, event_type)) = channel.split_once('.') {
                self.unsubscribe(publisher, event_type, false).await;
            }
        }
        info!(subscriber = %self.0.name, "subscriber closed");
    }
}

impl ChannelEntry {
    fn worker_enqueue(&self, event_id: i64) {
        if let Some(worker) = &self.worker {
            worker.enqueue(event_id);
        }
    }
}

fn default_logging_callback() -> Arc<dyn EventCallback> {
    Arc::new(crate::callback::FnCallback::new(|event: &Event| {
        let id = event.id;
        async move {
            tracing::info!(event_id = id, "no callback registered, logging event");
            Ok(serde_json::json!({ "logged": true }))
        }
    }))
}
