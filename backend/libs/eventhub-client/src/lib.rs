//! # Event Hub Client
//!
//! A publish/subscribe client library built on PostgreSQL `LISTEN`/`NOTIFY`.
//! Publishers insert event rows; a database trigger notifies a channel named
//! `"<publisher>.<event_type>"`; subscribers listen on that channel, persist
//! per-subscriber processing state in a database-backed lease, and dispatch
//! events to callbacks with at-least-once delivery, retry, and backfill of
//! events missed while offline.
//!
//! ## Architecture
//!
//! ```text
//! Publisher::publish()
//!   -> INSERT INTO event              (trigger fires NOTIFY "pub.event_type")
//!        |
//!        v
//! Listener (one per Subscriber)  --LISTEN "pub.event_type"-->  enqueues event id
//!        |
//!        v
//! Worker (one per channel)  -- dequeue --> Processing Protocol
//!        |                                     |
//!        |                          acquire lease (subscribed_event row)
//!        |                          invoke callback
//!        |                          record status + advance watermark
//!        v
//! Replay Worker (one per Subscriber) -- periodically re-enqueues failed/stuck events
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use eventhub_client::{
//!     config::EventHubConfig,
//!     callback::{CallbackRegistry, FnCallback},
//!     models::Category,
//!     publisher::Publisher,
//!     subscriber::Subscriber,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = EventHubConfig::from_env()?;
//! let pool = db_pool::create_pool(config.to_db_config("eventhub-client")).await?;
//!
//! let publisher = Publisher::new(pool.clone(), "Pub_Unitest", "unitest_event", Category::Testing).await?;
//! publisher.publish(serde_json::json!({ "greeting": "hello" })).await?;
//!
//! let subscriber = Subscriber::new(
//!     pool.clone(),
//!     config,
//!     "Sub_Unitest",
//!     Category::Testing,
//!     CallbackRegistry::new(),
//! ).await?;
//!
//! subscriber.subscribe(
//!     "Pub_Unitest",
//!     "unitest_event",
//!     Some(Arc::new(FnCallback::new(|event| {
//!         let payload = event.payload.clone();
//!         async move {
//!             println!("received {:?}", payload);
//!             Ok(serde_json::json!({ "ok": true }))
//!         }
//!     }))),
//!     true,
//!     false,
//! ).await?;
//!
//! subscriber.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod models;
pub mod protocol;
pub mod publisher;
pub mod replay;
pub mod retry;
pub mod subscriber;
pub mod time;
pub mod worker;

pub use config::EventHubConfig;
pub use error::{EventHubError, EventHubResult};
pub use publisher::Publisher;
pub use subscriber::Subscriber;
