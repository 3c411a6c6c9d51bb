//! Data model: publishers, event types, events, subscribers and their
//! subscriptions, and the per-delivery processing lease rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deployment role tag on publishers/event-types/subscribers/subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[sqlx(type_name = "smallint")]
pub enum Category {
    Programmatic = 1,
    Managed = 2,
    System = 999,
    Testing = -1,
    Unitesting = -2,
}

impl TryFrom<i16> for Category {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Category::Programmatic),
            2 => Ok(Category::Managed),
            999 => Ok(Category::System),
            -1 => Ok(Category::Testing),
            -2 => Ok(Category::Unitesting),
            other => Err(format!("unknown category code {other}")),
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Category::Programmatic => "programmatic",
            Category::Managed => "managed",
            Category::System => "system",
            Category::Testing => "testing",
            Category::Unitesting => "unitesting",
        };
        write!(f, "{s}")
    }
}

/// Status of a single processing attempt (`SubscribedEvent.status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[sqlx(type_name = "smallint")]
pub enum EventStatus {
    Processing = 0,
    Succeed = 1,
    Failed = -1,
    Timeout = -2,
}

impl TryFrom<i16> for EventStatus {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EventStatus::Processing),
            1 => Ok(EventStatus::Succeed),
            -1 => Ok(EventStatus::Failed),
            -2 => Ok(EventStatus::Timeout),
            other => Err(format!("unknown status code {other}")),
        }
    }
}

/// `PROCESSING_TIMEOUT`: how long a `Processing` lease is trusted before a
/// peer is allowed to steal it. Overridable via `EventHubConfig`.
pub const DEFAULT_PROCESSING_TIMEOUT_SECS: i64 = 3600;

/// `REPROCESSING_INTERVAL`: how often the replay worker re-scans for
/// failed/stuck events. Overridable via `EventHubConfig`.
pub const DEFAULT_REPROCESSING_INTERVAL_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Publisher {
    pub name: String,
    pub category: i16,
    pub active: bool,
    pub comments: Option<String>,
    pub creator: Option<String>,
    pub created: DateTime<Utc>,
    pub modifier: Option<String>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventType {
    pub name: String,
    pub publisher: String,
    pub category: i16,
    pub active: bool,
    pub sample: Option<serde_json::Value>,
    pub comments: Option<String>,
    pub creator: Option<String>,
    pub created: DateTime<Utc>,
    pub modifier: Option<String>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: i64,
    pub publisher: String,
    pub event_type: String,
    pub source: String,
    pub publish_time: DateTime<Utc>,
    pub payload: Option<serde_json::Value>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscriber {
    pub name: String,
    pub category: i16,
    pub active: bool,
    pub comments: Option<String>,
    pub creator: Option<String>,
    pub created: DateTime<Utc>,
    pub modifier: Option<String>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventProcessingModule {
    pub id: i64,
    pub name: String,
    pub code: Option<String>,
    pub parameters: Option<serde_json::Value>,
    pub comments: Option<String>,
    pub creator: Option<String>,
    pub created: DateTime<Utc>,
    pub modifier: Option<String>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscribedEventType {
    pub id: i64,
    pub subscriber: String,
    pub publisher: String,
    pub event_type: String,
    pub category: i16,
    pub processing_module: Option<i64>,
    pub parameters: Option<serde_json::Value>,
    pub replay_missed_events: bool,
    pub replay_failed_events: bool,
    pub last_dispatched_event: Option<i64>,
    pub last_dispatched_time: Option<DateTime<Utc>>,
    pub last_listening_time: Option<DateTime<Utc>>,
    pub creator: Option<String>,
    pub created: DateTime<Utc>,
    pub modifier: Option<String>,
    pub modified: DateTime<Utc>,
}

impl SubscribedEventType {
    /// Channel name this subscription LISTENs on: `"<publisher>.<event_type>"`
    pub fn channel(&self) -> String {
        format!("{}.{}", self.publisher, self.event_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscribedEvent {
    pub id: i64,
    pub subscriber: String,
    pub publisher: String,
    pub event_type: String,
    pub event: i64,
    pub process_host: Option<String>,
    pub process_pid: Option<i32>,
    pub process_times: i32,
    pub process_start_time: Option<DateTime<Utc>>,
    pub process_end_time: Option<DateTime<Utc>>,
    pub status: i16,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventProcessingHistory {
    pub id: i64,
    pub subscribed_event: i64,
    pub process_host: Option<String>,
    pub process_pid: Option<i32>,
    pub process_start_time: Option<DateTime<Utc>>,
    pub process_end_time: Option<DateTime<Utc>>,
    pub status: i16,
    pub result: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_i16() {
        for cat in [
            Category::Programmatic,
            Category::Managed,
            Category::System,
            Category::Testing,
            Category::Unitesting,
        ] {
            let code = cat as i16;
            assert_eq!(Category::try_from(code).unwrap().to_string(), cat.to_string());
        }
    }

    #[test]
    fn unknown_category_code_is_rejected() {
        assert!(Category::try_from(7).is_err());
    }

    #[test]
    fn channel_name_joins_publisher_and_event_type() {
        let row = SubscribedEventType {
            id: 1,
            subscriber: "Sub_Unitest".into(),
            publisher: "Pub_Unitest".into(),
            event_type: "unitest_event".into(),
            category: Category::Testing as i16,
            processing_module: None,
            parameters: None,
            replay_missed_events: true,
            replay_failed_events: true,
            last_dispatched_event: None,
            last_dispatched_time: None,
            last_listening_time: None,
            creator: None,
            created: Utc::now(),
            modifier: None,
            modified: Utc::now(),
        };
        assert_eq!(row.channel(), "Pub_Unitest.unitest_event");
    }
}
