//! Timezone-aware "now", mirroring the configured `TIME_ZONE`
//!
//! All `*_time` columns are written using this helper rather than bare
//! `Utc::now()` so log output and persisted `result` text read in local time
//! for deployments outside UTC, while the columns themselves stay `timestamptz`.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Current time in the zone configured by [`crate::config::EventHubConfig::time_zone`]
pub fn now(tz: Tz) -> DateTime<Tz> {
    Utc::now().with_timezone(&tz)
}

/// Current time as UTC, used wherever only the instant (not display zone) matters
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}
