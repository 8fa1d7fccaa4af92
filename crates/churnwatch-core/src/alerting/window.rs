//! Trailing-window event counts and baseline rates

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::db::EventStore;
use crate::error::Result;
use crate::models::EventType;

/// Hours in the baseline window that precede the most recent hour
const BASELINE_HOURS: f64 = 23.0;

/// Average hourly rate over the day before the most recent hour, floored at 1
pub fn baseline_rate(last_day: i64, last_hour: i64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let earlier = (last_day - last_hour).max(0) as f64;
    (earlier / BASELINE_HOURS).max(1.0)
}

/// Hourly activity compared against its baseline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivitySample {
    /// Events in the hour before the anchor
    pub last_hour: i64,
    /// Events in the day before the anchor
    pub last_day: i64,
    /// Baseline hourly rate
    pub baseline: f64,
}

/// Counts events in windows anchored at a given instant
#[derive(Clone)]
pub struct WindowedCounter {
    events: Arc<dyn EventStore>,
}

impl WindowedCounter {
    /// Create a counter over an event store
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self { events }
    }

    /// Events since `since` (all time when `None`), optionally of one type
    pub async fn count(
        &self,
        channel_id: i64,
        event_type: Option<EventType>,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        self.events
            .count_events(channel_id, event_type, since, None)
            .await
    }

    /// Events in `[anchor - window, anchor]`. Events stamped after the anchor
    /// do not count, so a late-arriving event sees the window it belongs to.
    pub async fn count_trailing(
        &self,
        channel_id: i64,
        event_type: Option<EventType>,
        anchor: DateTime<Utc>,
        window: Duration,
    ) -> Result<i64> {
        self.events
            .count_events(channel_id, event_type, Some(anchor - window), Some(anchor))
            .await
    }

    /// Last-hour activity and the baseline it is compared against
    pub async fn activity(&self, channel_id: i64, anchor: DateTime<Utc>) -> Result<ActivitySample> {
        let last_hour = self
            .count_trailing(channel_id, None, anchor, Duration::hours(1))
            .await?;
        let last_day = self
            .count_trailing(channel_id, None, anchor, Duration::hours(24))
            .await?;

        Ok(ActivitySample {
            last_hour,
            last_day,
            baseline: baseline_rate(last_day, last_hour),
        })
    }
}
