//! Digest jobs and the aggregates used to build digest content

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Digest cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestPeriod {
    /// Every day
    Daily,
    /// Mondays
    Weekly,
    /// First day of the month
    Monthly,
}

impl DigestPeriod {
    /// All periods, in scheduling order
    pub const ALL: [DigestPeriod; 3] = [
        DigestPeriod::Daily,
        DigestPeriod::Weekly,
        DigestPeriod::Monthly,
    ];

    /// Days of history summarized by a digest of this period
    pub fn lookback_days(self) -> i64 {
        match self {
            DigestPeriod::Daily => 1,
            DigestPeriod::Weekly => 7,
            DigestPeriod::Monthly => 30,
        }
    }

    /// Stable string form
    pub fn as_str(self) -> &'static str {
        match self {
            DigestPeriod::Daily => "daily",
            DigestPeriod::Weekly => "weekly",
            DigestPeriod::Monthly => "monthly",
        }
    }
}

impl fmt::Display for DigestPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A digest that is due for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestJob {
    /// Channel to summarize
    pub channel_id: i64,
    /// Digest cadence
    pub period: DigestPeriod,
    /// Instant the digest covers up to
    pub as_of: DateTime<Utc>,
}

/// Joins and departures for one UTC day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyFlow {
    pub day: NaiveDate,
    pub joins: i64,
    pub leaves: i64,
    pub kicks: i64,
    pub bans: i64,
    /// joins - leaves - kicks
    pub net: i64,
}

/// Activity bucketed by weekday and hour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyActivity {
    pub weekday: Weekday,
    pub hour: u32,
    pub events: i64,
    pub joins: i64,
    /// leaves + kicks + bans
    pub leaves: i64,
    pub net: i64,
}

/// Joins attributed to one inviter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviterCount {
    pub inviter_id: i64,
    pub joins: i64,
}

/// Users who left most often
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaverCount {
    pub user_id: i64,
    pub leaves: i64,
}

/// Users who both left and joined within a window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Returnee {
    pub user_id: i64,
    pub joins: i64,
    pub leaves: i64,
}

/// Members with no recent activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InactiveMember {
    pub user_id: i64,
    pub joined_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}
