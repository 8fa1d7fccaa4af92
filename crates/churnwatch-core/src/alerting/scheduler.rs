//! Digest scheduling
//!
//! Decides which digests are due at a given instant. Each period fires at
//! most once per UTC calendar day, keyed on its last acknowledgement.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

use crate::config::DigestScheduleConfig;
use crate::models::{AlertSettings, DigestJob, DigestPeriod};

/// Pure digest scheduler
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestScheduler {
    config: DigestScheduleConfig,
}

impl DigestScheduler {
    /// Create a scheduler for the given time-of-day settings
    pub fn new(config: DigestScheduleConfig) -> Self {
        Self { config }
    }

    /// Digests due for the channel at `now`, in daily, weekly, monthly order
    pub fn due_jobs(&self, settings: &AlertSettings, now: DateTime<Utc>) -> Vec<DigestJob> {
        DigestPeriod::ALL
            .into_iter()
            .filter(|period| self.is_due(settings, *period, now))
            .map(|period| DigestJob {
                channel_id: settings.channel_id,
                period,
                as_of: now,
            })
            .collect()
    }

    /// Whether a digest of `period` is due at `now`
    pub fn is_due(&self, settings: &AlertSettings, period: DigestPeriod, now: DateTime<Utc>) -> bool {
        settings.digest_enabled(period)
            && self.in_slot(period, now)
            && not_sent_today(settings.last_digest(period), now)
    }

    fn in_slot(&self, period: DigestPeriod, now: DateTime<Utc>) -> bool {
        if now.hour() != self.config.hour {
            return false;
        }
        match period {
            DigestPeriod::Daily => now.minute() >= self.config.daily_minute,
            DigestPeriod::Weekly => {
                now.weekday() == Weekday::Mon && now.minute() >= self.config.weekly_minute
            }
            DigestPeriod::Monthly => now.day() == 1 && now.minute() >= self.config.monthly_minute,
        }
    }
}

fn not_sent_today(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last.map_or(true, |last| last.date_naive() < now.date_naive())
}
