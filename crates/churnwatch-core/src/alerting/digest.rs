//! Digest content
//!
//! The orchestrator only decides when a digest is due. The text itself comes
//! from a [`DigestBuilder`], by default one that summarizes store aggregates
//! over the digest's lookback window. Daily digests add a week of activity
//! insights; weekly and monthly ones add an audience section.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::db::{EventStore, MemberStore};
use crate::error::Result;
use crate::models::{
    Channel, DailyFlow, DigestJob, DigestPeriod, EventType, HourlyActivity, MemberStatus,
};

use super::notifier::escape_html;

/// Days shown in the per-day trend
const TREND_DAYS: usize = 10;

/// Entries shown in ranked sections
const TOP_LIMIT: usize = 3;

/// Days covered by the activity insights of a daily digest
const ACTIVITY_DAYS: i64 = 7;

/// Members without events for this long count as inactive
const INACTIVE_DAYS: i64 = 30;

/// Recent departures listed in the audience section
const RECENT_LEAVES: usize = 5;

/// Builds the body of a digest
#[async_trait]
pub trait DigestBuilder: Send + Sync {
    /// Digest body for `channel` covering `job.period` up to `job.as_of`
    async fn build(&self, channel: &Channel, job: &DigestJob) -> Result<String>;
}

/// Growth summary over the store's event aggregates
pub struct AnalyticsDigestBuilder {
    events: Arc<dyn EventStore>,
    members: Arc<dyn MemberStore>,
}

impl AnalyticsDigestBuilder {
    /// Create a builder over the event and member stores
    pub fn new(events: Arc<dyn EventStore>, members: Arc<dyn MemberStore>) -> Self {
        Self { events, members }
    }
}

/// Totals over a run of days
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FlowTotals {
    joins: i64,
    leaves: i64,
}

impl FlowTotals {
    fn from_days(days: &[DailyFlow]) -> Self {
        days.iter().fold(Self::default(), |acc, day| Self {
            joins: acc.joins + day.joins,
            leaves: acc.leaves + day.leaves + day.kicks + day.bans,
        })
    }

    fn net(self) -> i64 {
        self.joins - self.leaves
    }
}

/// Joins and net change summed per key, ranked by joins then key
fn rank_joins<K: Ord + Copy>(
    buckets: &[HourlyActivity],
    key: impl Fn(&HourlyActivity) -> K,
) -> Vec<(K, i64, i64)> {
    let mut totals: BTreeMap<K, (i64, i64)> = BTreeMap::new();
    for bucket in buckets {
        let entry = totals.entry(key(bucket)).or_insert((0, 0));
        entry.0 += bucket.joins;
        entry.1 += bucket.net;
    }

    let mut ranked: Vec<(K, i64, i64)> = totals
        .into_iter()
        .map(|(k, (joins, net))| (k, joins, net))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(TOP_LIMIT);
    ranked
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    part as f64 / total as f64 * 100.0
}

#[async_trait]
impl DigestBuilder for AnalyticsDigestBuilder {
    async fn build(&self, channel: &Channel, job: &DigestJob) -> Result<String> {
        let days = job.period.lookback_days();
        let since = job.as_of - Duration::days(days);

        let flow = self.events.daily_flow(channel.id, Some(since)).await?;
        let statuses = self.members.count_by_status(channel.id).await?;
        let inviters = self
            .events
            .top_inviters(channel.id, Some(since), TOP_LIMIT)
            .await?;

        let totals = FlowTotals::from_days(&flow);
        let active = statuses.get(&MemberStatus::Member).copied().unwrap_or(0);
        let left = statuses.get(&MemberStatus::Left).copied().unwrap_or(0);
        let churn = percent(totals.leaves, active + left);

        #[allow(clippy::cast_precision_loss)]
        let avg_net = totals.net() as f64 / days as f64;

        let mut out = String::new();
        // writing to a String cannot fail
        let _ = writeln!(out, "<b>Growth for {}</b>", escape_html(&channel.title));
        let _ = writeln!(
            out,
            "Joins: {}, Leaves: {}, Net: {:+}",
            totals.joins,
            totals.leaves,
            totals.net()
        );
        let _ = writeln!(
            out,
            "Churn: {churn:.1}%, Retention: {:.1}%",
            (100.0 - churn).max(0.0)
        );
        let _ = writeln!(
            out,
            "Forecast 7d net: {:+.0} (avg/day {avg_net:.1})",
            avg_net * 7.0
        );
        let _ = write!(out, "Members: {active}");

        if flow.len() > 1 {
            let _ = write!(out, "\n\nTrend by day (last {TREND_DAYS}):");
            for day in flow.iter().rev().take(TREND_DAYS).rev() {
                let _ = write!(
                    out,
                    "\n  {}: +{} / -{} ({:+})",
                    day.day,
                    day.joins,
                    day.leaves + day.kicks + day.bans,
                    day.joins - day.leaves - day.kicks - day.bans
                );
            }
        }

        if !inviters.is_empty() {
            let _ = write!(out, "\n\n<b>Top inviters:</b>");
            for inviter in &inviters {
                let _ = write!(out, "\n  {}: {}", inviter.inviter_id, inviter.joins);
            }
        }

        if job.period == DigestPeriod::Daily {
            let activity = self.activity(channel, job.as_of).await?;
            let _ = write!(out, "\n\n{activity}");
        } else {
            let audience = self.audience(channel.id, since, job.as_of).await?;
            let _ = write!(out, "\n\n{audience}");
        }

        Ok(out)
    }
}

impl AnalyticsDigestBuilder {
    /// Busiest hours and weekdays, top leavers and returnees over the last week
    async fn activity(&self, channel: &Channel, as_of: DateTime<Utc>) -> Result<String> {
        let since = Some(as_of - Duration::days(ACTIVITY_DAYS));
        let buckets = self.events.hourly_activity(channel.id, since).await?;

        let mut out = String::new();
        let _ = write!(out, "<b>Activity for {}</b>", escape_html(&channel.title));
        if buckets.is_empty() {
            let _ = write!(out, "\nNo activity data yet.");
            return Ok(out);
        }

        let _ = write!(out, "\n<b>Top hours (UTC):</b>");
        for (hour, joins, net) in rank_joins(&buckets, |b| b.hour) {
            let _ = write!(out, "\n  {hour:02}:00: joins {joins} (net {net:+})");
        }
        let _ = write!(out, "\n<b>Top days of week (0=Sun):</b>");
        for (day, joins, _) in rank_joins(&buckets, |b| b.weekday.num_days_from_sunday()) {
            let _ = write!(out, "\n  {day}: joins {joins}");
        }

        let leavers = self.events.top_leavers(channel.id, since, TOP_LIMIT).await?;
        let _ = write!(out, "\n<b>Top leavers:</b>");
        if leavers.is_empty() {
            let _ = write!(out, "\n  No leaves.");
        }
        for leaver in &leavers {
            let _ = write!(out, "\n  {}: {}", leaver.user_id, leaver.leaves);
        }

        let returnees = self.events.returnees(channel.id, since, TOP_LIMIT).await?;
        let _ = write!(out, "\n<b>Returnees:</b>");
        if returnees.is_empty() {
            let _ = write!(out, "\n  No returnees yet.");
        }
        for returnee in &returnees {
            let _ = write!(
                out,
                "\n  {}: joins {}, leaves {}",
                returnee.user_id, returnee.joins, returnee.leaves
            );
        }

        Ok(out)
    }

    /// Recent departures within the lookback and long-inactive members
    async fn audience(
        &self,
        channel_id: i64,
        since: DateTime<Utc>,
        as_of: DateTime<Utc>,
    ) -> Result<String> {
        let recent = self
            .events
            .recent_events(channel_id, RECENT_LEAVES, Some(EventType::Leave))
            .await?;
        let inactive = self
            .events
            .inactive_members(channel_id, as_of - Duration::days(INACTIVE_DAYS), TOP_LIMIT)
            .await?;

        let mut out = String::from("<b>Recent leaves:</b>");
        let recent: Vec<_> = recent.iter().filter(|e| e.occurred_at >= since).collect();
        if recent.is_empty() {
            let _ = write!(out, "\n  No leaves.");
        }
        for event in recent {
            let _ = write!(
                out,
                "\n  {} at {}",
                event.user_id,
                event.occurred_at.format("%Y-%m-%d %H:%M")
            );
        }

        let _ = write!(out, "\n<b>Inactive members ({INACTIVE_DAYS}+ days):</b>");
        if inactive.is_empty() {
            let _ = write!(out, "\n  No inactive members.");
        }
        for member in &inactive {
            let _ = write!(out, "\n  {}", member.user_id);
            if let Some(joined_at) = member.joined_at {
                let _ = write!(out, " (joined {})", joined_at.format("%Y-%m-%d"));
            }
        }

        Ok(out)
    }
}
