//! Alert data models

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::AlertDefaults;

use super::DigestPeriod;

/// Per-channel alert configuration and watermark state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSettings {
    /// Channel these settings belong to
    pub channel_id: i64,

    // Mass leave
    /// Leaves within the window that trigger an alert
    pub mass_leave_threshold: i32,
    /// Trailing window for mass leave, in minutes
    pub mass_leave_window_minutes: i32,

    // Anomaly
    /// Multiplier over baseline that flags a spike or drop
    pub anomaly_factor: f64,

    // Milestones
    /// Distance between milestones
    pub milestone_step: i64,
    /// Highest milestone already announced
    pub last_milestone: i64,

    // Digests
    /// Daily digest enabled
    pub digest_daily: bool,
    /// Weekly digest enabled
    pub digest_weekly: bool,
    /// Monthly digest enabled
    pub digest_monthly: bool,

    // Quiet hours
    /// First quiet hour (UTC, 0-23)
    pub quiet_hours_start: u32,
    /// First non-quiet hour (UTC, 0-23)
    pub quiet_hours_end: u32,

    // Churn
    /// Daily churn percentage that triggers an alert (0 disables)
    pub churn_percent_threshold: f64,

    /// Users whose departure always alerts
    pub vip_ids: BTreeSet<i64>,

    // State
    /// Last churn alert
    pub last_churn_alert_at: Option<DateTime<Utc>>,
    /// Last daily digest
    pub last_daily_digest: Option<DateTime<Utc>>,
    /// Last weekly digest
    pub last_weekly_digest: Option<DateTime<Utc>>,
    /// Last monthly digest
    pub last_monthly_digest: Option<DateTime<Utc>>,
}

impl AlertSettings {
    /// Fresh settings for a channel, seeded from the configured defaults
    pub fn new(channel_id: i64, defaults: &AlertDefaults) -> Self {
        Self {
            channel_id,
            mass_leave_threshold: defaults.mass_leave_threshold,
            mass_leave_window_minutes: defaults.mass_leave_window_minutes,
            anomaly_factor: defaults.anomaly_factor,
            milestone_step: defaults.milestone_step,
            last_milestone: 0,
            digest_daily: defaults.digest_daily,
            digest_weekly: defaults.digest_weekly,
            digest_monthly: defaults.digest_monthly,
            quiet_hours_start: defaults.quiet_hours_start,
            quiet_hours_end: defaults.quiet_hours_end,
            churn_percent_threshold: defaults.churn_percent_threshold,
            vip_ids: BTreeSet::new(),
            last_churn_alert_at: None,
            last_daily_digest: None,
            last_weekly_digest: None,
            last_monthly_digest: None,
        }
    }

    /// Configured quiet hours, if the window is enabled and well-formed
    pub fn quiet_hours(&self) -> Option<QuietHours> {
        QuietHours::new(self.quiet_hours_start, self.quiet_hours_end)
    }

    /// Whether alerts and digests are suppressed at `at`
    pub fn is_quiet_at(&self, at: DateTime<Utc>) -> bool {
        self.quiet_hours().is_some_and(|q| q.contains(at))
    }

    /// Whether a digest of `period` is enabled
    pub fn digest_enabled(&self, period: DigestPeriod) -> bool {
        match period {
            DigestPeriod::Daily => self.digest_daily,
            DigestPeriod::Weekly => self.digest_weekly,
            DigestPeriod::Monthly => self.digest_monthly,
        }
    }

    /// When a digest of `period` was last acknowledged
    pub fn last_digest(&self, period: DigestPeriod) -> Option<DateTime<Utc>> {
        match period {
            DigestPeriod::Daily => self.last_daily_digest,
            DigestPeriod::Weekly => self.last_weekly_digest,
            DigestPeriod::Monthly => self.last_monthly_digest,
        }
    }

    /// Record a digest acknowledgement in memory; never moves backwards
    pub fn record_digest(&mut self, period: DigestPeriod, at: DateTime<Utc>) {
        let slot = match period {
            DigestPeriod::Daily => &mut self.last_daily_digest,
            DigestPeriod::Weekly => &mut self.last_weekly_digest,
            DigestPeriod::Monthly => &mut self.last_monthly_digest,
        };
        *slot = max_timestamp(*slot, at);
    }

    /// Record a churn alert in memory; never moves backwards
    pub fn record_churn_alert(&mut self, at: DateTime<Utc>) {
        self.last_churn_alert_at = max_timestamp(self.last_churn_alert_at, at);
    }

    /// Record a reached milestone in memory; never moves backwards
    pub fn record_milestone(&mut self, milestone: i64) {
        self.last_milestone = self.last_milestone.max(milestone);
    }
}

/// VIP ids in their persisted comma-separated form, `None` when empty
pub fn format_vip_ids(vip_ids: &BTreeSet<i64>) -> Option<String> {
    if vip_ids.is_empty() {
        return None;
    }
    Some(
        vip_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(","),
    )
}

fn max_timestamp(current: Option<DateTime<Utc>>, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(current.map_or(at, |c| c.max(at)))
}

/// Parse a persisted VIP list.
///
/// Malformed entries are dropped with a warning rather than failing the
/// whole list.
pub fn parse_vip_ids(raw: Option<&str>) -> BTreeSet<i64> {
    let Some(raw) = raw else {
        return BTreeSet::new();
    };

    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| {
            if !part.bytes().all(|b| b.is_ascii_digit()) {
                warn!(entry = part, "Ignoring malformed VIP id");
                return None;
            }
            match part.parse::<i64>() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(entry = part, error = %e, "Ignoring malformed VIP id");
                    None
                }
            }
        })
        .collect()
}

/// An hour-of-day suppression window in UTC, `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    start: u32,
    end: u32,
}

impl QuietHours {
    /// Build a window. Returns `None` when disabled (both zero) or when an
    /// hour is out of range.
    pub fn new(start: u32, end: u32) -> Option<Self> {
        if start == 0 && end == 0 {
            return None;
        }
        if start > 23 || end > 23 {
            warn!(start, end, "Ignoring out-of-range quiet hours");
            return None;
        }
        Some(Self { start, end })
    }

    /// Whether `at` falls inside the window. Windows with `start > end`
    /// wrap around midnight.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let hour = at.hour();
        if self.start <= self.end {
            self.start <= hour && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

/// Kind of alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Many leaves in a short window
    MassLeave,
    /// Hourly activity far above baseline
    AnomalySpike,
    /// Hourly activity far below baseline
    AnomalyDrop,
    /// Member count crossed a round number
    Milestone,
    /// Daily churn crossed the configured percentage
    ChurnThreshold,
    /// A VIP left
    VipLeft,
}

impl AlertKind {
    /// Stable string form
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::MassLeave => "mass_leave",
            AlertKind::AnomalySpike => "anomaly_spike",
            AlertKind::AnomalyDrop => "anomaly_drop",
            AlertKind::Milestone => "milestone",
            AlertKind::ChurnThreshold => "churn_threshold",
            AlertKind::VipLeft => "vip_left",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert payload with the fields needed to format a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    /// `count` leaves within the last `minutes`
    MassLeave { count: i64, minutes: i32 },
    /// `count` events in the last hour
    AnomalySpike { count: i64 },
    /// Activity fell well below the baseline
    AnomalyDrop { last_hour: i64, baseline: f64 },
    /// Active members reached `milestone`
    Milestone { milestone: i64 },
    /// Daily churn percentage crossed the threshold
    ChurnThreshold { churn_percent: f64, threshold: f64 },
    /// VIP `user_id` left, was kicked or banned
    VipLeft { user_id: i64 },
}

impl Alert {
    /// Tag of this alert
    pub fn kind(&self) -> AlertKind {
        match self {
            Alert::MassLeave { .. } => AlertKind::MassLeave,
            Alert::AnomalySpike { .. } => AlertKind::AnomalySpike,
            Alert::AnomalyDrop { .. } => AlertKind::AnomalyDrop,
            Alert::Milestone { .. } => AlertKind::Milestone,
            Alert::ChurnThreshold { .. } => AlertKind::ChurnThreshold,
            Alert::VipLeft { .. } => AlertKind::VipLeft,
        }
    }
}

/// A decision to notify, produced by the evaluator and consumed immediately
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDecision {
    /// Channel the alert is about
    pub channel_id: i64,

    /// Channel title, for formatting
    pub channel_title: String,

    /// Time of the event that triggered the alert
    pub triggered_at: DateTime<Utc>,

    /// What fired
    #[serde(flatten)]
    pub alert: Alert,
}

impl AlertDecision {
    /// Tag of the contained alert
    pub fn kind(&self) -> AlertKind {
        self.alert.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, hour, 30, 0).unwrap()
    }

    #[rstest]
    #[case(23, true)]
    #[case(22, true)]
    #[case(3, true)]
    #[case(6, true)]
    #[case(7, false)]
    #[case(12, false)]
    #[case(21, false)]
    fn test_quiet_hours_wrapping_midnight(#[case] hour: u32, #[case] quiet: bool) {
        let window = QuietHours::new(22, 7).unwrap();
        assert_eq!(window.contains(at_hour(hour)), quiet);
    }

    #[rstest]
    #[case(9, true)]
    #[case(16, true)]
    #[case(17, false)]
    #[case(8, false)]
    fn test_quiet_hours_same_day(#[case] hour: u32, #[case] quiet: bool) {
        let window = QuietHours::new(9, 17).unwrap();
        assert_eq!(window.contains(at_hour(hour)), quiet);
    }

    #[test]
    fn test_quiet_hours_disabled_or_invalid() {
        assert!(QuietHours::new(0, 0).is_none());
        assert!(QuietHours::new(25, 3).is_none());
        // equal non-zero bounds form an empty window
        let empty = QuietHours::new(5, 5).unwrap();
        assert!(!empty.contains(at_hour(5)));
    }

    #[test]
    fn test_parse_vip_ids_drops_malformed_entries() {
        let ids = parse_vip_ids(Some("12, 7,abc,,-3, 99999999999999999999,42"));
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![7, 12, 42]);
        assert!(parse_vip_ids(None).is_empty());
        assert!(parse_vip_ids(Some("")).is_empty());
    }

    #[test]
    fn test_format_vip_ids_round_trip() {
        assert_eq!(format_vip_ids(&BTreeSet::new()), None);
        let vip_ids: BTreeSet<i64> = [5, 3].into_iter().collect();
        let text = format_vip_ids(&vip_ids).unwrap();
        assert_eq!(text, "3,5");
        assert_eq!(parse_vip_ids(Some(&text)), vip_ids);
    }

    #[test]
    fn test_record_methods_never_move_backwards() {
        let mut settings = AlertSettings::new(1, &AlertDefaults::default());
        settings.record_milestone(2000);
        settings.record_milestone(1000);
        assert_eq!(settings.last_milestone, 2000);

        settings.record_churn_alert(at_hour(10));
        settings.record_churn_alert(at_hour(8));
        assert_eq!(settings.last_churn_alert_at, Some(at_hour(10)));

        settings.record_digest(DigestPeriod::Weekly, at_hour(9));
        settings.record_digest(DigestPeriod::Weekly, at_hour(1));
        assert_eq!(settings.last_digest(DigestPeriod::Weekly), Some(at_hour(9)));
        assert_eq!(settings.last_digest(DigestPeriod::Daily), None);
    }

    #[test]
    fn test_decision_serializes_flat_with_kind_tag() {
        let decision = AlertDecision {
            channel_id: 7,
            channel_title: "News".to_string(),
            triggered_at: at_hour(10),
            alert: Alert::MassLeave {
                count: 3,
                minutes: 30,
            },
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["kind"], "mass_leave");
        assert_eq!(json["count"], 3);
        assert_eq!(json["minutes"], 30);
        assert_eq!(decision.kind(), AlertKind::MassLeave);
    }
}
