//! Alert evaluation engine
//!
//! Runs the ordered alert checks for one member event. Milestone and churn
//! watermarks are persisted before the corresponding decision is returned,
//! so re-evaluating the same event never fires them twice.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::db::{MemberStore, SettingsStore};
use crate::error::Result;
use crate::models::{Alert, AlertDecision, AlertSettings, Channel, EventType, MemberStatus};

use super::window::WindowedCounter;

/// Last-hour events needed before a spike is reported
const MIN_SPIKE_EVENTS: i64 = 5;

/// Alert evaluator
pub struct AlertEvaluator {
    counter: WindowedCounter,
    members: Arc<dyn MemberStore>,
    settings: Arc<dyn SettingsStore>,
    churn_cooldown: Duration,
}

impl AlertEvaluator {
    /// Create a new alert evaluator
    pub fn new(
        counter: WindowedCounter,
        members: Arc<dyn MemberStore>,
        settings: Arc<dyn SettingsStore>,
        churn_cooldown: Duration,
    ) -> Self {
        Self {
            counter,
            members,
            settings,
            churn_cooldown,
        }
    }

    /// Evaluate one event against the channel's settings.
    ///
    /// `settings` is updated in place when a watermark moves.
    pub async fn evaluate(
        &self,
        channel: &Channel,
        settings: &mut AlertSettings,
        event_type: EventType,
        user_id: i64,
        event_time: DateTime<Utc>,
    ) -> Result<Vec<AlertDecision>> {
        let mut decisions = Vec::new();
        self.evaluate_into(channel, settings, event_type, user_id, event_time, &mut decisions)
            .await?;
        Ok(decisions)
    }

    /// Like [`evaluate`](Self::evaluate), but appends each decision to
    /// `decisions` as soon as it is made.
    ///
    /// A decision is appended in the same poll that persists its watermark,
    /// so when a later check fails, or the future is dropped on a timeout,
    /// `decisions` still holds every alert whose state was written.
    pub async fn evaluate_into(
        &self,
        channel: &Channel,
        settings: &mut AlertSettings,
        event_type: EventType,
        user_id: i64,
        event_time: DateTime<Utc>,
        decisions: &mut Vec<AlertDecision>,
    ) -> Result<()> {
        if settings.is_quiet_at(event_time) {
            debug!(channel_id = channel.id, %event_time, "Quiet hours, skipping evaluation");
            return Ok(());
        }

        let mut decide = |alert: Alert| {
            info!(channel_id = channel.id, kind = %alert.kind(), ?alert, "Alert triggered");
            decisions.push(AlertDecision {
                channel_id: channel.id,
                channel_title: channel.title.clone(),
                triggered_at: event_time,
                alert,
            });
        };

        if let Some(alert) = self.check_mass_leave(channel.id, settings, event_time).await? {
            decide(alert);
        }
        if let Some(alert) = self.check_anomaly(channel.id, settings, event_time).await? {
            decide(alert);
        }

        // Active members feed both the milestone and churn checks
        let statuses = self.members.count_by_status(channel.id).await?;
        let active = statuses.get(&MemberStatus::Member).copied().unwrap_or(0);
        let left = statuses.get(&MemberStatus::Left).copied().unwrap_or(0);

        if let Some(alert) = self.check_milestone(channel.id, settings, active).await? {
            decide(alert);
        }
        if let Some(alert) = self
            .check_churn(channel.id, settings, active + left, event_time)
            .await?
        {
            decide(alert);
        }
        if let Some(alert) = check_vip(settings, event_type, user_id) {
            decide(alert);
        }

        Ok(())
    }

    async fn check_mass_leave(
        &self,
        channel_id: i64,
        settings: &AlertSettings,
        event_time: DateTime<Utc>,
    ) -> Result<Option<Alert>> {
        let minutes = settings.mass_leave_window_minutes;
        let leaves = self
            .counter
            .count_trailing(
                channel_id,
                Some(EventType::Leave),
                event_time,
                Duration::minutes(i64::from(minutes)),
            )
            .await?;

        debug!(channel_id, leaves, minutes, "Mass leave check");

        Ok((leaves >= i64::from(settings.mass_leave_threshold)).then_some(Alert::MassLeave {
            count: leaves,
            minutes,
        }))
    }

    async fn check_anomaly(
        &self,
        channel_id: i64,
        settings: &AlertSettings,
        event_time: DateTime<Utc>,
    ) -> Result<Option<Alert>> {
        let sample = self.counter.activity(channel_id, event_time).await?;
        let factor = settings.anomaly_factor;

        debug!(
            channel_id,
            last_hour = sample.last_hour,
            baseline = sample.baseline,
            factor,
            "Anomaly check"
        );

        Ok(classify_anomaly(sample.last_hour, sample.baseline, factor))
    }

    async fn check_milestone(
        &self,
        channel_id: i64,
        settings: &mut AlertSettings,
        active: i64,
    ) -> Result<Option<Alert>> {
        let reached = reached_milestone(active, settings.milestone_step);
        if reached <= settings.last_milestone {
            return Ok(None);
        }

        self.settings.set_last_milestone(channel_id, reached).await?;
        settings.record_milestone(reached);

        Ok(Some(Alert::Milestone { milestone: reached }))
    }

    async fn check_churn(
        &self,
        channel_id: i64,
        settings: &mut AlertSettings,
        total: i64,
        event_time: DateTime<Utc>,
    ) -> Result<Option<Alert>> {
        let threshold = settings.churn_percent_threshold;
        if threshold <= 0.0 {
            return Ok(None);
        }
        if let Some(last) = settings.last_churn_alert_at {
            if event_time - last < self.churn_cooldown {
                debug!(channel_id, %last, "Churn alert cooling down");
                return Ok(None);
            }
        }
        if total == 0 {
            return Ok(None);
        }

        let leaves = self
            .counter
            .count_trailing(channel_id, Some(EventType::Leave), event_time, Duration::hours(24))
            .await?;
        #[allow(clippy::cast_precision_loss)]
        let churn_percent = leaves as f64 / total as f64 * 100.0;

        if churn_percent < threshold {
            return Ok(None);
        }

        self.settings
            .set_last_churn_alert(channel_id, event_time)
            .await?;
        settings.record_churn_alert(event_time);

        Ok(Some(Alert::ChurnThreshold {
            churn_percent,
            threshold,
        }))
    }
}

/// Spike takes precedence; a drop is only considered when there is no spike
pub fn classify_anomaly(last_hour: i64, baseline: f64, factor: f64) -> Option<Alert> {
    #[allow(clippy::cast_precision_loss)]
    let hour = last_hour as f64;

    if hour >= factor * baseline && last_hour >= MIN_SPIKE_EVENTS {
        Some(Alert::AnomalySpike { count: last_hour })
    } else if baseline >= factor * hour.max(1.0) {
        Some(Alert::AnomalyDrop {
            last_hour,
            baseline,
        })
    } else {
        None
    }
}

/// Largest multiple of `step` not above `active`; steps below 1 count as 1
pub fn reached_milestone(active: i64, step: i64) -> i64 {
    let step = step.max(1);
    active.max(0) / step * step
}

fn check_vip(settings: &AlertSettings, event_type: EventType, user_id: i64) -> Option<Alert> {
    (event_type.is_departure() && settings.vip_ids.contains(&user_id))
        .then_some(Alert::VipLeft { user_id })
}
