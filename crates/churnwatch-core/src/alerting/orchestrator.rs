//! Top-level alert driver
//!
//! Feeds member events through the evaluator, dispatches the resulting
//! alerts, and runs the periodic digest sweep. Work on a channel always runs
//! under that channel's lock, whether it comes from an event or a sweep.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::AlertingConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{AlertDecision, Channel, MemberEvent};

use super::digest::{AnalyticsDigestBuilder, DigestBuilder};
use super::evaluator::AlertEvaluator;
use super::locks::ChannelLocks;
use super::notifier::Notifier;
use super::scheduler::DigestScheduler;
use super::window::WindowedCounter;

/// Outcome of one digest sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Channels with a notification target that were examined
    pub channels_checked: usize,
    /// Channels skipped because of quiet hours
    pub quiet_skipped: usize,
    /// Digest jobs found due
    pub jobs_due: usize,
    /// Digests the notifier accepted
    pub delivered: usize,
    /// Digests the notifier rejected (still acknowledged)
    pub delivery_failures: usize,
    /// Channels whose sweep failed with an error
    pub channel_errors: usize,
    /// Channels not started because the sweep was cancelled
    pub cancelled: usize,
}

impl SweepReport {
    fn absorb(&mut self, outcome: ChannelOutcome) {
        match outcome {
            ChannelOutcome::Cancelled => self.cancelled += 1,
            ChannelOutcome::Quiet => {
                self.channels_checked += 1;
                self.quiet_skipped += 1;
            }
            ChannelOutcome::Swept { tally, failed } => {
                self.channels_checked += 1;
                self.jobs_due += tally.jobs_due;
                self.delivered += tally.delivered;
                self.delivery_failures += tally.delivery_failures;
                if failed {
                    self.channel_errors += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DigestTally {
    jobs_due: usize,
    delivered: usize,
    delivery_failures: usize,
}

#[derive(Debug, Clone, Copy)]
enum ChannelOutcome {
    Cancelled,
    Quiet,
    Swept { tally: DigestTally, failed: bool },
}

/// Decisions made for one event, kept outside the evaluation future so they
/// survive its failure or cancellation
#[derive(Debug, Default)]
struct PendingAlerts {
    chat_id: Option<i64>,
    decisions: Vec<AlertDecision>,
}

/// Drives evaluation, delivery and digest scheduling
pub struct AlertOrchestrator {
    db: Database,
    evaluator: AlertEvaluator,
    scheduler: DigestScheduler,
    digests: Arc<dyn DigestBuilder>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    locks: ChannelLocks,
    store_timeout: StdDuration,
    sweep_interval: StdDuration,
    sweep_concurrency: usize,
}

impl AlertOrchestrator {
    /// Create an orchestrator with the analytics digest builder and the wall clock
    pub fn new(db: Database, config: &AlertingConfig, notifier: Arc<dyn Notifier>) -> Self {
        let churn_cooldown =
            Duration::from_std(config.churn_cooldown).unwrap_or_else(|_| Duration::hours(6));
        let evaluator = AlertEvaluator::new(
            WindowedCounter::new(db.events.clone()),
            db.members.clone(),
            db.settings.clone(),
            churn_cooldown,
        );
        let digests = Arc::new(AnalyticsDigestBuilder::new(
            db.events.clone(),
            db.members.clone(),
        ));

        Self {
            db,
            evaluator,
            scheduler: DigestScheduler::new(config.digest),
            digests,
            notifier,
            clock: Arc::new(SystemClock),
            locks: ChannelLocks::new(),
            store_timeout: config.store_timeout,
            sweep_interval: config.sweep_interval,
            sweep_concurrency: config.sweep_concurrency.max(1),
        }
    }

    /// Replace the clock used by the sweep loop
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the digest content builder
    #[must_use]
    pub fn with_digest_builder(mut self, digests: Arc<dyn DigestBuilder>) -> Self {
        self.digests = digests;
        self
    }

    /// Storage used by this orchestrator
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Current time according to the orchestrator's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Evaluate one recorded event and dispatch the resulting alerts.
    ///
    /// Events for unknown channels, or channels without a notification
    /// target, are ignored. Delivery failures are logged and not retried.
    /// When evaluation fails part way, alerts decided before the failure are
    /// still dispatched, then the error is returned.
    pub async fn on_member_event(&self, event: &MemberEvent) -> Result<Vec<AlertDecision>> {
        let _guard = self.locks.lock(event.channel_id).await;

        let mut pending = PendingAlerts::default();
        let outcome = self
            .with_timeout(
                "member event evaluation",
                self.evaluate_event(event, &mut pending),
            )
            .await;

        if let Some(chat_id) = pending.chat_id {
            self.dispatch(chat_id, &pending.decisions).await;
        }

        match outcome {
            Ok(()) => Ok(pending.decisions),
            Err(e) => {
                if !pending.decisions.is_empty() {
                    warn!(
                        channel_id = event.channel_id,
                        dispatched = pending.decisions.len(),
                        error = %e,
                        "Evaluation failed after alerts were decided"
                    );
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, chat_id: i64, decisions: &[AlertDecision]) {
        for decision in decisions {
            metrics::counter!("churnwatch_alerts_total", "kind" => decision.kind().as_str())
                .increment(1);

            if !self.notifier.send_alert(chat_id, decision).await {
                warn!(
                    channel_id = decision.channel_id,
                    chat_id,
                    kind = %decision.kind(),
                    "Alert delivery failed"
                );
            }
        }
    }

    async fn evaluate_event(&self, event: &MemberEvent, pending: &mut PendingAlerts) -> Result<()> {
        let Some(channel) = self.db.channels.get(event.channel_id).await? else {
            info!(channel_id = event.channel_id, "Event for unknown channel ignored");
            return Ok(());
        };
        let Some(chat_id) = channel.notify_target() else {
            debug!(channel_id = channel.id, "Channel has no notification target");
            return Ok(());
        };
        pending.chat_id = Some(chat_id);

        let mut settings = self.db.settings.get_or_create(channel.id).await?;
        self.evaluator
            .evaluate_into(
                &channel,
                &mut settings,
                event.event_type,
                event.user_id,
                event.occurred_at,
                &mut pending.decisions,
            )
            .await
    }

    /// Send every digest due at `now` across all active channels
    pub async fn run_digest_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        self.sweep(now, &CancellationToken::new()).await
    }

    /// Like [`run_digest_sweep`](Self::run_digest_sweep), but stops starting
    /// new channels once `cancel` fires
    pub async fn run_digest_sweep_until(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<SweepReport> {
        self.sweep(now, cancel).await
    }

    async fn sweep(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<SweepReport> {
        let channels = self
            .with_timeout("channel listing", self.db.channels.list_active())
            .await?;

        let targets: Vec<(Channel, i64)> = channels
            .into_iter()
            .filter_map(|channel| channel.notify_target().map(|chat_id| (channel, chat_id)))
            .collect();

        debug!(channels = targets.len(), %now, "Starting digest sweep");

        let outcomes: Vec<ChannelOutcome> = stream::iter(targets)
            .map(|(channel, chat_id)| self.sweep_channel(channel, chat_id, now, cancel))
            .buffer_unordered(self.sweep_concurrency)
            .collect()
            .await;

        let mut report = SweepReport::default();
        for outcome in outcomes {
            report.absorb(outcome);
        }

        info!(
            channels = report.channels_checked,
            quiet = report.quiet_skipped,
            due = report.jobs_due,
            delivered = report.delivered,
            failed = report.delivery_failures,
            errors = report.channel_errors,
            cancelled = report.cancelled,
            "Digest sweep finished"
        );

        Ok(report)
    }

    async fn sweep_channel(
        &self,
        channel: Channel,
        chat_id: i64,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> ChannelOutcome {
        if cancel.is_cancelled() {
            return ChannelOutcome::Cancelled;
        }

        let _guard = self.locks.lock(channel.id).await;
        let mut tally = DigestTally::default();

        match self.deliver_digests(&channel, chat_id, now, &mut tally).await {
            Ok(true) => ChannelOutcome::Quiet,
            Ok(false) => ChannelOutcome::Swept {
                tally,
                failed: false,
            },
            Err(e) => {
                error!(channel_id = channel.id, error = %e, "Digest sweep failed for channel");
                metrics::counter!("churnwatch_sweep_channel_errors_total").increment(1);
                ChannelOutcome::Swept { tally, failed: true }
            }
        }
    }

    /// Returns `true` when the channel was skipped for quiet hours
    async fn deliver_digests(
        &self,
        channel: &Channel,
        chat_id: i64,
        now: DateTime<Utc>,
        tally: &mut DigestTally,
    ) -> Result<bool> {
        let settings = self
            .with_timeout("settings load", self.db.settings.get_or_create(channel.id))
            .await?;

        if settings.is_quiet_at(now) {
            debug!(channel_id = channel.id, "Quiet hours, skipping digests");
            return Ok(true);
        }

        for job in self.scheduler.due_jobs(&settings, now) {
            tally.jobs_due += 1;

            let body = self
                .with_timeout("digest build", self.digests.build(channel, &job))
                .await?;

            if self.notifier.send_digest(chat_id, &job, &body).await {
                tally.delivered += 1;
                metrics::counter!("churnwatch_digests_total", "period" => job.period.as_str())
                    .increment(1);
            } else {
                tally.delivery_failures += 1;
                warn!(
                    channel_id = channel.id,
                    period = %job.period,
                    "Digest delivery failed, acknowledging anyway"
                );
            }

            // acknowledged regardless of delivery
            self.with_timeout(
                "digest acknowledgement",
                self.db.settings.set_last_digest(channel.id, job.period, now),
            )
            .await?;
        }

        Ok(false)
    }

    /// Run digest sweeps on a fixed interval until `cancel` fires.
    ///
    /// A sweep in progress finishes the channels it has started.
    pub async fn start(&self, cancel: CancellationToken) {
        info!(interval = ?self.sweep_interval, "Starting digest sweep loop");

        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Digest sweep loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_digest_sweep_until(self.clock.now(), &cancel).await {
                        error!(error = %e, "Digest sweep failed");
                    }
                }
            }
        }
    }

    async fn with_timeout<T, F>(&self, what: &str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.store_timeout, work)
            .await
            .map_err(|_| Error::Timeout(format!("{what} exceeded {:?}", self.store_timeout)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{ChannelStore, EventStore, MemberStore, MemoryStore, SettingsStore};
    use crate::models::{AlertKind, AlertSettings, DigestJob, DigestPeriod, EventType};
    use std::collections::BTreeSet;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        alerts: Mutex<Vec<(i64, AlertKind)>>,
        digests: Mutex<Vec<(i64, DigestPeriod)>>,
        accept: bool,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn send_alert(&self, chat_id: i64, decision: &AlertDecision) -> bool {
            self.alerts.lock().push((chat_id, decision.kind()));
            self.accept
        }

        async fn send_digest(&self, chat_id: i64, job: &DigestJob, _content: &str) -> bool {
            self.digests.lock().push((chat_id, job.period));
            self.accept
        }
    }

    struct SlowBuilder;

    #[async_trait]
    impl DigestBuilder for SlowBuilder {
        async fn build(&self, _channel: &Channel, _job: &DigestJob) -> Result<String> {
            tokio::time::sleep(StdDuration::from_secs(60)).await;
            Ok(String::new())
        }
    }

    async fn setup(accept: bool) -> (Arc<MemoryStore>, Arc<Recorder>, AlertOrchestrator) {
        let store = Arc::new(MemoryStore::default());
        store
            .upsert(&Channel::new(1, "News", 10, Some(-100)))
            .await
            .unwrap();
        let recorder = Arc::new(Recorder {
            accept,
            ..Recorder::default()
        });
        let orchestrator = AlertOrchestrator::new(
            Database::from_store(store.clone()),
            &AlertingConfig::default(),
            recorder.clone(),
        );
        (store, recorder, orchestrator)
    }

    fn nine_am() -> DateTime<Utc> {
        // a Tuesday, not the 1st
        Utc.with_ymd_and_hms(2024, 7, 9, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_channel_is_ignored() {
        let (_store, recorder, orchestrator) = setup(true).await;
        let event = MemberEvent::new(404, 1, EventType::Leave, nine_am());
        assert!(orchestrator.on_member_event(&event).await.unwrap().is_empty());
        assert!(recorder.alerts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_alert_is_not_retried() {
        let (store, recorder, orchestrator) = setup(false).await;
        let mut settings = store.get_or_create(1).await.unwrap();
        settings.churn_percent_threshold = 0.0;
        store.update_config(&settings).await.unwrap();
        store.set_vip_ids(1, &[5].into_iter().collect()).await.unwrap();

        let event = MemberEvent::new(1, 5, EventType::Kick, nine_am());
        let decisions = orchestrator.on_member_event(&event).await.unwrap();

        assert_eq!(decisions.len(), 1);
        assert_eq!(recorder.alerts.lock().clone(), vec![(-100, AlertKind::VipLeft)]);
    }

    #[tokio::test]
    async fn test_failed_digest_is_acknowledged() {
        let (store, recorder, orchestrator) = setup(false).await;

        let report = orchestrator.run_digest_sweep(nine_am()).await.unwrap();
        assert_eq!(report.jobs_due, 1);
        assert_eq!(report.delivery_failures, 1);
        assert_eq!(
            store.get_or_create(1).await.unwrap().last_daily_digest,
            Some(nine_am())
        );

        let later = orchestrator
            .run_digest_sweep(nine_am() + Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(later.jobs_due, 0);
        assert_eq!(recorder.digests.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_quiet_channel_skips_digests() {
        let (store, recorder, orchestrator) = setup(true).await;
        let mut settings = store.get_or_create(1).await.unwrap();
        settings.quiet_hours_start = 8;
        settings.quiet_hours_end = 10;
        store.update_config(&settings).await.unwrap();

        let report = orchestrator.run_digest_sweep(nine_am()).await.unwrap();
        assert_eq!(report.quiet_skipped, 1);
        assert_eq!(report.jobs_due, 0);
        assert!(recorder.digests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_sweep_starts_no_channels() {
        let (_store, recorder, orchestrator) = setup(true).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = orchestrator
            .run_digest_sweep_until(nine_am(), &cancel)
            .await
            .unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.channels_checked, 0);
        assert!(recorder.digests.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_digest_build_times_out() {
        let (store, recorder, orchestrator) = setup(true).await;
        let orchestrator = orchestrator.with_digest_builder(Arc::new(SlowBuilder));

        let report = orchestrator.run_digest_sweep(nine_am()).await.unwrap();
        assert_eq!(report.channel_errors, 1);
        assert!(recorder.digests.lock().is_empty());
        // not acknowledged, so the next sweep retries
        assert_eq!(store.get_or_create(1).await.unwrap().last_daily_digest, None);
    }

    /// Delegates to a memory store, but churn watermark writes stall
    struct StallingChurnWrites {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl SettingsStore for StallingChurnWrites {
        async fn get_or_create(&self, channel_id: i64) -> Result<AlertSettings> {
            self.inner.get_or_create(channel_id).await
        }

        async fn update_config(&self, settings: &AlertSettings) -> Result<AlertSettings> {
            self.inner.update_config(settings).await
        }

        async fn set_last_milestone(&self, channel_id: i64, milestone: i64) -> Result<()> {
            self.inner.set_last_milestone(channel_id, milestone).await
        }

        async fn set_last_churn_alert(&self, channel_id: i64, at: DateTime<Utc>) -> Result<()> {
            tokio::time::sleep(StdDuration::from_secs(60)).await;
            self.inner.set_last_churn_alert(channel_id, at).await
        }

        async fn set_last_digest(
            &self,
            channel_id: i64,
            period: DigestPeriod,
            at: DateTime<Utc>,
        ) -> Result<()> {
            self.inner.set_last_digest(channel_id, period, at).await
        }

        async fn set_vip_ids(&self, channel_id: i64, vip_ids: &BTreeSet<i64>) -> Result<()> {
            self.inner.set_vip_ids(channel_id, vip_ids).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_timeout_still_dispatches_persisted_milestone() {
        let store = Arc::new(MemoryStore::default());
        store
            .upsert(&Channel::new(1, "News", 10, Some(-100)))
            .await
            .unwrap();
        let mut settings = store.get_or_create(1).await.unwrap();
        settings.milestone_step = 10;
        settings.churn_percent_threshold = 1.0;
        store.update_config(&settings).await.unwrap();

        let mut db = Database::from_store(store.clone());
        db.settings = Arc::new(StallingChurnWrites {
            inner: store.clone(),
        });
        let recorder = Arc::new(Recorder {
            accept: true,
            ..Recorder::default()
        });
        let orchestrator = AlertOrchestrator::new(db, &AlertingConfig::default(), recorder.clone());

        for user in 0..11 {
            let join = MemberEvent::new(1, user, EventType::Join, nine_am() - Duration::days(3));
            store.upsert_status(1, user, join.new_status, join.occurred_at).await.unwrap();
            store.append(&join).await.unwrap();
        }
        let leave = MemberEvent::new(1, 0, EventType::Leave, nine_am());
        let leave = orchestrator.database().record_member_event(&leave).await.unwrap();

        let result = orchestrator.on_member_event(&leave).await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        // the milestone watermark moved, so its alert must have gone out
        let persisted = store.get_or_create(1).await.unwrap();
        assert_eq!(persisted.last_milestone, 10);
        assert_eq!(persisted.last_churn_alert_at, None);
        assert_eq!(recorder.alerts.lock().clone(), vec![(-100, AlertKind::Milestone)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stops_on_cancel() {
        let (_store, recorder, orchestrator) = setup(true).await;
        let orchestrator =
            Arc::new(orchestrator.with_clock(Arc::new(ManualClock::new(nine_am()))));
        let cancel = CancellationToken::new();

        let handle = {
            let orchestrator = orchestrator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { orchestrator.start(cancel).await })
        };

        // first tick fires immediately
        tokio::time::sleep(StdDuration::from_secs(1)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(recorder.digests.lock().clone(), vec![(-100, DigestPeriod::Daily)]);
    }
}
